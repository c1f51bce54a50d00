mod account;
mod ledger;
mod order;
mod product;
mod task;
mod webhook_event;

pub use account::*;
pub use ledger::*;
pub use order::*;
pub use product::*;
pub use task::*;
pub use webhook_event::*;
