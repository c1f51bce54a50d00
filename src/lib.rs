//! creditgate - credit ledger and webhook settlement for a generation service
//!
//! Accounts hold credits that are bought through Creem and spent on WaveSpeed
//! generation tasks. Every provider webhook is settled at most once per event
//! id, however many times the provider delivers it.

pub mod config;
pub mod db;
pub mod error;
pub mod extractors;
pub mod generation;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod payments;
pub mod util;
