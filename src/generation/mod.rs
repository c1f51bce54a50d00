mod wavespeed;

pub use wavespeed::*;
