pub mod cancel;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod drivers;
pub mod error;
pub mod ops;
pub mod plan;
pub mod pool;
pub mod snapshot;
pub mod storage;
pub mod utils;
