//! Worker supervisor — runs configured worker processes, reshapes their
//! output into a live event stream and keeps enough state to survive a
//! restart.

pub mod config;
pub mod error;
pub mod instances;
pub mod logs;
pub mod notify;
pub mod process;
pub mod store;
