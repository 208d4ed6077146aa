//! GOPHERMART — loyalty-points order accrual reconciliation
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod storage;
pub mod accrual;
pub mod engine;
