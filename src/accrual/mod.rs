//! External accrual service integration.
//!
//! Defines the `AccrualSource` trait the dispatch pool talks to, the typed
//! outcomes of one lookup, and:
//! - `client`: reqwest implementation against the HTTP accrual service
//! - `status`: translation of the service's status vocabulary

pub mod client;
pub mod status;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

pub use client::AccrualClient;
pub use status::{translate_status, UnknownStatus};

/// Successful lookup body: `{ "order": ..., "status": ..., "accrual": ... }`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AccrualReply {
    pub order: String,
    /// External status string, see [`translate_status`].
    pub status: String,
    #[serde(default)]
    pub accrual: Option<Decimal>,
}

/// Outcome of a lookup that reached the service.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The service knows the order.
    Ready(AccrualReply),
    /// The service has no record of the order yet.
    NotRegistered,
    /// The service asked us to back off for the given interval.
    RateLimited(Duration),
}

/// Failures of a lookup. All of them are transient from the engine's point
/// of view: the order stays pending and is rediscovered on a later tick.
#[derive(Debug, thiserror::Error)]
pub enum AccrualError {
    #[error("Accrual request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Accrual service error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Accrual service rejected request {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Failed to decode accrual response: {0}")]
    Decode(String),
}

/// Source of accrual information for a single order.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccrualSource: Send + Sync {
    /// Query the status and reward of one order.
    async fn fetch(&self, order_number: &str) -> Result<FetchOutcome, AccrualError>;
}
