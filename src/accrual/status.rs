//! Accrual service status vocabulary.

use crate::types::OrderStatus;

/// The service reported a status this engine does not know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown accrual status: {0}")]
pub struct UnknownStatus(pub String);

/// Map an external status to the ledger's order status.
///
/// `REGISTERED` means the service accepted the order but has not computed a
/// reward yet, which the ledger records as `PROCESSING`.
pub fn translate_status(external: &str) -> Result<OrderStatus, UnknownStatus> {
    match external {
        "REGISTERED" | "PROCESSING" => Ok(OrderStatus::Processing),
        "INVALID" => Ok(OrderStatus::Invalid),
        "PROCESSED" => Ok(OrderStatus::Processed),
        other => Err(UnknownStatus(other.to_string())),
    }
}
