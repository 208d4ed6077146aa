//! Shared types for the Gophermart ledger.
//!
//! These types form the data model used by the storage layer, the accrual
//! client and the reconciliation engine. They carry no behaviour beyond
//! conversions and the order status state machine.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Externally supplied order number.
pub type OrderNumber = String;

/// User identifier (UUID v4, stored as text).
pub type UserId = String;

// ---------------------------------------------------------------------------
// Order status
// ---------------------------------------------------------------------------

/// Lifecycle of an order inside the ledger.
///
/// Variants are declared in transition order: a status may only be replaced
/// by one that compares greater or equal, and `Invalid`/`Processed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Processing,
    Invalid,
    Processed,
}

impl OrderStatus {
    /// Whether no further transition may occur from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }

    /// Integer code used by the persistent store.
    pub fn code(&self) -> i64 {
        match self {
            OrderStatus::New => 1,
            OrderStatus::Processing => 2,
            OrderStatus::Invalid => 3,
            OrderStatus::Processed => 4,
        }
    }

    /// Inverse of [`OrderStatus::code`].
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(OrderStatus::New),
            2 => Some(OrderStatus::Processing),
            3 => Some(OrderStatus::Invalid),
            4 => Some(OrderStatus::Processed),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` goes strictly forward from a
    /// non-terminal status.
    pub fn can_advance_to(&self, next: OrderStatus) -> bool {
        !self.is_terminal() && next > *self
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Ledger records
// ---------------------------------------------------------------------------

/// An order submitted by a user for accrual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub number: OrderNumber,
    pub owner_id: UserId,
    pub status: OrderStatus,
    /// Present only once the order is `PROCESSED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Decimal>,
    pub uploaded_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A registered user. The password hash is opaque to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub login: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub balance: Decimal,
}

/// Balance projection returned to the balance handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub current: Decimal,
    pub withdrawn: Decimal,
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "current={} withdrawn={}", self.current, self.withdrawn)
    }
}

/// A debit of points against an external order reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    #[serde(rename = "order")]
    pub order_ref: String,
    pub user_id: UserId,
    #[serde(rename = "sum")]
    pub amount: Decimal,
    pub processed_at: DateTime<Utc>,
}

/// Result of applying an accrual update to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The order row changed. `credited` is the amount added to the owner's
    /// balance (zero unless the order just became `PROCESSED`).
    Applied { credited: Decimal },
    /// The order was already terminal; nothing changed.
    AlreadyFinal,
    /// The order already has the requested status; nothing changed.
    Unchanged,
    /// The requested status would move the order backwards; nothing changed.
    Stale,
}

// ---------------------------------------------------------------------------
// Points <-> storage representation
// ---------------------------------------------------------------------------

/// Points are persisted as integer hundredths.
const POINT_SCALE: u32 = 2;

/// Round an amount to the precision the ledger keeps.
pub fn round_points(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(POINT_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Convert a decimal amount to integer hundredths, rounding to two places.
/// Returns `None` when the result does not fit in an `i64`.
pub fn to_hundredths(amount: Decimal) -> Option<i64> {
    round_points(amount).checked_mul(Decimal::from(100))?.to_i64()
}

/// Convert integer hundredths back to a decimal amount.
pub fn from_hundredths(value: i64) -> Decimal {
    Decimal::new(value, POINT_SCALE).normalize()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
