//! Ledger persistence.
//!
//! Defines the `LedgerStore` trait and provides two implementations:
//! - `SqliteLedger`: production store on an sqlx SQLite pool
//! - `MemoryLedger`: in-process store with identical semantics, used by
//!   tests and by hosts that embed the engine without a database
//!
//! Every mutation that touches a balance runs as one transaction: the
//! order row, the user balance and the withdrawal record commit together
//! or not at all.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{Balance, Order, OrderNumber, OrderStatus, UpdateOutcome, User, UserId, Withdrawal};

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

/// Errors surfaced by a ledger store.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Order not found: {0}")]
    OrderNotFound(OrderNumber),

    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: Decimal, available: Decimal },

    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    #[error("Order {0} was already uploaded by this user")]
    OrderAlreadyUploaded(OrderNumber),

    #[error("Order {0} was already uploaded by another user")]
    OrderOwnedByAnotherUser(OrderNumber),

    #[error("Login already taken: {0}")]
    LoginTaken(String),

    #[error("Ledger store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

/// Transactional persistence for orders, users and withdrawals.
///
/// Implementations must keep, for every user,
/// `balance == Σ accrual(PROCESSED orders) − Σ withdrawals`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Numbers of all orders that are not yet terminal, across all users.
    async fn list_pending(&self) -> Result<Vec<OrderNumber>, LedgerError>;

    /// Move an order forward and credit its owner when it becomes
    /// `PROCESSED` with a positive accrual. Re-applying an update to a
    /// terminal order is a no-op.
    async fn apply_accrual_update(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<UpdateOutcome, LedgerError>;

    /// Debit `amount` from the user's balance and record the withdrawal.
    async fn withdraw(
        &self,
        user_id: &str,
        order_ref: &str,
        amount: Decimal,
    ) -> Result<Withdrawal, LedgerError>;

    async fn get_balance(&self, user_id: &str) -> Result<Balance, LedgerError>;

    /// Orders of one user, oldest upload first.
    async fn list_orders(&self, user_id: &str) -> Result<Vec<Order>, LedgerError>;

    /// Withdrawals of one user, oldest first.
    async fn list_withdrawals(&self, user_id: &str) -> Result<Vec<Withdrawal>, LedgerError>;

    /// Register a user. The password must already be hashed by the caller.
    async fn create_user(&self, login: &str, password_hash: &str) -> Result<UserId, LedgerError>;

    async fn find_user(&self, login: &str) -> Result<Option<User>, LedgerError>;

    /// Insert a `NEW` order for `user_id`.
    async fn create_order(&self, number: &str, user_id: &str) -> Result<(), LedgerError>;

    /// Connectivity check.
    async fn ping(&self) -> Result<(), LedgerError>;
}

/// Accrual to store for a given status: only `PROCESSED` orders carry one.
pub(crate) fn effective_accrual(
    status: OrderStatus,
    accrual: Option<Decimal>,
) -> Result<Option<Decimal>, LedgerError> {
    match accrual {
        Some(a) if a < Decimal::ZERO => Err(LedgerError::InvalidAmount(a)),
        Some(a) if status == OrderStatus::Processed => Ok(Some(a)),
        None if status == OrderStatus::Processed => Ok(Some(Decimal::ZERO)),
        _ => Ok(None),
    }
}
