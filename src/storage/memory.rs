//! In-memory ledger store.
//!
//! All state lives behind one async mutex, so every operation is atomic
//! with respect to every other. Amounts are rounded to the same precision
//! the SQLite store keeps, which makes the two implementations
//! interchangeable in tests.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

use super::{effective_accrual, LedgerError, LedgerStore};
use crate::types::{
    round_points, to_hundredths, Balance, Order, OrderNumber, OrderStatus, UpdateOutcome, User,
    UserId, Withdrawal,
};

#[derive(Debug, Default)]
struct LedgerState {
    users: HashMap<UserId, User>,
    /// login -> user id
    logins: HashMap<String, UserId>,
    orders: HashMap<OrderNumber, Order>,
    withdrawals: Vec<Withdrawal>,
}

/// Ledger store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    /// When set, every operation fails as if the database were unreachable.
    offline: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the connection to the store.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), LedgerError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn list_pending(&self) -> Result<Vec<OrderNumber>, LedgerError> {
        self.check_online()?;
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .map(|o| o.number.clone())
            .collect())
    }

    async fn apply_accrual_update(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<UpdateOutcome, LedgerError> {
        self.check_online()?;
        let accrual = effective_accrual(status, accrual)?.map(round_points);

        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get(number)
            .ok_or_else(|| LedgerError::OrderNotFound(number.to_string()))?;

        if order.status.is_terminal() {
            return Ok(UpdateOutcome::AlreadyFinal);
        }
        if order.status == status {
            return Ok(UpdateOutcome::Unchanged);
        }
        if !order.status.can_advance_to(status) {
            return Ok(UpdateOutcome::Stale);
        }
        let owner = order.owner_id.clone();

        // Same limits as the SQLite store: amounts and balances must fit in
        // integer hundredths. Checked before anything is mutated.
        let credited = accrual.unwrap_or(Decimal::ZERO);
        let new_balance = if credited > Decimal::ZERO {
            if to_hundredths(credited).is_none() {
                return Err(LedgerError::InvalidAmount(credited));
            }
            let user = state
                .users
                .get(&owner)
                .ok_or_else(|| LedgerError::UserNotFound(owner.clone()))?;
            let total = user
                .balance
                .checked_add(credited)
                .filter(|b| to_hundredths(*b).is_some())
                .ok_or(LedgerError::InvalidAmount(credited))?;
            Some(total)
        } else {
            None
        };

        if let Some(order) = state.orders.get_mut(number) {
            order.status = status;
            order.accrual = accrual;
            order.updated_at = Utc::now();
        }
        if let (Some(total), Some(user)) = (new_balance, state.users.get_mut(&owner)) {
            user.balance = total;
            debug!(order = number, user = %owner, %credited, "Accrual credited");
        }

        Ok(UpdateOutcome::Applied { credited })
    }

    async fn withdraw(
        &self,
        user_id: &str,
        order_ref: &str,
        amount: Decimal,
    ) -> Result<Withdrawal, LedgerError> {
        self.check_online()?;
        let amount = round_points(amount);
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))?;

        if amount > user.balance {
            return Err(LedgerError::InsufficientFunds {
                requested: amount,
                available: user.balance,
            });
        }
        user.balance -= amount;

        let withdrawal = Withdrawal {
            order_ref: order_ref.to_string(),
            user_id: user_id.to_string(),
            amount,
            processed_at: Utc::now(),
        };
        state.withdrawals.push(withdrawal.clone());
        Ok(withdrawal)
    }

    async fn get_balance(&self, user_id: &str) -> Result<Balance, LedgerError> {
        self.check_online()?;
        let state = self.state.lock().await;
        let user = state
            .users
            .get(user_id)
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))?;
        let withdrawn: Decimal = state
            .withdrawals
            .iter()
            .filter(|w| w.user_id == user_id)
            .map(|w| w.amount)
            .sum();
        Ok(Balance {
            current: user.balance,
            withdrawn,
        })
    }

    async fn list_orders(&self, user_id: &str) -> Result<Vec<Order>, LedgerError> {
        self.check_online()?;
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.owner_id == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at).then_with(|| a.number.cmp(&b.number)));
        Ok(orders)
    }

    async fn list_withdrawals(&self, user_id: &str) -> Result<Vec<Withdrawal>, LedgerError> {
        self.check_online()?;
        let state = self.state.lock().await;
        // Insertion order is processing order.
        Ok(state
            .withdrawals
            .iter()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn create_user(&self, login: &str, password_hash: &str) -> Result<UserId, LedgerError> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        if state.logins.contains_key(login) {
            return Err(LedgerError::LoginTaken(login.to_string()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        state.logins.insert(login.to_string(), id.clone());
        state.users.insert(
            id.clone(),
            User {
                id: id.clone(),
                login: login.to_string(),
                password_hash: password_hash.to_string(),
                balance: Decimal::ZERO,
            },
        );
        Ok(id)
    }

    async fn find_user(&self, login: &str) -> Result<Option<User>, LedgerError> {
        self.check_online()?;
        let state = self.state.lock().await;
        Ok(state
            .logins
            .get(login)
            .and_then(|id| state.users.get(id))
            .cloned())
    }

    async fn create_order(&self, number: &str, user_id: &str) -> Result<(), LedgerError> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state.orders.get(number) {
            return Err(if existing.owner_id == user_id {
                LedgerError::OrderAlreadyUploaded(number.to_string())
            } else {
                LedgerError::OrderOwnedByAnotherUser(number.to_string())
            });
        }
        if !state.users.contains_key(user_id) {
            return Err(LedgerError::UserNotFound(user_id.to_string()));
        }

        let now = Utc::now();
        state.orders.insert(
            number.to_string(),
            Order {
                number: number.to_string(),
                owner_id: user_id.to_string(),
                status: OrderStatus::New,
                accrual: None,
                uploaded_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        self.check_online()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
