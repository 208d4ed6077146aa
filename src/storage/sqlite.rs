//! SQLite ledger store.
//!
//! Amounts are stored as integer hundredths so balance arithmetic happens
//! exactly inside SQL. Every balance mutation starts its transaction with
//! a write, which takes SQLite's writer lock up front: concurrent credits
//! and debits for the same user are serialised by the database, and the
//! debit itself is conditional on the balance covering it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{effective_accrual, LedgerError, LedgerStore};
use crate::types::{
    from_hundredths, to_hundredths, Balance, Order, OrderNumber, OrderStatus, UpdateOutcome, User,
    UserId, Withdrawal,
};

/// How long a writer waits for SQLite's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id            TEXT PRIMARY KEY,
    login         TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    balance       INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0)
);

CREATE TABLE IF NOT EXISTS orders (
    number      TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL REFERENCES users(id),
    status      INTEGER NOT NULL DEFAULT 1,
    accrual     INTEGER CHECK (accrual IS NULL OR accrual >= 0),
    uploaded_at TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS orders_status_idx ON orders (status);
CREATE INDEX IF NOT EXISTS orders_user_idx ON orders (user_id);

CREATE TABLE IF NOT EXISTS withdrawals (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id      TEXT NOT NULL REFERENCES users(id),
    order_ref    TEXT NOT NULL,
    amount       INTEGER NOT NULL CHECK (amount > 0),
    processed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS withdrawals_user_idx ON withdrawals (user_id);
"#;

/// Ledger store backed by an sqlx SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Open (creating if missing) the database at `uri` and apply the schema.
    pub async fn connect(uri: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(uri)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.migrate().await?;
        info!(max_connections, "Ledger store connected");
        Ok(ledger)
    }

    /// Private in-memory database. A single connection that is never
    /// recycled, since every SQLite connection to `:memory:` is its own
    /// database.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.migrate().await?;
        Ok(ledger)
    }

    async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!("Ledger schema applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// -- Row helpers ---------------------------------------------------------

fn hundredths(amount: Decimal) -> Result<i64, LedgerError> {
    to_hundredths(amount).ok_or(LedgerError::InvalidAmount(amount))
}

fn decode_status(code: i64) -> Result<OrderStatus, LedgerError> {
    OrderStatus::from_code(code).ok_or_else(|| {
        LedgerError::Unavailable(sqlx::Error::Decode(
            format!("unknown order status code {code}").into(),
        ))
    })
}

fn order_from_row(row: &SqliteRow) -> Result<Order, LedgerError> {
    let accrual: Option<i64> = row.try_get("accrual")?;
    Ok(Order {
        number: row.try_get("number")?,
        owner_id: row.try_get("user_id")?,
        status: decode_status(row.try_get("status")?)?,
        accrual: accrual.map(from_hundredths),
        uploaded_at: row.try_get::<DateTime<Utc>, _>("uploaded_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn withdrawal_from_row(row: &SqliteRow) -> Result<Withdrawal, LedgerError> {
    Ok(Withdrawal {
        order_ref: row.try_get("order_ref")?,
        user_id: row.try_get("user_id")?,
        amount: from_hundredths(row.try_get("amount")?),
        processed_at: row.try_get::<DateTime<Utc>, _>("processed_at")?,
    })
}

#[async_trait]
impl LedgerStore for SqliteLedger {
    async fn list_pending(&self) -> Result<Vec<OrderNumber>, LedgerError> {
        let numbers: Vec<String> = sqlx::query_scalar("SELECT number FROM orders WHERE status < ?")
            .bind(OrderStatus::Invalid.code())
            .fetch_all(&self.pool)
            .await?;
        Ok(numbers)
    }

    async fn apply_accrual_update(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<UpdateOutcome, LedgerError> {
        let accrual = effective_accrual(status, accrual)?
            .map(hundredths)
            .transpose()?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        // Non-terminal and strictly forward; the owner comes back from the
        // row that was actually changed.
        let owner: Option<String> = sqlx::query_scalar(
            "UPDATE orders SET status = ?, accrual = ?, updated_at = ? \
             WHERE number = ? AND status < ? AND status < ? \
             RETURNING user_id",
        )
        .bind(status.code())
        .bind(accrual)
        .bind(now)
        .bind(number)
        .bind(OrderStatus::Invalid.code())
        .bind(status.code())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(owner) = owner else {
            let current: Option<i64> = sqlx::query_scalar("SELECT status FROM orders WHERE number = ?")
                .bind(number)
                .fetch_optional(&mut *tx)
                .await?;
            return match current.map(OrderStatus::from_code) {
                None => Err(LedgerError::OrderNotFound(number.to_string())),
                Some(Some(s)) if s == status && !s.is_terminal() => Ok(UpdateOutcome::Unchanged),
                Some(Some(s)) if !s.is_terminal() => Ok(UpdateOutcome::Stale),
                Some(_) => Ok(UpdateOutcome::AlreadyFinal),
            };
        };

        let credit = accrual.unwrap_or(0);
        if credit > 0 {
            // Bounded so the INTEGER column cannot overflow.
            let updated = sqlx::query(
                "UPDATE users SET balance = balance + ? WHERE id = ? AND balance <= ?",
            )
            .bind(credit)
            .bind(&owner)
            .bind(i64::MAX - credit)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 0 {
                let exists: Option<String> = sqlx::query_scalar("SELECT id FROM users WHERE id = ?")
                    .bind(&owner)
                    .fetch_optional(&mut *tx)
                    .await?;
                return Err(match exists {
                    Some(_) => LedgerError::InvalidAmount(from_hundredths(credit)),
                    None => LedgerError::UserNotFound(owner),
                });
            }
        }

        tx.commit().await?;

        let credited = from_hundredths(credit);
        if credit > 0 {
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
        let minor = hundredths(amount)?;
        if minor <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        let debited = sqlx::query("UPDATE users SET balance = balance - ? WHERE id = ? AND balance >= ?")
            .bind(minor)
            .bind(user_id)
            .bind(minor)
            .execute(&mut *tx)
            .await?;

        if debited.rows_affected() == 0 {
            let available: Option<i64> = sqlx::query_scalar("SELECT balance FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
            return Err(match available {
                None => LedgerError::UserNotFound(user_id.to_string()),
                Some(balance) => LedgerError::InsufficientFunds {
                    requested: from_hundredths(minor),
                    available: from_hundredths(balance),
                },
            });
        }

        sqlx::query(
            "INSERT INTO withdrawals (user_id, order_ref, amount, processed_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(order_ref)
        .bind(minor)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Withdrawal {
            order_ref: order_ref.to_string(),
            user_id: user_id.to_string(),
            amount: from_hundredths(minor),
            processed_at: now,
        })
    }

    async fn get_balance(&self, user_id: &str) -> Result<Balance, LedgerError> {
        let row = sqlx::query(
            "SELECT u.balance AS current, \
                    COALESCE((SELECT SUM(w.amount) FROM withdrawals w WHERE w.user_id = u.id), 0) AS withdrawn \
             FROM users u WHERE u.id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))?;

        Ok(Balance {
            current: from_hundredths(row.try_get("current")?),
            withdrawn: from_hundredths(row.try_get("withdrawn")?),
        })
    }

    async fn list_orders(&self, user_id: &str) -> Result<Vec<Order>, LedgerError> {
        let rows = sqlx::query(
            "SELECT number, user_id, status, accrual, uploaded_at, updated_at \
             FROM orders WHERE user_id = ? ORDER BY uploaded_at, rowid",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    async fn list_withdrawals(&self, user_id: &str) -> Result<Vec<Withdrawal>, LedgerError> {
        let rows = sqlx::query(
            "SELECT order_ref, user_id, amount, processed_at \
             FROM withdrawals WHERE user_id = ? ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(withdrawal_from_row).collect()
    }

    async fn create_user(&self, login: &str, password_hash: &str) -> Result<UserId, LedgerError> {
        let id = uuid::Uuid::new_v4().to_string();
        let inserted = sqlx::query("INSERT INTO users (id, login, password_hash) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(login)
            .bind(password_hash)
            .execute(&self.pool)
            .await;

        match inserted {
            Ok(_) => Ok(id),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(LedgerError::LoginTaken(login.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_user(&self, login: &str) -> Result<Option<User>, LedgerError> {
        let row = sqlx::query("SELECT id, login, password_hash, balance FROM users WHERE login = ?")
            .bind(login)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(User {
                id: row.try_get("id")?,
                login: row.try_get("login")?,
                password_hash: row.try_get("password_hash")?,
                balance: from_hundredths(row.try_get("balance")?),
            })
        })
        .transpose()
    }

    async fn create_order(&self, number: &str, user_id: &str) -> Result<(), LedgerError> {
        let now = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO orders (number, user_id, status, uploaded_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT (number) DO NOTHING",
        )
        .bind(number)
        .bind(user_id)
        .bind(OrderStatus::New.code())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        let inserted = match inserted {
            Ok(result) => result,
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => {
                return Err(LedgerError::UserNotFound(user_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if inserted.rows_affected() > 0 {
            return Ok(());
        }

        let owner: String = sqlx::query_scalar("SELECT user_id FROM orders WHERE number = ?")
            .bind(number)
            .fetch_one(&self.pool)
            .await?;

        if owner == user_id {
            Err(LedgerError::OrderAlreadyUploaded(number.to_string()))
        } else {
            Err(LedgerError::OrderOwnedByAnotherUser(number.to_string()))
        }
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
