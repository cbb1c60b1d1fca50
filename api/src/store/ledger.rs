//! Ledger and balance operations.
//!
//! Every balance mutation goes through one of five operations, each of which
//! runs in a single transaction and appends exactly one immutable ledger
//! entry. `(entry_type, reference_id)` is unique: re-executing an operation
//! with the same pair is a no-op that reports success, which lets the
//! scheduler retry round closure and finalization safely.
//!
//! | op      | effect                                   | fails when          |
//! |---------|------------------------------------------|---------------------|
//! | deposit | balance += amt                           | amt <= 0            |
//! | lock    | balance -= amt; locked += amt            | balance < amt       |
//! | unlock  | balance += amt; locked -= amt            | locked < amt        |
//! | payout  | locked -= amt                            | locked < amt        |
//! | refund  | balance += amt; locked -= amt            | locked < amt        |

use jiff_sqlx::ToSqlx;
use payloads::{LedgerEntryType, UserId};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};

use super::{LedgerEntry, StoreError, User};
use crate::time::TimeSource;

/// Outcome of a ledger operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    Applied,
    /// The `(entry_type, reference_id)` pair already exists; nothing changed.
    AlreadyApplied,
}

pub async fn deposit(
    user_id: &UserId,
    amount: Decimal,
    reference_id: &str,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<LedgerOutcome, StoreError> {
    in_own_tx(
        user_id,
        LedgerEntryType::Deposit,
        amount,
        reference_id,
        pool,
        time_source,
    )
    .await
}

pub async fn lock(
    user_id: &UserId,
    amount: Decimal,
    reference_id: &str,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<LedgerOutcome, StoreError> {
    in_own_tx(
        user_id,
        LedgerEntryType::Lock,
        amount,
        reference_id,
        pool,
        time_source,
    )
    .await
}

pub async fn unlock(
    user_id: &UserId,
    amount: Decimal,
    reference_id: &str,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<LedgerOutcome, StoreError> {
    in_own_tx(
        user_id,
        LedgerEntryType::Unlock,
        amount,
        reference_id,
        pool,
        time_source,
    )
    .await
}

pub async fn payout(
    user_id: &UserId,
    amount: Decimal,
    reference_id: &str,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<LedgerOutcome, StoreError> {
    in_own_tx(
        user_id,
        LedgerEntryType::Payout,
        amount,
        reference_id,
        pool,
        time_source,
    )
    .await
}

pub async fn refund(
    user_id: &UserId,
    amount: Decimal,
    reference_id: &str,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<LedgerOutcome, StoreError> {
    in_own_tx(
        user_id,
        LedgerEntryType::Refund,
        amount,
        reference_id,
        pool,
        time_source,
    )
    .await
}

async fn in_own_tx(
    user_id: &UserId,
    entry_type: LedgerEntryType,
    amount: Decimal,
    reference_id: &str,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<LedgerOutcome, StoreError> {
    let mut tx = pool.begin().await?;
    let outcome = apply_entry_tx(
        user_id,
        entry_type,
        amount,
        reference_id,
        None,
        &mut tx,
        time_source,
    )
    .await?;
    tx.commit().await?;
    Ok(outcome)
}

/// Transaction variants, for composing ledger effects with bid and round
/// mutations that must commit atomically with them.
pub async fn lock_tx(
    user_id: &UserId,
    amount: Decimal,
    reference_id: &str,
    tx: &mut Transaction<'_, Postgres>,
    time_source: &TimeSource,
) -> Result<LedgerOutcome, StoreError> {
    apply_entry_tx(
        user_id,
        LedgerEntryType::Lock,
        amount,
        reference_id,
        None,
        tx,
        time_source,
    )
    .await
}

pub async fn payout_tx(
    user_id: &UserId,
    amount: Decimal,
    reference_id: &str,
    tx: &mut Transaction<'_, Postgres>,
    time_source: &TimeSource,
) -> Result<LedgerOutcome, StoreError> {
    apply_entry_tx(
        user_id,
        LedgerEntryType::Payout,
        amount,
        reference_id,
        None,
        tx,
        time_source,
    )
    .await
}

pub async fn refund_tx(
    user_id: &UserId,
    amount: Decimal,
    reference_id: &str,
    tx: &mut Transaction<'_, Postgres>,
    time_source: &TimeSource,
) -> Result<LedgerOutcome, StoreError> {
    apply_entry_tx(
        user_id,
        LedgerEntryType::Refund,
        amount,
        reference_id,
        None,
        tx,
        time_source,
    )
    .await
}

/// Core ledger write. Locks the user row, applies the signed balance
/// effect of `entry_type`, and appends the entry.
///
/// The user row lock serializes concurrent ledger effects for the same
/// user; the unique `(entry_type, reference_id)` index backs the
/// idempotency check against races that slip past it.
#[tracing::instrument(skip(tx, time_source))]
pub(crate) async fn apply_entry_tx(
    user_id: &UserId,
    entry_type: LedgerEntryType,
    amount: Decimal,
    reference_id: &str,
    note: Option<&str>,
    tx: &mut Transaction<'_, Postgres>,
    time_source: &TimeSource,
) -> Result<LedgerOutcome, StoreError> {
    if amount <= Decimal::ZERO {
        return Err(StoreError::InvalidInput(
            "ledger amounts must be positive",
        ));
    }

    let already_applied: bool = sqlx::query_scalar(
        "SELECT EXISTS (
            SELECT 1 FROM ledger_entries
            WHERE entry_type = $1 AND reference_id = $2
        )",
    )
    .bind(entry_type)
    .bind(reference_id)
    .fetch_one(&mut **tx)
    .await?;

    if already_applied {
        tracing::debug!(
            "ledger entry ({}, {}) already applied",
            entry_type,
            reference_id
        );
        return Ok(LedgerOutcome::AlreadyApplied);
    }

    let user = sqlx::query_as::<_, User>(
        "SELECT * FROM users WHERE id = $1 FOR UPDATE",
    )
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(StoreError::UserNotFound)?;

    let (balance_delta, locked_delta) = match entry_type {
        LedgerEntryType::Deposit => (amount, Decimal::ZERO),
        LedgerEntryType::Lock => {
            if user.balance < amount {
                return Err(StoreError::InsufficientFunds);
            }
            (-amount, amount)
        }
        LedgerEntryType::Unlock | LedgerEntryType::Refund => {
            if user.locked_balance < amount {
                return Err(StoreError::InsufficientFunds);
            }
            (amount, -amount)
        }
        LedgerEntryType::Payout => {
            if user.locked_balance < amount {
                return Err(StoreError::InsufficientFunds);
            }
            (Decimal::ZERO, -amount)
        }
    };

    sqlx::query(
        "UPDATE users
        SET balance = balance + $2,
            locked_balance = locked_balance + $3,
            updated_at = $4
        WHERE id = $1",
    )
    .bind(user_id)
    .bind(balance_delta)
    .bind(locked_delta)
    .bind(time_source.now().to_sqlx())
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        "INSERT INTO ledger_entries (
            user_id,
            entry_type,
            amount,
            reference_id,
            note,
            created_at
        ) VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(user_id)
    .bind(entry_type)
    .bind(amount)
    .bind(reference_id)
    .bind(note)
    .bind(time_source.now().to_sqlx())
    .execute(&mut **tx)
    .await?;

    Ok(LedgerOutcome::Applied)
}

/// All entries for a user in application order.
pub async fn list_user_entries(
    user_id: &UserId,
    pool: &PgPool,
) -> Result<Vec<LedgerEntry>, StoreError> {
    Ok(sqlx::query_as::<_, LedgerEntry>(
        "SELECT * FROM ledger_entries
        WHERE user_id = $1
        ORDER BY created_at ASC, id ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?)
}

/// Replay the signed effects of a user's ledger entries and compare the
/// result against the stored balances.
///
/// Exported for audit. A mismatch means an invariant was violated somewhere;
/// it is reported as [`StoreError::Fatal`] and never patched over.
#[tracing::instrument(skip(pool))]
pub async fn verify_user_ledger(
    user_id: &UserId,
    pool: &PgPool,
) -> Result<(Decimal, Decimal), StoreError> {
    let user = super::read_user(user_id, pool).await?;
    let entries = list_user_entries(user_id, pool).await?;

    let (replayed_balance, replayed_locked) = replay(&entries);

    if replayed_balance != user.balance
        || replayed_locked != user.locked_balance
    {
        return Err(StoreError::Fatal(format!(
            "ledger replay mismatch for user {}: \
            replayed ({replayed_balance}, {replayed_locked}), \
            stored ({}, {})",
            user_id, user.balance, user.locked_balance,
        )));
    }

    Ok((replayed_balance, replayed_locked))
}

/// Fold entries into `(balance, locked_balance)` starting from zero.
fn replay(entries: &[LedgerEntry]) -> (Decimal, Decimal) {
    let mut balance = Decimal::ZERO;
    let mut locked = Decimal::ZERO;
    for entry in entries {
        match entry.entry_type {
            LedgerEntryType::Deposit => balance += entry.amount,
            LedgerEntryType::Lock => {
                balance -= entry.amount;
                locked += entry.amount;
            }
            LedgerEntryType::Unlock | LedgerEntryType::Refund => {
                balance += entry.amount;
                locked -= entry.amount;
            }
            LedgerEntryType::Payout => locked -= entry.amount,
        }
    }
    (balance, locked)
}
