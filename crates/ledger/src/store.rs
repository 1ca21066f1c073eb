//! Durable credit balance storage.
//!
//! All mutating operations here run inside a caller-supplied transaction and
//! assume the caller already holds the row locks taken by [`load_locked`].
//! The one-live-row-per-user invariant is repaired on access: duplicates from
//! historical races collapse to the most recently updated row before anything
//! else reads or writes.

use sqlx::{Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::consume::CreditKind;
use crate::error::LedgerResult;

/// A user's persisted credit balance row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CreditBalance {
    pub id: Uuid,
    pub user_id: Uuid,
    pub credits: i32,
    pub ai_credits: i32,
    pub used_credits: i32,
    pub used_ai_credits: i32,
    pub resets_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

impl CreditBalance {
    pub fn remaining(&self, kind: CreditKind) -> i32 {
        match kind {
            CreditKind::Slide => self.credits,
            CreditKind::Ai => self.ai_credits,
        }
    }
}

/// Lock and load the user's balance row, collapsing duplicates first.
///
/// `SELECT ... FOR UPDATE` serializes concurrent consumers of the same user
/// regardless of whether the advisory Redis lock was obtained.
pub async fn load_locked(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
) -> LedgerResult<Option<CreditBalance>> {
    let rows: Vec<CreditBalance> = sqlx::query_as(
        r#"
        SELECT id, user_id, credits, ai_credits, used_credits, used_ai_credits,
               resets_at, updated_at
        FROM credit_balances
        WHERE user_id = $1
        ORDER BY updated_at DESC
        FOR UPDATE
        "#,
    )
    .bind(user_id)
    .fetch_all(&mut **tx)
    .await?;

    let mut rows = rows.into_iter();
    let newest = match rows.next() {
        Some(row) => row,
        None => return Ok(None),
    };

    let stale_ids: Vec<Uuid> = rows.map(|r| r.id).collect();
    if !stale_ids.is_empty() {
        tracing::warn!(
            user_id = %user_id,
            stale_count = stale_ids.len(),
            "Collapsing duplicate credit balance rows to most recent"
        );
        sqlx::query("DELETE FROM credit_balances WHERE id = ANY($1)")
            .bind(&stale_ids)
            .execute(&mut **tx)
            .await?;
    }

    Ok(Some(newest))
}

/// Insert a fresh balance row and return it locked for the rest of the
/// transaction (the insert itself holds the row lock).
pub async fn insert_fresh(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    credits: i32,
    ai_credits: i32,
    used_credits: i32,
    used_ai_credits: i32,
    resets_at: Option<OffsetDateTime>,
) -> LedgerResult<CreditBalance> {
    let row: CreditBalance = sqlx::query_as(
        r#"
        INSERT INTO credit_balances
            (id, user_id, credits, ai_credits, used_credits, used_ai_credits,
             resets_at, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
        RETURNING id, user_id, credits, ai_credits, used_credits,
                  used_ai_credits, resets_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(credits)
    .bind(ai_credits)
    .bind(used_credits)
    .bind(used_ai_credits)
    .bind(resets_at)
    .fetch_one(&mut **tx)
    .await?;

    Ok(row)
}

/// Rewrite the user's balance wholesale: delete every existing row, insert
/// one fresh row. Replacing instead of patching guarantees no stale derived
/// field survives a plan transition.
pub async fn replace(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    credits: i32,
    ai_credits: i32,
    used_credits: i32,
    used_ai_credits: i32,
    resets_at: Option<OffsetDateTime>,
) -> LedgerResult<CreditBalance> {
    sqlx::query("DELETE FROM credit_balances WHERE user_id = $1")
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

    insert_fresh(
        tx,
        user_id,
        credits,
        ai_credits,
        used_credits,
        used_ai_credits,
        resets_at,
    )
    .await
}

/// Overwrite both remaining pools in place. Used only for sentinel drift
/// correction; usage counters are left alone.
pub async fn set_pools(
    tx: &mut Transaction<'_, Postgres>,
    row_id: Uuid,
    credits: i32,
    ai_credits: i32,
) -> LedgerResult<()> {
    sqlx::query(
        r#"
        UPDATE credit_balances
        SET credits = $2, ai_credits = $3, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(row_id)
    .bind(credits)
    .bind(ai_credits)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Conditionally decrement a finite pool and bump its used counter in one
/// statement. Returns whether the row matched, i.e. whether the balance was
/// at least `cost` at the instant of the write. The WHERE clause re-checks
/// the invariant even if row locking were ever bypassed.
pub async fn try_decrement(
    tx: &mut Transaction<'_, Postgres>,
    row_id: Uuid,
    kind: CreditKind,
    cost: i32,
) -> LedgerResult<bool> {
    let query = match kind {
        CreditKind::Slide => {
            r#"
            UPDATE credit_balances
            SET credits = credits - $2,
                used_credits = used_credits + $2,
                updated_at = NOW()
            WHERE id = $1 AND credits >= $2
            "#
        }
        CreditKind::Ai => {
            r#"
            UPDATE credit_balances
            SET ai_credits = ai_credits - $2,
                used_ai_credits = used_ai_credits + $2,
                updated_at = NOW()
            WHERE id = $1 AND ai_credits >= $2
            "#
        }
    };

    let result = sqlx::query(query)
        .bind(row_id)
        .bind(cost)
        .execute(&mut **tx)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Bump a used counter without touching the remaining pool. The unlimited
/// path: a `-1` pool is never decremented.
pub async fn increment_used(
    tx: &mut Transaction<'_, Postgres>,
    row_id: Uuid,
    kind: CreditKind,
    cost: i32,
) -> LedgerResult<()> {
    let query = match kind {
        CreditKind::Slide => {
            r#"
            UPDATE credit_balances
            SET used_credits = used_credits + $2, updated_at = NOW()
            WHERE id = $1
            "#
        }
        CreditKind::Ai => {
            r#"
            UPDATE credit_balances
            SET used_ai_credits = used_ai_credits + $2, updated_at = NOW()
            WHERE id = $1
            "#
        }
    };

    sqlx::query(query)
        .bind(row_id)
        .bind(cost)
        .execute(&mut **tx)
        .await?;

    Ok(())
}
