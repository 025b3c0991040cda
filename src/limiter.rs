//! Distributed fixed-window rate limiter backed by the `rate_limits` table.
//!
//! Every delivery attempt consumes `weight` points (one per media unit in
//! the call) from a per-destination budget. Exhausting the budget applies a
//! block so a rejected caller cannot immediately thrash the counter. The
//! whole increment-and-check runs inside one SQLite write transaction;
//! SQLite's single-writer model makes it atomic for every process sharing
//! the database file.

use crate::config::RateLimit;
use crate::db::Pool;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{Row, SqliteConnection};
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Rejected { ms_before_next: i64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Try to consume `weight` points for `key`. Rejection consumes nothing and
/// reports how long the caller should wait before the next attempt.
///
/// The transaction opens with `BEGIN IMMEDIATE` so the write lock is taken
/// before the counter is read. A deferred transaction would let two
/// processes read the same window and fail one of them at commit with
/// `SQLITE_BUSY_SNAPSHOT`; immediate mode serializes them on the lock
/// instead, which is what makes this an atomic increment-and-check.
#[instrument(skip_all, fields(key = %key, weight))]
pub async fn consume(pool: &Pool, limit: &RateLimit, key: &str, weight: i64) -> Result<Decision> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    match consume_locked(&mut *conn, limit, key, weight).await {
        Ok(decision) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            Ok(decision)
        }
        Err(err) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(err)
        }
    }
}

async fn consume_locked(
    conn: &mut SqliteConnection,
    limit: &RateLimit,
    key: &str,
    weight: i64,
) -> Result<Decision> {
    let now = Utc::now();

    let row = sqlx::query("SELECT window_start, points, blocked_until FROM rate_limits WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;

    let (window_start, points, blocked_until) = match &row {
        Some(row) => (
            Some(row.get::<DateTime<Utc>, _>("window_start")),
            row.get::<i64, _>("points"),
            row.get::<Option<DateTime<Utc>>, _>("blocked_until"),
        ),
        None => (None, 0, None),
    };

    if let Some(blocked_until) = blocked_until {
        if blocked_until > now {
            let ms = (blocked_until - now).num_milliseconds().max(0);
            return Ok(Decision::Rejected { ms_before_next: ms });
        }
    }

    let window = ChronoDuration::seconds(limit.window_seconds);
    let (window_start, points) = match window_start {
        Some(start) if now < start + window => (start, points),
        // Fresh key or expired window: start counting from scratch.
        _ => (now, 0),
    };

    if points + weight <= limit.max_points {
        sqlx::query(
            "INSERT INTO rate_limits (key, window_start, points, blocked_until) VALUES (?, ?, ?, NULL) \
             ON CONFLICT(key) DO UPDATE SET window_start = excluded.window_start, \
                 points = excluded.points, blocked_until = NULL",
        )
        .bind(key)
        .bind(window_start)
        .bind(points + weight)
        .execute(&mut *conn)
        .await?;
        return Ok(Decision::Allowed);
    }

    // Budget exhausted: apply the block without consuming anything.
    let blocked_until = now + ChronoDuration::seconds(limit.block_seconds);
    sqlx::query(
        "INSERT INTO rate_limits (key, window_start, points, blocked_until) VALUES (?, ?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET window_start = excluded.window_start, \
             points = excluded.points, blocked_until = excluded.blocked_until",
    )
    .bind(key)
    .bind(window_start)
    .bind(points)
    .bind(blocked_until)
    .execute(&mut *conn)
    .await?;

    let window_ms = ((window_start + window) - now).num_milliseconds();
    let block_ms = limit.block_seconds * 1000;
    Ok(Decision::Rejected {
        ms_before_next: block_ms.max(window_ms).max(0),
    })
}
