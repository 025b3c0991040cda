use super::model::{AvailableItem, BatchForDelivery, JobRow, ResolvedMedia};
use crate::model::JobKind;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::time::Duration;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query_part {
        Some(q) => format!("sqlite://{}?{}", expanded, q),
        None => format!("sqlite://{}", expanded),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_or_create_user(
    pool: &Pool,
    tg_user_id: i64,
    username: Option<&str>,
) -> Result<i64> {
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE tg_user_id = ?")
        .bind(tg_user_id)
        .fetch_optional(pool)
        .await?
    {
        return Ok(id);
    }

    let rec = sqlx::query("INSERT INTO users (tg_user_id, username) VALUES (?, ?) RETURNING id")
        .bind(tg_user_id)
        .bind(username)
        .fetch_one(pool)
        .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn insert_content_item(pool: &Pool, user_id: i64, source_ref: &str) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO content_items (user_id, source_ref) VALUES (?, ?) RETURNING id",
    )
    .bind(user_id)
    .bind(source_ref)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn insert_media_unit(pool: &Pool, content_item_id: i64, url: Option<&str>) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO media_units (content_item_id, url) VALUES (?, ?) RETURNING id",
    )
    .bind(content_item_id)
    .bind(url)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn soft_delete_media_unit(pool: &Pool, media_unit_id: i64) -> Result<()> {
    sqlx::query("UPDATE media_units SET deleted_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(media_unit_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Availability filter shared by ad-hoc planning and slot sampling:
/// media must be mirrored (url set), not soft-deleted, not yet delivered to
/// the chat, and not already claimed by an existing batch for the chat.
const AVAILABLE_MEDIA_WHERE: &str = "mu.deleted_at IS NULL AND mu.url IS NOT NULL \
     AND NOT EXISTS (SELECT 1 FROM delivery_records dr \
                     WHERE dr.media_unit_id = mu.id AND dr.chat_id = ?2) \
     AND NOT EXISTS (SELECT 1 FROM batch_media bm JOIN batches b ON b.id = bm.batch_id \
                     WHERE bm.media_unit_id = mu.id AND b.chat_id = ?2)";

/// Newest-first content items with at least one media unit still deliverable
/// to `chat_id`, capped at `limit` items.
#[instrument(skip_all)]
pub async fn list_available_content(
    pool: &Pool,
    user_id: i64,
    chat_id: i64,
    limit: i64,
) -> Result<Vec<AvailableItem>> {
    let sql = format!(
        "SELECT ci.id AS item_id, ci.source_ref AS source_ref, mu.id AS media_id \
         FROM content_items ci \
         JOIN media_units mu ON mu.content_item_id = ci.id \
         WHERE ci.user_id = ?1 AND {AVAILABLE_MEDIA_WHERE} \
         ORDER BY ci.created_at DESC, ci.id DESC, mu.id ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(user_id)
        .bind(chat_id)
        .fetch_all(pool)
        .await?;

    let mut items: Vec<AvailableItem> = Vec::new();
    for row in rows {
        let item_id: i64 = row.get("item_id");
        let media_id: i64 = row.get("media_id");
        match items.last_mut() {
            Some(last) if last.item_id == item_id => last.media.push(media_id),
            _ => {
                if items.len() as i64 >= limit {
                    break;
                }
                items.push(AvailableItem {
                    item_id,
                    source_ref: row.get("source_ref"),
                    media: vec![media_id],
                });
            }
        }
    }
    Ok(items)
}

/// Random sample of `target` available item ids, drawn from a 2x oversampled
/// newest-first window so the selection stays fresh but non-deterministic.
#[instrument(skip_all)]
pub async fn sample_available_items(
    pool: &Pool,
    user_id: i64,
    chat_id: i64,
    target: i64,
) -> Result<Vec<AvailableItem>> {
    let sql = format!(
        "SELECT item_id FROM ( \
             SELECT DISTINCT ci.id AS item_id, ci.created_at AS created_at \
             FROM content_items ci \
             JOIN media_units mu ON mu.content_item_id = ci.id \
             WHERE ci.user_id = ?1 AND {AVAILABLE_MEDIA_WHERE} \
             ORDER BY ci.created_at DESC LIMIT ?3 \
         ) ORDER BY RANDOM() LIMIT ?4"
    );
    let ids: Vec<i64> = sqlx::query_scalar(&sql)
        .bind(user_id)
        .bind(chat_id)
        .bind(target * 2)
        .bind(target)
        .fetch_all(pool)
        .await?;

    let mut items = Vec::with_capacity(ids.len());
    for item_id in ids {
        let source_ref: String =
            sqlx::query_scalar("SELECT source_ref FROM content_items WHERE id = ?")
                .bind(item_id)
                .fetch_one(pool)
                .await?;
        let media_sql = format!(
            "SELECT mu.id FROM media_units mu \
             WHERE mu.content_item_id = ?1 AND {AVAILABLE_MEDIA_WHERE} \
             ORDER BY mu.id ASC"
        );
        let media: Vec<i64> = sqlx::query_scalar(&media_sql)
            .bind(item_id)
            .bind(chat_id)
            .fetch_all(pool)
            .await?;
        if !media.is_empty() {
            items.push(AvailableItem {
                item_id,
                source_ref,
                media,
            });
        }
    }
    Ok(items)
}

/// Insert a batch and its ordered members inside an open transaction.
pub async fn insert_batch_tx(
    tx: &mut Transaction<'_, Sqlite>,
    flow_id: Option<&str>,
    slot_id: Option<&str>,
    user_id: i64,
    chat_id: i64,
    seq: i64,
    media: &[i64],
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO batches (flow_id, slot_id, user_id, chat_id, seq) VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(flow_id)
    .bind(slot_id)
    .bind(user_id)
    .bind(chat_id)
    .bind(seq)
    .fetch_one(&mut **tx)
    .await?;
    let batch_id: i64 = rec.get("id");

    for (position, media_unit_id) in media.iter().enumerate() {
        sqlx::query("INSERT INTO batch_media (batch_id, media_unit_id, position) VALUES (?, ?, ?)")
            .bind(batch_id)
            .bind(media_unit_id)
            .bind(position as i64)
            .execute(&mut **tx)
            .await?;
    }
    Ok(batch_id)
}

#[instrument(skip_all)]
pub async fn batch_for_delivery(pool: &Pool, batch_id: i64) -> Result<Option<BatchForDelivery>> {
    let row = sqlx::query(
        "SELECT b.id, b.flow_id, b.slot_id, b.user_id, b.chat_id, b.seq, f.thread_id \
         FROM batches b LEFT JOIN flows f ON f.id = b.flow_id \
         WHERE b.id = ?",
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| BatchForDelivery {
        id: row.get("id"),
        flow_id: row.get("flow_id"),
        slot_id: row.get("slot_id"),
        user_id: row.get("user_id"),
        chat_id: row.get("chat_id"),
        seq: row.get("seq"),
        thread_id: row.get("thread_id"),
    }))
}

/// Resolve batch members to sendable URLs, dropping units soft-deleted or
/// unmirrored since planning time.
#[instrument(skip_all)]
pub async fn resolve_batch_media(pool: &Pool, batch_id: i64) -> Result<Vec<ResolvedMedia>> {
    let rows = sqlx::query(
        "SELECT mu.id AS media_unit_id, mu.url AS url, ci.source_ref AS source_ref \
         FROM batch_media bm \
         JOIN media_units mu ON mu.id = bm.media_unit_id \
         JOIN content_items ci ON ci.id = mu.content_item_id \
         WHERE bm.batch_id = ? AND mu.deleted_at IS NULL AND mu.url IS NOT NULL \
         ORDER BY bm.position ASC",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ResolvedMedia {
            media_unit_id: row.get("media_unit_id"),
            url: row.get("url"),
            source_ref: row.get("source_ref"),
        })
        .collect())
}

/// Idempotent bulk insert of delivery records: duplicates are silently
/// ignored so a re-run after a crash between send and persist cannot error
/// or double-count.
#[instrument(skip_all)]
pub async fn record_deliveries(
    pool: &Pool,
    chat_id: i64,
    delivered: &[(i64, Option<i64>)],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    for (media_unit_id, message_id) in delivered {
        sqlx::query(
            "INSERT OR IGNORE INTO delivery_records (media_unit_id, chat_id, message_id) VALUES (?, ?, ?)",
        )
        .bind(media_unit_id)
        .bind(chat_id)
        .bind(message_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Upstream post reference for a delivered message, used by `/source`.
#[instrument(skip_all)]
pub async fn delivered_source_ref(
    pool: &Pool,
    chat_id: i64,
    message_id: i64,
) -> Result<Option<String>> {
    let source_ref = sqlx::query_scalar(
        "SELECT ci.source_ref FROM delivery_records dr \
         JOIN media_units mu ON mu.id = dr.media_unit_id \
         JOIN content_items ci ON ci.id = mu.content_item_id \
         WHERE dr.chat_id = ? AND dr.message_id = ? LIMIT 1",
    )
    .bind(chat_id)
    .bind(message_id)
    .fetch_optional(pool)
    .await?;
    Ok(source_ref)
}

#[instrument(skip_all)]
pub async fn enqueue_job(
    pool: &Pool,
    kind: JobKind,
    batch_id: Option<i64>,
    slot_id: Option<&str>,
    chat_id: i64,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = enqueue_job_tx(&mut tx, kind, batch_id, slot_id, chat_id, due_at).await?;
    tx.commit().await?;
    Ok(id)
}

pub async fn enqueue_job_tx(
    tx: &mut Transaction<'_, Sqlite>,
    kind: JobKind,
    batch_id: Option<i64>,
    slot_id: Option<&str>,
    chat_id: i64,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO outbox (kind, batch_id, slot_id, chat_id, attempt, due_at) VALUES (?, ?, ?, ?, 0, ?) RETURNING id",
    )
    .bind(kind.as_str())
    .bind(batch_id)
    .bind(slot_id)
    .bind(chat_id)
    .bind(due_at)
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn next_due_job(pool: &Pool) -> Result<Option<JobRow>> {
    let row = sqlx::query(
        "SELECT id, kind, batch_id, slot_id, chat_id, attempt FROM outbox \
         WHERE failed_at IS NULL AND datetime(due_at) <= CURRENT_TIMESTAMP \
         ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let kind_str: String = row.get("kind");
    let kind = JobKind::parse(&kind_str)
        .ok_or_else(|| anyhow!("outbox row has unknown kind {}", kind_str))?;
    Ok(Some(JobRow {
        id: row.get("id"),
        kind,
        batch_id: row.get("batch_id"),
        slot_id: row.get("slot_id"),
        chat_id: row.get("chat_id"),
        attempt: row.get("attempt"),
    }))
}

#[instrument(skip_all)]
pub async fn delete_job(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM outbox WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Push the job's due time into the future without touching its attempt
/// counter. A deferral is not a failed attempt.
#[instrument(skip_all)]
pub async fn defer_job(pool: &Pool, id: i64, delay: Duration) -> Result<()> {
    let secs = delay.as_millis().div_ceil(1000) as i64;
    sqlx::query("UPDATE outbox SET due_at = datetime('now', ? || ' seconds') WHERE id = ?")
        .bind(secs)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Exponential backoff for transient failures: 5s * 2^attempt, capped.
#[instrument(skip_all)]
pub async fn backoff_job(pool: &Pool, id: i64, attempt: i32, max_cap_secs: i64) -> Result<()> {
    let secs = (5_i64) * (1_i64 << attempt.min(10));
    let cap = if max_cap_secs <= 0 { secs } else { max_cap_secs };
    let secs = secs.min(cap);
    sqlx::query(
        "UPDATE outbox SET attempt = ?, due_at = datetime('now', ? || ' seconds') WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Terminal failure: keep the row for operator inspection instead of
/// deleting it.
#[instrument(skip_all)]
pub async fn fail_job(pool: &Pool, id: i64, error: &str) -> Result<()> {
    sqlx::query("UPDATE outbox SET failed_at = CURRENT_TIMESTAMP, last_error = ? WHERE id = ?")
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Drop a batch and its membership rows, returning the media to the
/// availability pool. Called once the batch's delivery failed permanently;
/// delivery records written before the failure are untouched.
#[instrument(skip_all)]
pub async fn release_batch(pool: &Pool, batch_id: i64) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM batch_media WHERE batch_id = ?")
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM batches WHERE id = ?")
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Next pending batch in the same flow, if any.
pub async fn next_batch_in_flow(pool: &Pool, flow_id: &str, after_seq: i64) -> Result<Option<i64>> {
    let id = sqlx::query_scalar(
        "SELECT id FROM batches WHERE flow_id = ? AND seq > ? ORDER BY seq ASC LIMIT 1",
    )
    .bind(flow_id)
    .bind(after_seq)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

/// Next pending batch in the same slot, if any.
pub async fn next_batch_in_slot(pool: &Pool, slot_id: &str, after_seq: i64) -> Result<Option<i64>> {
    let id = sqlx::query_scalar(
        "SELECT id FROM batches WHERE slot_id = ? AND seq > ? ORDER BY seq ASC LIMIT 1",
    )
    .bind(slot_id)
    .bind(after_seq)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn availability_filters_delivered_and_deleted() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, 123, Some("alice")).await.unwrap();
        let chat = -100_500;

        let item = insert_content_item(&pool, uid, "1111").await.unwrap();
        let m1 = insert_media_unit(&pool, item, Some("https://cdn/a.jpg"))
            .await
            .unwrap();
        let m2 = insert_media_unit(&pool, item, Some("https://cdn/b.jpg"))
            .await
            .unwrap();
        let _unmirrored = insert_media_unit(&pool, item, None).await.unwrap();

        let items = list_available_content(&pool, uid, chat, 100).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].media, vec![m1, m2]);

        record_deliveries(&pool, chat, &[(m1, Some(10))]).await.unwrap();
        soft_delete_media_unit(&pool, m2).await.unwrap();
        let items = list_available_content(&pool, uid, chat, 100).await.unwrap();
        assert!(items.is_empty());

        // A different chat still sees the non-deleted unit.
        let items = list_available_content(&pool, uid, -42, 100).await.unwrap();
        assert_eq!(items[0].media, vec![m1]);
    }

    #[tokio::test]
    async fn delivery_records_are_idempotent() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, 7, None).await.unwrap();
        let item = insert_content_item(&pool, uid, "2222").await.unwrap();
        let m = insert_media_unit(&pool, item, Some("https://cdn/c.jpg"))
            .await
            .unwrap();

        record_deliveries(&pool, -1, &[(m, Some(1))]).await.unwrap();
        record_deliveries(&pool, -1, &[(m, Some(99))]).await.unwrap();

        let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM delivery_records")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(cnt, 1);
        // First write wins.
        let msg: Option<i64> =
            sqlx::query_scalar("SELECT message_id FROM delivery_records WHERE media_unit_id = ?")
                .bind(m)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(msg, Some(1));
    }

    #[tokio::test]
    async fn defer_does_not_touch_attempt() {
        let pool = setup_pool().await;
        let id = enqueue_job(&pool, JobKind::DeliverBatch, Some(1), None, -1, Utc::now())
            .await
            .unwrap();

        defer_job(&pool, id, Duration::from_millis(1500)).await.unwrap();

        let (attempt, due_future): (i32, i64) = sqlx::query_as(
            "SELECT attempt, datetime(due_at) > datetime('now') FROM outbox WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(attempt, 0);
        assert_eq!(due_future, 1);
        assert!(next_due_job(&pool).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_jobs_leave_the_queue_but_stay_visible() {
        let pool = setup_pool().await;
        let id = enqueue_job(&pool, JobKind::DeliverBatch, Some(1), None, -1, Utc::now())
            .await
            .unwrap();

        fail_job(&pool, id, "chat not found").await.unwrap();
        assert!(next_due_job(&pool).await.unwrap().is_none());

        let err: Option<String> =
            sqlx::query_scalar("SELECT last_error FROM outbox WHERE id = ?")
                .bind(id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(err.as_deref(), Some("chat not found"));
    }
}
