//! Scheduled slots: date-triggered publishing with content pre-selected at
//! slot creation time rather than on demand. A poller promotes due slots
//! into the same delivery queue the ad-hoc flows use; the slot status is a
//! projection driven by the queue, independent of delivery outcomes.

use crate::db::{self, Pool};
use crate::model::{JobKind, SlotStatus};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Outcome of slot creation. Having nothing left to publish is an explicit
/// answer for the caller, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotCreation {
    Created(String),
    NothingToPublish,
}

/// Create a slot for `scheduled_for`, sampling up to `target_count` items at
/// random from a 2x oversampled newest-first window and materializing each
/// item's undelivered media into one batch (truncated to `capacity`).
#[instrument(skip_all, fields(chat_id, target_count))]
pub async fn create_slot(
    pool: &Pool,
    user_id: i64,
    chat_id: i64,
    scheduled_for: DateTime<Utc>,
    target_count: i64,
    capacity: usize,
) -> Result<SlotCreation> {
    let items = db::sample_available_items(pool, user_id, chat_id, target_count.max(1)).await?;
    if items.is_empty() {
        return Ok(SlotCreation::NothingToPublish);
    }

    let slot_id = Uuid::new_v4().to_string();
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO scheduled_slots (id, user_id, chat_id, scheduled_for, status) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&slot_id)
    .bind(user_id)
    .bind(chat_id)
    .bind(scheduled_for)
    .bind(SlotStatus::Waiting.as_str())
    .execute(&mut *tx)
    .await?;

    for (seq, item) in items.iter().enumerate() {
        let media: Vec<i64> = item.media.iter().take(capacity).copied().collect();
        db::insert_batch_tx(
            &mut tx,
            None,
            Some(&slot_id),
            user_id,
            chat_id,
            seq as i64,
            &media,
        )
        .await?;
    }
    tx.commit().await?;

    info!(slot_id, chat_id, items = items.len(), %scheduled_for, "created scheduled slot");
    Ok(SlotCreation::Created(slot_id))
}

/// Delete a slot and its unpublished batches. Allowed only while the slot is
/// still WAITING; already-delivered history survives in delivery records.
#[instrument(skip_all, fields(slot_id = %slot_id))]
pub async fn delete_slot(pool: &Pool, slot_id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let deleted = sqlx::query("DELETE FROM scheduled_slots WHERE id = ? AND status = 'WAITING'")
        .bind(slot_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if deleted == 0 {
        tx.commit().await?;
        return Ok(false);
    }

    sqlx::query(
        "DELETE FROM batch_media WHERE batch_id IN (SELECT id FROM batches WHERE slot_id = ?)",
    )
    .bind(slot_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM batches WHERE slot_id = ?")
        .bind(slot_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM outbox WHERE slot_id = ?")
        .bind(slot_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(true)
}

pub async fn slot_status(pool: &Pool, slot_id: &str) -> Result<Option<SlotStatus>> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM scheduled_slots WHERE id = ?")
            .bind(slot_id)
            .fetch_optional(pool)
            .await?;
    match status {
        None => Ok(None),
        Some(s) => SlotStatus::parse(&s)
            .map(Some)
            .ok_or_else(|| anyhow!("slot {} has unknown status {}", slot_id, s)),
    }
}

#[instrument(skip_all)]
pub async fn set_slot_status(pool: &Pool, slot_id: &str, status: SlotStatus) -> Result<()> {
    let updated = sqlx::query("UPDATE scheduled_slots SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(slot_id)
        .execute(pool)
        .await?
        .rows_affected();
    if updated == 0 {
        // Deleted while its status job was queued; nothing to project.
        warn!(slot_id, "slot not found while updating status");
    }
    Ok(())
}

/// Move due WAITING slots to PUBLISHING and enqueue their work: the first
/// slot batch (the worker chains the rest) plus a trailing status job that
/// marks the slot PUBLISHED without waiting on delivery outcomes.
#[instrument(skip_all)]
pub async fn promote_due_slots(pool: &Pool) -> Result<u32> {
    let due = sqlx::query(
        "SELECT id, chat_id FROM scheduled_slots \
         WHERE status = 'WAITING' AND datetime(scheduled_for) <= CURRENT_TIMESTAMP \
         ORDER BY datetime(scheduled_for) ASC",
    )
    .fetch_all(pool)
    .await?;

    let mut promoted = 0;
    for row in due {
        let slot_id: String = row.get("id");
        let chat_id: i64 = row.get("chat_id");

        let mut tx = pool.begin().await?;
        sqlx::query("UPDATE scheduled_slots SET status = ? WHERE id = ? AND status = 'WAITING'")
            .bind(SlotStatus::Publishing.as_str())
            .bind(&slot_id)
            .execute(&mut *tx)
            .await?;

        let first_batch: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM batches WHERE slot_id = ? ORDER BY seq ASC LIMIT 1",
        )
        .bind(&slot_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(batch_id) = first_batch {
            db::enqueue_job_tx(
                &mut tx,
                JobKind::DeliverBatch,
                Some(batch_id),
                Some(&slot_id),
                chat_id,
                Utc::now(),
            )
            .await?;
        }
        db::enqueue_job_tx(
            &mut tx,
            JobKind::SlotStatus,
            None,
            Some(&slot_id),
            chat_id,
            Utc::now(),
        )
        .await?;
        tx.commit().await?;

        info!(slot_id, chat_id, "promoted scheduled slot to publishing");
        promoted += 1;
    }
    Ok(promoted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use sqlx::SqlitePool;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn seed_items(pool: &Pool, user_id: i64, n: usize, media_each: usize) {
        for i in 0..n {
            let item = db::insert_content_item(pool, user_id, &format!("post-{i}"))
                .await
                .unwrap();
            for j in 0..media_each {
                db::insert_media_unit(pool, item, Some(&format!("https://cdn/{i}/{j}.jpg")))
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn create_slot_materializes_batches() {
        let pool = setup_pool().await;
        let uid = db::get_or_create_user(&pool, 1, None).await.unwrap();
        seed_items(&pool, uid, 6, 2).await;

        let created = create_slot(&pool, uid, -1, Utc::now(), 3, 10).await.unwrap();
        let slot_id = match created {
            SlotCreation::Created(id) => id,
            SlotCreation::NothingToPublish => panic!("expected a slot"),
        };

        let batches: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM batches WHERE slot_id = ?")
            .bind(&slot_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(batches, 3);
        assert_eq!(
            slot_status(&pool, &slot_id).await.unwrap(),
            Some(SlotStatus::Waiting)
        );
        // Nothing enqueued until the slot comes due.
        let jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(jobs, 0);
    }

    #[tokio::test]
    async fn slot_media_is_reserved_against_other_slots() {
        let pool = setup_pool().await;
        let uid = db::get_or_create_user(&pool, 1, None).await.unwrap();
        seed_items(&pool, uid, 2, 1).await;

        assert!(matches!(
            create_slot(&pool, uid, -1, Utc::now(), 2, 10).await.unwrap(),
            SlotCreation::Created(_)
        ));
        // Both items are claimed by the first slot's batches.
        assert_eq!(
            create_slot(&pool, uid, -1, Utc::now(), 2, 10).await.unwrap(),
            SlotCreation::NothingToPublish
        );
    }

    #[tokio::test]
    async fn no_content_is_an_explicit_outcome() {
        let pool = setup_pool().await;
        let uid = db::get_or_create_user(&pool, 1, None).await.unwrap();
        assert_eq!(
            create_slot(&pool, uid, -1, Utc::now(), 3, 10).await.unwrap(),
            SlotCreation::NothingToPublish
        );
    }

    #[tokio::test]
    async fn delete_only_while_waiting() {
        let pool = setup_pool().await;
        let uid = db::get_or_create_user(&pool, 1, None).await.unwrap();
        seed_items(&pool, uid, 2, 1).await;

        let SlotCreation::Created(slot_id) =
            create_slot(&pool, uid, -1, Utc::now(), 2, 10).await.unwrap()
        else {
            panic!("expected a slot");
        };

        set_slot_status(&pool, &slot_id, SlotStatus::Publishing).await.unwrap();
        assert!(!delete_slot(&pool, &slot_id).await.unwrap());

        set_slot_status(&pool, &slot_id, SlotStatus::Waiting).await.unwrap();
        assert!(delete_slot(&pool, &slot_id).await.unwrap());

        let batches: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM batches")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(batches, 0);
    }

    #[tokio::test]
    async fn promotion_enqueues_first_batch_and_status_job() {
        let pool = setup_pool().await;
        let uid = db::get_or_create_user(&pool, 1, None).await.unwrap();
        seed_items(&pool, uid, 4, 1).await;

        let past = Utc::now() - ChronoDuration::seconds(5);
        let SlotCreation::Created(slot_id) =
            create_slot(&pool, uid, -1, past, 2, 10).await.unwrap()
        else {
            panic!("expected a slot");
        };

        assert_eq!(promote_due_slots(&pool).await.unwrap(), 1);
        assert_eq!(
            slot_status(&pool, &slot_id).await.unwrap(),
            Some(SlotStatus::Publishing)
        );

        let (deliveries, statuses): (i64, i64) = sqlx::query_as(
            "SELECT SUM(kind = 'deliver_batch'), SUM(kind = 'slot_status') FROM outbox",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(deliveries, 1);
        assert_eq!(statuses, 1);

        // Already promoted; a second pass finds nothing due.
        assert_eq!(promote_due_slots(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn future_slots_are_not_promoted() {
        let pool = setup_pool().await;
        let uid = db::get_or_create_user(&pool, 1, None).await.unwrap();
        seed_items(&pool, uid, 2, 1).await;

        let future = Utc::now() + ChronoDuration::hours(2);
        create_slot(&pool, uid, -1, future, 2, 10).await.unwrap();
        assert_eq!(promote_due_slots(&pool).await.unwrap(), 0);
    }
}
