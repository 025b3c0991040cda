//! Flows: ordered chains of batches delivered one at a time to a single
//! chat. Only the first batch is enqueued at creation; the worker enqueues
//! batch k+1 when batch k reaches a terminal state, which keeps at most one
//! delivery job in flight per flow.

use crate::db::{self, Pool};
use crate::model::JobKind;
use crate::planner::PlannedBatch;
use anyhow::{anyhow, Result};
use chrono::Utc;
use sqlx::Row;
use tracing::{info, instrument};
use uuid::Uuid;

/// Persist a flow with its ordered batches and submit the first delivery
/// job. Returns the flow id for correlation and cancellation.
#[instrument(skip_all, fields(chat_id, batches = batches.len()))]
pub async fn create_flow(
    pool: &Pool,
    user_id: i64,
    chat_id: i64,
    thread_id: Option<i32>,
    batches: &[PlannedBatch],
) -> Result<String> {
    if batches.is_empty() {
        return Err(anyhow!("no batches planned for flow"));
    }

    let flow_id = Uuid::new_v4().to_string();
    let mut tx = pool.begin().await?;

    sqlx::query("INSERT INTO flows (id, user_id, chat_id, thread_id) VALUES (?, ?, ?, ?)")
        .bind(&flow_id)
        .bind(user_id)
        .bind(chat_id)
        .bind(thread_id)
        .execute(&mut *tx)
        .await?;

    let mut first_batch_id = None;
    for (seq, batch) in batches.iter().enumerate() {
        let batch_id = db::insert_batch_tx(
            &mut tx,
            Some(&flow_id),
            None,
            user_id,
            chat_id,
            seq as i64,
            &batch.media,
        )
        .await?;
        if seq == 0 {
            first_batch_id = Some(batch_id);
        }
    }

    if let Some(batch_id) = first_batch_id {
        db::enqueue_job_tx(
            &mut tx,
            JobKind::DeliverBatch,
            Some(batch_id),
            None,
            chat_id,
            Utc::now(),
        )
        .await?;
    }
    tx.commit().await?;

    info!(flow_id, chat_id, batches = batches.len(), "created publishing flow");
    Ok(flow_id)
}

/// Cancel a flow's not-yet-delivered batches. A batch counts as delivered
/// once any of its media has a delivery record for the flow's chat, so a
/// batch the worker is sending concurrently is left alone. Returns the
/// number of batches removed; zero means the worker won the race, which is
/// a normal outcome.
#[instrument(skip_all, fields(flow_id = %flow_id))]
pub async fn cancel_flow(pool: &Pool, flow_id: &str) -> Result<u64> {
    let mut tx = pool.begin().await?;

    let cancelable: Vec<i64> = sqlx::query_scalar(
        "SELECT b.id FROM batches b \
         WHERE b.flow_id = ? AND NOT EXISTS ( \
             SELECT 1 FROM batch_media bm \
             JOIN delivery_records dr \
               ON dr.media_unit_id = bm.media_unit_id AND dr.chat_id = b.chat_id \
             WHERE bm.batch_id = b.id)",
    )
    .bind(flow_id)
    .fetch_all(&mut *tx)
    .await?;

    for batch_id in &cancelable {
        sqlx::query("DELETE FROM outbox WHERE kind = 'deliver_batch' AND batch_id = ?")
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM batch_media WHERE batch_id = ?")
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM batches WHERE id = ?")
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    info!(flow_id, canceled = cancelable.len(), "canceled publishing flow");
    Ok(cancelable.len() as u64)
}

/// Flows for this chat that still own at least one undelivered batch,
/// oldest first.
#[instrument(skip_all, fields(chat_id))]
pub async fn list_active_flows(pool: &Pool, chat_id: i64) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT f.id AS id FROM flows f \
         JOIN batches b ON b.flow_id = f.id \
         WHERE f.chat_id = ? AND NOT EXISTS ( \
             SELECT 1 FROM batch_media bm \
             JOIN delivery_records dr \
               ON dr.media_unit_id = bm.media_unit_id AND dr.chat_id = b.chat_id \
             WHERE bm.batch_id = b.id) \
         GROUP BY f.id \
         ORDER BY MIN(f.created_at), f.id",
    )
    .bind(chat_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|row| row.get("id")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn seed_item(pool: &Pool, user_id: i64, source_ref: &str, count: usize) -> Vec<i64> {
        let item = db::insert_content_item(pool, user_id, source_ref).await.unwrap();
        let mut media = Vec::new();
        for i in 0..count {
            media.push(
                db::insert_media_unit(pool, item, Some(&format!("https://cdn/{source_ref}/{i}.jpg")))
                    .await
                    .unwrap(),
            );
        }
        media
    }

    #[tokio::test]
    async fn create_flow_enqueues_only_first_batch() {
        let pool = setup_pool().await;
        let uid = db::get_or_create_user(&pool, 1, None).await.unwrap();
        let m1 = seed_item(&pool, uid, "a", 2).await;
        let m2 = seed_item(&pool, uid, "b", 2).await;

        let flow_id = create_flow(
            &pool,
            uid,
            -1,
            None,
            &[
                PlannedBatch { media: m1 },
                PlannedBatch { media: m2 },
            ],
        )
        .await
        .unwrap();

        let jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(jobs, 1);

        let active = list_active_flows(&pool, -1).await.unwrap();
        assert_eq!(active, vec![flow_id]);
        assert!(list_active_flows(&pool, -2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_plan_is_rejected() {
        let pool = setup_pool().await;
        assert!(create_flow(&pool, 1, -1, None, &[]).await.is_err());
    }

    #[tokio::test]
    async fn cancel_spares_delivered_batches() {
        let pool = setup_pool().await;
        let uid = db::get_or_create_user(&pool, 1, None).await.unwrap();
        let m1 = seed_item(&pool, uid, "a", 2).await;
        let m2 = seed_item(&pool, uid, "b", 2).await;
        let m3 = seed_item(&pool, uid, "c", 1).await;

        let flow_id = create_flow(
            &pool,
            uid,
            -1,
            None,
            &[
                PlannedBatch { media: m1.clone() },
                PlannedBatch { media: m2 },
                PlannedBatch { media: m3 },
            ],
        )
        .await
        .unwrap();

        // Batch 1 already went out.
        db::record_deliveries(&pool, -1, &[(m1[0], Some(10)), (m1[1], Some(11))])
            .await
            .unwrap();

        let canceled = cancel_flow(&pool, &flow_id).await.unwrap();
        assert_eq!(canceled, 2);

        // Delivered history is untouched.
        let records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM delivery_records")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(records, 2);

        // Re-canceling is a race-tolerant no-op.
        assert_eq!(cancel_flow(&pool, &flow_id).await.unwrap(), 0);
        assert!(list_active_flows(&pool, -1).await.unwrap().is_empty());
    }
}
