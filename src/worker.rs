//! The delivery worker: a single-concurrency outbox consumer. One worker
//! loop per process is the ordering guarantee — the rate limiter only
//! shapes throughput, it does not serialize batches.

use crate::config::{Config, RateLimit};
use crate::db::{self, JobRow, Pool};
use crate::limiter::{self, Decision};
use crate::model::{DeliveryOutcome, JobKind, SlotStatus};
use crate::slots;
use crate::telegram::{Destination, OutgoingMedia, SendError};
use anyhow::Result;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Knobs the worker needs, detached from the full config so tests can build
/// them directly.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub adhoc_limit: RateLimit,
    pub scheduled_limit: RateLimit,
    pub max_delivery_attempts: u32,
    pub max_backoff_seconds: i64,
}

impl WorkerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            adhoc_limit: cfg.publishing.adhoc_limit,
            scheduled_limit: cfg.publishing.scheduled_limit,
            max_delivery_attempts: cfg.app.max_delivery_attempts,
            max_backoff_seconds: cfg.app.max_backoff_seconds as i64,
        }
    }
}

const MIN_DEFER: Duration = Duration::from_secs(1);
const THROTTLE_DEFAULT_DEFER: Duration = Duration::from_secs(15);

/// Pull and process at most one due job. Returns whether a job was handled,
/// so the caller can poll-sleep when the queue is idle.
#[instrument(skip_all)]
pub async fn process_next_job(
    pool: &Pool,
    dest: &dyn Destination,
    settings: &WorkerSettings,
) -> Result<bool> {
    let Some(job) = db::next_due_job(pool).await? else {
        return Ok(false);
    };

    match job.kind {
        JobKind::SlotStatus => {
            if let Some(slot_id) = &job.slot_id {
                slots::set_slot_status(pool, slot_id, SlotStatus::Published).await?;
            }
            db::delete_job(pool, job.id).await?;
        }
        JobKind::DeliverBatch => match deliver_batch(pool, dest, settings, &job).await {
            Ok(DeliveryOutcome::Delivered) => {
                db::delete_job(pool, job.id).await?;
                chain_next_batch(pool, &job).await?;
                info!(job_id = job.id, batch_id = job.batch_id, "batch delivered");
            }
            Ok(DeliveryOutcome::Deferred(delay)) => {
                // Not a failure: same payload, same attempt counter, later due time.
                db::defer_job(pool, job.id, delay).await?;
                debug!(job_id = job.id, delay_ms = delay.as_millis() as u64, "delivery deferred");
            }
            Ok(DeliveryOutcome::Failed(reason)) => {
                db::fail_job(pool, job.id, &reason).await?;
                chain_next_batch(pool, &job).await?;
                release_failed_batch(pool, &job).await?;
                error!(
                    job_id = job.id,
                    batch_id = job.batch_id,
                    chat_id = job.chat_id,
                    reason,
                    "batch delivery failed permanently"
                );
            }
            Err(err) => {
                if job.attempt + 1 >= settings.max_delivery_attempts as i32 {
                    db::fail_job(pool, job.id, &format!("{err:#}")).await?;
                    chain_next_batch(pool, &job).await?;
                    release_failed_batch(pool, &job).await?;
                    error!(
                        ?err,
                        job_id = job.id,
                        batch_id = job.batch_id,
                        chat_id = job.chat_id,
                        attempt = job.attempt,
                        "batch delivery failed; retries exhausted"
                    );
                } else {
                    warn!(
                        ?err,
                        job_id = job.id,
                        batch_id = job.batch_id,
                        attempt = job.attempt,
                        "batch delivery failed; backoff"
                    );
                    db::backoff_job(pool, job.id, job.attempt, settings.max_backoff_seconds)
                        .await?;
                }
            }
        },
    }
    Ok(true)
}

/// One delivery attempt: rate-check, resolve, send, persist. Returns the
/// three-way outcome; transient errors propagate as `Err` for the caller's
/// bounded backoff.
async fn deliver_batch(
    pool: &Pool,
    dest: &dyn Destination,
    settings: &WorkerSettings,
    job: &JobRow,
) -> Result<DeliveryOutcome> {
    let Some(batch_id) = job.batch_id else {
        return Ok(DeliveryOutcome::Failed(
            "delivery job without batch reference".into(),
        ));
    };
    let Some(batch) = db::batch_for_delivery(pool, batch_id).await? else {
        // Canceled between enqueue and pickup; nothing to send.
        return Ok(DeliveryOutcome::Delivered);
    };

    let scheduled = batch.slot_id.is_some();
    let (limit, key) = if scheduled {
        (&settings.scheduled_limit, format!("slot-publishing:{}", batch.chat_id))
    } else {
        (&settings.adhoc_limit, format!("chat-publishing:{}", batch.chat_id))
    };

    // Weight is the planned batch size: one multi-photo batch may exhaust
    // the whole window in a single consume.
    let weight: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM batch_media WHERE batch_id = ?")
        .bind(batch_id)
        .fetch_one(pool)
        .await?;

    match limiter::consume(pool, limit, &key, weight).await? {
        Decision::Allowed => {}
        Decision::Rejected { ms_before_next } => {
            let delay = Duration::from_millis(ms_before_next.max(0) as u64).max(MIN_DEFER);
            return Ok(DeliveryOutcome::Deferred(delay));
        }
    }

    let resolved = db::resolve_batch_media(pool, batch_id).await?;
    if resolved.is_empty() {
        // Every member was soft-deleted since planning; the batch is spent.
        info!(batch_id, "no deliverable media left in batch; skipping send");
        return Ok(DeliveryOutcome::Delivered);
    }

    let sent = if resolved.len() == 1 {
        let media = OutgoingMedia {
            url: resolved[0].url.clone(),
            caption: scheduled.then(|| source_link(&resolved[0].source_ref)),
        };
        dest.send_single(batch.chat_id, batch.thread_id, &media)
            .await
            .map(|id| vec![id])
    } else {
        let media: Vec<OutgoingMedia> = resolved
            .iter()
            .enumerate()
            .map(|(i, m)| OutgoingMedia {
                url: m.url.clone(),
                caption: (scheduled && i == 0).then(|| source_link(&m.source_ref)),
            })
            .collect();
        dest.send_batch(batch.chat_id, batch.thread_id, &media).await
    };

    let message_ids = match sent {
        Ok(ids) => ids,
        Err(SendError::Throttled { retry_after }) => {
            // The platform throttled us past our own limiter; honor its delay.
            return Ok(DeliveryOutcome::Deferred(
                retry_after.unwrap_or(THROTTLE_DEFAULT_DEFER),
            ));
        }
        Err(SendError::Fatal(reason)) => return Ok(DeliveryOutcome::Failed(reason)),
        Err(SendError::Retryable(err)) => return Err(err),
    };

    let delivered: Vec<(i64, Option<i64>)> = resolved
        .iter()
        .enumerate()
        .map(|(i, m)| (m.media_unit_id, message_ids.get(i).copied()))
        .collect();
    db::record_deliveries(pool, batch.chat_id, &delivered).await?;

    Ok(DeliveryOutcome::Delivered)
}

/// A permanently failed batch must not keep claiming its media: drop its
/// rows so the units become plannable again. Runs after the chain step,
/// which still needs the batch row to find the successor.
async fn release_failed_batch(pool: &Pool, job: &JobRow) -> Result<()> {
    if let Some(batch_id) = job.batch_id {
        db::release_batch(pool, batch_id).await?;
    }
    Ok(())
}

fn source_link(source_ref: &str) -> String {
    format!("https://x.com/i/status/{source_ref}")
}

/// Enqueue the next batch of the same flow or slot once this one reached a
/// terminal state. This is the parent→child dependency that keeps batches
/// strictly ordered with at most one delivery job in flight per chain.
async fn chain_next_batch(pool: &Pool, job: &JobRow) -> Result<()> {
    let Some(batch_id) = job.batch_id else {
        return Ok(());
    };
    let Some(batch) = db::batch_for_delivery(pool, batch_id).await? else {
        return Ok(());
    };

    let next = if let Some(flow_id) = &batch.flow_id {
        db::next_batch_in_flow(pool, flow_id, batch.seq).await?
    } else if let Some(slot_id) = &batch.slot_id {
        db::next_batch_in_slot(pool, slot_id, batch.seq).await?
    } else {
        None
    };

    if let Some(next_batch_id) = next {
        db::enqueue_job(
            pool,
            JobKind::DeliverBatch,
            Some(next_batch_id),
            batch.slot_id.as_deref(),
            batch.chat_id,
            Utc::now(),
        )
        .await?;
        debug!(batch_id, next_batch_id, "chained next batch");
    }
    Ok(())
}
