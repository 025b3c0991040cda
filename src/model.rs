use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle of a scheduled slot. Status is a projection maintained by the
/// queue, independent of whether individual batch deliveries succeeded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SlotStatus {
    Waiting,
    Publishing,
    Published,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Waiting => "WAITING",
            SlotStatus::Publishing => "PUBLISHING",
            SlotStatus::Published => "PUBLISHED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WAITING" => Some(SlotStatus::Waiting),
            "PUBLISHING" => Some(SlotStatus::Publishing),
            "PUBLISHED" => Some(SlotStatus::Published),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobKind {
    DeliverBatch,
    SlotStatus,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::DeliverBatch => "deliver_batch",
            JobKind::SlotStatus => "slot_status",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deliver_batch" => Some(JobKind::DeliverBatch),
            "slot_status" => Some(JobKind::SlotStatus),
            _ => None,
        }
    }
}

/// Three-way result of one delivery attempt. `Deferred` means "run the same
/// job again later" and costs nothing against the retry budget; `Failed` is
/// terminal. Transient errors propagate as `Err` and are retried with
/// backoff by the queue adapter.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered,
    Deferred(Duration),
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub tg_user_id: i64,
    pub username: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: i64,
    pub user_id: i64,
    pub source_ref: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaUnit {
    pub id: i64,
    pub content_item_id: i64,
    pub url: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}
