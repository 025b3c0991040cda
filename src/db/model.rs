use crate::model::JobKind;

/// A content item with at least one media unit still deliverable to the
/// target chat. Media ids are ordered for stable batch membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableItem {
    pub item_id: i64,
    pub source_ref: String,
    pub media: Vec<i64>,
}

/// One due row from the outbox queue.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: i64,
    pub kind: JobKind,
    pub batch_id: Option<i64>,
    pub slot_id: Option<String>,
    pub chat_id: i64,
    pub attempt: i32,
}

/// Batch context loaded for one delivery attempt.
#[derive(Debug, Clone)]
pub struct BatchForDelivery {
    pub id: i64,
    pub flow_id: Option<String>,
    pub slot_id: Option<String>,
    pub user_id: i64,
    pub chat_id: i64,
    pub seq: i64,
    pub thread_id: Option<i32>,
}

/// A batch member resolved to a sendable URL. Members soft-deleted since
/// planning time are filtered out before this struct is built.
#[derive(Debug, Clone)]
pub struct ResolvedMedia {
    pub media_unit_id: i64,
    pub url: String,
    pub source_ref: String,
}
