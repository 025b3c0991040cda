//! Destination seam: the delivery calls the scheduler makes against
//! Telegram, behind a trait so tests can substitute a recording fake.

use async_trait::async_trait;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{InputFile, InputMedia, InputMediaPhoto};
use thiserror::Error;
use tracing::instrument;

/// Delivery failure taxonomy. `Throttled` is not a failure at all: the
/// worker turns it into a deferred retry with the platform's advertised
/// delay. `Fatal` is terminal (chat deleted, bot blocked, bad media);
/// `Retryable` is left to the queue's bounded backoff.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("throttled by destination")]
    Throttled { retry_after: Option<Duration> },
    #[error("permanent delivery failure: {0}")]
    Fatal(String),
    #[error("transient delivery failure: {0}")]
    Retryable(anyhow::Error),
}

/// One media unit ready to send, with an optional caption (set on the first
/// element of a group, or on a single send).
#[derive(Debug, Clone)]
pub struct OutgoingMedia {
    pub url: String,
    pub caption: Option<String>,
}

/// A chat that accepts media deliveries. Implementations must surface
/// throttling as `SendError::Throttled` so the scheduler can defer instead
/// of fail.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Deliver an ordered group of media in one call. Returns the resulting
    /// message ids, aligned with the input order.
    async fn send_batch(
        &self,
        chat_id: i64,
        thread_id: Option<i32>,
        media: &[OutgoingMedia],
    ) -> Result<Vec<i64>, SendError>;

    /// Deliver one media unit. Some destination APIs distinguish single
    /// sends from groups (and only singles carry a first-class caption).
    async fn send_single(
        &self,
        chat_id: i64,
        thread_id: Option<i32>,
        media: &OutgoingMedia,
    ) -> Result<i64, SendError>;
}

#[derive(Clone)]
pub struct TelegramDestination {
    bot: Bot,
}

impl TelegramDestination {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn parse_url(url: &str) -> Result<reqwest::Url, SendError> {
    // A stored URL that no longer parses will never send; don't retry it.
    reqwest::Url::parse(url).map_err(|err| SendError::Fatal(format!("invalid media url: {err}")))
}

fn map_request_error(err: teloxide::RequestError) -> SendError {
    match err {
        teloxide::RequestError::RetryAfter(retry_after) => SendError::Throttled {
            retry_after: Some(retry_after),
        },
        // The platform rejected the request outright: chat gone, bot
        // blocked, media refused. Retrying cannot help.
        teloxide::RequestError::Api(api) => SendError::Fatal(api.to_string()),
        teloxide::RequestError::MigrateToChatId(id) => {
            SendError::Fatal(format!("chat migrated to {id}"))
        }
        other => SendError::Retryable(other.into()),
    }
}

#[async_trait]
impl Destination for TelegramDestination {
    #[instrument(skip_all, fields(chat_id, count = media.len()))]
    async fn send_batch(
        &self,
        chat_id: i64,
        thread_id: Option<i32>,
        media: &[OutgoingMedia],
    ) -> Result<Vec<i64>, SendError> {
        let mut group = Vec::with_capacity(media.len());
        for item in media {
            let mut photo = InputMediaPhoto::new(InputFile::url(parse_url(&item.url)?));
            if let Some(caption) = &item.caption {
                photo = photo.caption(caption.clone());
            }
            group.push(InputMedia::Photo(photo));
        }

        let mut req = self.bot.send_media_group(ChatId(chat_id), group);
        if let Some(thread_id) = thread_id {
            req = req.message_thread_id(thread_id);
        }
        let messages = req.await.map_err(map_request_error)?;
        Ok(messages.iter().map(|m| m.id.0 as i64).collect())
    }

    #[instrument(skip_all, fields(chat_id))]
    async fn send_single(
        &self,
        chat_id: i64,
        thread_id: Option<i32>,
        media: &OutgoingMedia,
    ) -> Result<i64, SendError> {
        let mut req = self
            .bot
            .send_photo(ChatId(chat_id), InputFile::url(parse_url(&media.url)?));
        if let Some(thread_id) = thread_id {
            req = req.message_thread_id(thread_id);
        }
        if let Some(caption) = &media.caption {
            req = req.caption(caption.clone());
        }
        let message = req.await.map_err(map_request_error)?;
        Ok(message.id.0 as i64)
    }
}
