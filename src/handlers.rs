//! Telegram command layer. Users see only coarse outcomes ("queued",
//! "nothing to publish"); the scheduler's richer taxonomy stays internal.

use crate::config::Config;
use crate::db::{self, Pool};
use crate::flow;
use crate::planner::{self, PlannedItem};
use crate::slots::{self, SlotCreation};
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use teloxide::prelude::*;
use tracing::{info, instrument, warn};

const MAX_PUBLISH_ITEMS: i64 = 100;
const MAX_SLOT_ITEMS: i64 = 5;
const DEFAULT_SLOT_ITEMS: i64 = 3;

#[instrument(skip_all)]
pub async fn handle_update(bot: &Bot, pool: &Pool, cfg: &Config, msg: &Message) -> Result<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let tg_user_id = user.id.0 as i64;
    if !cfg.telegram.allowed_users.is_empty()
        && !cfg.telegram.allowed_users.contains(&tg_user_id)
    {
        return Ok(());
    }

    let Some(text) = msg.text() else {
        return Ok(());
    };
    let mut parts = text.trim().split_whitespace();
    let Some(command) = parts.next() else {
        return Ok(());
    };
    // Strip an @BotName suffix so commands work in groups.
    let command = command.split('@').next().unwrap_or(command);

    let in_group = msg.chat.is_group() || msg.chat.is_supergroup();
    let user_id = db::get_or_create_user(pool, tg_user_id, user.username.as_deref()).await?;

    match command {
        "/ping" => {
            let _ = bot.send_message(msg.chat.id, "PONG").await;
        }
        "/publish" if in_group => {
            let limit = parts
                .next()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(MAX_PUBLISH_ITEMS)
                .clamp(1, MAX_PUBLISH_ITEMS);
            publish(bot, pool, cfg, msg, user_id, limit).await?;
        }
        "/publish" => {
            let _ = bot
                .send_message(
                    msg.chat.id,
                    "Please add me to a group and publish images there.",
                )
                .await;
        }
        "/cancel" if in_group => {
            cancel_all(bot, pool, msg).await?;
        }
        "/source" if in_group => {
            source(bot, pool, msg).await?;
        }
        "/slot" if in_group => {
            let hours = parts.next().and_then(|s| s.parse::<i64>().ok()).unwrap_or(24);
            let count = parts
                .next()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(DEFAULT_SLOT_ITEMS)
                .clamp(1, MAX_SLOT_ITEMS);
            create_slot(bot, pool, cfg, msg, user_id, hours, count).await?;
        }
        "/unslot" if in_group => {
            let Some(slot_id) = parts.next() else {
                let _ = bot.send_message(msg.chat.id, "Usage: /unslot <slot-id>").await;
                return Ok(());
            };
            let removed = slots::delete_slot(pool, slot_id).await?;
            let reply = if removed {
                "Deleted scheduled slot."
            } else {
                "Slot not found or already publishing."
            };
            let _ = bot.send_message(msg.chat.id, reply).await;
        }
        _ if command.starts_with('/') => {
            let _ = bot.send_message(msg.chat.id, "Unknown command.").await;
        }
        _ => {}
    }

    Ok(())
}

async fn publish(
    bot: &Bot,
    pool: &Pool,
    cfg: &Config,
    msg: &Message,
    user_id: i64,
    limit: i64,
) -> Result<()> {
    let chat_id = msg.chat.id.0;
    let items = db::list_available_content(pool, user_id, chat_id, limit).await?;
    if items.is_empty() {
        let _ = bot
            .send_message(msg.chat.id, "No photos to publish, check back later.")
            .await;
        return Ok(());
    }

    let planned: Vec<PlannedItem> = items
        .into_iter()
        .map(|item| PlannedItem {
            item_id: item.item_id,
            media: item.media,
        })
        .collect();
    let batches = planner::plan_batches(&planned, cfg.publishing.batch_capacity);

    let flow_id = flow::create_flow(pool, user_id, chat_id, msg.thread_id, &batches).await?;
    info!(flow_id, chat_id, groups = batches.len(), "queued publishing flow");

    let _ = bot
        .send_message(
            msg.chat.id,
            format!(
                "Queued {} photo group(s) for publishing. They will be sent at a limited rate to respect Telegram limits.",
                batches.len()
            ),
        )
        .await;
    Ok(())
}

async fn cancel_all(bot: &Bot, pool: &Pool, msg: &Message) -> Result<()> {
    let chat_id = msg.chat.id.0;
    let mut canceled = 0_u64;
    for flow_id in flow::list_active_flows(pool, chat_id).await? {
        canceled += flow::cancel_flow(pool, &flow_id).await?;
    }

    let reply = if canceled > 0 {
        format!("Canceled {canceled} pending photo group(s).")
    } else {
        "Nothing to cancel.".to_string()
    };
    let _ = bot.send_message(msg.chat.id, reply).await;
    Ok(())
}

async fn source(bot: &Bot, pool: &Pool, msg: &Message) -> Result<()> {
    let Some(reply_to) = msg.reply_to_message() else {
        let _ = bot
            .send_message(msg.chat.id, "Please, reply to a message with a photo.")
            .await;
        return Ok(());
    };

    let found =
        db::delivered_source_ref(pool, msg.chat.id.0, reply_to.id.0 as i64).await?;
    let reply = match found {
        Some(source_ref) => format!("https://x.com/i/status/{source_ref}"),
        None => "No source found, sorry.".to_string(),
    };
    let _ = bot.send_message(msg.chat.id, reply).await;
    Ok(())
}

async fn create_slot(
    bot: &Bot,
    pool: &Pool,
    cfg: &Config,
    msg: &Message,
    user_id: i64,
    hours: i64,
    count: i64,
) -> Result<()> {
    let scheduled_for = Utc::now() + ChronoDuration::hours(hours.max(0));
    let created = slots::create_slot(
        pool,
        user_id,
        msg.chat.id.0,
        scheduled_for,
        count,
        cfg.publishing.batch_capacity,
    )
    .await?;

    let reply = match created {
        SlotCreation::Created(slot_id) => {
            format!("Scheduled slot {slot_id} for {scheduled_for}.")
        }
        SlotCreation::NothingToPublish => {
            warn!(chat_id = msg.chat.id.0, "slot requested with no available content");
            "No photos available to schedule, check back later.".to_string()
        }
    };
    let _ = bot.send_message(msg.chat.id, reply).await;
    Ok(())
}
