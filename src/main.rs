use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tracing::{error, info};

use tg_repostbot::telegram::TelegramDestination;
use tg_repostbot::worker::WorkerSettings;
use tg_repostbot::{config, db, handlers, slots, worker};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/repostbot.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let settings = WorkerSettings::from_config(&cfg);
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);

    // Delivery worker: single consumer, which is what keeps batches for a
    // chat strictly ordered.
    let worker_pool = pool.clone();
    let worker_dest = TelegramDestination::new(bot.clone());
    let worker_sleep = poll_sleep;
    tokio::spawn(async move {
        loop {
            match worker::process_next_job(&worker_pool, &worker_dest, &settings).await {
                Ok(processed) => {
                    if !processed {
                        tokio::time::sleep(worker_sleep).await;
                    }
                }
                Err(err) => {
                    error!(?err, "delivery worker error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    // Slot poller: promotes due scheduled slots into the delivery queue.
    let slot_pool = pool.clone();
    tokio::spawn(async move {
        loop {
            if let Err(err) = slots::promote_due_slots(&slot_pool).await {
                error!(?err, "slot poller error");
            }
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
    });

    let cfg = Arc::new(cfg);
    info!("starting telegram bot");
    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let pool = pool.clone();
        let cfg = cfg.clone();
        async move {
            if let Err(err) = handlers::handle_update(&bot, &pool, &cfg, &msg).await {
                error!(?err, "failed to handle update");
            }
            respond(())
        }
    })
    .await;

    Ok(())
}
