use crate::discord::{self, ChannelAnnouncer};
use crate::AppState;
use anyhow::Result;
use chrono::Utc;
use serenity::all::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

const FIRST_TICK_DELAY: Duration = Duration::from_secs(5);

pub async fn start_background_jobs(ctx: Arc<Context>, state: AppState) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;
    let tick_interval = state.config.pumpkin.tick_interval;

    let ctx_clone = ctx.clone();
    let state_clone = state.clone();
    let spawn_job = Job::new_repeated_async(tick_interval, move |_uuid, _l| {
        let ctx = ctx_clone.clone();
        let state = state_clone.clone();
        Box::pin(async move {
            run_pumpkin_tick(ctx, state).await;
        })
    })?;

    let first_tick = Job::new_one_shot_async(FIRST_TICK_DELAY, move |_uuid, _l| {
        let ctx = ctx.clone();
        let state = state.clone();
        Box::pin(async move {
            run_pumpkin_tick(ctx, state).await;
        })
    })?;

    scheduler.add(spawn_job).await?;
    scheduler.add(first_tick).await?;
    scheduler.start().await?;

    info!(
        "Background jobs started, pumpkin tick every {}s",
        tick_interval.as_secs()
    );

    Ok(scheduler)
}

async fn run_pumpkin_tick(ctx: Arc<Context>, state: AppState) {
    let disabled = match state.db.disabled_guilds().await {
        Ok(disabled) => disabled,
        Err(e) => {
            error!("[PUMPKIN] Failed to load guild settings: {}", e);
            return;
        }
    };

    let channels = discord::eligible_channels(
        &ctx.cache,
        &disabled,
        state.config.restricted_role_id,
        None,
    );

    let announcer = ChannelAnnouncer::new(ctx.http.clone());
    if let Err(e) = state.hunt.tick(&announcer, &channels, Utc::now()).await {
        error!("[PUMPKIN] Spawn tick failed: {}", e);
    }
}
