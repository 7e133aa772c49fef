use std::sync::Arc;

use anyhow::{Context as _, Result};
use serenity::all::{Context, EventHandler, GatewayIntents, Message, Ready};
use serenity::async_trait;
use serenity::client::Client;
use tokio::sync::Mutex;
use tokio_cron_scheduler::JobScheduler;
use tracing::{error, info};

mod candy;
mod commands;
mod config;
mod db;
mod discord;
mod jobs;
mod pumpkin;

use commands::CommandHandler;
use config::Config;
use db::Database;
use pumpkin::PumpkinHunt;

/// Everything the event handler and the background jobs share.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub hunt: Arc<PumpkinHunt<Database>>,
    pub config: Arc<Config>,
}

impl AppState {
    fn new(db: Database, config: Config) -> Self {
        let hunt = PumpkinHunt::new(db.clone(), config.pumpkin.clone());
        Self {
            db,
            hunt: Arc::new(hunt),
            config: Arc::new(config),
        }
    }
}

struct Handler {
    state: AppState,
    command_handler: CommandHandler,
    scheduler: Mutex<Option<JobScheduler>>,
}

impl Handler {
    fn new(state: AppState) -> Self {
        let command_handler = CommandHandler::new(state.clone());
        Self {
            state,
            command_handler,
            scheduler: Mutex::new(None),
        }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let Some(guild_id) = msg.guild_id else {
            return;
        };

        if msg.content.trim_start().starts_with('!') {
            info!(
                "[COMMAND] {} ({}) in {}: {}",
                msg.author.name, msg.author.id, msg.channel_id, msg.content
            );
        }

        self.command_handler
            .handle_guild_message(&ctx, &msg, guild_id)
            .await;
    }

    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(
            "{} is connected to {} guilds!",
            ready.user.name,
            ready.guilds.len()
        );

        // Ready fires again after a reconnect; the jobs only start once.
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.is_some() {
            return;
        }

        let ctx_arc = Arc::new(ctx);
        match jobs::start_background_jobs(ctx_arc, self.state.clone()).await {
            Ok(started) => *scheduler = Some(started),
            Err(e) => error!("Failed to start background jobs: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

    // Set up file logging with daily rotation
    let file_appender = tracing_appender::rolling::daily("logs", "halloween.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .json()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .pretty();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("halloween_bot=info".parse()?)
                .add_directive("serenity=warn".parse()?),
        )
        .with(file_layer)
        .with(console_layer)
        .init();

    let config = Config::from_env()?;

    info!("Connecting to database...");
    let db = Database::new(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    info!("Running database migrations...");
    db.run_migrations()
        .await
        .context("Failed to run database migrations")?;

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::MESSAGE_CONTENT;

    let token = config.discord_token.clone();
    let handler = Handler::new(AppState::new(db, config));

    let mut client = Client::builder(&token, intents)
        .event_handler(handler)
        .await
        .context("Error creating client")?;

    info!("Starting Discord bot...");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}
