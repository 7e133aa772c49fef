use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serenity::all::{
    Colour, Context, CreateAllowedMentions, CreateEmbed, CreateMessage, EditMember, GuildId,
    Http, Message, MessageFlags,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::candy::{self, CandyLedger, CandySource, Payout};
use crate::db::{Database, HistoryEntry};
use crate::discord::{self, ChannelAnnouncer, EMBED_COLOUR, GHOST_COLOUR, HAUNTED_COLOUR};
use crate::pumpkin::{GrabOutcome, ManualSpawn, PumpkinHunt};
use crate::AppState;

const TRICK_OR_TREAT: &str = "trickortreat";
const INBOUND_SPAWNS: u32 = 5;
const MAX_SPAWN_COUNT: u32 = 10;

const SPOOKY_FINDS: [(&str, &str); 8] = [
    ("🍬 You found ", " hidden in the shadows!"),
    ("🎃 A friendly jack-o'-lantern left you ", "!"),
    ("🕷️ A spider dropped ", " from its web!"),
    ("🦇 A bat flew by and dropped ", "!"),
    ("👻 A friendly ghost gifted you ", "!"),
    ("🌙 Under the moonlight, you discovered ", "!"),
    ("⚰️ You found ", " in an old coffin!"),
    ("💀 You found ", " in a skeleton's pocket!"),
];

pub struct CommandHandler {
    state: AppState,
}

impl CommandHandler {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn handle_guild_message(&self, ctx: &Context, msg: &Message, guild_id: GuildId) {
        if let Err(e) = self.dispatch(ctx, msg, guild_id).await {
            error!(
                "Failed to handle message {} from {}: {:#}",
                msg.id, msg.author.id, e
            );
            if msg.content.trim_start().starts_with('!') {
                reply(ctx, msg, "❌ Something spooky went wrong. Please try again later.")
                    .await
                    .ok();
            }
        }
    }

    async fn dispatch(&self, ctx: &Context, msg: &Message, guild_id: GuildId) -> Result<()> {
        let content = msg.content.trim();
        let Some(rest) = content.strip_prefix('!') else {
            return self.handle_passive_candy(ctx, msg, guild_id).await;
        };

        let parts: Vec<&str> = rest.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Ok(());
        };
        let command = first.to_lowercase();
        let args = &parts[1..];

        if command != "enable"
            && command != "disable"
            && !self.state.db.is_guild_enabled(guild_id.get()).await?
        {
            reply(
                ctx,
                msg,
                "🚫 The bot is currently disabled. An administrator can enable it with `!enable`.",
            )
            .await?;
            return Ok(());
        }

        match command.as_str() {
            "grab" => self.handle_grab(ctx, msg, guild_id).await?,
            "candies" => self.handle_candies(ctx, msg).await?,
            "history" => self.handle_history(ctx, msg).await?,
            "leaderboard" => self.handle_leaderboard(ctx, msg).await?,
            "commands" => self.handle_commands(ctx, msg).await?,
            "trickortreat" => self.handle_trick_or_treat(ctx, msg, guild_id).await?,
            "enable" => self.handle_toggle(ctx, msg, guild_id, true).await?,
            "disable" => self.handle_toggle(ctx, msg, guild_id, false).await?,
            "candymodifier" => self.handle_candy_modifier(ctx, msg, guild_id, args).await?,
            "spumpkin" => self.handle_spawn_here(ctx, msg, guild_id, args).await?,
            "pumpkininbound" => self.handle_pumpkin_inbound(ctx, msg, guild_id).await?,
            _ => {}
        }

        Ok(())
    }

    async fn is_admin(&self, ctx: &Context, msg: &Message, guild_id: GuildId) -> bool {
        let member = match msg.member(ctx).await {
            Ok(member) => member,
            Err(e) => {
                warn!("Failed to fetch member {}: {}", msg.author.id, e);
                return false;
            }
        };

        ctx.cache
            .guild(guild_id)
            .map(|guild| guild.member_permissions(&member).administrator())
            .unwrap_or(false)
    }

    async fn handle_grab(&self, ctx: &Context, msg: &Message, guild_id: GuildId) -> Result<()> {
        let outcome = self
            .state
            .hunt
            .grab(
                &ChannelAnnouncer::new(ctx.http.clone()),
                msg.author.id.get(),
                Some(guild_id.get()),
                msg.channel_id.get(),
                Utc::now(),
            )
            .await?;

        let description = match outcome {
            GrabOutcome::NothingToGrab => {
                info!("[GRAB] {} found nothing to grab", msg.author.id);
                "💨 **No pumpkin to grab!** Keep an eye out for the next one!".to_string()
            }
            GrabOutcome::WrongChannel => {
                info!("[GRAB] {} tried the wrong channel", msg.author.id);
                "💨 **The pumpkin is not in this channel!**".to_string()
            }
            GrabOutcome::Grabbed(payout) => format!(
                "🎃 **Congratulations {}!** You caught the pumpkin and got {}! 🍬\nYour total: **{} candies**",
                msg.author.name,
                payout.describe(),
                payout.new_balance
            ),
        };

        reply(ctx, msg, description).await
    }

    async fn handle_candies(&self, ctx: &Context, msg: &Message) -> Result<()> {
        let balance = self.state.db.candy_balance(msg.author.id.get()).await?;
        reply(ctx, msg, format!("🍬 You have **{} candies**!", balance)).await
    }

    async fn handle_history(&self, ctx: &Context, msg: &Message) -> Result<()> {
        let entries = self.state.db.recent_history(msg.author.id.get(), 10).await?;

        let description = if entries.is_empty() {
            "📜 You haven't earned any candies yet! Try `!trickortreat` or chat to earn candies!"
                .to_string()
        } else {
            format_history(&entries, Utc::now())
        };

        reply(ctx, msg, description).await
    }

    async fn handle_leaderboard(&self, ctx: &Context, msg: &Message) -> Result<()> {
        let rows = self.state.db.leaderboard(10).await?;

        let description = if rows.is_empty() {
            "🏆 **No one has earned candies yet!** Be the first!".to_string()
        } else {
            format_leaderboard(&rows)
        };

        reply(ctx, msg, description).await
    }

    async fn handle_commands(&self, ctx: &Context, msg: &Message) -> Result<()> {
        let help_embed = CreateEmbed::new()
            .title("🎃 AVAILABLE COMMANDS 🎃")
            .description("Here are all the commands you can use:")
            .field("!trickortreat", "Get random candies or a trick (1 hour cooldown)", false)
            .field("!grab", "Grab a spawned pumpkin to win candies", false)
            .field("!candies", "Check your candy balance", false)
            .field("!history", "View your last 10 candy earnings", false)
            .field("!leaderboard", "View the top 10 candy collectors", false)
            .field("!commands", "Show this command list", false)
            .field("ADMIN COMMANDS", "\u{200b}", false)
            .field("!enable / !disable", "Turn the bot on or off for this server", false)
            .field("!spumpkin [count]", "Spawn pumpkins in this channel (up to 10)", false)
            .field("!pumpkininbound", "Spawn 5 pumpkins in random channels", false)
            .field(
                "!candymodifier <±%>",
                "Adjust candy drop rates, e.g. `!candymodifier 25%` or `!candymodifier -25%`",
                false,
            )
            .colour(EMBED_COLOUR);

        msg.channel_id
            .send_message(
                &ctx.http,
                CreateMessage::new()
                    .embed(help_embed)
                    .reference_message(msg),
            )
            .await?;

        Ok(())
    }

    async fn handle_toggle(
        &self,
        ctx: &Context,
        msg: &Message,
        guild_id: GuildId,
        enabled: bool,
    ) -> Result<()> {
        if !self.is_admin(ctx, msg, guild_id).await {
            let verb = if enabled { "enable" } else { "disable" };
            return reply(ctx, msg, format!("❌ Only administrators can {} the bot!", verb)).await;
        }

        self.state.db.set_guild_enabled(guild_id.get(), enabled).await?;
        info!(
            "[SETTINGS] {} set enabled={} in guild {}",
            msg.author.id, enabled, guild_id
        );

        let description = if enabled {
            "✅ Bot has been enabled! All commands are now available."
        } else {
            "🚫 Bot has been disabled. Use `!enable` to re-enable it."
        };
        reply(ctx, msg, description).await
    }

    async fn handle_candy_modifier(
        &self,
        ctx: &Context,
        msg: &Message,
        guild_id: GuildId,
        args: &[&str],
    ) -> Result<()> {
        if !self.is_admin(ctx, msg, guild_id).await {
            return reply(ctx, msg, "❌ Only administrators can modify candy drop rates!").await;
        }

        let Some(arg) = args.first() else {
            let multiplier = self.state.db.guild_multiplier(guild_id.get()).await?;
            return reply(
                ctx,
                msg,
                format!(
                    "📊 **Current candy modifier:** {} ({:.2}x)\n\nUsage: `!candymodifier <±%>`\nExample: `!candymodifier 25%` or `!candymodifier -25%`",
                    candy::format_percent_change(multiplier),
                    multiplier
                ),
            )
            .await;
        };

        let Some(change) = candy::parse_modifier(arg) else {
            return reply(
                ctx,
                msg,
                "❌ Invalid format! Use: `!candymodifier <±%>` (e.g., `!candymodifier 25%` or `!candymodifier -25%`)",
            )
            .await;
        };

        let multiplier = self
            .state
            .db
            .set_guild_multiplier(guild_id.get(), candy::multiplier_from_percent(change))
            .await?;

        info!(
            "[SETTINGS] {} set candy multiplier {:.2} (requested {}%) in guild {}",
            msg.author.id, multiplier, change, guild_id
        );

        reply(
            ctx,
            msg,
            format!(
                "✅ **Candy modifier updated for everyone in this server!**\n\nNew modifier: {} ({:.2}x)\nAll candy drops are now multiplied by {:.2}!",
                candy::format_percent_change(multiplier),
                multiplier,
                multiplier
            ),
        )
        .await
    }

    async fn handle_trick_or_treat(
        &self,
        ctx: &Context,
        msg: &Message,
        guild_id: GuildId,
    ) -> Result<()> {
        let user_id = msg.author.id.get();
        let now = Utc::now();

        if let Some(last_used) = self.state.db.last_used(user_id, TRICK_OR_TREAT).await? {
            if let Some(minutes) = cooldown_remaining(last_used, now, Duration::hours(1)) {
                return reply(
                    ctx,
                    msg,
                    format!(
                        "⏰ You need to wait **{} minutes** before trick-or-treating again!",
                        minutes
                    ),
                )
                .await;
            }
        }

        self.state
            .db
            .touch_cooldown(user_id, TRICK_OR_TREAT, now)
            .await?;

        let (is_trick, base) = {
            let mut rng = rand::thread_rng();
            (rng.gen_bool(0.3), rng.gen_range(5..=30))
        };

        if is_trick {
            let until = (now + Duration::seconds(10)).to_rfc3339();
            let description = match guild_id
                .edit_member(
                    &ctx.http,
                    msg.author.id,
                    EditMember::new().disable_communication_until(until),
                )
                .await
            {
                Ok(_) => {
                    info!("[TRICK] {} timed out for 10 seconds", msg.author.id);
                    "👻 **TRICK!** You've been spooked and timed out for **10 seconds**! 👻"
                }
                Err(e) => {
                    info!("[TRICK] Could not time out {}: {}", msg.author.id, e);
                    "👻 **TRICK!** You got spooked, but you're too powerful to timeout! 💪"
                }
            };
            return reply(ctx, msg, description).await;
        }

        let payout = self
            .state
            .db
            .credit(user_id, Some(guild_id.get()), base, CandySource::TrickOrTreat)
            .await?;

        reply(
            ctx,
            msg,
            format!(
                "🎃 **TREAT!** You got {}! 🍬 Your total: **{} candies**",
                payout.describe(),
                payout.new_balance
            ),
        )
        .await
    }

    async fn handle_passive_candy(
        &self,
        ctx: &Context,
        msg: &Message,
        guild_id: GuildId,
    ) -> Result<()> {
        let find = {
            let mut rng = rand::thread_rng();
            if !rng.gen_bool(0.07) {
                return Ok(());
            }
            let base = rng.gen_range(10..=20);
            let template = *SPOOKY_FINDS.choose(&mut rng).unwrap_or(&SPOOKY_FINDS[0]);
            (passive_find(base, rng.gen::<f64>()), template)
        };
        let ((base, source), (prefix, suffix)) = find;

        if !self.state.db.is_guild_enabled(guild_id.get()).await? {
            return Ok(());
        }

        let payout = self
            .state
            .db
            .credit(msg.author.id.get(), Some(guild_id.get()), base, source)
            .await?;

        let (description, colour) = describe_passive(&payout, source, prefix, suffix);

        msg.channel_id
            .send_message(
                &ctx.http,
                CreateMessage::new()
                    .embed(CreateEmbed::new().colour(colour).description(description))
                    .reference_message(msg)
                    .allowed_mentions(CreateAllowedMentions::new())
                    .flags(MessageFlags::SUPPRESS_NOTIFICATIONS),
            )
            .await?;

        info!(
            "[CANDY] {} ({}) earned {} from {}",
            msg.author.name,
            msg.author.id,
            payout.paid,
            source.as_str()
        );

        Ok(())
    }

    async fn handle_spawn_here(
        &self,
        ctx: &Context,
        msg: &Message,
        guild_id: GuildId,
        args: &[&str],
    ) -> Result<()> {
        if !self.is_admin(ctx, msg, guild_id).await {
            return reply(
                ctx,
                msg,
                "🚫 **You need administrator permissions to use this command!**",
            )
            .await;
        }

        let count = args
            .first()
            .and_then(|arg| arg.parse::<u32>().ok())
            .unwrap_or(1)
            .clamp(1, MAX_SPAWN_COUNT);

        if count > 1 {
            reply(
                ctx,
                msg,
                format!(
                    "🎃 **Spawning {} pumpkins!** They'll appear one by one as each is claimed!",
                    count
                ),
            )
            .await?;
        }

        info!(
            "[PUMPKIN] {} requested {} spawn(s) in channel {}",
            msg.author.id, count, msg.channel_id
        );

        spawn_in_background(
            Arc::clone(&self.state.hunt),
            Arc::clone(&ctx.http),
            vec![msg.channel_id.get()],
            count,
            std::time::Duration::ZERO,
        );

        Ok(())
    }

    async fn handle_pumpkin_inbound(
        &self,
        ctx: &Context,
        msg: &Message,
        guild_id: GuildId,
    ) -> Result<()> {
        if !self.is_admin(ctx, msg, guild_id).await {
            return reply(
                ctx,
                msg,
                "🚫 **You need administrator permissions to use this command!**",
            )
            .await;
        }

        let channels = discord::eligible_channels(
            &ctx.cache,
            &HashSet::new(),
            self.state.config.restricted_role_id,
            Some(guild_id),
        );

        if channels.is_empty() {
            return reply(ctx, msg, "❌ **No valid channels found!**").await;
        }

        reply(
            ctx,
            msg,
            format!(
                "🎃 **Spawning {} pumpkins!** Watch out, they'll appear one by one!",
                INBOUND_SPAWNS
            ),
        )
        .await?;

        info!(
            "[PUMPKIN] {} started pumpkin inbound in guild {} across {} channels",
            msg.author.id,
            guild_id,
            channels.len()
        );

        spawn_in_background(
            Arc::clone(&self.state.hunt),
            Arc::clone(&ctx.http),
            channels,
            INBOUND_SPAWNS,
            std::time::Duration::from_secs(2),
        );

        Ok(())
    }
}

/// Runs `count` manual spawns one after another, each waiting for the
/// previous pumpkin to clear.
fn spawn_in_background(
    hunt: Arc<PumpkinHunt<Database>>,
    http: Arc<Http>,
    channels: Vec<u64>,
    count: u32,
    pause: std::time::Duration,
) {
    tokio::spawn(async move {
        let announcer = ChannelAnnouncer::new(http);
        let mut spawned = 0;

        for _ in 0..count {
            match hunt.wait_until_clear().await {
                Ok(true) => {}
                Ok(false) => warn!("[PUMPKIN] Previous pumpkin still active, trying anyway"),
                Err(e) => {
                    error!("[PUMPKIN] Failed to check pumpkin state: {}", e);
                    break;
                }
            }

            let picked = channels.choose(&mut rand::thread_rng()).copied();
            let Some(channel_id) = picked else {
                break;
            };

            match hunt.spawn_in(&announcer, channel_id, Utc::now()).await {
                Ok(ManualSpawn::Spawned { .. }) => spawned += 1,
                Ok(ManualSpawn::Busy) => warn!("[PUMPKIN] Skipped a manual spawn, pumpkin busy"),
                Err(e) => error!("[PUMPKIN] Manual spawn in {} failed: {}", channel_id, e),
            }

            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }

        info!("[PUMPKIN] Manual spawns finished: {} of {}", spawned, count);
    });
}

async fn reply(ctx: &Context, msg: &Message, description: impl Into<String>) -> Result<()> {
    msg.channel_id
        .send_message(
            &ctx.http,
            CreateMessage::new()
                .embed(discord::embed(description))
                .reference_message(msg)
                .allowed_mentions(CreateAllowedMentions::new()),
        )
        .await?;

    Ok(())
}

/// Ghost encounters (5%) triple the base, haunted finds (next 15%) add half.
fn passive_find(base: i64, roll: f64) -> (i64, CandySource) {
    if roll < 0.05 {
        (base * 3, CandySource::GhostEncounter)
    } else if roll < 0.20 {
        ((base as f64 * 1.5).floor() as i64, CandySource::HauntedFind)
    } else {
        (base, CandySource::PassiveChat)
    }
}

fn describe_passive(
    payout: &Payout,
    source: CandySource,
    prefix: &str,
    suffix: &str,
) -> (String, Colour) {
    match source {
        CandySource::GhostEncounter => (
            format!(
                "👻✨ **GHOST ENCOUNTER!** ✨👻\n\nA friendly ghost appeared and showered you with {} (3x bonus)!\nYour total: **{} candies**",
                payout.describe(),
                payout.new_balance
            ),
            GHOST_COLOUR,
        ),
        CandySource::HauntedFind => (
            format!(
                "🌟 **HAUNTED TREASURE!** 🌟\n\nYou found a haunted candy stash with {} (1.5x bonus)!\nYour total: **{} candies**",
                payout.describe(),
                payout.new_balance
            ),
            HAUNTED_COLOUR,
        ),
        _ => (
            format!(
                "{}{}{} Your total: **{} candies**",
                prefix,
                payout.describe(),
                suffix,
                payout.new_balance
            ),
            EMBED_COLOUR,
        ),
    }
}

/// Whole minutes left on a cooldown, rounded up, or `None` once it has passed.
fn cooldown_remaining(
    last_used: DateTime<Utc>,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> Option<i64> {
    let remaining = cooldown - (now - last_used);
    if remaining <= Duration::zero() {
        return None;
    }
    Some((remaining.num_seconds() + 59) / 60)
}

fn time_ago(earned_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let minutes = (now - earned_at).num_minutes().max(0);
    if minutes < 60 {
        format!("{}m ago", minutes)
    } else {
        format!("{}h ago", minutes / 60)
    }
}

fn format_history(entries: &[HistoryEntry], now: DateTime<Utc>) -> String {
    let mut text = String::from("📜 **Your Last Candy Earnings:**\n\n");
    for entry in entries {
        text.push_str(&format!(
            "🍬 **+{}** candies from **{}** ({})\n",
            entry.amount,
            entry.source,
            time_ago(entry.earned_at, now)
        ));
    }
    text
}

fn format_leaderboard(rows: &[(u64, i64)]) -> String {
    let mut text = String::from("🏆 **TOP CANDY COLLECTORS** 🏆\n\n");
    for (index, (user_id, balance)) in rows.iter().enumerate() {
        let place = match index {
            0 => "🥇".to_string(),
            1 => "🥈".to_string(),
            2 => "🥉".to_string(),
            n => format!("{}.", n + 1),
        };
        text.push_str(&format!(
            "{} <@{}>: **{} candies** 🍬\n",
            place, user_id, balance
        ));
    }
    text
}
