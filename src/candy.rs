use anyhow::Result;
use regex::Regex;
use serenity::async_trait;
use std::sync::OnceLock;

pub const MIN_GUILD_MULTIPLIER: f64 = 0.1;
pub const MAX_GUILD_MULTIPLIER: f64 = 10.0;
pub const UPGRADE_STEP: f64 = 0.25;

/// Where a candy credit came from. Stored verbatim in `candy_history.source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandySource {
    PumpkinGrab,
    TrickOrTreat,
    PassiveChat,
    GhostEncounter,
    HauntedFind,
}

impl CandySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandySource::PumpkinGrab => "pumpkin_grab",
            CandySource::TrickOrTreat => "trick_or_treat",
            CandySource::PassiveChat => "passive_chat",
            CandySource::GhostEncounter => "ghost_encounter",
            CandySource::HauntedFind => "haunted_find",
        }
    }
}

/// Result of a single ledger credit.
#[derive(Debug, Clone, PartialEq)]
pub struct Payout {
    pub base: i64,
    pub multiplier: f64,
    pub paid: i64,
    pub new_balance: i64,
}

impl Payout {
    /// `**15 candies**`, or `**15 candies** (x1.50 = **22 candies**)` when boosted.
    pub fn describe(&self) -> String {
        if self.multiplier > 1.0 {
            format!(
                "**{} candies** (x{:.2} = **{} candies**)",
                self.base, self.multiplier, self.paid
            )
        } else {
            format!("**{} candies**", self.paid)
        }
    }
}

/// The one write path for earned candy: balance upsert plus a history row,
/// with both multipliers applied to `base`.
#[async_trait]
pub trait CandyLedger: Send + Sync {
    async fn credit(
        &self,
        user_id: u64,
        guild_id: Option<u64>,
        base: i64,
        source: CandySource,
    ) -> Result<Payout>;
}

pub fn upgrade_multiplier(upgrade_level: i32) -> f64 {
    1.0 + f64::from(upgrade_level.max(0)) * UPGRADE_STEP
}

pub fn total_multiplier(upgrade_level: i32, guild_multiplier: f64) -> f64 {
    upgrade_multiplier(upgrade_level) * sanitize_guild_multiplier(guild_multiplier)
}

pub fn apply_multiplier(base: i64, upgrade_level: i32, guild_multiplier: f64) -> i64 {
    (base as f64 * total_multiplier(upgrade_level, guild_multiplier)).floor() as i64
}

/// Clamps a guild multiplier into its allowed range. Non-finite values reset to 1.0.
pub fn sanitize_guild_multiplier(value: f64) -> f64 {
    if !value.is_finite() {
        return 1.0;
    }
    value.clamp(MIN_GUILD_MULTIPLIER, MAX_GUILD_MULTIPLIER)
}

/// `+25` means 1.25x, `-25` means 0.75x. The result is always clamped.
pub fn multiplier_from_percent(change: f64) -> f64 {
    sanitize_guild_multiplier(1.0 + change / 100.0)
}

/// Parses a `!candymodifier` argument such as `25%`, `-25` or `+12.5%` into a
/// signed percent change.
pub fn parse_modifier(arg: &str) -> Option<f64> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^([+-]?)(\d+(?:\.\d+)?)%?$").expect("modifier pattern is valid")
    });

    let caps = pattern.captures(arg.trim())?;
    let value: f64 = caps.get(2)?.as_str().parse().ok()?;
    if !value.is_finite() {
        return None;
    }

    match caps.get(1).map(|m| m.as_str()) {
        Some("-") => Some(-value),
        _ => Some(value),
    }
}

pub fn format_percent_change(multiplier: f64) -> String {
    let percent = (multiplier - 1.0) * 100.0;
    let sign = if percent > 0.0 { "+" } else { "" };
    format!("{}{:.1}%", sign, percent)
}
