use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serenity::async_trait;
use sqlx::{MySql, Pool, Transaction};
use std::collections::HashSet;

use crate::candy::{self, CandyLedger, CandySource, Payout};
use crate::pumpkin::{PumpkinLock, PumpkinState, PumpkinStore};

#[derive(Clone)]
pub struct Database {
    pub pool: Pool<MySql>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HistoryEntry {
    pub amount: i64,
    pub source: String,
    pub earned_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PumpkinRow {
    active: bool,
    channel_id: Option<i64>,
    message_id: Option<i64>,
    candy_amount: i32,
    spawned_at: Option<DateTime<Utc>>,
    next_spawn_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
}

impl From<PumpkinRow> for PumpkinState {
    fn from(row: PumpkinRow) -> Self {
        Self {
            active: row.active,
            channel_id: row.channel_id.map(|id| id as u64),
            message_id: row.message_id.map(|id| id as u64),
            candy_amount: i64::from(row.candy_amount),
            spawned_at: row.spawned_at,
            next_spawn_at: row.next_spawn_at,
            expires_at: row.expires_at,
        }
    }
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS guild_settings (
                guild_id BIGINT PRIMARY KEY,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                candy_multiplier DOUBLE NOT NULL DEFAULT 1.0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candy_balances (
                user_id BIGINT PRIMARY KEY,
                candy_balance BIGINT NOT NULL DEFAULT 0,
                INDEX idx_candy_balance (candy_balance)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candy_history (
                id INT PRIMARY KEY AUTO_INCREMENT,
                user_id BIGINT NOT NULL,
                amount BIGINT NOT NULL,
                source VARCHAR(64) NOT NULL,
                earned_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                INDEX idx_user_id (user_id),
                INDEX idx_earned_at (earned_at)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candy_upgrades (
                user_id BIGINT PRIMARY KEY,
                upgrade_level INT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS command_cooldowns (
                user_id BIGINT NOT NULL,
                command VARCHAR(64) NOT NULL,
                last_used DATETIME NOT NULL,
                PRIMARY KEY (user_id, command)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pumpkin_state (
                id TINYINT PRIMARY KEY,
                active BOOLEAN NOT NULL DEFAULT FALSE,
                channel_id BIGINT NULL,
                message_id BIGINT NULL,
                candy_amount INT NOT NULL DEFAULT 0,
                spawned_at DATETIME NULL,
                next_spawn_at DATETIME NULL,
                expires_at DATETIME NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT IGNORE INTO pumpkin_state (id, active) VALUES (1, FALSE)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // Guild settings. A guild without a row is enabled with a 1.0x multiplier.

    pub async fn is_guild_enabled(&self, guild_id: u64) -> Result<bool> {
        let enabled = sqlx::query_scalar::<_, bool>(
            "SELECT enabled FROM guild_settings WHERE guild_id = ?",
        )
        .bind(guild_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(enabled.unwrap_or(true))
    }

    pub async fn set_guild_enabled(&self, guild_id: u64, enabled: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO guild_settings (guild_id, enabled)
            VALUES (?, ?)
            ON DUPLICATE KEY UPDATE enabled = VALUES(enabled)
            "#,
        )
        .bind(guild_id as i64)
        .bind(enabled)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn disabled_guilds(&self) -> Result<HashSet<u64>> {
        let rows = sqlx::query_scalar::<_, i64>(
            "SELECT guild_id FROM guild_settings WHERE enabled = FALSE",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|id| id as u64).collect())
    }

    pub async fn guild_multiplier(&self, guild_id: u64) -> Result<f64> {
        let multiplier = sqlx::query_scalar::<_, f64>(
            "SELECT candy_multiplier FROM guild_settings WHERE guild_id = ?",
        )
        .bind(guild_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(candy::sanitize_guild_multiplier(multiplier.unwrap_or(1.0)))
    }

    pub async fn set_guild_multiplier(&self, guild_id: u64, multiplier: f64) -> Result<f64> {
        let multiplier = candy::sanitize_guild_multiplier(multiplier);

        sqlx::query(
            r#"
            INSERT INTO guild_settings (guild_id, enabled, candy_multiplier)
            VALUES (?, TRUE, ?)
            ON DUPLICATE KEY UPDATE candy_multiplier = VALUES(candy_multiplier)
            "#,
        )
        .bind(guild_id as i64)
        .bind(multiplier)
        .execute(&self.pool)
        .await?;

        Ok(multiplier)
    }

    // Candy.

    pub async fn upgrade_level(&self, user_id: u64) -> Result<i32> {
        let level = sqlx::query_scalar::<_, i32>(
            "SELECT upgrade_level FROM candy_upgrades WHERE user_id = ?",
        )
        .bind(user_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(level.unwrap_or(0))
    }

    pub async fn candy_balance(&self, user_id: u64) -> Result<i64> {
        let balance = sqlx::query_scalar::<_, i64>(
            "SELECT candy_balance FROM candy_balances WHERE user_id = ?",
        )
        .bind(user_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(balance.unwrap_or(0))
    }

    pub async fn recent_history(&self, user_id: u64, limit: u32) -> Result<Vec<HistoryEntry>> {
        let entries = sqlx::query_as::<_, HistoryEntry>(
            r#"
            SELECT amount, source, earned_at
            FROM candy_history
            WHERE user_id = ?
            ORDER BY earned_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    pub async fn leaderboard(&self, limit: u32) -> Result<Vec<(u64, i64)>> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT user_id, candy_balance FROM candy_balances ORDER BY candy_balance DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, balance)| (user_id as u64, balance))
            .collect())
    }

    // Cooldowns.

    pub async fn last_used(&self, user_id: u64, command: &str) -> Result<Option<DateTime<Utc>>> {
        let last_used = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT last_used FROM command_cooldowns WHERE user_id = ? AND command = ?",
        )
        .bind(user_id as i64)
        .bind(command)
        .fetch_optional(&self.pool)
        .await?;

        Ok(last_used)
    }

    pub async fn touch_cooldown(&self, user_id: u64, command: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO command_cooldowns (user_id, command, last_used)
            VALUES (?, ?, ?)
            ON DUPLICATE KEY UPDATE last_used = VALUES(last_used)
            "#,
        )
        .bind(user_id as i64)
        .bind(command)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CandyLedger for Database {
    async fn credit(
        &self,
        user_id: u64,
        guild_id: Option<u64>,
        base: i64,
        source: CandySource,
    ) -> Result<Payout> {
        let level = self.upgrade_level(user_id).await?;
        let guild_multiplier = match guild_id {
            Some(guild_id) => self.guild_multiplier(guild_id).await?,
            None => 1.0,
        };
        let multiplier = candy::total_multiplier(level, guild_multiplier);
        let paid = candy::apply_multiplier(base, level, guild_multiplier);

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO candy_balances (user_id, candy_balance)
            VALUES (?, ?)
            ON DUPLICATE KEY UPDATE candy_balance = candy_balance + VALUES(candy_balance)
            "#,
        )
        .bind(user_id as i64)
        .bind(paid)
        .execute(&mut *tx)
        .await?;

        let new_balance = sqlx::query_scalar::<_, i64>(
            "SELECT candy_balance FROM candy_balances WHERE user_id = ?",
        )
        .bind(user_id as i64)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO candy_history (user_id, amount, source, earned_at) VALUES (?, ?, ?, NOW())",
        )
        .bind(user_id as i64)
        .bind(paid)
        .bind(source.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            "[CANDY] {} +{} ({} x{:.2}) from {} -> {}",
            user_id,
            paid,
            base,
            multiplier,
            source.as_str(),
            new_balance
        );

        Ok(Payout {
            base,
            multiplier,
            paid,
            new_balance,
        })
    }
}

/// `SELECT … FOR UPDATE` on the singleton pumpkin row, held until commit or drop.
pub struct MySqlPumpkinLock {
    tx: Transaction<'static, MySql>,
    original: PumpkinState,
    state: PumpkinState,
}

#[async_trait]
impl PumpkinLock for MySqlPumpkinLock {
    fn state(&mut self) -> &mut PumpkinState {
        &mut self.state
    }

    async fn commit(mut self) -> Result<()> {
        if self.state != self.original {
            let state = &self.state;
            sqlx::query(
                r#"
                UPDATE pumpkin_state
                SET active = ?, channel_id = ?, message_id = ?, candy_amount = ?,
                    spawned_at = ?, next_spawn_at = ?, expires_at = ?
                WHERE id = 1
                "#,
            )
            .bind(state.active)
            .bind(state.channel_id.map(|id| id as i64))
            .bind(state.message_id.map(|id| id as i64))
            .bind(state.candy_amount as i32)
            .bind(state.spawned_at)
            .bind(state.next_spawn_at)
            .bind(state.expires_at)
            .execute(&mut *self.tx)
            .await?;
        }

        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl PumpkinStore for Database {
    type Lock = MySqlPumpkinLock;

    async fn lock(&self) -> Result<MySqlPumpkinLock> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, PumpkinRow>(
            r#"
            SELECT active, channel_id, message_id, candy_amount, spawned_at, next_spawn_at, expires_at
            FROM pumpkin_state
            WHERE id = 1
            FOR UPDATE
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?
        .context("pumpkin_state row is missing; run migrations first")?;

        let state = PumpkinState::from(row);
        Ok(MySqlPumpkinLock {
            tx,
            original: state.clone(),
            state,
        })
    }

    async fn peek(&self) -> Result<PumpkinState> {
        let row = sqlx::query_as::<_, PumpkinRow>(
            r#"
            SELECT active, channel_id, message_id, candy_amount, spawned_at, next_spawn_at, expires_at
            FROM pumpkin_state
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?
        .context("pumpkin_state row is missing; run migrations first")?;

        Ok(PumpkinState::from(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pumpkin::{Announcer, GrabOutcome, PumpkinHunt, PumpkinSettings};

    struct SilentAnnouncer;

    #[async_trait]
    impl Announcer for SilentAnnouncer {
        async fn announce_spawn(&self, _channel_id: u64, _candy_amount: i64) -> Result<u64> {
            Ok(4242)
        }

        async fn announce_missed(&self, _channel_id: u64, _message_id: u64) -> Result<()> {
            Ok(())
        }
    }

    // Runs against a scratch MySQL database when TEST_DATABASE_URL is set.
    async fn test_db() -> Option<Database> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let db = Database::new(&url).await.expect("connect to TEST_DATABASE_URL");
        db.run_migrations().await.expect("run migrations");
        Some(db)
    }

    #[tokio::test]
    async fn mysql_round_trip() {
        let Some(db) = test_db().await else {
            return;
        };

        let guild_id = 900_000_000_000_000_001u64;
        let user_id = 900_000_000_000_000_002u64 + rand::random::<u16>() as u64;

        assert!(db.is_guild_enabled(guild_id).await.unwrap());
        db.set_guild_enabled(guild_id, false).await.unwrap();
        assert!(!db.is_guild_enabled(guild_id).await.unwrap());
        assert!(db.disabled_guilds().await.unwrap().contains(&guild_id));
        db.set_guild_enabled(guild_id, true).await.unwrap();

        assert_eq!(db.set_guild_multiplier(guild_id, -99.0).await.unwrap(), 0.1);
        db.set_guild_multiplier(guild_id, 1.0).await.unwrap();

        // Spawn of 15 in channel C, grabbed by a level-0 user in a 1.0x guild.
        {
            let mut lock = db.lock().await.unwrap();
            lock.state()
                .activate(31337, 4242, 15, Utc::now(), chrono::Duration::seconds(30));
            lock.commit().await.unwrap();
        }

        let before = db.candy_balance(user_id).await.unwrap();
        let hunt = PumpkinHunt::new(db.clone(), PumpkinSettings::default());
        let outcome = hunt
            .grab(&SilentAnnouncer, user_id, Some(guild_id), 31337, Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, GrabOutcome::Grabbed(ref p) if p.paid == 15));
        assert_eq!(db.candy_balance(user_id).await.unwrap(), before + 15);

        let history = db.recent_history(user_id, 1).await.unwrap();
        assert_eq!(history[0].amount, 15);
        assert_eq!(history[0].source, "pumpkin_grab");

        assert!(!db.peek().await.unwrap().active);
        assert_eq!(
            hunt.grab(&SilentAnnouncer, user_id, Some(guild_id), 31337, Utc::now())
                .await
                .unwrap(),
            GrabOutcome::NothingToGrab
        );
    }
}
