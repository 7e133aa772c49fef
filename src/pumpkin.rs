//! Pumpkin spawn-and-grab.
//!
//! All spawn state lives in one row. Every mutator takes the row lock through
//! [`PumpkinStore::lock`] before looking at `active`, so the order of state
//! transitions is exactly the commit order of lock holders.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serenity::async_trait;
use std::ops::RangeInclusive;
use tracing::{error, info, warn};

use crate::candy::{CandyLedger, CandySource, Payout};

#[derive(Debug, Clone)]
pub struct PumpkinSettings {
    pub tick_interval: std::time::Duration,
    pub despawn_after: Duration,
    pub next_spawn_delay: RangeInclusive<i64>,
    pub retry_delay: Duration,
    pub reward: RangeInclusive<i64>,
    pub clear_poll_interval: std::time::Duration,
    pub clear_poll_attempts: u32,
}

impl Default for PumpkinSettings {
    fn default() -> Self {
        Self {
            tick_interval: std::time::Duration::from_secs(10),
            despawn_after: Duration::seconds(30),
            next_spawn_delay: 60..=300,
            retry_delay: Duration::seconds(60),
            reward: 10..=30,
            clear_poll_interval: std::time::Duration::from_millis(500),
            clear_poll_attempts: 90,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PumpkinState {
    pub active: bool,
    pub channel_id: Option<u64>,
    pub message_id: Option<u64>,
    pub candy_amount: i64,
    pub spawned_at: Option<DateTime<Utc>>,
    pub next_spawn_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnGate {
    Busy,
    NotYet,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    NothingToGrab,
    /// The spawn outlived its deadline and has now been flipped inactive.
    Expired { channel_id: Option<u64>, message_id: Option<u64> },
    WrongChannel,
    Won { base: i64 },
}

impl PumpkinState {
    pub fn spawn_gate(&self, now: DateTime<Utc>) -> SpawnGate {
        if self.active {
            return SpawnGate::Busy;
        }
        match self.next_spawn_at {
            Some(next) if now < next => SpawnGate::NotYet,
            _ => SpawnGate::Open,
        }
    }

    /// Flips the spawn to inactive if `channel_id` is where it lives and its
    /// deadline has not passed at `now`.
    pub fn claim(&mut self, channel_id: u64, now: DateTime<Utc>) -> Claim {
        if !self.active {
            return Claim::NothingToGrab;
        }
        if self.expires_at.map_or(true, |deadline| deadline <= now) {
            self.active = false;
            return Claim::Expired {
                channel_id: self.channel_id,
                message_id: self.message_id,
            };
        }
        if self.channel_id != Some(channel_id) {
            return Claim::WrongChannel;
        }
        self.active = false;
        Claim::Won {
            base: self.candy_amount,
        }
    }

    /// Expires the spawn announced by `message_id`. Returns false when it was
    /// already claimed or has been superseded by a newer spawn.
    pub fn expire(&mut self, message_id: u64) -> bool {
        if !self.active || self.message_id != Some(message_id) {
            return false;
        }
        self.active = false;
        true
    }

    /// Message id of an active spawn whose despawn deadline has passed.
    pub fn due_for_despawn(&self, now: DateTime<Utc>) -> Option<u64> {
        if !self.active {
            return None;
        }
        match self.expires_at {
            Some(deadline) if deadline <= now => self.message_id,
            // An active row without a deadline predates expiry tracking; treat it as stale.
            None => self.message_id,
            _ => None,
        }
    }

    pub fn activate(
        &mut self,
        channel_id: u64,
        message_id: u64,
        candy_amount: i64,
        now: DateTime<Utc>,
        despawn_after: Duration,
    ) {
        self.active = true;
        self.channel_id = Some(channel_id);
        self.message_id = Some(message_id);
        self.candy_amount = candy_amount;
        self.spawned_at = Some(now);
        self.expires_at = Some(now + despawn_after);
    }
}

/// Exclusive hold on the spawn-state row. Dropping it without calling
/// [`PumpkinLock::commit`] discards any changes.
#[async_trait]
pub trait PumpkinLock: Send {
    fn state(&mut self) -> &mut PumpkinState;
    async fn commit(self) -> Result<()>;
}

#[async_trait]
pub trait PumpkinStore: Send + Sync {
    type Lock: PumpkinLock;

    async fn lock(&self) -> Result<Self::Lock>;

    /// Last committed state, read without taking the row lock.
    async fn peek(&self) -> Result<PumpkinState>;
}

/// Chat side of the protocol.
#[async_trait]
pub trait Announcer: Send + Sync {
    /// Posts a spawn announcement and returns its message id.
    async fn announce_spawn(&self, channel_id: u64, candy_amount: i64) -> Result<u64>;
    async fn announce_missed(&self, channel_id: u64, message_id: u64) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum GrabOutcome {
    NothingToGrab,
    WrongChannel,
    Grabbed(Payout),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Busy,
    NotYet,
    Deferred,
    Spawned {
        channel_id: u64,
        message_id: u64,
        candy_amount: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualSpawn {
    Busy,
    Spawned { message_id: u64, candy_amount: i64 },
}

#[derive(Clone)]
pub struct PumpkinHunt<S> {
    store: S,
    settings: PumpkinSettings,
}

impl<S> PumpkinHunt<S>
where
    S: PumpkinStore + CandyLedger,
{
    pub fn new(store: S, settings: PumpkinSettings) -> Self {
        Self { store, settings }
    }

    fn roll_reward(&self) -> i64 {
        rand::thread_rng().gen_range(self.settings.reward.clone())
    }

    fn roll_next_spawn(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = rand::thread_rng().gen_range(self.settings.next_spawn_delay.clone());
        now + Duration::seconds(delay)
    }

    /// One scheduler pass: despawn anything overdue, then maybe spawn into
    /// one of `channels`.
    pub async fn tick<A: Announcer>(
        &self,
        announcer: &A,
        channels: &[u64],
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        self.sweep_expired(announcer, now).await?;

        let mut lock = self.store.lock().await?;
        match lock.state().spawn_gate(now) {
            SpawnGate::Busy => return Ok(TickOutcome::Busy),
            SpawnGate::NotYet => return Ok(TickOutcome::NotYet),
            SpawnGate::Open => {}
        }

        let picked = channels.choose(&mut rand::thread_rng()).copied();
        let Some(channel_id) = picked else {
            lock.state().next_spawn_at = Some(now + self.settings.retry_delay);
            lock.commit().await?;
            info!("[PUMPKIN] No eligible channel, retrying later");
            return Ok(TickOutcome::Deferred);
        };

        let candy_amount = self.roll_reward();
        let message_id = announcer.announce_spawn(channel_id, candy_amount).await?;

        let next_spawn_at = self.roll_next_spawn(now);
        let state = lock.state();
        state.activate(
            channel_id,
            message_id,
            candy_amount,
            now,
            self.settings.despawn_after,
        );
        state.next_spawn_at = Some(next_spawn_at);
        lock.commit().await?;

        info!(
            "[PUMPKIN] Spawned {} candies in channel {} (message {}), next spawn at {}",
            candy_amount, channel_id, message_id, next_spawn_at
        );

        Ok(TickOutcome::Spawned {
            channel_id,
            message_id,
            candy_amount,
        })
    }

    /// Despawns the current spawn if its deadline has passed. Also recovers
    /// spawns left behind by a restart.
    pub async fn sweep_expired<A: Announcer>(
        &self,
        announcer: &A,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let due = {
            let mut lock = self.store.lock().await?;
            lock.state().due_for_despawn(now)
        };

        match due {
            Some(message_id) => self.despawn(announcer, message_id).await,
            None => Ok(false),
        }
    }

    /// Expires the spawn announced by `message_id`. A no-op if it has been
    /// grabbed or replaced in the meantime.
    pub async fn despawn<A: Announcer>(&self, announcer: &A, message_id: u64) -> Result<bool> {
        let mut lock = self.store.lock().await?;
        let state = lock.state();
        if !state.expire(message_id) {
            return Ok(false);
        }
        let channel_id = state.channel_id;
        lock.commit().await?;

        info!("[PUMPKIN] Spawn {} despawned unclaimed", message_id);
        announce_missed(announcer, channel_id, Some(message_id)).await;

        Ok(true)
    }

    /// Claims the active spawn for `user_id` and pays it out. A spawn past its
    /// deadline is despawned here instead of waiting for the next sweep.
    pub async fn grab<A: Announcer>(
        &self,
        announcer: &A,
        user_id: u64,
        guild_id: Option<u64>,
        channel_id: u64,
        now: DateTime<Utc>,
    ) -> Result<GrabOutcome> {
        let mut lock = self.store.lock().await?;
        let base = match lock.state().claim(channel_id, now) {
            Claim::NothingToGrab => return Ok(GrabOutcome::NothingToGrab),
            Claim::WrongChannel => return Ok(GrabOutcome::WrongChannel),
            Claim::Expired {
                channel_id,
                message_id,
            } => {
                lock.commit().await?;
                info!(
                    "[GRAB] {} was too late, spawn {:?} already expired",
                    user_id, message_id
                );
                announce_missed(announcer, channel_id, message_id).await;
                return Ok(GrabOutcome::NothingToGrab);
            }
            Claim::Won { base } => base,
        };
        // Release the row before paying out so other grabs are not held up.
        lock.commit().await?;

        match self
            .store
            .credit(user_id, guild_id, base, CandySource::PumpkinGrab)
            .await
        {
            Ok(payout) => {
                info!(
                    "[GRAB] User {} grabbed a pumpkin in {} for {} candies",
                    user_id, channel_id, payout.paid
                );
                Ok(GrabOutcome::Grabbed(payout))
            }
            Err(e) => {
                error!(
                    "[GRAB] Pumpkin claimed by {} but payout of {} failed: {}",
                    user_id, base, e
                );
                Err(e)
            }
        }
    }

    /// Spawns into `channel_id` if nothing is active. Leaves `next_spawn_at` alone.
    pub async fn spawn_in<A: Announcer>(
        &self,
        announcer: &A,
        channel_id: u64,
        now: DateTime<Utc>,
    ) -> Result<ManualSpawn> {
        let mut lock = self.store.lock().await?;
        if lock.state().active {
            return Ok(ManualSpawn::Busy);
        }

        let candy_amount = self.roll_reward();
        let message_id = announcer.announce_spawn(channel_id, candy_amount).await?;
        lock.state().activate(
            channel_id,
            message_id,
            candy_amount,
            now,
            self.settings.despawn_after,
        );
        lock.commit().await?;

        info!(
            "[PUMPKIN] Manual spawn of {} candies in channel {}",
            candy_amount, channel_id
        );

        Ok(ManualSpawn::Spawned {
            message_id,
            candy_amount,
        })
    }

    /// Polls until no spawn is active, giving up after the configured number
    /// of attempts. Returns whether the row was seen inactive.
    pub async fn wait_until_clear(&self) -> Result<bool> {
        for _ in 0..self.settings.clear_poll_attempts {
            if !self.store.peek().await?.active {
                return Ok(true);
            }
            tokio::time::sleep(self.settings.clear_poll_interval).await;
        }
        Ok(false)
    }
}

async fn announce_missed<A: Announcer>(
    announcer: &A,
    channel_id: Option<u64>,
    message_id: Option<u64>,
) {
    let (Some(channel_id), Some(message_id)) = (channel_id, message_id) else {
        return;
    };
    if let Err(e) = announcer.announce_missed(channel_id, message_id).await {
        warn!("Failed to edit missed pumpkin {}: {}", message_id, e);
    }
}
