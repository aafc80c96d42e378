//! Next-water tracking: turns status edits into completed `water` intervals.

use crate::{
    status_text,
    tree_log::{Category, TreeEvent, TreeLogError, TreeLogStore},
};
use std::{collections::HashMap, sync::Arc};
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

/// When the tree can next be watered, and how long the last accepted interval lasted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NextWater {
    pub next_time: OffsetDateTime,
    pub last_duration: Duration,
}

/// What a status text says about watering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaterSignal {
    /// The tree can be watered right now; nothing to record.
    Ready,
    /// The tree was watered and can be watered again at this time.
    Until(OffsetDateTime),
}

/// `None` when the text carries neither the ready marker nor a timestamp.
pub fn water_signal(text: &str) -> Option<WaterSignal> {
    if status_text::is_ready(text) {
        return Some(WaterSignal::Ready);
    }
    let ts = status_text::extract_timestamp(text)?;
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .map(WaterSignal::Until)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Ready,
    Stale,
    Recorded(TreeEvent),
}

type FactCell = OnceCell<Arc<Mutex<NextWater>>>;

/// Per-guild next-water facts, seeded from the tree log on first use.
pub struct NextWaterCache {
    logs: Arc<TreeLogStore>,
    guilds: Mutex<HashMap<String, Arc<FactCell>>>,
}

impl NextWaterCache {
    pub fn new(logs: Arc<TreeLogStore>) -> Self {
        Self {
            logs,
            guilds: Mutex::new(HashMap::new()),
        }
    }

    async fn bootstrap(&self, guild_id: &str) -> Result<NextWater, TreeLogError> {
        let seeded = match self.logs.last_event(guild_id, Category::Water).await? {
            Some(last) => NextWater {
                next_time: last.end,
                last_duration: last.end - last.start,
            },
            None => NextWater {
                next_time: OffsetDateTime::now_utc(),
                last_duration: Duration::ZERO,
            },
        };
        info!(
            guild_id,
            "next water seeded at {} (last duration {}s)",
            seeded.next_time,
            seeded.last_duration.whole_seconds()
        );
        Ok(seeded)
    }

    /// Waits for (or performs) the guild's bootstrap and returns its fact slot.
    async fn fact(&self, guild_id: &str) -> Result<Arc<Mutex<NextWater>>, TreeLogError> {
        let cell = {
            let mut guilds = self.guilds.lock().await;
            guilds
                .entry(guild_id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let fact = cell
            .get_or_try_init(|| async {
                let seeded = self.bootstrap(guild_id).await?;
                Ok::<_, TreeLogError>(Arc::new(Mutex::new(seeded)))
            })
            .await?;
        Ok(fact.clone())
    }

    pub async fn peek(&self, guild_id: &str) -> Result<NextWater, TreeLogError> {
        let fact = self.fact(guild_id).await?;
        let current = *fact.lock().await;
        Ok(current)
    }

    /// Reconciles one observed signal against the cached fact.
    ///
    /// Rejection, append and cache update happen under the guild's lock, so two concurrent copies
    /// of the same edit record at most one interval.
    pub async fn observe(
        &self,
        guild_id: &str,
        signal_time: OffsetDateTime,
        signal: WaterSignal,
    ) -> Result<Outcome, TreeLogError> {
        let end = match signal {
            WaterSignal::Ready => return Ok(Outcome::Ready),
            WaterSignal::Until(end) => end,
        };

        let fact = self.fact(guild_id).await?;
        let mut current = fact.lock().await;
        if end <= signal_time || end <= current.next_time {
            debug!(guild_id, "stale water signal ignored");
            return Ok(Outcome::Stale);
        }

        // A late edit would understate the interval; the previous duration is the floor.
        let start = if end - signal_time < current.last_duration {
            end - current.last_duration
        } else {
            signal_time
        };
        let event = TreeEvent::new(start, end, Category::Water);
        self.logs.append(guild_id, &event).await?;

        *current = NextWater {
            next_time: end,
            last_duration: end - start,
        };
        info!(guild_id, "watered; next water at {end}");
        Ok(Outcome::Recorded(event))
    }
}
