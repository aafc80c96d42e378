//! Per-guild orchestration over the log, the next-water cache, the notification gate and settings.

use crate::{
    chat::ChatClient,
    next_water::{self, NextWater, NextWaterCache, Outcome},
    notify::{self, GateAction, NotificationGate},
    settings::{
        GeneralConfig, GoalConfig, NotificationConfig, SettingsError, SettingsStore,
        StatusMessageConfig,
    },
    status_text::{self, IngestControl},
    tree_log::{format_log_ts, parse_log_ts, Category, TreeEvent, TreeLogError, TreeLogStore},
    uptime::{self, SummaryReport, UpDown},
};
use regex::Regex;
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, LazyLock},
};
use time::{Duration, OffsetDateTime, Time, UtcOffset};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const YEAR_HOURS: i64 = 24 * 365;
const CLEANUP_SCAN_LIMIT: u8 = 100;

static MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`@/(&?[0-9]+)`").expect("static regex"));
static GOAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)`goal`").expect("static regex"));
static NEWLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i) ?`newline` ?").expect("static regex"));

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    Log(#[from] TreeLogError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("window of {hours}h ending {offset}h ago is out of range")]
    Window { hours: i64, offset: i64 },
}

/// An edit of the tree message, reduced to what tracking needs.
#[derive(Clone, Debug)]
pub struct StatusSignal {
    pub guild_id: String,
    pub channel_id: String,
    pub description: String,
    pub footer: Option<String>,
    pub controls: Vec<IngestControl>,
    pub edited_at: OffsetDateTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSkip {
    ChannelNotConfigured,
    OtherChannel,
    NotTreeStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaterOutcome {
    NoTimestamp,
    Ready,
    Stale,
    Recorded,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SignalReport {
    pub skipped: Option<SignalSkip>,
    pub water: Option<WaterOutcome>,
    pub goal_reached: bool,
    pub insect: Option<GateAction>,
    pub fruit: Option<GateAction>,
    pub water_notification: Option<GateAction>,
}

impl SignalReport {
    fn skipped(reason: SignalSkip) -> Self {
        Self {
            skipped: Some(reason),
            water: None,
            goal_reached: false,
            insect: None,
            fruit: None,
            water_notification: None,
        }
    }
}

/// Fills the goal template: `` `@/123` `` and `` `@/&123` `` become mentions, `` `goal` `` the
/// goal value and `` `newline` `` a line break.
pub fn render_goal_message(template: &str, goal: f64) -> String {
    let out = MENTION.replace_all(template, "<@$1>");
    let out = GOAL.replace_all(&out, regex::NoExpand(goal.to_string().as_str()));
    let out = NEWLINE.replace_all(&out, "\n");
    out.trim().to_string()
}

pub fn render_status_message(total_hours: i64, recent: UpDown, year: UpDown) -> String {
    format!(
        "### Past {total_hours} Hours:\n\
         `uptime:` `{:7.4}%`   `wet:` `{:6.0}`   `dry:` `{:6.0}`\n\
         ### Past Year:\n\
         `uptime:` `{:7.4}%`   `wet:` `{:6.0}`   `dry:` `{:6.0}`\n",
        recent.uptime_percent(),
        recent.uptime_seconds,
        recent.downtime_seconds,
        year.uptime_percent(),
        year.uptime_seconds,
        year.downtime_seconds,
    )
}

/// Whether `weekday` (0 = Monday) falls in the configured inclusive range. An empty list means
/// every day.
fn weekday_allowed(valid_days: &[u8], weekday: u8) -> bool {
    match valid_days {
        [] => true,
        [only] => *only == weekday,
        [first, .., last] => (*first..=*last).contains(&weekday),
    }
}

/// The `[now - hours - offset, now - offset]` window, with `offset` in hours.
pub fn window(
    now: OffsetDateTime,
    hours: i64,
    offset: i64,
) -> Result<(OffsetDateTime, OffsetDateTime), TrackerError> {
    let back = |from: OffsetDateTime, h: i64| {
        h.checked_mul(3600)
            .and_then(|secs| from.checked_sub(Duration::seconds(secs)))
    };
    let end = back(now, offset).ok_or(TrackerError::Window { hours, offset })?;
    let start = back(end, hours).ok_or(TrackerError::Window { hours, offset })?;
    Ok((start, end))
}

/// Next-water time of a tracked guild, as last seen by the water check.
#[derive(Clone, Copy, Debug)]
struct WaterDue {
    next_time: OffsetDateTime,
    /// Checked since `next_time` passed. Stays set until the guild is watered again or its
    /// settings change.
    settled: bool,
}

pub struct Tracker {
    pub logs: Arc<TreeLogStore>,
    pub next_water: NextWaterCache,
    pub gate: NotificationGate,
    pub settings: SettingsStore,
    chat: Arc<dyn ChatClient>,
    water_due: Mutex<HashMap<String, WaterDue>>,
}

impl Tracker {
    pub fn new(logs: Arc<TreeLogStore>, settings: SettingsStore, chat: Arc<dyn ChatClient>) -> Self {
        Self {
            next_water: NextWaterCache::new(logs.clone()),
            gate: NotificationGate::new(chat.clone(), logs.clone()),
            logs,
            settings,
            chat,
            water_due: Mutex::new(HashMap::new()),
        }
    }

    /// Guilds with a log file or stored settings.
    pub async fn known_guilds(&self) -> Result<Vec<String>, TrackerError> {
        let mut out: BTreeSet<String> = self.settings.guild_ids().await?.into_iter().collect();
        match self.logs.known_guilds().await {
            Ok(ids) => out.extend(ids),
            Err(e) => warn!("log directory scan failed: {e}"),
        }
        Ok(out.into_iter().collect())
    }

    /// Prepares a guild at startup or first contact: default settings, an empty log, and the
    /// next-water fact.
    pub async fn load_guild(&self, guild_id: &str) -> Result<(), TrackerError> {
        self.settings.ensure_defaults(guild_id).await?;
        self.logs.ensure(guild_id).await?;
        self.track_water(guild_id).await
    }

    /// Records the guild's current next-water time for the water check. A new time re-arms it.
    async fn track_water(&self, guild_id: &str) -> Result<(), TrackerError> {
        let NextWater { next_time, .. } = self.next_water.peek(guild_id).await?;
        let mut tracked = self.water_due.lock().await;
        let due = tracked.entry(guild_id.to_string()).or_insert(WaterDue {
            next_time,
            settled: false,
        });
        if due.next_time != next_time {
            *due = WaterDue {
                next_time,
                settled: false,
            };
        }
        Ok(())
    }

    /// Re-arms the water check after the guild's settings changed.
    pub async fn config_updated(&self, guild_id: &str) -> Result<(), TrackerError> {
        self.track_water(guild_id).await?;
        if let Some(due) = self.water_due.lock().await.get_mut(guild_id) {
            due.settled = false;
        }
        Ok(())
    }

    pub async fn handle_signal(&self, signal: &StatusSignal) -> Result<SignalReport, TrackerError> {
        let guild_id = signal.guild_id.as_str();
        self.settings.ensure_defaults(guild_id).await?;

        let general: GeneralConfig = self.settings.get(guild_id).await?;
        let Some(tree_channel) = general.channel_id.as_deref() else {
            return Ok(SignalReport::skipped(SignalSkip::ChannelNotConfigured));
        };
        if tree_channel != signal.channel_id {
            return Ok(SignalReport::skipped(SignalSkip::OtherChannel));
        }
        if !status_text::is_tree_status(&signal.description) {
            return Ok(SignalReport::skipped(SignalSkip::NotTreeStatus));
        }

        let text = format!(
            "{}\n{}",
            signal.description,
            signal.footer.as_deref().unwrap_or_default()
        );

        let water = match next_water::water_signal(&text) {
            None => {
                info!(guild_id, "no timestamp in status text: {}", text.replace('\n', " "));
                WaterOutcome::NoTimestamp
            }
            Some(ws) => match self.next_water.observe(guild_id, signal.edited_at, ws).await? {
                Outcome::Ready => WaterOutcome::Ready,
                Outcome::Stale => WaterOutcome::Stale,
                Outcome::Recorded(_) => WaterOutcome::Recorded,
            },
        };
        self.track_water(guild_id).await?;

        let goal_reached = self.check_goal(guild_id, &text).await?;

        let now = OffsetDateTime::now_utc();
        let notification: NotificationConfig = self.settings.get(guild_id).await?;
        let controls = status_text::extract_control_set(&signal.controls);
        let insect = self
            .gate
            .evaluate(guild_id, Category::Insect, &notification, now, |engaged| {
                notify::insect_condition(&controls, engaged)
            })
            .await?;
        let fruit = self
            .gate
            .evaluate(guild_id, Category::Fruit, &notification, now, |_| {
                notify::fruit_condition(&controls)
            })
            .await?;
        let water_notification = self.water_gate(guild_id, &notification, now).await?;

        Ok(SignalReport {
            skipped: None,
            water: Some(water),
            goal_reached,
            insect: Some(insect),
            fruit: Some(fruit),
            water_notification: Some(water_notification),
        })
    }

    /// Sends the goal message once the configured value is reached. Returns true when it was sent.
    async fn check_goal(&self, guild_id: &str, text: &str) -> Result<bool, TrackerError> {
        let mut goal: GoalConfig = self.settings.get(guild_id).await?;
        let Some(channel_id) = goal.channel_id.clone() else {
            return Ok(false);
        };
        if goal.reached {
            return Ok(false);
        }
        let value = match status_text::extract_goal_value(&goal.pattern, text) {
            Ok(Some(v)) => v,
            Ok(None) => {
                info!(guild_id, "goal pattern `{}` not found in status text", goal.pattern);
                return Ok(false);
            }
            Err(e) => {
                warn!(guild_id, "goal pattern `{}` is invalid: {e}", goal.pattern);
                return Ok(false);
            }
        };
        let passed = if goal.greater_than {
            value >= goal.goal
        } else {
            value <= goal.goal
        };
        if !passed {
            return Ok(false);
        }

        let content = render_goal_message(&goal.message, goal.goal);
        match self.chat.send_message(&channel_id, &content).await {
            Ok(_) => {
                goal.reached = true;
                self.settings.set(guild_id, &goal).await?;
                info!(guild_id, "goal {} reached at {value}", goal.goal);
                Ok(true)
            }
            Err(e) => {
                warn!(guild_id, "goal message not sent: {e}");
                Ok(false)
            }
        }
    }

    async fn water_gate(
        &self,
        guild_id: &str,
        notification: &NotificationConfig,
        now: OffsetDateTime,
    ) -> Result<GateAction, TrackerError> {
        let NextWater { next_time, .. } = self.next_water.peek(guild_id).await?;
        Ok(self
            .gate
            .evaluate(guild_id, Category::Water, notification, now, |_| {
                notify::water_condition(now, next_time)
            })
            .await?)
    }

    /// One pass of the water notification check. Only tracked guilds whose next-water time has
    /// passed and that were not checked since are evaluated. Returns how many were.
    pub async fn water_tick(&self, now: OffsetDateTime) -> usize {
        let due: Vec<(String, OffsetDateTime)> = {
            let tracked = self.water_due.lock().await;
            tracked
                .iter()
                .filter(|(_, d)| !d.settled && now > d.next_time)
                .map(|(guild_id, d)| (guild_id.clone(), d.next_time))
                .collect()
        };
        for (guild, next_time) in &due {
            let guild_id = guild.as_str();
            let action = match self.settings.get::<NotificationConfig>(guild_id).await {
                Ok(notification) => self.water_gate(guild_id, &notification, now).await,
                Err(e) => Err(e.into()),
            };
            match action {
                // Retried next tick.
                Ok(GateAction::SendFailed) => {}
                Ok(action) => {
                    debug!(guild_id, "water check settled: {action:?}");
                    let mut tracked = self.water_due.lock().await;
                    if let Some(d) = tracked.get_mut(guild_id) {
                        if d.next_time == *next_time {
                            d.settled = true;
                        }
                    }
                }
                Err(e) => warn!(guild_id, "water check failed: {e}"),
            }
        }
        due.len()
    }

    pub async fn calc_up_down(
        &self,
        guild_id: &str,
        hours: i64,
        now: OffsetDateTime,
    ) -> Result<UpDown, TrackerError> {
        let (start, end) = window(now, hours, 0)?;
        self.up_down(guild_id, start, end, Category::Water).await
    }

    pub async fn up_down(
        &self,
        guild_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
        category: Category,
    ) -> Result<UpDown, TrackerError> {
        let general: GeneralConfig = self.settings.get(guild_id).await?;
        let events = self
            .logs
            .read(guild_id, start, end, Some(&[category]))
            .await?
            .unwrap_or_default();
        Ok(uptime::up_down(
            &events,
            start,
            end,
            general.outlier_duration as f64,
        ))
    }

    /// Percentile report for one category; `tz` overrides the guild's configured offset.
    pub async fn summary(
        &self,
        guild_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
        category: Category,
        tz: Option<UtcOffset>,
    ) -> Result<SummaryReport, TrackerError> {
        let general: GeneralConfig = self.settings.get(guild_id).await?;
        let tz = tz.unwrap_or_else(|| general.tz_offset());
        let events = self
            .logs
            .read(guild_id, start, end, Some(&[category]))
            .await?
            .unwrap_or_default();
        Ok(uptime::summary_report(
            &events,
            start,
            end,
            general.outlier_duration as f64,
            tz,
        ))
    }

    /// Sends every due status summary. A guild that fails is logged and skipped. Returns how
    /// many summaries were sent.
    pub async fn status_tick(&self, now: OffsetDateTime) -> Result<usize, TrackerError> {
        let mut sent = 0;
        for guild in self.known_guilds().await? {
            let guild_id = guild.as_str();
            match self.send_due_status(guild_id, now).await {
                Ok(n) => sent += n,
                Err(e) => warn!(guild_id, "status message check failed: {e}"),
            }
        }
        Ok(sent)
    }

    /// Each sent slot moves to the same hour tomorrow.
    async fn send_due_status(
        &self,
        guild_id: &str,
        now: OffsetDateTime,
    ) -> Result<usize, TrackerError> {
        let mut config: StatusMessageConfig = self.settings.get(guild_id).await?;
        let Some(channel_id) = config.channel_id.clone() else {
            return Ok(0);
        };
        if !weekday_allowed(&config.valid_days, now.weekday().number_days_from_monday()) {
            return Ok(0);
        }

        let mut sent = 0;
        let hours = config.valid_hours.clone();
        for (i, &hour) in hours.iter().enumerate() {
            let due = config.next_message.get(i).and_then(|s| parse_log_ts(s));
            if due.is_some_and(|d| now <= d) {
                continue;
            }
            let Ok(at) = Time::from_hms(hour, 0, 0) else {
                warn!(guild_id, "status hour {hour} is out of range");
                continue;
            };

            let recent = self.calc_up_down(guild_id, config.total_hours, now).await?;
            let year = self.calc_up_down(guild_id, YEAR_HOURS, now).await?;
            let content = render_status_message(config.total_hours, recent, year);
            if let Err(e) = self.chat.send_message(&channel_id, &content).await {
                warn!(guild_id, "status message not sent: {e}");
                continue;
            }

            let next = (now + Duration::days(1)).replace_time(at);
            if config.next_message.len() <= i {
                config.next_message.resize(i + 1, String::new());
            }
            config.next_message[i] = format_log_ts(next);
            sent += 1;
            info!(guild_id, "status message sent; next at {next}");
        }
        if sent > 0 {
            self.settings.set(guild_id, &config).await?;
        }
        Ok(sent)
    }

    /// Deletes this bot's messages older than an hour from each notification channel.
    pub async fn cleanup_tick(
        &self,
        now: OffsetDateTime,
        pause: std::time::Duration,
    ) -> Result<usize, TrackerError> {
        let cutoff = now - Duration::hours(1);
        let mut deleted = 0;
        for guild in self.known_guilds().await? {
            let guild_id = guild.as_str();
            let config: NotificationConfig = match self.settings.get(guild_id).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(guild_id, "cleanup: reading settings failed: {e}");
                    continue;
                }
            };
            let Some(channel_id) = config.channel_id.as_deref() else {
                continue;
            };
            let recent = match self
                .chat
                .recent_messages(channel_id, CLEANUP_SCAN_LIMIT)
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    warn!(guild_id, "cleanup: listing messages failed: {e}");
                    continue;
                }
            };
            for m in recent
                .iter()
                .filter(|m| m.own && m.handle.created_at < cutoff)
            {
                match self.chat.delete_message(&m.handle).await {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!(guild_id, "cleanup: delete failed: {e}"),
                }
            }
            tokio::time::sleep(pause).await;
        }
        Ok(deleted)
    }

    /// Events overlapping the window, for export.
    pub async fn events(
        &self,
        guild_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
        categories: &[Category],
    ) -> Result<Option<Vec<TreeEvent>>, TrackerError> {
        Ok(self.logs.read(guild_id, start, end, Some(categories)).await?)
    }
}
