//! Edge-triggered notifications per (guild, category).
//!
//! A notification is sent when its condition turns true and retracted when it turns false. Temporary
//! notifications are deleted right after sending; the slot stays latched until the condition clears
//! so a standing condition is announced once. Nothing survives a restart, so at most one repeat per
//! category can follow one.

use crate::{
    chat::{ChatClient, MessageHandle},
    settings::NotificationConfig,
    status_text::ControlId,
    tree_log::{Category, TreeEvent, TreeLogError, TreeLogStore},
};
use regex::Regex;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, LazyLock},
};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{info, warn};

static PING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)`ping`").expect("static regex"));
static NEWLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i) ?`newline` ?").expect("static regex"));
static CHOICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`(.+?)``(.+?)``(.+?)`").expect("static regex"));

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotificationState {
    Absent,
    Active {
        handle: MessageHandle,
        created_at: OffsetDateTime,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    /// No channel configured for the guild.
    Disabled,
    Noop,
    Sent,
    /// Sent and deleted straight away.
    Pulsed,
    SendFailed,
    Cleared,
}

#[derive(Debug)]
struct Slot {
    state: NotificationState,
    /// Creation time of a temporary notification whose condition has not cleared yet.
    pulsed_at: Option<OffsetDateTime>,
}

impl Slot {
    fn absent() -> Self {
        Self {
            state: NotificationState::Absent,
            pulsed_at: None,
        }
    }

    fn engaged_since(&self) -> Option<OffsetDateTime> {
        match &self.state {
            NotificationState::Active { created_at, .. } => Some(*created_at),
            NotificationState::Absent => self.pulsed_at,
        }
    }
}

fn choice_index(category: Category) -> usize {
    match category {
        Category::Insect => 0,
        Category::Fruit => 1,
        Category::Water => 2,
    }
}

fn role_for(config: &NotificationConfig, category: Category) -> Option<&str> {
    match category {
        Category::Insect => config.insect_role_id.as_deref(),
        Category::Fruit => config.fruit_role_id.as_deref(),
        Category::Water => config.water_role_id.as_deref(),
    }
}

fn enabled_for(config: &NotificationConfig, category: Category) -> bool {
    match category {
        Category::Insect => config.insect,
        Category::Fruit => config.fruit,
        Category::Water => config.water,
    }
}

/// Fills a notification template for one category.
///
/// `` `ping` `` becomes the role mention (dropped without a role), `` `newline` `` a line break, and
/// each `` `a``b``c` `` triple the entry for insect, fruit or water.
pub fn render_notification(template: &str, category: Category, role_id: Option<&str>) -> String {
    let mention = role_id.map(|r| format!("<@&{r}>")).unwrap_or_default();
    let out = PING.replace_all(template, regex::NoExpand(mention.as_str()));
    let out = NEWLINE.replace_all(&out, "\n");
    let idx = choice_index(category) + 1;
    let out = CHOICE.replace_all(&out, |caps: &regex::Captures| caps[idx].to_string());
    out.trim().to_string()
}

pub fn insect_condition(controls: &HashSet<ControlId>, insect_engaged: bool) -> bool {
    // While the insect is being caught every control turns into a basket, so a missing water
    // control keeps an existing insect notification alive.
    controls.contains(&ControlId::BugNet)
        || (!controls.contains(&ControlId::Water) && insect_engaged)
}

pub fn fruit_condition(controls: &HashSet<ControlId>) -> bool {
    controls.contains(&ControlId::Basket)
}

pub fn water_condition(now: OffsetDateTime, next_time: OffsetDateTime) -> bool {
    now > next_time
}

pub struct NotificationGate {
    chat: Arc<dyn ChatClient>,
    logs: Arc<TreeLogStore>,
    slots: Mutex<HashMap<(String, Category), Slot>>,
}

impl NotificationGate {
    pub fn new(chat: Arc<dyn ChatClient>, logs: Arc<TreeLogStore>) -> Self {
        Self {
            chat,
            logs,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn state(&self, guild_id: &str, category: Category) -> NotificationState {
        let slots = self.slots.lock().await;
        slots
            .get(&(guild_id.to_string(), category))
            .map(|s| s.state.clone())
            .unwrap_or(NotificationState::Absent)
    }

    /// Runs one edge check. `condition` receives whether a notification for this slot is currently
    /// out (active or latched) and decides whether one should be.
    ///
    /// The slot table stays locked through send and delete, so concurrent evaluations for the same
    /// slot cannot both send. Without a channel nothing is sent, but an engaged slot is still
    /// cleared.
    pub async fn evaluate(
        &self,
        guild_id: &str,
        category: Category,
        config: &NotificationConfig,
        now: OffsetDateTime,
        condition: impl FnOnce(bool) -> bool,
    ) -> Result<GateAction, TreeLogError> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .entry((guild_id.to_string(), category))
            .or_insert_with(Slot::absent);
        let engaged = slot.engaged_since();

        let Some(channel_id) = config.channel_id.as_deref() else {
            return match engaged {
                Some(created_at) => self.clear(guild_id, category, slot, created_at, now).await,
                None => Ok(GateAction::Disabled),
            };
        };
        let wanted = enabled_for(config, category) && condition(engaged.is_some());

        match (wanted, engaged) {
            (true, None) => {
                let content = render_notification(
                    &config.message,
                    category,
                    role_for(config, category),
                );
                let handle = match self.chat.send_message(channel_id, &content).await {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!(guild_id, category = category.as_str(), "notification not sent: {e}");
                        return Ok(GateAction::SendFailed);
                    }
                };
                info!(guild_id, category = category.as_str(), "notification sent");
                if config.temporary {
                    if let Err(e) = self.chat.delete_message(&handle).await {
                        warn!(guild_id, "temporary notification not deleted: {e}");
                    }
                    slot.pulsed_at = Some(handle.created_at);
                    return Ok(GateAction::Pulsed);
                }
                slot.state = NotificationState::Active {
                    created_at: handle.created_at,
                    handle,
                };
                Ok(GateAction::Sent)
            }
            (false, Some(created_at)) => self.clear(guild_id, category, slot, created_at, now).await,
            _ => Ok(GateAction::Noop),
        }
    }

    async fn clear(
        &self,
        guild_id: &str,
        category: Category,
        slot: &mut Slot,
        created_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<GateAction, TreeLogError> {
        if let NotificationState::Active { handle, .. } = &slot.state {
            if let Err(e) = self.chat.delete_message(handle).await {
                warn!(guild_id, "notification not deleted: {e}");
            }
        }
        *slot = Slot::absent();
        // Water intervals come from the status timestamps instead.
        if category != Category::Water {
            // `created_at` is the platform's clock; it can run ahead of ours.
            let event = TreeEvent::new(created_at.min(now), now, category);
            self.logs.append(guild_id, &event).await?;
        }
        info!(guild_id, category = category.as_str(), "notification cleared");
        Ok(GateAction::Cleared)
    }
}
