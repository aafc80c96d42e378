//! Per-guild configuration, one JSON document per (guild, category) in SQLite.

use rusqlite::{Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use time::{format_description::well_known::Rfc3339, OffsetDateTime, UtcOffset};
use tokio::sync::Mutex;

pub const DEFAULT_OUTLIER_SECONDS: i64 = 60 * 60 * 2;
pub const TZ_OFFSET_MINUTES_MIN: i32 = -14 * 60;
pub const TZ_OFFSET_MINUTES_MAX: i32 = 14 * 60;
/// Longest statistics window, in hours.
pub const MAX_WINDOW_HOURS: i64 = 24 * 365 * 5;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings db error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("settings json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown config category: {0}")]
    UnknownCategory(String),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

pub trait ConfigCategory: Serialize + DeserializeOwned + Default {
    const NAME: &'static str;

    /// Range checks that serde cannot express.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Offset for a minute count, clamped to the valid UTC offset range.
pub fn tz_offset_from_minutes(minutes: i32) -> UtcOffset {
    let minutes = minutes.clamp(TZ_OFFSET_MINUTES_MIN, TZ_OFFSET_MINUTES_MAX);
    UtcOffset::from_whole_seconds(minutes.saturating_mul(60)).unwrap_or(UtcOffset::UTC)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Channel the tree message lives in.
    pub channel_id: Option<String>,
    /// Offset used when grouping report rows by local hour/day.
    pub tz_offset_minutes: i32,
    /// Intervals or gaps this long (seconds) are left out of statistics.
    pub outlier_duration: i64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            channel_id: None,
            tz_offset_minutes: 0,
            outlier_duration: DEFAULT_OUTLIER_SECONDS,
        }
    }
}

impl GeneralConfig {
    pub fn tz_offset(&self) -> UtcOffset {
        tz_offset_from_minutes(self.tz_offset_minutes)
    }
}

impl ConfigCategory for GeneralConfig {
    const NAME: &'static str = "general";

    fn validate(&self) -> Result<(), String> {
        if !(TZ_OFFSET_MINUTES_MIN..=TZ_OFFSET_MINUTES_MAX).contains(&self.tz_offset_minutes) {
            return Err(format!(
                "tz_offset_minutes must be within {TZ_OFFSET_MINUTES_MIN}..={TZ_OFFSET_MINUTES_MAX}"
            ));
        }
        if self.outlier_duration <= 0 {
            return Err("outlier_duration must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusMessageConfig {
    pub channel_id: Option<String>,
    pub total_hours: i64,
    /// Inclusive weekday range `[first, last]`, 0 = Monday. One entry means a single day.
    pub valid_days: Vec<u8>,
    /// UTC hours at which a summary is due.
    pub valid_hours: Vec<u8>,
    /// Next due time per entry of `valid_hours`, in the log timestamp format.
    pub next_message: Vec<String>,
}

impl Default for StatusMessageConfig {
    fn default() -> Self {
        Self {
            channel_id: None,
            total_hours: 24 * 7,
            valid_days: vec![6],
            valid_hours: vec![11],
            next_message: Vec::new(),
        }
    }
}

impl ConfigCategory for StatusMessageConfig {
    const NAME: &'static str = "status_message";

    fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_WINDOW_HOURS).contains(&self.total_hours) {
            return Err(format!("total_hours must be within 1..={MAX_WINDOW_HOURS}"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoalConfig {
    pub channel_id: Option<String>,
    pub reached: bool,
    pub goal: f64,
    /// Reached when the value is `>= goal`; otherwise when `<= goal`.
    pub greater_than: bool,
    pub pattern: String,
    pub message: String,
}

impl Default for GoalConfig {
    fn default() -> Self {
        Self {
            channel_id: None,
            reached: true,
            goal: 0.0,
            greater_than: false,
            pattern: r"the #([0-9]+) tallest".to_string(),
            message: "`@/` `newline` Tree has reached rank #`goal`!".to_string(),
        }
    }
}

impl ConfigCategory for GoalConfig {
    const NAME: &'static str = "tree_goal";
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub channel_id: Option<String>,
    pub insect: bool,
    pub fruit: bool,
    pub water: bool,
    /// Delete each notification right after sending it.
    pub temporary: bool,
    pub message: String,
    pub insect_role_id: Option<String>,
    pub fruit_role_id: Option<String>,
    pub water_role_id: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel_id: None,
            insect: false,
            fruit: false,
            water: false,
            temporary: true,
            message: "`ping` `Catch the insect!``Collect the fruit!``Water the tree!`"
                .to_string(),
            insect_role_id: None,
            fruit_role_id: None,
            water_role_id: None,
        }
    }
}

impl ConfigCategory for NotificationConfig {
    const NAME: &'static str = "notification";
}

pub const CATEGORIES: [&str; 4] = [
    GeneralConfig::NAME,
    StatusMessageConfig::NAME,
    GoalConfig::NAME,
    NotificationConfig::NAME,
];

/// Accepts a bare id or a link: one digit group is the channel, two or more
/// (`guild/channel/message`) means the second group is.
pub fn normalize_channel_ref(input: &str) -> Option<String> {
    let groups: Vec<&str> = input
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .collect();
    match groups.as_slice() {
        [] => None,
        [only] => Some(only.to_string()),
        [_, second, ..] => Some(second.to_string()),
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS guild_settings (
  guild_id TEXT NOT NULL,
  category TEXT NOT NULL,
  config_json TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (guild_id, category)
);
"#,
    )
}

fn load_config_json(
    conn: &Connection,
    guild_id: &str,
    category: &str,
) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT config_json FROM guild_settings WHERE guild_id = ?1 AND category = ?2",
        (guild_id, category),
        |row| row.get(0),
    )
    .optional()
}

fn upsert_config_json(
    conn: &Connection,
    guild_id: &str,
    category: &str,
    config_json: &str,
    updated_at: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        r#"
INSERT INTO guild_settings (guild_id, category, config_json, updated_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(guild_id, category) DO UPDATE SET
  config_json=excluded.config_json,
  updated_at=excluded.updated_at
        "#,
        (guild_id, category, config_json, updated_at),
    )?;
    Ok(())
}

fn default_json(category: &str) -> Result<Value, SettingsError> {
    Ok(match category {
        GeneralConfig::NAME => serde_json::to_value(GeneralConfig::default())?,
        StatusMessageConfig::NAME => serde_json::to_value(StatusMessageConfig::default())?,
        GoalConfig::NAME => serde_json::to_value(GoalConfig::default())?,
        NotificationConfig::NAME => serde_json::to_value(NotificationConfig::default())?,
        other => return Err(SettingsError::UnknownCategory(other.to_string())),
    })
}

/// Round-trips `value` through the typed config so unknown keys and wrong types are rejected
/// before anything is stored.
fn validate_json(category: &str, value: Value) -> Result<Value, SettingsError> {
    fn check<T: ConfigCategory>(value: Value) -> Result<Value, SettingsError> {
        let typed: T = serde_json::from_value(value)
            .map_err(|e| SettingsError::Invalid(format!("{}: {e}", T::NAME)))?;
        typed
            .validate()
            .map_err(|e| SettingsError::Invalid(format!("{}: {e}", T::NAME)))?;
        Ok(serde_json::to_value(typed)?)
    }
    match category {
        GeneralConfig::NAME => check::<GeneralConfig>(value),
        StatusMessageConfig::NAME => check::<StatusMessageConfig>(value),
        GoalConfig::NAME => check::<GoalConfig>(value),
        NotificationConfig::NAME => check::<NotificationConfig>(value),
        other => Err(SettingsError::UnknownCategory(other.to_string())),
    }
}

pub struct SettingsStore {
    conn: Mutex<Connection>,
}

impl SettingsStore {
    pub fn open(path: &Path) -> Result<Self, SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SettingsError::Invalid(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, SettingsError> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Stored config, or the category default when the guild has none yet.
    pub async fn get<T: ConfigCategory>(&self, guild_id: &str) -> Result<T, SettingsError> {
        let conn = self.conn.lock().await;
        match load_config_json(&conn, guild_id, T::NAME)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(T::default()),
        }
    }

    pub async fn set<T: ConfigCategory>(
        &self,
        guild_id: &str,
        config: &T,
    ) -> Result<(), SettingsError> {
        let json = serde_json::to_string(config)?;
        let conn = self.conn.lock().await;
        upsert_config_json(&conn, guild_id, T::NAME, &json, &now_rfc3339())?;
        Ok(())
    }

    /// Writes defaults for every category the guild does not have yet.
    pub async fn ensure_defaults(&self, guild_id: &str) -> Result<(), SettingsError> {
        let conn = self.conn.lock().await;
        let updated_at = now_rfc3339();
        for category in CATEGORIES {
            let json = serde_json::to_string(&default_json(category)?)?;
            conn.execute(
                "INSERT INTO guild_settings (guild_id, category, config_json, updated_at) VALUES (?1, ?2, ?3, ?4) ON CONFLICT(guild_id, category) DO NOTHING",
                (guild_id, category, &json, &updated_at),
            )?;
        }
        Ok(())
    }

    pub async fn guild_ids(&self) -> Result<Vec<String>, SettingsError> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT DISTINCT guild_id FROM guild_settings ORDER BY guild_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn get_json(&self, guild_id: &str, category: &str) -> Result<Value, SettingsError> {
        let stored = {
            let conn = self.conn.lock().await;
            load_config_json(&conn, guild_id, category)?
        };
        match stored {
            Some(json) => validate_json(category, serde_json::from_str(&json)?),
            None => default_json(category),
        }
    }

    /// Applies the non-null fields of `patch` to one category and returns the stored result.
    pub async fn update_json(
        &self,
        guild_id: &str,
        category: &str,
        patch: Map<String, Value>,
    ) -> Result<Value, SettingsError> {
        let conn = self.conn.lock().await;
        let mut current = match load_config_json(&conn, guild_id, category)? {
            Some(json) => serde_json::from_str::<Value>(&json)?,
            None => default_json(category)?,
        };
        let Some(obj) = current.as_object_mut() else {
            return Err(SettingsError::Invalid(format!("{category}: not an object")));
        };

        for (key, value) in patch {
            if value.is_null() {
                continue;
            }
            let value = if key.ends_with("channel_id") || key.ends_with("role_id") {
                let raw = match &value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return Err(SettingsError::Invalid(format!("{key}: expected an id"))),
                };
                let id = normalize_channel_ref(&raw)
                    .ok_or_else(|| SettingsError::Invalid(format!("{key}: `{raw}` has no id")))?;
                Value::String(id)
            } else {
                value
            };
            match (category, key.as_str()) {
                // A new goal has not been reached yet.
                (GoalConfig::NAME, "goal") => {
                    obj.insert("reached".to_string(), Value::Bool(false));
                }
                // Due times belong to the old hour list.
                (StatusMessageConfig::NAME, "valid_hours") => {
                    obj.insert("next_message".to_string(), Value::Array(Vec::new()));
                }
                _ => {}
            }
            obj.insert(key, value);
        }

        let validated = validate_json(category, current)?;
        upsert_config_json(
            &conn,
            guild_id,
            category,
            &serde_json::to_string(&validated)?,
            &now_rfc3339(),
        )?;
        Ok(validated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const GUILD: &str = "1001";

    fn patch(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn channel_refs_accept_ids_and_links() {
        assert_eq!(normalize_channel_ref("1234"), Some("1234".to_string()));
        assert_eq!(
            normalize_channel_ref("https://discord.com/channels/111/222/333"),
            Some("222".to_string())
        );
        assert_eq!(normalize_channel_ref("<#555>"), Some("555".to_string()));
        assert_eq!(normalize_channel_ref("general"), None);
    }

    #[tokio::test]
    async fn missing_config_falls_back_to_defaults() {
        let store = SettingsStore::open_in_memory().unwrap();
        let general: GeneralConfig = store.get(GUILD).await.unwrap();
        assert_eq!(general, GeneralConfig::default());
        assert!(store.guild_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ensure_defaults_does_not_overwrite() {
        let store = SettingsStore::open_in_memory().unwrap();
        let custom = NotificationConfig {
            water: true,
            ..NotificationConfig::default()
        };
        store.set(GUILD, &custom).await.unwrap();
        store.ensure_defaults(GUILD).await.unwrap();
        let got: NotificationConfig = store.get(GUILD).await.unwrap();
        assert!(got.water);
        assert_eq!(store.guild_ids().await.unwrap(), vec![GUILD.to_string()]);
    }

    #[tokio::test]
    async fn update_json_merges_and_normalizes() {
        let store = SettingsStore::open_in_memory().unwrap();
        let out = store
            .update_json(
                GUILD,
                "notification",
                patch(json!({
                    "channel_id": "https://discord.com/channels/1/42",
                    "water": true,
                    "message": null
                })),
            )
            .await
            .unwrap();
        assert_eq!(out["channel_id"], json!("42"));
        assert_eq!(out["water"], json!(true));
        assert_eq!(out["message"], json!(NotificationConfig::default().message));

        let typed: NotificationConfig = store.get(GUILD).await.unwrap();
        assert_eq!(typed.channel_id.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn update_json_resets_dependent_fields() {
        let store = SettingsStore::open_in_memory().unwrap();
        store
            .set(
                GUILD,
                &GoalConfig {
                    reached: true,
                    ..GoalConfig::default()
                },
            )
            .await
            .unwrap();
        let out = store
            .update_json(GUILD, "tree_goal", patch(json!({"goal": 10})))
            .await
            .unwrap();
        assert_eq!(out["reached"], json!(false));

        store
            .set(
                GUILD,
                &StatusMessageConfig {
                    next_message: vec!["2025-01-01 11:00:00".to_string()],
                    ..StatusMessageConfig::default()
                },
            )
            .await
            .unwrap();
        let out = store
            .update_json(GUILD, "status_message", patch(json!({"valid_hours": [3, 15]})))
            .await
            .unwrap();
        assert_eq!(out["next_message"], json!([]));
        assert_eq!(out["valid_hours"], json!([3, 15]));
    }

    #[tokio::test]
    async fn update_json_rejects_bad_input() {
        let store = SettingsStore::open_in_memory().unwrap();
        let err = store
            .update_json(GUILD, "general", patch(json!({"outlier_duration": "long"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SettingsError::Invalid(_)));
        let err = store
            .update_json(GUILD, "weather", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SettingsError::UnknownCategory(_)));
        let err = store
            .update_json(GUILD, "general", patch(json!({"channel_id": "none"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SettingsError::Invalid(_)));
    }

    #[tokio::test]
    async fn update_json_rejects_out_of_range_numbers() {
        let store = SettingsStore::open_in_memory().unwrap();
        for (category, body) in [
            ("status_message", json!({"total_hours": 2_000_000_000i64})),
            ("status_message", json!({"total_hours": 0})),
            ("general", json!({"tz_offset_minutes": 100_000_000})),
            ("general", json!({"outlier_duration": -5})),
        ] {
            let err = store
                .update_json(GUILD, category, patch(body))
                .await
                .unwrap_err();
            assert!(matches!(err, SettingsError::Invalid(_)), "{category}");
        }
        let stored: StatusMessageConfig = store.get(GUILD).await.unwrap();
        assert_eq!(stored.total_hours, StatusMessageConfig::default().total_hours);

        let out = store
            .update_json(GUILD, "general", patch(json!({"tz_offset_minutes": -300})))
            .await
            .unwrap();
        assert_eq!(out["tz_offset_minutes"], json!(-300));
    }

    #[test]
    fn tz_offset_is_clamped() {
        let far = GeneralConfig {
            tz_offset_minutes: i32::MAX,
            ..GeneralConfig::default()
        };
        assert_eq!(far.tz_offset().whole_minutes(), 14 * 60);
        assert_eq!(tz_offset_from_minutes(-90).whole_minutes(), -90);
    }
}
