//! Append-only per-guild CSV logs of tree intervals.
//!
//! One file per guild (`<guild_id>.csv`) with the header `start,end,type`. Timestamps are naive
//! UTC in `YYYY-MM-DD HH:MM:SS` so the files stay readable and diffable.

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, io::ErrorKind, path::PathBuf, sync::Arc};
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime, PrimitiveDateTime};
use tokio::{
    fs::OpenOptions,
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::{Mutex, OnceCell},
};
use tracing::{debug, info};

pub const LOG_HEADER: &str = "start,end,type";

const LOG_TS_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Water,
    Insect,
    Fruit,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Water, Category::Insect, Category::Fruit];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Water => "water",
            Category::Insect => "insect",
            Category::Fruit => "fruit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "water" => Some(Category::Water),
            "insect" => Some(Category::Insect),
            "fruit" => Some(Category::Fruit),
            _ => None,
        }
    }
}

/// One completed interval.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEvent {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub category: Category,
}

impl TreeEvent {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime, category: Category) -> Self {
        Self {
            start,
            end,
            category,
        }
    }

    fn overlaps(&self, start: OffsetDateTime, end: OffsetDateTime) -> bool {
        self.end >= start && self.start <= end
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TreeLogError {
    #[error("tree log I/O failed for guild {guild_id}: {source}")]
    Io {
        guild_id: String,
        #[source]
        source: std::io::Error,
    },
}

impl TreeLogError {
    fn io(guild_id: &str) -> impl FnOnce(std::io::Error) -> TreeLogError + '_ {
        move |source| TreeLogError::Io {
            guild_id: guild_id.to_string(),
            source,
        }
    }
}

pub fn format_log_ts(t: OffsetDateTime) -> String {
    t.to_offset(time::UtcOffset::UTC)
        .format(LOG_TS_FORMAT)
        .unwrap_or_default()
}

pub fn parse_log_ts(s: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(s.trim(), LOG_TS_FORMAT)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

fn format_row(e: &TreeEvent) -> String {
    format!(
        "{},{},{}\n",
        format_log_ts(e.start),
        format_log_ts(e.end),
        e.category.as_str()
    )
}

/// Rows with a missing or unparseable field yield `None`.
fn parse_row(line: &str) -> Option<TreeEvent> {
    let mut fields = line.trim_end_matches(['\r', '\n']).split(',');
    let start = parse_log_ts(fields.next()?)?;
    let end = parse_log_ts(fields.next()?)?;
    let category = Category::parse(fields.next()?)?;
    if fields.next().is_some() {
        return None;
    }
    Some(TreeEvent {
        start,
        end,
        category,
    })
}

/// CSV document (with header) for export.
pub fn render_csv(events: &[TreeEvent]) -> String {
    let mut out = String::with_capacity(LOG_HEADER.len() + 1 + events.len() * 48);
    out.push_str(LOG_HEADER);
    out.push('\n');
    for e in events {
        out.push_str(&format_row(e));
    }
    out
}

/// Drops inverted rows, sorts by `(category, start)` and removes same-category overlaps.
pub fn normalize_events(mut events: Vec<TreeEvent>) -> Vec<TreeEvent> {
    events.retain(|e| e.start <= e.end);
    events.sort_by_key(|e| (e.category, e.start));
    dedupe_overlaps(events)
}

/// Input must be sorted by `(category, start)`. Within a category an event survives only if it
/// starts at or after the end of the last surviving event; the first of each category always does.
pub fn dedupe_overlaps(sorted: Vec<TreeEvent>) -> Vec<TreeEvent> {
    let mut out: Vec<TreeEvent> = Vec::with_capacity(sorted.len());
    let mut last_kept: Option<(Category, OffsetDateTime)> = None;
    for e in sorted {
        if let Some((category, end)) = last_kept {
            if category == e.category && e.start < end {
                continue;
            }
        }
        last_kept = Some((e.category, e.end));
        out.push(e);
    }
    out
}

struct GuildLog {
    ready: OnceCell<()>,
    io: Mutex<()>,
}

/// Per-guild CSV logs. Reads and appends for one guild are serialized; guilds are independent.
pub struct TreeLogStore {
    dir: PathBuf,
    guilds: Mutex<HashMap<String, Arc<GuildLog>>>,
}

impl TreeLogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            guilds: Mutex::new(HashMap::new()),
        }
    }

    pub fn log_path(&self, guild_id: &str) -> PathBuf {
        self.dir.join(format!("{guild_id}.csv"))
    }

    async fn entry(&self, guild_id: &str) -> Arc<GuildLog> {
        let mut guilds = self.guilds.lock().await;
        guilds
            .entry(guild_id.to_string())
            .or_insert_with(|| {
                Arc::new(GuildLog {
                    ready: OnceCell::new(),
                    io: Mutex::new(()),
                })
            })
            .clone()
    }

    /// Creates the header-only log if it does not exist yet. Concurrent callers for the same guild
    /// all wait on the first initialization.
    pub async fn ensure(&self, guild_id: &str) -> Result<(), TreeLogError> {
        let entry = self.entry(guild_id).await;
        entry
            .ready
            .get_or_try_init(|| async {
                let _guard = entry.io.lock().await;
                self.create_if_missing(guild_id).await
            })
            .await?;
        Ok(())
    }

    async fn create_if_missing(&self, guild_id: &str) -> Result<(), TreeLogError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(TreeLogError::io(guild_id))?;
        let path = self.log_path(guild_id);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut f) => {
                f.write_all(format!("{LOG_HEADER}\n").as_bytes())
                    .await
                    .map_err(TreeLogError::io(guild_id))?;
                f.sync_data().await.map_err(TreeLogError::io(guild_id))?;
                info!("created tree log {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(TreeLogError::io(guild_id)(err)),
        }
    }

    pub async fn append(&self, guild_id: &str, event: &TreeEvent) -> Result<(), TreeLogError> {
        self.ensure(guild_id).await?;
        let entry = self.entry(guild_id).await;
        let _guard = entry.io.lock().await;

        let mut f = OpenOptions::new()
            .append(true)
            .open(self.log_path(guild_id))
            .await
            .map_err(TreeLogError::io(guild_id))?;
        f.write_all(format_row(event).as_bytes())
            .await
            .map_err(TreeLogError::io(guild_id))?;
        f.sync_data().await.map_err(TreeLogError::io(guild_id))?;
        debug!(
            guild_id,
            category = event.category.as_str(),
            "appended {} -> {}",
            format_log_ts(event.start),
            format_log_ts(event.end)
        );
        Ok(())
    }

    /// `Ok(None)` means the guild has no log at all, which callers keep apart from an empty one.
    async fn open_known(&self, guild_id: &str) -> Result<Option<Arc<GuildLog>>, TreeLogError> {
        let known = self.guilds.lock().await.contains_key(guild_id);
        if !known {
            let exists = tokio::fs::try_exists(self.log_path(guild_id))
                .await
                .map_err(TreeLogError::io(guild_id))?;
            if !exists {
                return Ok(None);
            }
        }
        self.ensure(guild_id).await?;
        Ok(Some(self.entry(guild_id).await))
    }

    /// Streams the log line by line and visits every parseable row.
    async fn scan(
        &self,
        guild_id: &str,
        mut visit: impl FnMut(TreeEvent),
    ) -> Result<(), TreeLogError> {
        let f = tokio::fs::File::open(self.log_path(guild_id))
            .await
            .map_err(TreeLogError::io(guild_id))?;
        let mut lines = BufReader::new(f).lines();
        let mut first = true;
        while let Some(line) = lines.next_line().await.map_err(TreeLogError::io(guild_id))? {
            if std::mem::take(&mut first) && line.trim() == LOG_HEADER {
                continue;
            }
            if let Some(e) = parse_row(&line) {
                visit(e);
            }
        }
        Ok(())
    }

    /// Events overlapping `[start, end]` of the given categories (`water` when `None`),
    /// normalized by [`normalize_events`].
    pub async fn read(
        &self,
        guild_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
        categories: Option<&[Category]>,
    ) -> Result<Option<Vec<TreeEvent>>, TreeLogError> {
        let Some(entry) = self.open_known(guild_id).await? else {
            return Ok(None);
        };
        let wanted: &[Category] = categories.unwrap_or(&[Category::Water]);

        let mut rows = Vec::new();
        {
            let _guard = entry.io.lock().await;
            self.scan(guild_id, |e| {
                if wanted.contains(&e.category) && e.overlaps(start, end) {
                    rows.push(e);
                }
            })
            .await?;
        }
        Ok(Some(normalize_events(rows)))
    }

    /// Most recently appended valid row of `category`.
    pub async fn last_event(
        &self,
        guild_id: &str,
        category: Category,
    ) -> Result<Option<TreeEvent>, TreeLogError> {
        let Some(entry) = self.open_known(guild_id).await? else {
            return Ok(None);
        };
        let _guard = entry.io.lock().await;
        let mut last = None;
        self.scan(guild_id, |e| {
            if e.category == category && e.start <= e.end {
                last = Some(e);
            }
        })
        .await?;
        Ok(last)
    }

    /// Guild ids that already have a log file on disk.
    pub async fn known_guilds(&self) -> Result<Vec<String>, std::io::Error> {
        let mut out = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.is_empty() && stem.chars().all(|c| c.is_ascii_digit()) {
                    out.push(stem.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }
}
