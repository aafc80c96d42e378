//! Grammar for the tree bot's status embed.
//!
//! The embed text is owned by a third-party bot, so every pattern here has an explicit miss
//! outcome (`None` / `false`) that callers treat as "nothing to record", never as zero.

use regex::Regex;
use serde::Deserialize;
use std::{collections::HashSet, sync::LazyLock};

/// Matches Discord's `<t:1735689600:R>` timestamp markup (the style flag is optional).
static TIMESTAMP_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<t:(\d+)(?::[a-zA-Z])?>").expect("static regex"));

const TREE_MARKER: &str = "your tree is";
const READY_MARKER: &str = "ready to be watered";

/// True when the embed description belongs to a tree status message.
pub fn is_tree_status(description: &str) -> bool {
    description.to_lowercase().contains(TREE_MARKER)
}

/// True when the text shows the momentary "can be watered now" state.
pub fn is_ready(text: &str) -> bool {
    text.to_lowercase().contains(READY_MARKER)
}

/// First timestamp marker in `text`, as Unix epoch seconds.
pub fn extract_timestamp(text: &str) -> Option<i64> {
    TIMESTAMP_MARKER
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())
}

/// Applies a guild-configured goal pattern and parses the first match as a number.
///
/// When the pattern has a capture group, group 1 holds the value; otherwise the whole match does.
/// An invalid pattern is an error (it is user configuration); a missing or non-numeric match is a
/// miss.
pub fn extract_goal_value(pattern: &str, text: &str) -> Result<Option<f64>, regex::Error> {
    let re = Regex::new(pattern)?;
    Ok(re
        .captures(text)
        .and_then(|c| c.get(1).or_else(|| c.get(0)))
        .and_then(|m| m.as_str().trim().parse::<f64>().ok()))
}

/// One interactive control attached to the status message, as delivered by the chat adapter.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct IngestControl {
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

/// Controls the tree message can show. Only the ones the gate cares about are named.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum ControlId {
    BugNet,
    Water,
    Basket,
    Refresh,
    Other(String),
}

impl ControlId {
    fn from_emoji(emoji: &str) -> Self {
        match emoji.trim() {
            "bugnet" => ControlId::BugNet,
            "💧" => ControlId::Water,
            "🧺" => ControlId::Basket,
            "🔄" => ControlId::Refresh,
            other => ControlId::Other(other.to_string()),
        }
    }
}

/// Enabled controls, keyed by what they mean for the tree.
pub fn extract_control_set(controls: &[IngestControl]) -> HashSet<ControlId> {
    controls
        .iter()
        .filter(|c| !c.disabled)
        .filter_map(|c| c.emoji.as_deref())
        .filter(|e| !e.trim().is_empty())
        .map(ControlId::from_emoji)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_timestamp_takes_first_marker() {
        let text = "Ready to water in <t:1735689600:R> (next <t:1735693200:R>)";
        assert_eq!(extract_timestamp(text), Some(1735689600));
        assert_eq!(extract_timestamp("at <t:42>"), Some(42));
    }

    #[test]
    fn extract_timestamp_miss_is_distinct_from_zero() {
        assert_eq!(extract_timestamp("<t:0:R>"), Some(0));
        assert_eq!(extract_timestamp("no marker here"), None);
        assert_eq!(extract_timestamp("<t:abc:R>"), None);
        assert_eq!(extract_timestamp("<t:123:Rx>"), None);
        assert_eq!(extract_timestamp("<t:99999999999999999999999:R>"), None);
    }

    #[test]
    fn status_markers_ignore_case() {
        assert!(is_tree_status("Your tree is 12.3ft tall"));
        assert!(!is_tree_status("Some other embed"));
        assert!(is_ready("Your tree is READY TO BE WATERED!"));
        assert!(!is_ready("Your tree can be watered <t:1:R>"));
    }

    #[test]
    fn goal_value_uses_configured_pattern() {
        let text = "Your tree is the #42 tallest tree";
        assert!(extract_goal_value(r"[0-9]+(?= tallest)", text).is_err());
        assert_eq!(
            extract_goal_value(r"the #([0-9]+) tallest", text).unwrap(),
            Some(42.0)
        );
        assert_eq!(
            extract_goal_value(r"#[0-9]+", text).unwrap(),
            None,
            "non-numeric match is a miss"
        );
        assert_eq!(extract_goal_value(r"[0-9]+", text).unwrap(), Some(42.0));
        assert_eq!(extract_goal_value(r"[0-9]+", "no digits").unwrap(), None);
    }

    #[test]
    fn control_set_skips_disabled_and_blank() {
        let controls = vec![
            IngestControl {
                emoji: Some("bugnet".to_string()),
                disabled: false,
            },
            IngestControl {
                emoji: Some("💧".to_string()),
                disabled: true,
            },
            IngestControl {
                emoji: None,
                disabled: false,
            },
            IngestControl {
                emoji: Some("🔄".to_string()),
                disabled: false,
            },
        ];
        let set = extract_control_set(&controls);
        assert_eq!(set.len(), 2);
        assert!(set.contains(&ControlId::BugNet));
        assert!(set.contains(&ControlId::Refresh));
        assert!(!set.contains(&ControlId::Water));
    }
}
