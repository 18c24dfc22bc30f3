//! # Types
//!
//! Core domain types for sitewatch: the persisted document, monitors,
//! fingerprints, history, forensic snapshots, and outbound alert payloads.
//!
//! ## Serialization
//!
//! Every type here implements `Serialize`/`Deserialize`; the whole tree is
//! persisted as a single JSON document by the atomic store. Timestamps are
//! chrono `DateTime<Utc>` and serialize as ISO-8601 with a `Z` suffix.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use sitewatch_diff::{ChangeType, SimilarityMetrics};

use crate::error::WatchError;

/// Current schema version of the persisted document.
pub const SCHEMA_VERSION: &str = "2.0";

/// Oldest schema version the loader can migrate forward.
pub const MINIMUM_SUPPORTED_SCHEMA: &str = "1.0";

/// Default similarity threshold below which a change alerts.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

/// Lowest accepted similarity threshold; smaller values clamp up to this.
pub const MIN_SIMILARITY_THRESHOLD: f64 = 0.01;

/// Default seconds between checks of a monitor.
pub const DEFAULT_CHECK_INTERVAL_SECONDS: u64 = 60;

/// Shortest permitted check interval; smaller values clamp up to this.
pub const MIN_CHECK_INTERVAL_SECONDS: u64 = 30;

/// Days of change history kept per monitor; older entries are pruned on insert.
pub const HISTORY_RETENTION_DAYS: i64 = 30;

/// Maximum forensic snapshots retained per monitor.
pub const FORENSIC_SNAPSHOT_CAP: usize = 3;

/// The whole persisted document: a schema version plus one entry per chat id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    /// Document schema version, e.g. `"2.0"`.
    pub schema_version: String,
    /// User records, keyed by chat id (stringified for JSON keys).
    #[serde(flatten)]
    pub users: BTreeMap<String, UserRecord>,
}

impl Database {
    /// A fresh, empty document at the current schema version.
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            users: BTreeMap::new(),
        }
    }

    /// Look up a user's record.
    pub fn user(&self, chat_id: i64) -> Option<&UserRecord> {
        self.users.get(&chat_id.to_string())
    }

    /// Look up or create a user's record.
    pub fn user_mut(&mut self, chat_id: i64) -> &mut UserRecord {
        self.users.entry(chat_id.to_string()).or_default()
    }

    /// Total number of monitors across all users.
    pub fn monitor_count(&self) -> usize {
        self.users.values().map(|u| u.monitors.len()).sum()
    }
}

/// Everything owned by a single chat identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserRecord {
    /// The user's default configuration, applied to monitors without overrides.
    #[serde(default)]
    pub user_config: UserConfig,
    /// Registered monitors, unique by normalized URL.
    #[serde(default)]
    pub monitors: Vec<Monitor>,
}

impl UserRecord {
    /// Find a monitor by its normalized URL.
    pub fn monitor(&self, normalized_url: &str) -> Option<&Monitor> {
        self.monitors
            .iter()
            .find(|m| m.normalized_url == normalized_url)
    }

    /// Find a monitor mutably by its normalized URL.
    pub fn monitor_mut(&mut self, normalized_url: &str) -> Option<&mut Monitor> {
        self.monitors
            .iter_mut()
            .find(|m| m.normalized_url == normalized_url)
    }
}

/// Per-user defaults for monitoring behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Similarity at or above which a change is ignored, in (0, 1].
    pub similarity_threshold: f64,
    /// Seconds between checks (minimum 30).
    pub check_interval_seconds: u64,
    /// Whether change notifications carry the safe diff.
    pub include_diff: bool,
    /// Optional CSS selector scoping fingerprint extraction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_selector: Option<String>,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            check_interval_seconds: DEFAULT_CHECK_INTERVAL_SECONDS,
            include_diff: true,
            custom_selector: None,
        }
    }
}

/// A partial configuration: a monitor-level override or a `set_config` patch.
///
/// `None` fields fall through to the next layer (monitor → user → system).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub similarity_threshold: Option<f64>,
    pub check_interval_seconds: Option<u64>,
    pub include_diff: Option<bool>,
    pub custom_selector: Option<String>,
}

impl ConfigPatch {
    /// Whether the patch carries no values at all.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Validate and clamp a patch at the command boundary.
    ///
    /// Thresholds at or below zero clamp to [`MIN_SIMILARITY_THRESHOLD`] and
    /// above 1.0 clamp down to 1.0; non-finite thresholds are rejected.
    /// Intervals under [`MIN_CHECK_INTERVAL_SECONDS`] clamp up; intervals
    /// beyond `u32::MAX` are rejected.
    pub fn clamped(mut self) -> Result<Self, WatchError> {
        if let Some(t) = self.similarity_threshold {
            if !t.is_finite() {
                return Err(WatchError::ConfigInvalid(format!(
                    "similarity threshold must be a number, got {t}"
                )));
            }
            self.similarity_threshold = Some(t.clamp(MIN_SIMILARITY_THRESHOLD, 1.0));
        }
        if let Some(secs) = self.check_interval_seconds {
            if secs > u64::from(u32::MAX) {
                return Err(WatchError::ConfigInvalid(format!(
                    "check interval {secs}s is out of range"
                )));
            }
            self.check_interval_seconds = Some(secs.max(MIN_CHECK_INTERVAL_SECONDS));
        }
        Ok(self)
    }

    /// Merge another patch on top of this one (later values win).
    pub fn apply(&mut self, other: &ConfigPatch) {
        if other.similarity_threshold.is_some() {
            self.similarity_threshold = other.similarity_threshold;
        }
        if other.check_interval_seconds.is_some() {
            self.check_interval_seconds = other.check_interval_seconds;
        }
        if other.include_diff.is_some() {
            self.include_diff = other.include_diff;
        }
        if other.custom_selector.is_some() {
            self.custom_selector = other.custom_selector.clone();
        }
    }
}

/// The configuration in force for one monitor after resolution
/// (monitor override → user defaults → system defaults).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveConfig {
    pub similarity_threshold: f64,
    pub check_interval_seconds: u64,
    pub include_diff: bool,
    pub custom_selector: Option<String>,
}

impl EffectiveConfig {
    /// Resolve the effective configuration for a monitor under a user config.
    pub fn resolve(user: &UserConfig, monitor: Option<&ConfigPatch>) -> Self {
        let patch = monitor.cloned().unwrap_or_default();
        Self {
            similarity_threshold: patch
                .similarity_threshold
                .unwrap_or(user.similarity_threshold),
            check_interval_seconds: patch
                .check_interval_seconds
                .unwrap_or(user.check_interval_seconds),
            include_diff: patch.include_diff.unwrap_or(user.include_diff),
            custom_selector: patch.custom_selector.or_else(|| user.custom_selector.clone()),
        }
    }

    /// The check interval as a [`Duration`].
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }
}

/// Per-host circuit breaker state, persisted per monitor so it survives restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    #[default]
    Closed,
    /// Requests fast-fail; the host is cooling down.
    Open,
    /// One probing request is permitted.
    HalfOpen,
}

/// Outcome of a monitor's most recent check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    /// Never checked yet.
    #[default]
    Pending,
    Ok,
    HttpError,
    Timeout,
    NetworkError,
    BlockPage,
    CircuitOpen,
    PolicyBlocked,
}

/// A single registered URL with its fingerprint, bookkeeping, and evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    /// The URL as the user supplied it.
    pub url: String,
    /// Canonical form used for dedup, collapsing, and breaker keying.
    pub normalized_url: String,
    /// Monitor-level config override; empty means user defaults apply.
    #[serde(default, skip_serializing_if = "ConfigPatch::is_empty")]
    pub config: ConfigPatch,
    /// Current baseline, or `None` before the first successful fetch.
    #[serde(default)]
    pub fingerprint: Option<WeightedFingerprint>,
    pub metadata: MonitorMetadata,
    /// Change history, ascending by timestamp, pruned to 30 days on insert.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Bounded ring of before/after evidence, newest first.
    #[serde(default)]
    pub forensic_snapshots: Vec<ForensicSnapshot>,
}

impl Monitor {
    /// A fresh monitor created at `now`.
    pub fn new(url: String, normalized_url: String, now: DateTime<Utc>) -> Self {
        Self {
            url,
            normalized_url,
            config: ConfigPatch::default(),
            fingerprint: None,
            metadata: MonitorMetadata::new(now),
            history: Vec::new(),
            forensic_snapshots: Vec::new(),
        }
    }

    /// Append a history entry, keeping ascending order and pruning entries
    /// older than [`HISTORY_RETENTION_DAYS`].
    pub fn push_history(&mut self, entry: HistoryEntry, now: DateTime<Utc>) {
        self.history.push(entry);
        self.history.sort_by_key(|e| e.timestamp);
        let cutoff = now - chrono::Duration::days(HISTORY_RETENTION_DAYS);
        self.history.retain(|e| e.timestamp >= cutoff);
    }

    /// Insert a forensic snapshot at the head, evicting beyond the cap.
    pub fn push_snapshot(&mut self, snapshot: ForensicSnapshot) {
        self.forensic_snapshots.insert(0, snapshot);
        self.forensic_snapshots.truncate(FORENSIC_SNAPSHOT_CAP);
    }
}

/// Scheduler and failure bookkeeping for one monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorMetadata {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_check_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub check_count: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub circuit_breaker_state: CircuitState,
    /// When the breaker for this monitor's host entered OPEN; drives the
    /// cooldown window across restarts.
    #[serde(default)]
    pub circuit_opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub snooze_until: Option<DateTime<Utc>>,
    /// Indefinitely paused via `stop_watching`; resumed by a new `snooze`
    /// of zero or by re-adding.
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub last_status: MonitorStatus,
}

impl MonitorMetadata {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            last_check_at: None,
            check_count: 0,
            consecutive_failures: 0,
            circuit_breaker_state: CircuitState::Closed,
            circuit_opened_at: None,
            snooze_until: None,
            paused: false,
            last_status: MonitorStatus::Pending,
        }
    }
}

/// A versioned, weight-aware digest of a page's noise-filtered content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedFingerprint {
    /// Hex SHA-256 of the filtered weighted text.
    pub hash: String,
    /// Fingerprinting algorithm version tag, e.g. `"v2.0"`.
    pub version: String,
    /// Structural regions present on the page and their semantic weights.
    pub content_weights: BTreeMap<String, f64>,
    /// Compact `tag:count` summary of the DOM skeleton.
    pub structure_signature: String,
    /// The filtered weighted text itself; the diff baseline for the next cycle.
    pub content_text: String,
}

/// One meaningful change, as kept in a monitor's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub change_type: ChangeType,
    pub similarity_final: f64,
    pub diff_summary: String,
}

/// A compressed before/after pair kept for later recomputation of a change
/// decision. Content is zlib-compressed, then base64-encoded; the structure
/// signatures ride along so a replay can rebuild every metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForensicSnapshot {
    pub timestamp: DateTime<Utc>,
    pub old_content_compressed: String,
    pub new_content_compressed: String,
    #[serde(default)]
    pub old_structure_signature: String,
    #[serde(default)]
    pub new_structure_signature: String,
    pub change_type: ChangeType,
    pub similarity_metrics: SimilarityMetrics,
    pub diff_summary: String,
    pub diff_truncated: bool,
}

/// Events delivered to the chat layer through the [`crate::engine::Notifier`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AlertEvent {
    /// A monitored page changed meaningfully.
    ChangeDetected {
        url: String,
        change_type: ChangeType,
        similarity_final: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        safe_diff: Option<String>,
    },
    /// A host's breaker opened; its monitors pause until the cooldown lapses.
    HostCooldown {
        host: String,
        retry_after_seconds: u64,
    },
    /// Operational diagnostics (repeated failures, migration trouble).
    Diagnostic {
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        message: String,
    },
}

impl AlertEvent {
    /// Whether this event is operational rather than a content change.
    pub fn is_diagnostic(&self) -> bool {
        !matches!(self, AlertEvent::ChangeDetected { .. })
    }
}

/// A queued outbound notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub chat_id: i64,
    pub timestamp: DateTime<Utc>,
    pub event: AlertEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().expect("timestamp")
    }

    #[test]
    fn database_flattens_users_beside_schema_version() {
        let mut db = Database::empty();
        db.user_mut(42);
        let json = serde_json::to_value(&db).expect("serialize");
        assert_eq!(json["schema_version"], "2.0");
        assert!(json.get("42").is_some());
        assert!(json.get("users").is_none());
    }

    #[test]
    fn database_roundtrips() {
        let mut db = Database::empty();
        let user = db.user_mut(7);
        user.monitors.push(Monitor::new(
            "https://example.com/page".into(),
            "https://example.com/page".into(),
            t("2026-01-01T00:00:00Z"),
        ));

        let json = serde_json::to_string(&db).expect("serialize");
        let back: Database = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.monitor_count(), 1);
        assert_eq!(
            back.user(7).expect("user").monitors[0].url,
            "https://example.com/page"
        );
    }

    #[test]
    fn user_config_defaults_match_system_defaults() {
        let config = UserConfig::default();
        assert_eq!(config.similarity_threshold, 0.85);
        assert_eq!(config.check_interval_seconds, 60);
        assert!(config.include_diff);
        assert!(config.custom_selector.is_none());
    }

    #[test]
    fn clamp_raises_low_threshold_to_floor() {
        let patch = ConfigPatch {
            similarity_threshold: Some(0.0),
            ..Default::default()
        };
        let clamped = patch.clamped().expect("clamp");
        assert_eq!(clamped.similarity_threshold, Some(0.01));

        let patch = ConfigPatch {
            similarity_threshold: Some(-3.0),
            ..Default::default()
        };
        assert_eq!(
            patch.clamped().expect("clamp").similarity_threshold,
            Some(0.01)
        );
    }

    #[test]
    fn clamp_caps_threshold_at_one() {
        let patch = ConfigPatch {
            similarity_threshold: Some(1.5),
            ..Default::default()
        };
        assert_eq!(
            patch.clamped().expect("clamp").similarity_threshold,
            Some(1.0)
        );
    }

    #[test]
    fn clamp_rejects_nan_threshold() {
        let patch = ConfigPatch {
            similarity_threshold: Some(f64::NAN),
            ..Default::default()
        };
        assert!(matches!(
            patch.clamped(),
            Err(WatchError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn clamp_raises_short_interval_to_minimum() {
        let patch = ConfigPatch {
            check_interval_seconds: Some(5),
            ..Default::default()
        };
        assert_eq!(
            patch.clamped().expect("clamp").check_interval_seconds,
            Some(30)
        );
    }

    #[test]
    fn clamp_rejects_out_of_range_interval() {
        let patch = ConfigPatch {
            check_interval_seconds: Some(u64::from(u32::MAX) + 1),
            ..Default::default()
        };
        assert!(matches!(
            patch.clamped(),
            Err(WatchError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn effective_config_resolves_monitor_over_user() {
        let user = UserConfig {
            similarity_threshold: 0.9,
            check_interval_seconds: 120,
            include_diff: true,
            custom_selector: Some("main".into()),
        };
        let monitor = ConfigPatch {
            similarity_threshold: Some(0.5),
            ..Default::default()
        };

        let effective = EffectiveConfig::resolve(&user, Some(&monitor));
        assert_eq!(effective.similarity_threshold, 0.5);
        assert_eq!(effective.check_interval_seconds, 120);
        assert_eq!(effective.custom_selector.as_deref(), Some("main"));
    }

    #[test]
    fn effective_config_falls_back_to_system_defaults() {
        let effective = EffectiveConfig::resolve(&UserConfig::default(), None);
        assert_eq!(effective.similarity_threshold, 0.85);
        assert_eq!(effective.check_interval_seconds, 60);
    }

    #[test]
    fn history_prunes_entries_older_than_retention() {
        let now = t("2026-06-30T00:00:00Z");
        let mut monitor = Monitor::new("u".into(), "u".into(), now);
        monitor.push_history(
            HistoryEntry {
                timestamp: t("2026-05-01T00:00:00Z"),
                change_type: ChangeType::UiTweak,
                similarity_final: 0.8,
                diff_summary: "old".into(),
            },
            now,
        );
        monitor.push_history(
            HistoryEntry {
                timestamp: t("2026-06-20T00:00:00Z"),
                change_type: ChangeType::ContentUpdate,
                similarity_final: 0.5,
                diff_summary: "recent".into(),
            },
            now,
        );

        assert_eq!(monitor.history.len(), 1);
        assert_eq!(monitor.history[0].diff_summary, "recent");
    }

    #[test]
    fn history_stays_sorted_ascending() {
        let now = t("2026-06-30T00:00:00Z");
        let mut monitor = Monitor::new("u".into(), "u".into(), now);
        for ts in ["2026-06-29T00:00:00Z", "2026-06-27T00:00:00Z", "2026-06-28T00:00:00Z"] {
            monitor.push_history(
                HistoryEntry {
                    timestamp: t(ts),
                    change_type: ChangeType::UiTweak,
                    similarity_final: 0.8,
                    diff_summary: ts.into(),
                },
                now,
            );
        }
        let stamps: Vec<_> = monitor.history.iter().map(|e| e.timestamp).collect();
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted);
    }

    #[test]
    fn snapshot_ring_caps_at_three_newest_first() {
        let now = t("2026-06-30T00:00:00Z");
        let mut monitor = Monitor::new("u".into(), "u".into(), now);
        for i in 0..5 {
            monitor.push_snapshot(ForensicSnapshot {
                timestamp: now + chrono::Duration::seconds(i),
                old_content_compressed: String::new(),
                new_content_compressed: String::new(),
                old_structure_signature: String::new(),
                new_structure_signature: String::new(),
                change_type: ChangeType::ContentUpdate,
                similarity_metrics: SimilarityMetrics {
                    jaccard: 0.0,
                    levenshtein_ratio: 0.0,
                    semantic: 0.0,
                    final_score: 0.0,
                },
                diff_summary: format!("change {i}"),
                diff_truncated: false,
            });
        }
        assert_eq!(monitor.forensic_snapshots.len(), 3);
        assert_eq!(monitor.forensic_snapshots[0].diff_summary, "change 4");
        assert_eq!(monitor.forensic_snapshots[2].diff_summary, "change 2");
    }

    #[test]
    fn circuit_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).expect("serialize"),
            "\"half_open\""
        );
    }

    #[test]
    fn alert_event_tags_and_flags() {
        let change = AlertEvent::ChangeDetected {
            url: "https://example.com".into(),
            change_type: ChangeType::MajorOverhaul,
            similarity_final: 0.2,
            safe_diff: None,
        };
        assert!(!change.is_diagnostic());
        let json = serde_json::to_value(&change).expect("serialize");
        assert_eq!(json["event"], "change_detected");
        assert_eq!(json["change_type"], "MAJOR_OVERHAUL");

        let cooldown = AlertEvent::HostCooldown {
            host: "https://example.com".into(),
            retry_after_seconds: 3600,
        };
        assert!(cooldown.is_diagnostic());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn clamped_threshold_always_in_range(t in -10.0f64..10.0) {
                let patch = ConfigPatch {
                    similarity_threshold: Some(t),
                    ..Default::default()
                };
                let clamped = patch.clamped().expect("finite input");
                let value = clamped.similarity_threshold.expect("present");
                prop_assert!((MIN_SIMILARITY_THRESHOLD..=1.0).contains(&value));
            }

            #[test]
            fn clamped_interval_never_below_minimum(secs in 0u64..1_000_000) {
                let patch = ConfigPatch {
                    check_interval_seconds: Some(secs),
                    ..Default::default()
                };
                let clamped = patch.clamped().expect("in range");
                prop_assert!(clamped.check_interval_seconds.expect("present") >= 30);
            }
        }
    }
}
