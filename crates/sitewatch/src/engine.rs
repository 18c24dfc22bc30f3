//! Engine lifecycle and the chat-facing command surface.
//!
//! [`Engine`] owns every long-lived component (the atomic store, the
//! request manager with its breaker registry and governor, and the
//! notification queue) behind a single `start()`/`stop()` lifecycle.
//! The chat layer calls the command methods here and receives outbound
//! events through its [`Notifier`] implementation; nothing else crosses
//! the boundary.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use sitewatch_governor::{
    LeakyBucket, NOTIFICATION_QUEUE_CAPACITY, NOTIFICATIONS_PER_SECOND, spawn_drainer,
};

use crate::breaker::BreakerCounts;
use crate::error::WatchError;
use crate::patrol;
use crate::request::{CooldownEvent, RequestManager, RequestOptions, host_key, normalize_url};
use crate::store::AtomicStore;
use crate::types::{
    AlertEvent, ConfigPatch, EffectiveConfig, HistoryEntry, Monitor, MonitorStatus, Notification,
    UserRecord,
};

/// Monitors shown per `list_monitors` page.
pub const PAGE_SIZE: usize = 10;

/// Outbound boundary: the chat layer's message sink.
///
/// Delivery is paced by the engine at 25 messages/second; the implementor
/// only has to honour its own platform cap.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, chat_id: i64, event: &AlertEvent);
}

/// Engine construction knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the persistence file.
    pub db_path: PathBuf,
    /// How often the patrol driver wakes.
    pub patrol_interval: Duration,
    /// Recipient of administrative diagnostics, when configured.
    pub admin_chat_id: Option<i64>,
    pub request: RequestOptions,
}

impl EngineConfig {
    /// Defaults for the given database path.
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            patrol_interval: Duration::from_secs(60),
            admin_chat_id: None,
            request: RequestOptions::default(),
        }
    }
}

/// Supported snooze windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnoozeDuration {
    OneHour,
    SixHours,
    OneDay,
}

impl SnoozeDuration {
    fn as_chrono(self) -> chrono::Duration {
        match self {
            SnoozeDuration::OneHour => chrono::Duration::hours(1),
            SnoozeDuration::SixHours => chrono::Duration::hours(6),
            SnoozeDuration::OneDay => chrono::Duration::hours(24),
        }
    }
}

impl std::str::FromStr for SnoozeDuration {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(SnoozeDuration::OneHour),
            "6h" => Ok(SnoozeDuration::SixHours),
            "24h" => Ok(SnoozeDuration::OneDay),
            other => Err(WatchError::ConfigInvalid(format!(
                "snooze duration must be 1h, 6h, or 24h, got {other}"
            ))),
        }
    }
}

/// Export renderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl std::str::FromStr for ExportFormat {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(WatchError::ConfigInvalid(format!(
                "export format must be json or csv, got {other}"
            ))),
        }
    }
}

/// One row of a `list_monitors` page.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSummary {
    pub url: String,
    pub normalized_url: String,
    pub last_status: MonitorStatus,
    pub last_check_at: Option<DateTime<Utc>>,
    pub check_count: u64,
    pub consecutive_failures: u32,
    pub snooze_until: Option<DateTime<Utc>>,
    pub paused: bool,
    pub history_entries: usize,
}

/// A page of monitor summaries.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorPage {
    pub page: usize,
    pub total_pages: usize,
    pub total_monitors: usize,
    pub items: Vec<MonitorSummary>,
}

/// Operational metrics for the `health` command.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub users: usize,
    pub monitors: usize,
    pub notification_queue_depth: usize,
    pub congested: bool,
    pub breakers: BreakerCounts,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

struct RunningTasks {
    patrol: JoinHandle<()>,
    drainer: JoinHandle<()>,
    cooldowns: JoinHandle<()>,
}

/// The root engine value.
pub struct Engine {
    config: EngineConfig,
    store: Arc<AtomicStore>,
    requests: RequestManager,
    queue: LeakyBucket<Notification>,
    notifier: Arc<dyn Notifier>,
    last_cycle_at: Arc<Mutex<Option<DateTime<Utc>>>>,
    shutdown_tx: watch::Sender<bool>,
    queue_rx: Mutex<Option<mpsc::Receiver<Notification>>>,
    cooldown_rx: Mutex<Option<mpsc::UnboundedReceiver<CooldownEvent>>>,
    tasks: Mutex<Option<RunningTasks>>,
}

impl Engine {
    /// Load state, rebuild per-host breakers from persisted metadata, and
    /// wire the components together. Call [`Engine::start`] to begin
    /// patrolling. Must run within a tokio runtime.
    pub fn open(config: EngineConfig, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let store = Arc::new(
            AtomicStore::open(config.db_path.clone())
                .with_context(|| format!("failed to open database {}", config.db_path.display()))?,
        );
        let (requests, cooldown_rx) =
            RequestManager::new(config.request.clone()).context("failed to build fetch layer")?;

        let snapshot = store.snapshot();
        for user in snapshot.users.values() {
            for monitor in &user.monitors {
                if let Some(host) = host_key(&monitor.normalized_url) {
                    requests.restore_breaker(
                        &host,
                        monitor.metadata.circuit_breaker_state,
                        monitor.metadata.consecutive_failures,
                        monitor.metadata.circuit_opened_at,
                    );
                }
            }
        }

        let (queue, queue_rx) = LeakyBucket::new(NOTIFICATION_QUEUE_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            store,
            requests,
            queue,
            notifier,
            last_cycle_at: Arc::new(Mutex::new(None)),
            shutdown_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            cooldown_rx: Mutex::new(Some(cooldown_rx)),
            tasks: Mutex::new(None),
        })
    }

    /// Spawn the long-lived tasks: notification drainer, patrol driver,
    /// and cooldown forwarder. Idempotent after the first call.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().expect("tasks mutex");
        if tasks.is_some() {
            return;
        }
        let queue_rx = match self.queue_rx.lock().expect("queue rx mutex").take() {
            Some(rx) => rx,
            None => return,
        };
        let cooldown_rx = match self.cooldown_rx.lock().expect("cooldown rx mutex").take() {
            Some(rx) => rx,
            None => return,
        };

        let notifier = Arc::clone(&self.notifier);
        let drainer = spawn_drainer(queue_rx, NOTIFICATIONS_PER_SECOND, move |n: Notification| {
            let notifier = Arc::clone(&notifier);
            async move {
                notifier.deliver(n.chat_id, &n.event).await;
            }
        });

        let patrol = tokio::spawn(patrol::patrol_loop(
            Arc::clone(&self.store),
            self.requests.clone(),
            self.queue.clone(),
            self.config.patrol_interval,
            Arc::clone(&self.last_cycle_at),
            self.shutdown_tx.subscribe(),
        ));

        let cooldowns = tokio::spawn(forward_cooldowns(
            Arc::clone(&self.store),
            self.queue.clone(),
            cooldown_rx,
            self.config.admin_chat_id,
        ));

        *tasks = Some(RunningTasks {
            patrol,
            drainer,
            cooldowns,
        });
        tracing::info!(db = %self.config.db_path.display(), "engine started");
    }

    /// Ordered shutdown: stop the patrol driver, cancel in-flight fetches,
    /// stop the drainer, then drain the write queue.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        let tasks = self.tasks.lock().expect("tasks mutex").take();
        if let Some(tasks) = tasks {
            tasks.patrol.await.ok();
            self.requests.close();
            tasks.cooldowns.abort();
            tasks.drainer.abort();
        }
        self.store.close().await.context("failed to close store")?;
        tracing::info!("engine stopped");
        Ok(())
    }

    // -- Commander surface ---------------------------------------------------

    /// Register a URL for `chat_id`. Re-adding a paused monitor resumes it;
    /// re-adding an active one is rejected.
    pub async fn add_monitor(&self, chat_id: i64, url: &str) -> Result<()> {
        let normalized = normalize_url(url)?;
        let original = url.trim().to_string();
        let rejected = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&rejected);
        let norm = normalized.clone();
        self.store
            .submit_write(move |db| {
                let user = db.user_mut(chat_id);
                match user.monitors.iter().position(|m| m.normalized_url == norm) {
                    Some(index) => {
                        let existing = &mut user.monitors[index];
                        if existing.metadata.paused {
                            existing.metadata.paused = false;
                            existing.metadata.snooze_until = None;
                        } else {
                            flag.store(true, Ordering::SeqCst);
                        }
                    }
                    None => user
                        .monitors
                        .push(Monitor::new(original, norm.clone(), Utc::now())),
                }
            })
            .await?;

        if rejected.load(Ordering::SeqCst) {
            return Err(WatchError::ConfigInvalid(format!(
                "{normalized} is already monitored"
            ))
            .into());
        }
        tracing::info!(chat_id, url = %normalized, "monitor added");
        Ok(())
    }

    /// A page of the user's monitors (10 per page, zero-indexed).
    pub fn list_monitors(&self, chat_id: i64, page: usize) -> MonitorPage {
        let snapshot = self.store.snapshot();
        let monitors = snapshot
            .user(chat_id)
            .map(|u| u.monitors.as_slice())
            .unwrap_or_default();
        let total_monitors = monitors.len();
        let total_pages = total_monitors.div_ceil(PAGE_SIZE).max(1);
        let items = monitors
            .iter()
            .skip(page * PAGE_SIZE)
            .take(PAGE_SIZE)
            .map(|m| MonitorSummary {
                url: m.url.clone(),
                normalized_url: m.normalized_url.clone(),
                last_status: m.metadata.last_status,
                last_check_at: m.metadata.last_check_at,
                check_count: m.metadata.check_count,
                consecutive_failures: m.metadata.consecutive_failures,
                snooze_until: m.metadata.snooze_until,
                paused: m.metadata.paused,
                history_entries: m.history.len(),
            })
            .collect();
        MonitorPage {
            page,
            total_pages,
            total_monitors,
            items,
        }
    }

    /// Delete a monitor and all of its history and evidence.
    pub async fn remove_monitor(&self, chat_id: i64, url: &str) -> Result<()> {
        let normalized = normalize_url(url)?;
        self.mutate_monitor_list(chat_id, normalized, |user, norm| {
            let before = user.monitors.len();
            user.monitors.retain(|m| m.normalized_url != norm);
            user.monitors.len() != before
        })
        .await
    }

    /// Pause checks of a monitor until the window lapses.
    pub async fn snooze(&self, chat_id: i64, url: &str, duration: SnoozeDuration) -> Result<()> {
        let until = Utc::now() + duration.as_chrono();
        self.mutate_monitor(chat_id, url, move |monitor| {
            monitor.metadata.snooze_until = Some(until);
        })
        .await
    }

    /// Pause a monitor indefinitely, keeping its state and history.
    pub async fn stop_watching(&self, chat_id: i64, url: &str) -> Result<()> {
        self.mutate_monitor(chat_id, url, |monitor| {
            monitor.metadata.paused = true;
            monitor.metadata.snooze_until = None;
        })
        .await
    }

    /// The effective configuration: the monitor's when `url` is given,
    /// otherwise the user's defaults.
    pub fn get_config(&self, chat_id: i64, url: Option<&str>) -> Result<EffectiveConfig> {
        let snapshot = self.store.snapshot();
        let user = snapshot.user(chat_id);
        let user_config = user.map(|u| u.user_config.clone()).unwrap_or_default();
        match url {
            None => Ok(EffectiveConfig::resolve(&user_config, None)),
            Some(url) => {
                let normalized = normalize_url(url)?;
                let monitor = user
                    .and_then(|u| u.monitor(&normalized))
                    .ok_or_else(|| not_monitored(&normalized))?;
                Ok(EffectiveConfig::resolve(&user_config, Some(&monitor.config)))
            }
        }
    }

    /// Apply a validated, clamped configuration patch to the user defaults
    /// (`url` = None) or to one monitor's override.
    pub async fn set_config(
        &self,
        chat_id: i64,
        url: Option<&str>,
        patch: ConfigPatch,
    ) -> Result<()> {
        let patch = patch.clamped()?;
        if let Some(selector) = patch.custom_selector.as_deref() {
            if scraper::Selector::parse(selector).is_err() {
                return Err(WatchError::ConfigInvalid(format!(
                    "invalid CSS selector: {selector}"
                ))
                .into());
            }
        }

        match url {
            None => {
                self.store
                    .submit_write(move |db| {
                        let config = &mut db.user_mut(chat_id).user_config;
                        if let Some(threshold) = patch.similarity_threshold {
                            config.similarity_threshold = threshold;
                        }
                        if let Some(interval) = patch.check_interval_seconds {
                            config.check_interval_seconds = interval;
                        }
                        if let Some(include_diff) = patch.include_diff {
                            config.include_diff = include_diff;
                        }
                        if patch.custom_selector.is_some() {
                            config.custom_selector = patch.custom_selector.clone();
                        }
                    })
                    .await
            }
            Some(url) => {
                self.mutate_monitor(chat_id, url, move |monitor| {
                    monitor.config.apply(&patch);
                })
                .await
            }
        }
    }

    /// The change history of one monitor, ascending by time.
    pub fn get_history(&self, chat_id: i64, url: &str) -> Result<Vec<HistoryEntry>> {
        let normalized = normalize_url(url)?;
        let snapshot = self.store.snapshot();
        let monitor = snapshot
            .user(chat_id)
            .and_then(|u| u.monitor(&normalized))
            .ok_or_else(|| not_monitored(&normalized))?;
        Ok(monitor.history.clone())
    }

    /// Render the user's whole record as a portable blob.
    pub fn export(&self, chat_id: i64, format: ExportFormat) -> Result<String> {
        let snapshot = self.store.snapshot();
        let user = snapshot
            .user(chat_id)
            .cloned()
            .unwrap_or_default();
        match format {
            ExportFormat::Json => {
                serde_json::to_string_pretty(&user).context("failed to render export JSON")
            }
            ExportFormat::Csv => Ok(render_csv(&user)),
        }
    }

    /// Operational metrics snapshot.
    pub fn health(&self) -> HealthSnapshot {
        let snapshot = self.store.snapshot();
        HealthSnapshot {
            users: snapshot.users.len(),
            monitors: snapshot.monitor_count(),
            notification_queue_depth: self.queue.depth(),
            congested: self.queue.is_congested(),
            breakers: self.requests.breaker_counts(),
            last_cycle_at: *self.last_cycle_at.lock().expect("last cycle mutex"),
        }
    }

    // -- internals -----------------------------------------------------------

    async fn mutate_monitor<F>(&self, chat_id: i64, url: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Monitor) + Send + 'static,
    {
        let normalized = normalize_url(url)?;
        let found = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&found);
        let norm = normalized.clone();
        self.store
            .submit_write(move |db| {
                if let Some(monitor) = db.user_mut(chat_id).monitor_mut(&norm) {
                    flag.store(true, Ordering::SeqCst);
                    mutate(monitor);
                }
            })
            .await?;
        if found.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(not_monitored(&normalized).into())
        }
    }

    async fn mutate_monitor_list<F>(&self, chat_id: i64, normalized: String, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut UserRecord, &str) -> bool + Send + 'static,
    {
        let found = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&found);
        let norm = normalized.clone();
        self.store
            .submit_write(move |db| {
                if mutate(db.user_mut(chat_id), &norm) {
                    flag.store(true, Ordering::SeqCst);
                }
            })
            .await?;
        if found.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(not_monitored(&normalized).into())
        }
    }
}

fn not_monitored(normalized: &str) -> WatchError {
    WatchError::ConfigInvalid(format!("{normalized} is not monitored"))
}

/// Forward breaker cooldown events to every user watching the host (and
/// the admin, when configured).
async fn forward_cooldowns(
    store: Arc<AtomicStore>,
    queue: LeakyBucket<Notification>,
    mut rx: mpsc::UnboundedReceiver<CooldownEvent>,
    admin_chat_id: Option<i64>,
) {
    while let Some(event) = rx.recv().await {
        let snapshot = store.snapshot();
        let mut recipients: Vec<i64> = snapshot
            .users
            .iter()
            .filter(|(_, user)| {
                user.monitors
                    .iter()
                    .any(|m| host_key(&m.normalized_url).as_deref() == Some(event.host.as_str()))
            })
            .filter_map(|(chat_key, _)| chat_key.parse().ok())
            .collect();
        if let Some(admin) = admin_chat_id {
            if !recipients.contains(&admin) {
                recipients.push(admin);
            }
        }
        for chat_id in recipients {
            let notification = Notification {
                chat_id,
                timestamp: Utc::now(),
                event: AlertEvent::HostCooldown {
                    host: event.host.clone(),
                    retry_after_seconds: event.retry_after_seconds,
                },
            };
            if queue.enqueue(notification).await.is_err() {
                return;
            }
        }
    }
}

fn render_csv(user: &UserRecord) -> String {
    let mut out = String::from(
        "url,created_at,last_check_at,check_count,consecutive_failures,last_status,history_entries\n",
    );
    for monitor in &user.monitors {
        let last_check = monitor
            .metadata
            .last_check_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let status = serde_json::to_value(monitor.metadata.last_status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        out.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            csv_field(&monitor.url),
            monitor.metadata.created_at.to_rfc3339(),
            last_check,
            monitor.metadata.check_count,
            monitor.metadata.consecutive_failures,
            status,
            monitor.history.len(),
        ));
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
