//! The patrol engine: the periodic driver behind every check.
//!
//! Each cycle scans a lightweight view of the stored monitors, checks the
//! due ones through the fetch → fingerprint → detect pipeline, submits one
//! coalesced write with everything that changed, and only then hands
//! notifications to the outbound queue: a crash can lose an alert but
//! never the history entry behind one.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinSet;

use sitewatch_governor::LeakyBucket;

use crate::breaker::{BreakerView, COOLDOWN_SECONDS};
use crate::detect;
use crate::fingerprint::{Fingerprinted, fingerprint};
use crate::request::{RequestManager, host_key};
use crate::store::AtomicStore;
use crate::types::{
    AlertEvent, CircuitState, Database, EffectiveConfig, ForensicSnapshot, HistoryEntry, Monitor,
    MonitorStatus, Notification, WeightedFingerprint,
};

/// What one cycle did, for logging and the health snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleReport {
    /// The cycle was skipped because the notification queue was congested.
    pub skipped_congested: bool,
    /// Monitors that were due and checked.
    pub checked: usize,
    /// Checks that ended in a fetch-class failure.
    pub failures: usize,
    /// Meaningful changes detected.
    pub changes: usize,
    /// Notifications enqueued (changes plus diagnostics).
    pub notifications: usize,
}

/// One due monitor, captured from the snapshot before checking.
struct Job {
    chat_key: String,
    chat_id: i64,
    url: String,
    normalized_url: String,
    effective: EffectiveConfig,
    baseline: Option<WeightedFingerprint>,
    prev_breaker_state: CircuitState,
}

/// The write-side outcome of checking one monitor.
struct MonitorUpdate {
    chat_key: String,
    normalized_url: String,
    checked_at: DateTime<Utc>,
    status: MonitorStatus,
    count_check: bool,
    add_failure: bool,
    clear_failures: bool,
    new_fingerprint: Option<WeightedFingerprint>,
    history_entry: Option<HistoryEntry>,
    forensic_snapshot: Option<ForensicSnapshot>,
    breaker: BreakerView,
}

struct CheckResult {
    update: MonitorUpdate,
    chat_id: i64,
    notifications: Vec<AlertEvent>,
}

/// Run one patrol cycle at `now`.
pub async fn run_cycle(
    store: &AtomicStore,
    requests: &RequestManager,
    queue: &LeakyBucket<Notification>,
    now: DateTime<Utc>,
) -> Result<CycleReport> {
    if queue.is_congested() {
        tracing::warn!(depth = queue.depth(), "notification queue congested; skipping cycle");
        return Ok(CycleReport {
            skipped_congested: true,
            ..CycleReport::default()
        });
    }

    let snapshot = store.snapshot();
    let jobs = collect_due(&snapshot, now);
    if jobs.is_empty() {
        return Ok(CycleReport::default());
    }

    let mut set = JoinSet::new();
    for job in jobs {
        let requests = requests.clone();
        set.spawn(async move { check_monitor(&requests, job, now).await });
    }

    let mut updates = Vec::new();
    let mut outbound: Vec<Notification> = Vec::new();
    let mut report = CycleReport::default();
    while let Some(joined) = set.join_next().await {
        let result = joined.context("monitor check task panicked")?;
        report.checked += 1;
        if result.update.add_failure {
            report.failures += 1;
        }
        if result.update.history_entry.is_some() {
            report.changes += 1;
        }
        for event in result.notifications {
            outbound.push(Notification {
                chat_id: result.chat_id,
                timestamp: now,
                event,
            });
        }
        updates.push(result.update);
    }

    // One coalesced write per cycle; history and baselines land atomically.
    store
        .submit_write(move |db| apply_updates(db, updates, now))
        .await
        .context("failed to persist patrol cycle")?;

    // Alerts go out only after their evidence is durable.
    report.notifications = outbound.len();
    for notification in outbound {
        queue
            .enqueue(notification)
            .await
            .context("notification queue closed")?;
    }
    Ok(report)
}

/// Drive [`run_cycle`] forever at `interval`, until `shutdown` fires.
pub(crate) async fn patrol_loop(
    store: Arc<AtomicStore>,
    requests: RequestManager,
    queue: LeakyBucket<Notification>,
    interval: std::time::Duration,
    last_cycle_at: Arc<std::sync::Mutex<Option<DateTime<Utc>>>>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = Utc::now();
                match run_cycle(&store, &requests, &queue, now).await {
                    Ok(report) if report.skipped_congested => {}
                    Ok(report) => {
                        *last_cycle_at.lock().expect("last cycle mutex") = Some(now);
                        if report.checked > 0 {
                            tracing::info!(
                                checked = report.checked,
                                failures = report.failures,
                                changes = report.changes,
                                "patrol cycle complete"
                            );
                        }
                    }
                    Err(err) => tracing::error!(error = %err, "patrol cycle failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("patrol driver stopped");
}

fn collect_due(snapshot: &Database, now: DateTime<Utc>) -> Vec<Job> {
    let mut jobs = Vec::new();
    for (chat_key, user) in &snapshot.users {
        let chat_id = chat_key.parse().unwrap_or(0);
        for monitor in &user.monitors {
            let effective = EffectiveConfig::resolve(&user.user_config, Some(&monitor.config));
            if !is_due(monitor, effective.check_interval_seconds, now) {
                continue;
            }
            jobs.push(Job {
                chat_key: chat_key.clone(),
                chat_id,
                url: monitor.url.clone(),
                normalized_url: monitor.normalized_url.clone(),
                effective,
                baseline: monitor.fingerprint.clone(),
                prev_breaker_state: monitor.metadata.circuit_breaker_state,
            });
        }
    }
    jobs
}

fn is_due(monitor: &Monitor, interval_seconds: u64, now: DateTime<Utc>) -> bool {
    if monitor.metadata.paused {
        return false;
    }
    if let Some(snooze) = monitor.metadata.snooze_until {
        if snooze > now {
            return false;
        }
    }
    // An open breaker inside its cooldown gets skipped without a wasted
    // fast-fail; once the hour lapses the fetch layer will probe.
    if monitor.metadata.circuit_breaker_state == CircuitState::Open {
        if let Some(opened) = monitor.metadata.circuit_opened_at {
            if now - opened < Duration::seconds(COOLDOWN_SECONDS) {
                return false;
            }
        }
    }
    match monitor.metadata.last_check_at {
        None => true,
        Some(last) => last + Duration::seconds(interval_seconds as i64) <= now,
    }
}

async fn check_monitor(requests: &RequestManager, job: Job, now: DateTime<Utc>) -> CheckResult {
    let host = host_key(&job.normalized_url).unwrap_or_else(|| job.normalized_url.clone());
    let mut update = MonitorUpdate {
        chat_key: job.chat_key,
        normalized_url: job.normalized_url.clone(),
        checked_at: now,
        status: MonitorStatus::Pending,
        count_check: false,
        add_failure: false,
        clear_failures: false,
        new_fingerprint: None,
        history_entry: None,
        forensic_snapshot: None,
        breaker: requests.breaker_view(&host),
    };
    let mut notifications = Vec::new();

    match requests.fetch(&job.normalized_url).await {
        Err(err) => {
            update.status = err.monitor_status();
            update.add_failure = err.counts_as_monitor_failure();
            tracing::debug!(url = %job.normalized_url, error = %err, "check failed");
        }
        Ok(success) => match fingerprint(&success.body, job.effective.custom_selector.as_deref()) {
            Fingerprinted::BlockPage => {
                requests.note_block_page(&job.normalized_url);
                update.status = MonitorStatus::BlockPage;
                update.add_failure = true;
                tracing::debug!(url = %job.normalized_url, "block page; baseline untouched");
            }
            Fingerprinted::Page(new_fp) => {
                requests.confirm_content(&job.normalized_url);
                update.status = MonitorStatus::Ok;
                update.count_check = true;
                update.clear_failures = true;

                match &job.baseline {
                    // First successful fetch: set the baseline, no alert.
                    None => update.new_fingerprint = Some(new_fp),
                    // Algorithm version changed underneath this monitor:
                    // silently reset the baseline, never alert.
                    Some(old) if old.version != new_fp.version => {
                        tracing::info!(url = %job.normalized_url, "fingerprint version changed; baseline reset");
                        update.new_fingerprint = Some(new_fp);
                    }
                    Some(old) => {
                        let detection =
                            detect::detect(old, &new_fp, job.effective.similarity_threshold);
                        if let Some(change) = detection.change {
                            match detect::build_snapshot(
                                old,
                                &new_fp,
                                change.change_type,
                                detection.metrics,
                                &change.safe_diff,
                                now,
                            ) {
                                Ok(snapshot) => update.forensic_snapshot = Some(snapshot),
                                Err(err) => {
                                    tracing::warn!(error = %err, "forensic snapshot failed")
                                }
                            }
                            update.history_entry = Some(HistoryEntry {
                                timestamp: now,
                                change_type: change.change_type,
                                similarity_final: detection.metrics.final_score,
                                diff_summary: change.safe_diff.summary(),
                            });
                            notifications.push(AlertEvent::ChangeDetected {
                                url: job.url.clone(),
                                change_type: change.change_type,
                                similarity_final: detection.metrics.final_score,
                                safe_diff: job
                                    .effective
                                    .include_diff
                                    .then(|| change.safe_diff.text.clone()),
                            });
                            update.new_fingerprint = Some(new_fp);
                        }
                    }
                }
            }
        },
    }

    update.breaker = requests.breaker_view(&host);

    // First transition into OPEN tells the owner their monitor is failing.
    if update.breaker.state == CircuitState::Open
        && job.prev_breaker_state != CircuitState::Open
    {
        notifications.push(AlertEvent::Diagnostic {
            url: Some(job.url.clone()),
            message: format!(
                "{} consecutive failures; pausing checks of {host} for an hour",
                update.breaker.consecutive_failures
            ),
        });
    }

    CheckResult {
        update,
        chat_id: job.chat_id,
        notifications,
    }
}

fn apply_updates(db: &mut Database, updates: Vec<MonitorUpdate>, now: DateTime<Utc>) {
    for update in updates {
        let Some(user) = db.users.get_mut(&update.chat_key) else {
            continue;
        };
        // The monitor may have been removed while its check was in flight.
        let Some(monitor) = user.monitor_mut(&update.normalized_url) else {
            continue;
        };
        monitor.metadata.last_check_at = Some(update.checked_at);
        monitor.metadata.last_status = update.status;
        if update.count_check {
            monitor.metadata.check_count += 1;
        }
        if update.add_failure {
            monitor.metadata.consecutive_failures += 1;
        }
        if update.clear_failures {
            monitor.metadata.consecutive_failures = 0;
        }
        monitor.metadata.circuit_breaker_state = update.breaker.state;
        monitor.metadata.circuit_opened_at = update.breaker.opened_at;
        if let Some(fp) = update.new_fingerprint {
            monitor.fingerprint = Some(fp);
        }
        if let Some(entry) = update.history_entry {
            monitor.push_history(entry, now);
        }
        if let Some(snapshot) = update.forensic_snapshot {
            monitor.push_snapshot(snapshot);
        }
    }
}
