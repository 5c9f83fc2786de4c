pub mod jobs;
pub mod queue;

use crate::config::SettingsHandle;
use crate::error::{EngineError, Result};
use crate::frames::FrameAggregator;
use crate::ingest::LiveIngestLoop;
use crate::metrics::Counters;
use crate::shared::types::JobRow;
use crate::store::TickStore;
use crate::upstream::UpstreamClient;
use chrono::{DateTime, Utc};
use self::queue::{JobMessage, QueueName, WorkQueue, WorkQueueConsumer};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

const RUN_HISTORY: usize = 256;
const RETRY_BASE: Duration = Duration::from_secs(5);
const RETRY_CAP: Duration = Duration::from_secs(300);

/// A job's firing rule: a cron expression or a fixed interval.
#[derive(Debug, Clone)]
pub enum Schedule {
    Cron(cron::Schedule),
    Every(Duration),
}

impl Schedule {
    pub fn parse(kind: &str, spec: &str) -> Result<Self> {
        match kind {
            "cron" => cron::Schedule::from_str(spec)
                .map(Schedule::Cron)
                .map_err(|e| EngineError::Schedule {
                    spec: spec.to_string(),
                    cause: e.to_string(),
                }),
            "interval" => parse_interval(spec).map(Schedule::Every),
            other => Err(EngineError::Schedule {
                spec: spec.to_string(),
                cause: format!("unknown schedule kind '{other}'"),
            }),
        }
    }

    /// Whether the job should fire now, given when it last fired.
    pub fn is_due(&self, last_fire: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Schedule::Every(every) => {
                (now - last_fire).to_std().map_or(false, |gap| gap >= *every)
            }
            Schedule::Cron(schedule) => schedule
                .after(&last_fire)
                .next()
                .map_or(false, |next| next <= now),
        }
    }
}

/// "30s", "5m", "2h" or plain seconds.
fn parse_interval(spec: &str) -> Result<Duration> {
    let spec = spec.trim();
    let err = || EngineError::Schedule {
        spec: spec.to_string(),
        cause: "expected <number>[s|m|h]".into(),
    };
    let (digits, unit) = match spec.chars().last() {
        Some(c) if c.is_ascii_digit() => (spec, 1u64),
        Some('s') => (&spec[..spec.len() - 1], 1),
        Some('m') => (&spec[..spec.len() - 1], 60),
        Some('h') => (&spec[..spec.len() - 1], 3600),
        _ => return Err(err()),
    };
    let n: u64 = digits.parse().map_err(|_| err())?;
    if n == 0 {
        return Err(err());
    }
    Ok(Duration::from_secs(n * unit))
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub row: JobRow,
    pub schedule: Schedule,
    pub queue: QueueName,
}

impl JobSpec {
    pub fn from_row(row: JobRow) -> Result<Self> {
        let schedule = Schedule::parse(&row.kind, &row.spec)?;
        let queue = QueueName::parse(&row.queue).ok_or_else(|| EngineError::Schedule {
            spec: row.queue.clone(),
            cause: "unknown queue".into(),
        })?;
        Ok(Self { row, schedule, queue })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// One run of one job, kept in a bounded in-memory history for the operator
/// surface.
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub run_id: Uuid,
    pub job: String,
    pub attempt: u32,
    pub state: RunState,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Everything a job body may touch.
#[derive(Clone)]
pub struct JobContext {
    pub upstream: Arc<UpstreamClient>,
    pub store: Arc<TickStore>,
    pub ingest: Arc<LiveIngestLoop>,
    pub frames: Arc<FrameAggregator>,
    pub settings: SettingsHandle,
}

/// The default job catalog, seeded into the `job` table on first start.
/// Operator edits to the table win on subsequent starts.
pub fn default_catalog() -> Vec<JobRow> {
    let row = |name: &str, kind: &str, spec: &str, queue: &str, soft: i32, hard: i32, retries: i32| JobRow {
        name: name.into(),
        kind: kind.into(),
        spec: spec.into(),
        queue: queue.into(),
        priority: 0,
        enabled: true,
        soft_limit_secs: soft,
        hard_limit_secs: hard,
        retries,
    };
    vec![
        row("fixture_poll", "cron", "0 0 */6 * * *", "fixtures", 120, 300, 2),
        row("live_trigger", "interval", "30s", "live", 20, 25, 0),
        row("prematch_snapshot", "cron", "0 0 */2 * * *", "prematch", 300, 600, 2),
        row("frame_maker", "interval", "60s", "frames", 30, 55, 0),
        row("finalizer", "interval", "5m", "finalizer", 60, 120, 1),
        row("weekly_refresh", "cron", "0 0 2 * * SUN", "maintenance", 600, 1200, 1),
        row("retention_maintenance", "cron", "0 0 3 * * *", "maintenance", 600, 1800, 1),
    ]
}

/// Single source of truth for what runs when. Owns the catalog, the typed
/// queues and the per-queue worker pools.
pub struct Scheduler {
    ctx: JobContext,
    counters: Arc<Counters>,
    catalog: RwLock<HashMap<String, JobSpec>>,
    last_fire: Mutex<HashMap<String, DateTime<Utc>>>,
    queues: HashMap<QueueName, WorkQueue>,
    runs: Mutex<VecDeque<JobRun>>,
}

impl Scheduler {
    pub fn new(ctx: JobContext, counters: Arc<Counters>) -> (Arc<Self>, Vec<WorkQueueConsumer>) {
        let mut queues = HashMap::new();
        let mut consumers = Vec::new();
        for name in QueueName::ALL {
            let (queue, consumer) = WorkQueue::bounded(name);
            queues.insert(name, queue);
            consumers.push(consumer);
        }
        let scheduler = Arc::new(Self {
            ctx,
            counters,
            catalog: RwLock::new(HashMap::new()),
            last_fire: Mutex::new(HashMap::new()),
            queues,
            runs: Mutex::new(VecDeque::with_capacity(RUN_HISTORY)),
        });
        (scheduler, consumers)
    }

    /// Seed missing catalog rows, then load the (possibly operator-edited)
    /// table into memory.
    pub async fn load_catalog(&self) -> Result<()> {
        for row in default_catalog() {
            self.ctx.store.seed_job(&row).await?;
        }
        let rows = self.ctx.store.load_jobs().await?;
        let mut catalog = self.catalog.write().unwrap();
        catalog.clear();
        for row in rows {
            match JobSpec::from_row(row.clone()) {
                Ok(spec) => {
                    catalog.insert(row.name.clone(), spec);
                }
                Err(e) => warn!("job '{}' skipped: {}", row.name, e),
            }
        }
        info!("job catalog loaded ({} jobs)", catalog.len());
        Ok(())
    }

    /// Apply an operator edit; takes effect at the next dispatcher tick.
    pub fn apply_row(&self, row: JobRow) -> Result<()> {
        let spec = JobSpec::from_row(row.clone())?;
        self.catalog.write().unwrap().insert(row.name, spec);
        Ok(())
    }

    pub fn jobs(&self) -> Vec<JobRow> {
        let mut rows: Vec<JobRow> = self
            .catalog
            .read()
            .unwrap()
            .values()
            .map(|spec| spec.row.clone())
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    pub fn recent_runs(&self) -> Vec<JobRun> {
        self.runs.lock().unwrap().iter().cloned().collect()
    }

    pub fn queue_depths(&self) -> Vec<(&'static str, usize)> {
        QueueName::ALL
            .iter()
            .map(|name| (name.as_str(), self.queues[name].depth()))
            .collect()
    }

    /// 1 s dispatcher tick; enable/cadence edits take effect within one
    /// tick, and disabled jobs accumulate no backlog.
    pub async fn run_dispatcher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("dispatcher running");
        loop {
            tokio::select! {
                _ = tick.tick() => self.dispatch_due(Utc::now()),
                _ = shutdown.changed() => {
                    info!("dispatcher stopping");
                    break;
                }
            }
        }
    }

    fn dispatch_due(&self, now: DateTime<Utc>) {
        let due: Vec<JobSpec> = {
            let catalog = self.catalog.read().unwrap();
            let mut last_fire = self.last_fire.lock().unwrap();
            catalog
                .values()
                .filter(|spec| spec.row.enabled)
                .filter(|spec| {
                    // First sighting arms the schedule; it fires on the next
                    // due boundary, not immediately.
                    let last = *last_fire
                        .entry(spec.row.name.clone())
                        .or_insert(now);
                    if spec.schedule.is_due(last, now) {
                        last_fire.insert(spec.row.name.clone(), now);
                        true
                    } else {
                        false
                    }
                })
                .cloned()
                .collect()
        };

        for spec in due {
            self.enqueue_run(&spec, 0);
        }
    }

    fn enqueue_run(&self, spec: &JobSpec, attempt: u32) {
        let run = JobRun {
            run_id: Uuid::new_v4(),
            job: spec.row.name.clone(),
            attempt,
            state: RunState::Pending,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        };
        let message = JobMessage {
            run_id: run.run_id,
            job_name: spec.row.name.clone(),
            attempt,
            enqueued_at: Instant::now(),
            ttl: spec.queue.settings().ttl,
            soft_limit: Duration::from_secs(spec.row.soft_limit_secs.max(1) as u64),
            hard_limit: Duration::from_secs(spec.row.hard_limit_secs.max(1) as u64),
            max_retries: spec.row.retries.max(0) as u32,
        };
        self.record_run(run);
        Counters::bump(&self.counters.jobs_dispatched);
        if let Err(e) = self.queues[&spec.queue].enqueue(message) {
            Counters::bump(&self.counters.queue_dropped_full);
            Counters::bump(&self.counters.jobs_cancelled);
            self.finish_run(
                // The run we just recorded is the newest entry.
                |run| run.state == RunState::Pending && run.job == spec.row.name,
                RunState::Cancelled,
                Some(e.to_string()),
            );
            warn!("job '{}' dropped: {}", spec.row.name, e);
        }
    }

    /// Spawn one worker pool per queue. Each pool bounds its concurrency
    /// with a semaphore and stops consuming on shutdown.
    pub fn spawn_workers(
        self: &Arc<Self>,
        consumers: Vec<WorkQueueConsumer>,
        shutdown: watch::Receiver<bool>,
    ) {
        for mut consumer in consumers {
            let scheduler = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let pool = Arc::new(Semaphore::new(consumer.concurrency.max(1)));
                loop {
                    tokio::select! {
                        message = consumer.recv() => {
                            let Some(message) = message else { break };
                            let permit = match pool.clone().acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => break,
                            };
                            let scheduler = Arc::clone(&scheduler);
                            tokio::spawn(async move {
                                scheduler.run_message(message).await;
                                drop(permit);
                            });
                        }
                        _ = shutdown.changed() => {
                            debug!("worker pool for {} stopping", consumer.name.as_str());
                            break;
                        }
                    }
                }
            });
        }
    }

    async fn run_message(self: Arc<Self>, message: JobMessage) {
        if message.expired() {
            Counters::bump(&self.counters.queue_dropped_ttl);
            Counters::bump(&self.counters.jobs_cancelled);
            self.finish_run(
                |run| run.run_id == message.run_id,
                RunState::Cancelled,
                Some("ttl expired".into()),
            );
            return;
        }

        self.update_run(message.run_id, |run| {
            run.state = RunState::Running;
            run.started_at = Some(Utc::now());
        });

        let started = Instant::now();
        let outcome =
            tokio::time::timeout(message.hard_limit, jobs::execute(&self.ctx, &message.job_name))
                .await;
        let elapsed = started.elapsed();
        if elapsed > message.soft_limit {
            warn!(
                "job '{}' exceeded its soft limit ({:?} > {:?})",
                message.job_name, elapsed, message.soft_limit
            );
        }

        match outcome {
            Ok(Ok(())) => {
                Counters::bump(&self.counters.jobs_succeeded);
                self.finish_run(|run| run.run_id == message.run_id, RunState::Succeeded, None);
            }
            Ok(Err(e)) => {
                Counters::bump(&self.counters.jobs_failed);
                self.finish_run(
                    |run| run.run_id == message.run_id,
                    RunState::Failed,
                    Some(e.to_string()),
                );
                self.maybe_retry(&message);
            }
            Err(_) => {
                Counters::bump(&self.counters.jobs_timed_out);
                self.finish_run(
                    |run| run.run_id == message.run_id,
                    RunState::TimedOut,
                    Some(format!("hard limit {:?} expired", message.hard_limit)),
                );
                self.maybe_retry(&message);
            }
        }
    }

    /// Schedule a new PENDING run with exponential backoff.
    fn maybe_retry(self: &Arc<Self>, message: &JobMessage) {
        if message.attempt >= message.max_retries {
            return;
        }
        let spec = {
            let catalog = self.catalog.read().unwrap();
            match catalog.get(&message.job_name) {
                Some(spec) if spec.row.enabled => spec.clone(),
                _ => return,
            }
        };
        let attempt = message.attempt + 1;
        let backoff = RETRY_CAP.min(RETRY_BASE * 2u32.pow(message.attempt.min(6)));
        let scheduler = Arc::clone(self);
        debug!(
            "job '{}' retry {} scheduled in {:?}",
            message.job_name, attempt, backoff
        );
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            scheduler.enqueue_run(&spec, attempt);
        });
    }

    fn record_run(&self, run: JobRun) {
        let mut runs = self.runs.lock().unwrap();
        if runs.len() == RUN_HISTORY {
            runs.pop_front();
        }
        runs.push_back(run);
    }

    fn update_run(&self, run_id: Uuid, apply: impl FnOnce(&mut JobRun)) {
        let mut runs = self.runs.lock().unwrap();
        if let Some(run) = runs.iter_mut().rev().find(|run| run.run_id == run_id) {
            apply(run);
        }
    }

    fn finish_run(
        &self,
        matcher: impl Fn(&JobRun) -> bool,
        state: RunState,
        error: Option<String>,
    ) {
        let mut runs = self.runs.lock().unwrap();
        if let Some(run) = runs.iter_mut().rev().find(|run| matcher(run)) {
            run.state = state;
            run.finished_at = Some(Utc::now());
            run.error = error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn interval_specs_parse() {
        assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_interval("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_interval("45").unwrap(), Duration::from_secs(45));
        assert!(parse_interval("0s").is_err());
        assert!(parse_interval("fast").is_err());
    }

    #[test]
    fn interval_schedule_due_after_gap() {
        let schedule = Schedule::parse("interval", "30s").unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        assert!(!schedule.is_due(t0, t0 + chrono::Duration::seconds(29)));
        assert!(schedule.is_due(t0, t0 + chrono::Duration::seconds(30)));
    }

    #[test]
    fn cron_schedule_fires_on_boundary() {
        // Daily at 03:00.
        let schedule = Schedule::parse("cron", "0 0 3 * * *").unwrap();
        let last = Utc.with_ymd_and_hms(2026, 8, 1, 3, 0, 0).unwrap();
        assert!(!schedule.is_due(last, Utc.with_ymd_and_hms(2026, 8, 1, 20, 0, 0).unwrap()));
        assert!(schedule.is_due(last, Utc.with_ymd_and_hms(2026, 8, 2, 3, 0, 0).unwrap()));
    }

    #[test]
    fn weekly_cron_parses() {
        let schedule = Schedule::parse("cron", "0 0 2 * * SUN").unwrap();
        let saturday = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        // 2026-08-02 is a Sunday.
        assert!(schedule.is_due(saturday, Utc.with_ymd_and_hms(2026, 8, 2, 2, 0, 0).unwrap()));
        assert!(!schedule.is_due(saturday, Utc.with_ymd_and_hms(2026, 8, 1, 23, 0, 0).unwrap()));
    }

    #[test]
    fn bad_schedules_are_rejected() {
        assert!(Schedule::parse("cron", "not a cron").is_err());
        assert!(Schedule::parse("metronome", "30s").is_err());
    }

    #[test]
    fn default_catalog_rows_all_parse() {
        for row in default_catalog() {
            JobSpec::from_row(row.clone())
                .unwrap_or_else(|e| panic!("catalog row {} failed: {}", row.name, e));
        }
    }

    #[test]
    fn default_catalog_covers_required_jobs() {
        let names: Vec<String> = default_catalog().into_iter().map(|r| r.name).collect();
        for required in [
            "fixture_poll",
            "live_trigger",
            "prematch_snapshot",
            "frame_maker",
            "finalizer",
            "weekly_refresh",
            "retention_maintenance",
        ] {
            assert!(names.iter().any(|n| n == required), "missing {required}");
        }
    }
}
