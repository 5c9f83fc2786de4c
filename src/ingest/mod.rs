use crate::config::{PullIntervals, SettingsHandle};
use crate::error::{EngineError, Result};
use crate::frames::FrameAggregator;
use crate::metrics::{Counters, LagWindow};
use crate::shared::types::{
    ChangeNote, EventTick, Fixture, FixtureStatus, NoteKind, OddsTick, PullKind, StatTick,
};
use crate::store::TickStore;
use crate::upstream::UpstreamClient;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

/// Per-(fixture, kind) pull bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct PullState {
    pub last_pulled: Option<DateTime<Utc>>,
    pub consec_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub in_flight: bool,
}

/// One entry of the trigger's pull plan, ordered by staleness descending.
#[derive(Debug, Clone)]
pub struct PlannedPull {
    pub fixture: Fixture,
    pub kind: PullKind,
    pub staleness_ms: i64,
}

/// Maintains near-real-time currency of ticks for every live fixture,
/// subject to league enablement and the global rate budget. Driven by the
/// `live_trigger` job.
pub struct LiveIngestLoop {
    upstream: Arc<UpstreamClient>,
    store: Arc<TickStore>,
    frames: Arc<FrameAggregator>,
    notes: mpsc::Sender<ChangeNote>,
    pulls: DashMap<(i64, PullKind), PullState>,
    limiter: Arc<Semaphore>,
    settings: SettingsHandle,
    counters: Arc<Counters>,
    pub lag: Arc<LagWindow>,
    consec_fail_limit: u32,
    cooldown: Duration,
}

impl LiveIngestLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        upstream: Arc<UpstreamClient>,
        store: Arc<TickStore>,
        frames: Arc<FrameAggregator>,
        notes: mpsc::Sender<ChangeNote>,
        settings: SettingsHandle,
        counters: Arc<Counters>,
        live_workers: usize,
        consec_fail_limit: u32,
        cooldown: Duration,
    ) -> Self {
        Self {
            upstream,
            store,
            frames,
            notes,
            pulls: DashMap::new(),
            limiter: Arc::new(Semaphore::new(live_workers.max(1))),
            settings,
            counters,
            lag: Arc::new(LagWindow::new(512)),
            consec_fail_limit,
            cooldown,
        }
    }

    /// One trigger cycle: refresh live statuses, compute the due set and
    /// submit pulls to the bounded worker pool. With no live-or-imminent
    /// fixtures this returns immediately and issues zero upstream calls.
    pub async fn run_trigger(self: &Arc<Self>) -> Result<()> {
        let candidates = self.store.live_or_imminent_fixtures().await?;
        if candidates.is_empty() {
            debug!("live trigger: nothing live or imminent");
            return Ok(());
        }

        let prior: HashMap<i64, FixtureStatus> = candidates
            .iter()
            .map(|f| (f.fixture_id, f.status))
            .collect();
        self.refresh_live_statuses(&prior).await?;

        let settings = self.settings.snapshot();
        let live: Vec<Fixture> = self
            .store
            .live_fixtures()
            .await?
            .into_iter()
            .filter(|f| settings.league_enabled(f.league_id))
            .collect();

        // Drop bookkeeping for fixtures that are no longer live.
        let live_ids: std::collections::HashSet<i64> =
            live.iter().map(|f| f.fixture_id).collect();
        self.pulls
            .retain(|(fixture_id, _), state| state.in_flight || live_ids.contains(fixture_id));

        let now = Utc::now();
        let plan = plan_pulls(&live, &settings.intervals, now, |fixture_id, kind| {
            self.pulls.get(&(fixture_id, kind)).map(|s| *s)
        });

        debug!("live trigger: {} fixtures live, {} pulls due", live.len(), plan.len());

        for planned in plan {
            let key = (planned.fixture.fixture_id, planned.kind);
            self.pulls.entry(key).or_default().in_flight = true;
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = match this.limiter.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                this.execute_pull(planned).await;
            });
        }
        Ok(())
    }

    /// One rate-gated call refreshing status/score/elapsed for everything
    /// currently in play; detects live -> terminal transitions.
    async fn refresh_live_statuses(&self, prior: &HashMap<i64, FixtureStatus>) -> Result<()> {
        let refreshed = self.upstream.fixtures_live().await?;
        self.store.upsert_fixtures(&refreshed).await?;
        for fixture in &refreshed {
            let was_live = prior
                .get(&fixture.fixture_id)
                .map_or(false, |status| status.is_live());
            if was_live && fixture.status.is_terminal_inactive() {
                self.close_fixture(fixture.fixture_id, fixture.status).await;
            }
        }
        Ok(())
    }

    /// Terminal transition: stop scheduling the fixture and tell subscribers.
    async fn close_fixture(&self, fixture_id: i64, status: FixtureStatus) {
        if let Err(e) = self.store.set_fixture_status(fixture_id, status).await {
            warn!("failed to persist terminal status for {}: {}", fixture_id, e);
            return;
        }
        for kind in PullKind::ALL {
            self.pulls.remove(&(fixture_id, kind));
        }
        Counters::bump(&self.counters.fixtures_closed);
        info!("fixture {} closed ({})", fixture_id, status.as_str());
        self.emit_note(ChangeNote {
            fixture_id,
            kind: NoteKind::FixtureClosed,
            timestamp: Utc::now(),
            payload: serde_json::json!({ "status": status.as_str() }),
            window: None,
        })
        .await;
    }

    async fn execute_pull(&self, planned: PlannedPull) {
        let key = (planned.fixture.fixture_id, planned.kind);
        let started = Instant::now();
        let result = self.pull_once(&planned.fixture, planned.kind).await;
        let now = Utc::now();

        let mut entry = self.pulls.entry(key).or_default();
        entry.in_flight = false;
        match result {
            Ok(()) => {
                entry.last_pulled = Some(now);
                entry.consec_failures = 0;
                entry.cooldown_until = None;
                drop(entry);
                Counters::bump(&self.counters.pulls_completed);
                self.lag.record(started.elapsed().as_millis() as u64);
            }
            Err(EngineError::RateStalled { .. }) => {
                // Budget pressure is not a fixture-level fault; just skip
                // this cycle.
                drop(entry);
                Counters::bump(&self.counters.pulls_failed);
            }
            Err(e) => {
                entry.consec_failures += 1;
                let failures = entry.consec_failures;
                if failures >= self.consec_fail_limit {
                    entry.cooldown_until = Some(
                        now + ChronoDuration::from_std(self.cooldown)
                            .unwrap_or_else(|_| ChronoDuration::seconds(600)),
                    );
                    entry.consec_failures = 0;
                    drop(entry);
                    Counters::bump(&self.counters.pulls_cooled_down);
                    warn!(
                        "pull ({}, {}) cooled down after {} consecutive failures: {}",
                        key.0,
                        key.1.as_str(),
                        failures,
                        e
                    );
                } else {
                    drop(entry);
                    debug!("pull ({}, {}) failed: {}", key.0, key.1.as_str(), e);
                }
                Counters::bump(&self.counters.pulls_failed);
            }
        }
    }

    /// Pull, normalize, write one batch, emit one change note. Terminal
    /// status evidence closes the fixture instead of writing ticks.
    async fn pull_once(&self, fixture: &Fixture, kind: PullKind) -> Result<()> {
        let observed_at = Utc::now();
        match kind {
            PullKind::Odds => {
                let batch = self
                    .upstream
                    .odds_live(fixture.fixture_id, observed_at, fixture.elapsed)
                    .await?;
                if let Some(status) = batch.status_evidence {
                    if status.is_terminal_inactive() {
                        self.close_fixture(fixture.fixture_id, status).await;
                        return Ok(());
                    }
                }
                self.count_late_ticks(batch.ticks.iter().map(|t| t.instant));
                let inserted = self.store.insert_odds_ticks(&batch.ticks).await?;
                if inserted > 0 {
                    self.emit_batch_note(fixture.fixture_id, kind, &batch.ticks, odds_window(&batch.ticks))
                        .await;
                }
            }
            PullKind::Events => {
                let ticks = self
                    .upstream
                    .fixture_events(fixture.fixture_id, observed_at)
                    .await?;
                let inserted = self.store.insert_event_ticks(&ticks).await?;
                if inserted > 0 {
                    self.emit_batch_note(fixture.fixture_id, kind, &ticks, event_window(&ticks))
                        .await;
                }
            }
            PullKind::Stats => {
                let ticks = self
                    .upstream
                    .fixture_statistics(fixture.fixture_id, observed_at)
                    .await?;
                let inserted = self.store.insert_stat_ticks(&ticks).await?;
                if inserted > 0 {
                    self.emit_batch_note(fixture.fixture_id, kind, &ticks, stat_window(&ticks))
                        .await;
                }
            }
        }
        Ok(())
    }

    fn count_late_ticks(&self, instants: impl Iterator<Item = DateTime<Utc>>) {
        if let Some(floor) = self.frames.frame_floor() {
            let late = instants.filter(|i| *i < floor).count() as u64;
            if late > 0 {
                Counters::add(&self.counters.late_ticks_dropped, late);
            }
        }
    }

    async fn emit_batch_note<T: serde::Serialize>(
        &self,
        fixture_id: i64,
        kind: PullKind,
        batch: &[T],
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) {
        let payload = match serde_json::to_value(batch) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("change note payload serialization failed: {}", e);
                return;
            }
        };
        self.emit_note(ChangeNote {
            fixture_id,
            kind: NoteKind::for_pull(kind),
            timestamp: Utc::now(),
            payload,
            window,
        })
        .await;
    }

    async fn emit_note(&self, note: ChangeNote) {
        Counters::bump(&self.counters.notes_published);
        if self.notes.send(note).await.is_err() {
            warn!("change-note channel closed; bridge gone");
        }
    }
}

fn odds_window(ticks: &[OddsTick]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    span(ticks.iter().map(|t| t.instant))
}

fn event_window(ticks: &[EventTick]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    span(ticks.iter().map(|t| t.instant))
}

fn stat_window(ticks: &[StatTick]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    span(ticks.iter().map(|t| t.instant))
}

fn span(instants: impl Iterator<Item = DateTime<Utc>>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let mut min = None;
    let mut max = None;
    for instant in instants {
        min = Some(min.map_or(instant, |m: DateTime<Utc>| m.min(instant)));
        max = Some(max.map_or(instant, |m: DateTime<Utc>| m.max(instant)));
    }
    Some((min?, max?))
}

fn interval_for(kind: PullKind, intervals: &PullIntervals) -> Duration {
    match kind {
        PullKind::Odds => intervals.odds,
        PullKind::Events => intervals.events,
        PullKind::Stats => intervals.stats,
    }
}

/// Compute the due set for this trigger and order it by staleness
/// descending. A (fixture, kind) pair is due when it is not cooling down,
/// not already in flight, and its last pull is older than the kind's
/// cadence.
pub fn plan_pulls(
    live: &[Fixture],
    intervals: &PullIntervals,
    now: DateTime<Utc>,
    lookup: impl Fn(i64, PullKind) -> Option<PullState>,
) -> Vec<PlannedPull> {
    let mut plan = Vec::new();
    for fixture in live {
        if !fixture.status.is_live() {
            continue;
        }
        for kind in PullKind::ALL {
            let state = lookup(fixture.fixture_id, kind).unwrap_or_default();
            if state.in_flight {
                continue;
            }
            if let Some(until) = state.cooldown_until {
                if until > now {
                    continue;
                }
            }
            let staleness_ms = match state.last_pulled {
                Some(last) => (now - last).num_milliseconds(),
                None => i64::MAX,
            };
            let due = match state.last_pulled {
                Some(last) => {
                    now - last
                        >= ChronoDuration::from_std(interval_for(kind, intervals))
                            .unwrap_or_else(|_| ChronoDuration::seconds(10))
                }
                None => true,
            };
            if due {
                plan.push(PlannedPull {
                    fixture: fixture.clone(),
                    kind,
                    staleness_ms,
                });
            }
        }
    }
    plan.sort_by(|a, b| b.staleness_ms.cmp(&a.staleness_ms));
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn fixture(id: i64, status: FixtureStatus) -> Fixture {
        Fixture {
            fixture_id: id,
            kickoff: Utc.with_ymd_and_hms(2026, 8, 1, 14, 0, 0).unwrap(),
            league_id: 39,
            season: 2026,
            round: None,
            venue: None,
            home_team_id: 1,
            home_team: "Home".into(),
            away_team_id: 2,
            away_team: "Away".into(),
            status,
            elapsed: Some(10),
            home_goals: Some(0),
            away_goals: Some(0),
            ht_home_goals: None,
            ht_away_goals: None,
            et_home_goals: None,
            et_away_goals: None,
            pen_home_goals: None,
            pen_away_goals: None,
            status_changed_at: None,
            finalized_at: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 14, 30, 0).unwrap()
    }

    #[test]
    fn never_pulled_fixture_is_due_for_all_kinds() {
        let live = vec![fixture(1000, FixtureStatus::FirstHalf)];
        let plan = plan_pulls(&live, &PullIntervals::default(), now(), |_, _| None);
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|p| p.staleness_ms == i64::MAX));
    }

    #[test]
    fn recent_pull_is_not_due() {
        let live = vec![fixture(1000, FixtureStatus::FirstHalf)];
        let state = |_: i64, kind: PullKind| {
            // Odds pulled 3 s ago (interval 10 s): not due. Events pulled
            // 7 s ago (interval 5 s): due. Stats never pulled: due.
            match kind {
                PullKind::Odds => Some(PullState {
                    last_pulled: Some(now() - ChronoDuration::seconds(3)),
                    ..Default::default()
                }),
                PullKind::Events => Some(PullState {
                    last_pulled: Some(now() - ChronoDuration::seconds(7)),
                    ..Default::default()
                }),
                PullKind::Stats => None,
            }
        };
        let plan = plan_pulls(&live, &PullIntervals::default(), now(), state);
        let kinds: Vec<PullKind> = plan.iter().map(|p| p.kind).collect();
        assert!(!kinds.contains(&PullKind::Odds));
        assert!(kinds.contains(&PullKind::Events));
        assert!(kinds.contains(&PullKind::Stats));
    }

    #[test]
    fn plan_orders_by_staleness_descending() {
        let live = vec![
            fixture(1, FixtureStatus::FirstHalf),
            fixture(2, FixtureStatus::SecondHalf),
        ];
        let mut states: HashMap<(i64, PullKind), PullState> = HashMap::new();
        for kind in PullKind::ALL {
            states.insert(
                (1, kind),
                PullState {
                    last_pulled: Some(now() - ChronoDuration::seconds(30)),
                    ..Default::default()
                },
            );
            states.insert(
                (2, kind),
                PullState {
                    last_pulled: Some(now() - ChronoDuration::seconds(90)),
                    ..Default::default()
                },
            );
        }
        let plan = plan_pulls(&live, &PullIntervals::default(), now(), |id, kind| {
            states.get(&(id, kind)).copied()
        });
        assert_eq!(plan.len(), 6);
        // Fixture 2 is staler on every kind, so its pulls lead the plan.
        assert!(plan[..3].iter().all(|p| p.fixture.fixture_id == 2));
    }

    #[test]
    fn cooldown_and_in_flight_are_excluded() {
        let live = vec![fixture(1000, FixtureStatus::FirstHalf)];
        let state = |_: i64, kind: PullKind| match kind {
            PullKind::Odds => Some(PullState {
                cooldown_until: Some(now() + ChronoDuration::minutes(5)),
                ..Default::default()
            }),
            PullKind::Events => Some(PullState {
                in_flight: true,
                ..Default::default()
            }),
            PullKind::Stats => Some(PullState {
                // Expired cooldown no longer excludes.
                cooldown_until: Some(now() - ChronoDuration::minutes(1)),
                ..Default::default()
            }),
        };
        let plan = plan_pulls(&live, &PullIntervals::default(), now(), state);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].kind, PullKind::Stats);
    }

    #[test]
    fn non_live_fixtures_are_never_planned() {
        let live = vec![
            fixture(1, FixtureStatus::NotStarted),
            fixture(2, FixtureStatus::FullTime),
            fixture(3, FixtureStatus::Postponed),
        ];
        let plan = plan_pulls(&live, &PullIntervals::default(), now(), |_, _| None);
        assert!(plan.is_empty());
    }

    #[test]
    fn batch_window_spans_instants() {
        let t0 = now();
        let ticks = vec![
            OddsTick {
                fixture_id: 1,
                bookmaker_id: 8,
                market_id: 1,
                outcome: "1".into(),
                instant: t0,
                price: 2.0,
                match_minute: None,
            },
            OddsTick {
                fixture_id: 1,
                bookmaker_id: 8,
                market_id: 1,
                outcome: "X".into(),
                instant: t0 + ChronoDuration::seconds(5),
                price: 3.1,
                match_minute: None,
            },
        ];
        let window = odds_window(&ticks).unwrap();
        assert_eq!(window.0, t0);
        assert_eq!(window.1, t0 + ChronoDuration::seconds(5));
        assert!(odds_window(&[]).is_none());
    }
}
