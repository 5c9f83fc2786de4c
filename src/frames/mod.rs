use crate::error::Result;
use crate::metrics::Counters;
use crate::shared::types::{EventTick, Fixture, MatchLiveFrame, OddsTick};
use crate::store::TickStore;
use crate::upstream::types::MARKET_MATCH_WINNER;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const WINDOW_SECS: i64 = 60;
/// Windows older than this are never caught up implicitly.
const CATCHUP_LIMIT_SECS: i64 = 300;

/// Materializes per-minute per-fixture summary frames from raw ticks.
/// One cycle per minute, driven by the `frame_maker` job.
pub struct FrameAggregator {
    store: Arc<TickStore>,
    counters: Arc<Counters>,
    /// End of the most recently materialized window, unix seconds. Ticks
    /// older than this can no longer reach a frame.
    floor_ts: AtomicI64,
    last_done: Mutex<Option<DateTime<Utc>>>,
}

impl FrameAggregator {
    pub fn new(store: Arc<TickStore>, counters: Arc<Counters>) -> Self {
        Self {
            store,
            counters,
            floor_ts: AtomicI64::new(0),
            last_done: Mutex::new(None),
        }
    }

    /// Instant before which ticks are late for frame purposes.
    pub fn frame_floor(&self) -> Option<DateTime<Utc>> {
        let ts = self.floor_ts.load(Ordering::Relaxed);
        (ts > 0).then(|| DateTime::from_timestamp(ts, 0).unwrap_or_default())
    }

    /// Run one aggregation cycle: materialize every closed window since the
    /// previous cycle, but never reach further back than the catch-up limit.
    pub async fn run_cycle(&self) -> Result<()> {
        let now = Utc::now();
        let latest_start = closed_window_start(now);

        let mut last_done = self.last_done.lock().await;
        let mut window = match *last_done {
            Some(done) => {
                // Behindness in whole unprocessed seconds; zero in steady state.
                let lag = (latest_start - done).num_seconds().max(0) as u64;
                Counters::set(&self.counters.frames_lag_seconds, lag);
                let floor = now - ChronoDuration::seconds(CATCHUP_LIMIT_SECS);
                if done < floor {
                    warn!(
                        "frame aggregator behind by {}s, skipping forward to the latest closed minute",
                        lag
                    );
                    latest_start
                } else {
                    done
                }
            }
            None => latest_start,
        };

        while window <= latest_start {
            self.materialize_window_for_active(window).await?;
            window = window + ChronoDuration::seconds(WINDOW_SECS);
        }

        *last_done = Some(window);
        self.floor_ts.store(window.timestamp(), Ordering::Relaxed);
        Ok(())
    }

    /// Materialize one window for every fixture that had activity in it.
    async fn materialize_window_for_active(&self, bucket_start: DateTime<Utc>) -> Result<()> {
        let bucket_end = bucket_start + ChronoDuration::seconds(WINDOW_SECS);
        let fixtures = self
            .store
            .active_fixtures_between(bucket_start, bucket_end)
            .await?;
        if fixtures.is_empty() {
            return Ok(());
        }
        debug!(
            "materializing frame window {} for {} fixtures",
            bucket_start, fixtures.len()
        );
        for fixture_id in fixtures {
            self.materialize_window(fixture_id, bucket_start).await?;
        }
        Ok(())
    }

    /// Materialize (or re-materialize) a single (fixture, window) frame.
    /// Idempotent: the same input ticks produce the same row.
    pub async fn materialize_window(
        &self,
        fixture_id: i64,
        bucket_start: DateTime<Utc>,
    ) -> Result<()> {
        let bucket_end = bucket_start + ChronoDuration::seconds(WINDOW_SECS);
        let Some(fixture) = self.store.get_fixture(fixture_id).await? else {
            warn!("frame skipped: unknown fixture {}", fixture_id);
            return Ok(());
        };
        let odds = self
            .store
            .odds_ticks_between(fixture_id, bucket_start, bucket_end)
            .await?;
        let events = self
            .store
            .event_ticks_between(fixture_id, bucket_start, bucket_end)
            .await?;
        if odds.is_empty() && events.is_empty() {
            return Ok(());
        }
        let frame = compute_frame(bucket_start, &fixture, &odds, &events);
        self.store.upsert_frame(&frame).await?;
        Counters::bump(&self.counters.frames_materialized);
        Ok(())
    }
}

/// Start of the most recently *closed* 1-minute window at `now`.
pub fn closed_window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let minute = now
        .duration_trunc(ChronoDuration::seconds(WINDOW_SECS))
        .expect("minute truncation cannot fail");
    minute - ChronoDuration::seconds(WINDOW_SECS)
}

fn avg_and_delta(ticks: &[&OddsTick]) -> (Option<f64>, Option<f64>) {
    if ticks.is_empty() {
        return (None, None);
    }
    let avg = ticks.iter().map(|t| t.price).sum::<f64>() / ticks.len() as f64;
    let open = ticks.first().map(|t| t.price).unwrap_or_default();
    let close = ticks.last().map(|t| t.price).unwrap_or_default();
    (Some(avg), Some(close - open))
}

/// Pure frame computation over the ticks of one window plus the fixture
/// dimension row at window close.
pub fn compute_frame(
    bucket_start: DateTime<Utc>,
    fixture: &Fixture,
    odds: &[OddsTick],
    events: &[EventTick],
) -> MatchLiveFrame {
    // 1X2 ticks per outcome, in instant order.
    let mut home: Vec<&OddsTick> = Vec::new();
    let mut draw: Vec<&OddsTick> = Vec::new();
    let mut away: Vec<&OddsTick> = Vec::new();
    let mut sorted: Vec<&OddsTick> = odds.iter().collect();
    sorted.sort_by_key(|t| t.instant);
    for tick in &sorted {
        if tick.market_id != MARKET_MATCH_WINNER {
            continue;
        }
        match tick.outcome.as_str() {
            "1" => home.push(tick),
            "X" => draw.push(tick),
            "2" => away.push(tick),
            _ => {}
        }
    }

    let (avg_home_odd, home_odd_delta) = avg_and_delta(&home);
    let (avg_draw_odd, _) = avg_and_delta(&draw);
    let (avg_away_odd, away_odd_delta) = avg_and_delta(&away);

    let goals_in_bucket = events.iter().filter(|e| e.is_goal()).count() as i32;
    let cards_in_bucket = events.iter().filter(|e| e.is_card()).count() as i32;
    let subs_in_bucket = events.iter().filter(|e| e.is_substitution()).count() as i32;

    MatchLiveFrame {
        fixture_id: fixture.fixture_id,
        bucket_start,
        home_team_id: fixture.home_team_id,
        away_team_id: fixture.away_team_id,
        status: fixture.status,
        elapsed: fixture.elapsed,
        home_goals: fixture.home_goals.unwrap_or(0),
        away_goals: fixture.away_goals.unwrap_or(0),
        avg_home_odd,
        avg_draw_odd,
        avg_away_odd,
        home_odd_delta,
        away_odd_delta,
        goals_in_bucket,
        cards_in_bucket,
        subs_in_bucket,
        odds_ticks_in_bucket: odds.len() as i32,
        event_ticks_in_bucket: events.len() as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::types::FixtureStatus;
    use chrono::TimeZone;

    fn fixture() -> Fixture {
        Fixture {
            fixture_id: 1000,
            kickoff: Utc.with_ymd_and_hms(2026, 8, 1, 14, 0, 0).unwrap(),
            league_id: 39,
            season: 2026,
            round: None,
            venue: None,
            home_team_id: 40,
            home_team: "Liverpool".into(),
            away_team_id: 33,
            away_team: "Manchester United".into(),
            status: FixtureStatus::FirstHalf,
            elapsed: Some(23),
            home_goals: Some(1),
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

    fn odds_tick(outcome: &str, price: f64, offset_secs: i64, t0: DateTime<Utc>) -> OddsTick {
        OddsTick {
            fixture_id: 1000,
            bookmaker_id: 8,
            market_id: MARKET_MATCH_WINNER,
            outcome: outcome.into(),
            instant: t0 + ChronoDuration::seconds(offset_secs),
            price,
            match_minute: Some(23),
        }
    }

    fn goal_event(t0: DateTime<Utc>) -> EventTick {
        EventTick {
            fixture_id: 1000,
            instant: t0 + ChronoDuration::seconds(30),
            match_minute: Some(23),
            extra_minute: None,
            kind: "Goal".into(),
            detail: "Normal Goal".into(),
            team_id: Some(40),
            player_id: Some(306),
            assist_id: None,
            comment: None,
        }
    }

    #[test]
    fn frame_matches_minute_summary() {
        // Three 1X2 ticks, one later tick on "1", one goal: the minute's
        // frame averages 2.10/2.00 on home, keeps single quotes as-is and
        // reports the close-minus-open home delta.
        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 14, 10, 0).unwrap();
        let odds = vec![
            odds_tick("1", 2.10, 5, t0),
            odds_tick("X", 3.40, 5, t0),
            odds_tick("2", 3.20, 5, t0),
            odds_tick("1", 2.00, 40, t0),
        ];
        let events = vec![goal_event(t0)];
        let frame = compute_frame(t0, &fixture(), &odds, &events);

        assert_eq!(frame.bucket_start, t0);
        assert!((frame.avg_home_odd.unwrap() - 2.05).abs() < 1e-9);
        assert!((frame.avg_draw_odd.unwrap() - 3.40).abs() < 1e-9);
        assert!((frame.avg_away_odd.unwrap() - 3.20).abs() < 1e-9);
        assert!((frame.home_odd_delta.unwrap() - (-0.10)).abs() < 1e-9);
        assert!((frame.away_odd_delta.unwrap() - 0.0).abs() < 1e-9);
        assert_eq!(frame.goals_in_bucket, 1);
        assert_eq!(frame.cards_in_bucket, 0);
        assert_eq!(frame.odds_ticks_in_bucket, 4);
        assert_eq!(frame.event_ticks_in_bucket, 1);
        assert_eq!(frame.home_goals, 1);
        assert_eq!(frame.status, FixtureStatus::FirstHalf);
    }

    #[test]
    fn frame_is_pure_over_inputs() {
        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 14, 10, 0).unwrap();
        let odds = vec![odds_tick("1", 2.10, 5, t0), odds_tick("1", 2.00, 40, t0)];
        let events = vec![goal_event(t0)];
        let a = compute_frame(t0, &fixture(), &odds, &events);
        let b = compute_frame(t0, &fixture(), &odds, &events);
        assert_eq!(a, b);
    }

    #[test]
    fn frame_without_odds_has_no_averages() {
        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 14, 10, 0).unwrap();
        let frame = compute_frame(t0, &fixture(), &[], &[goal_event(t0)]);
        assert_eq!(frame.avg_home_odd, None);
        assert_eq!(frame.home_odd_delta, None);
        assert_eq!(frame.goals_in_bucket, 1);
        assert_eq!(frame.odds_ticks_in_bucket, 0);
    }

    #[test]
    fn non_match_winner_markets_do_not_move_averages() {
        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 14, 10, 0).unwrap();
        let mut over = odds_tick("Over 2.5", 1.85, 10, t0);
        over.market_id = 5;
        let odds = vec![odds_tick("1", 2.10, 5, t0), over];
        let frame = compute_frame(t0, &fixture(), &odds, &[]);
        assert!((frame.avg_home_odd.unwrap() - 2.10).abs() < 1e-9);
        // Still counted in the activity counter.
        assert_eq!(frame.odds_ticks_in_bucket, 2);
    }

    #[test]
    fn closed_window_is_the_previous_minute() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 14, 10, 42).unwrap();
        let t0 = closed_window_start(now);
        assert_eq!(t0, Utc.with_ymd_and_hms(2026, 8, 1, 14, 9, 0).unwrap());
    }
}
