pub mod retention;
pub mod schema;

use crate::error::Result;
use crate::metrics::Counters;
use crate::shared::types::{
    EventTick, Fixture, FixtureStatus, JobRow, MatchLiveFrame, OddsTick, PrematchOdds, PullKind,
    StatTick,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const LIVE_STATUSES: &str = "('1H','HT','2H','ET','BT','P')";
const FINISHED_STATUSES: &str = "('FT','AET','PEN','AWD','WO')";

/// Time-series storage for ticks, snapshots, frames and the job catalog.
/// All batch writes are transactional; validation drops individual rows
/// without aborting the batch.
pub struct TickStore {
    pool: PgPool,
    counters: Arc<Counters>,
}

fn is_transient_db(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            // Serialization failures and deadlocks are retryable.
            matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

fn decode_status(code: &str) -> std::result::Result<FixtureStatus, sqlx::Error> {
    FixtureStatus::parse(code)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown status '{code}' in fixture row").into()))
}

fn row_to_fixture(row: &PgRow) -> std::result::Result<Fixture, sqlx::Error> {
    let status: String = row.get("status");
    Ok(Fixture {
        fixture_id: row.get("fixture_id"),
        kickoff: row.get("kickoff"),
        league_id: row.get("league_id"),
        season: row.get("season"),
        round: row.get("round"),
        venue: row.get("venue"),
        home_team_id: row.get("home_team_id"),
        home_team: row.get("home_team"),
        away_team_id: row.get("away_team_id"),
        away_team: row.get("away_team"),
        status: decode_status(&status)?,
        elapsed: row.get("elapsed"),
        home_goals: row.get("home_goals"),
        away_goals: row.get("away_goals"),
        ht_home_goals: row.get("ht_home_goals"),
        ht_away_goals: row.get("ht_away_goals"),
        et_home_goals: row.get("et_home_goals"),
        et_away_goals: row.get("et_away_goals"),
        pen_home_goals: row.get("pen_home_goals"),
        pen_away_goals: row.get("pen_away_goals"),
        status_changed_at: row.get("status_changed_at"),
        finalized_at: row.get("finalized_at"),
    })
}

const FIXTURE_COLUMNS: &str = "fixture_id, kickoff, league_id, season, round, venue, \
     home_team_id, home_team, away_team_id, away_team, status, elapsed, \
     home_goals, away_goals, ht_home_goals, ht_away_goals, et_home_goals, \
     et_away_goals, pen_home_goals, pen_away_goals, status_changed_at, finalized_at";

impl TickStore {
    pub fn new(pool: PgPool, counters: Arc<Counters>) -> Self {
        Self { pool, counters }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables, hypertables and compression settings. The Timescale
    /// layer is best-effort so the engine still runs on plain Postgres.
    pub async fn ensure_schema(&self) -> Result<()> {
        for ddl in schema::TABLES {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        for ddl in schema::TIMESCALE {
            if let Err(e) = sqlx::query(*ddl).execute(&self.pool).await {
                warn!("timescale DDL skipped ({})", e);
            }
        }
        info!("schema ensured");
        Ok(())
    }

    async fn retrying<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < 3 && is_transient_db(&e) => {
                    Counters::bump(&self.counters.storage_retries);
                    warn!("storage {} transient failure (attempt {}): {}", what, attempt, e);
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // --- Write paths ---

    /// Bulk-append odds ticks. Rows with a non-positive price are dropped
    /// and counted; duplicates on the natural key are silently ignored.
    /// Returns the number of rows actually inserted.
    pub async fn insert_odds_ticks(&self, batch: &[OddsTick]) -> Result<u64> {
        let valid: Vec<&OddsTick> = batch
            .iter()
            .filter(|t| {
                if t.price > 0.0 {
                    true
                } else {
                    Counters::bump(&self.counters.validation_dropped);
                    false
                }
            })
            .collect();
        if valid.is_empty() {
            return Ok(0);
        }

        let fixture_ids: Vec<i64> = valid.iter().map(|t| t.fixture_id).collect();
        let bookmaker_ids: Vec<i64> = valid.iter().map(|t| t.bookmaker_id).collect();
        let market_ids: Vec<i64> = valid.iter().map(|t| t.market_id).collect();
        let outcomes: Vec<String> = valid.iter().map(|t| t.outcome.clone()).collect();
        let instants: Vec<DateTime<Utc>> = valid.iter().map(|t| t.instant).collect();
        let prices: Vec<f64> = valid.iter().map(|t| t.price).collect();
        let minutes: Vec<Option<i32>> = valid.iter().map(|t| t.match_minute).collect();

        let inserted = self
            .retrying("insert_odds_ticks", || {
                let pool = self.pool.clone();
                let (f, b, m, o, i, p, mm) = (
                    fixture_ids.clone(),
                    bookmaker_ids.clone(),
                    market_ids.clone(),
                    outcomes.clone(),
                    instants.clone(),
                    prices.clone(),
                    minutes.clone(),
                );
                async move {
                    let result = sqlx::query(
                        r#"
                        INSERT INTO live_odds_tick
                            (fixture_id, bookmaker_id, market_id, outcome, instant, price, match_minute)
                        SELECT * FROM UNNEST(
                            $1::bigint[], $2::bigint[], $3::bigint[], $4::text[],
                            $5::timestamptz[], $6::double precision[], $7::int[]
                        )
                        ON CONFLICT (fixture_id, bookmaker_id, market_id, outcome, instant)
                        DO NOTHING
                        "#,
                    )
                    .bind(f)
                    .bind(b)
                    .bind(m)
                    .bind(o)
                    .bind(i)
                    .bind(p)
                    .bind(mm)
                    .execute(&pool)
                    .await?;
                    Ok(result.rows_affected())
                }
            })
            .await?;

        Counters::add(&self.counters.odds_ticks_written, inserted);
        Counters::add(
            &self.counters.duplicate_ticks_dropped,
            valid.len() as u64 - inserted,
        );
        Ok(inserted)
    }

    /// Bulk-append event ticks. The provider resends the full cumulative
    /// event list on every poll, so the batch is deduplicated against the
    /// rows already stored for the fixture before inserting.
    pub async fn insert_event_ticks(&self, batch: &[EventTick]) -> Result<u64> {
        let Some(first) = batch.first() else {
            return Ok(0);
        };
        let fixture_id = first.fixture_id;

        let inserted = self
            .retrying("insert_event_ticks", || {
                let pool = self.pool.clone();
                let batch: Vec<EventTick> = batch.to_vec();
                async move {
                    let mut tx = pool.begin().await?;
                    let existing = sqlx::query(
                        r#"
                        SELECT match_minute, extra_minute, kind, detail, team_id, player_id
                        FROM live_event_tick
                        WHERE fixture_id = $1
                        "#,
                    )
                    .bind(fixture_id)
                    .fetch_all(&mut *tx)
                    .await?;

                    let seen: HashSet<(Option<i32>, Option<i32>, String, String, Option<i64>, Option<i64>)> =
                        existing
                            .iter()
                            .map(|row| {
                                (
                                    row.get("match_minute"),
                                    row.get("extra_minute"),
                                    row.get("kind"),
                                    row.get("detail"),
                                    row.get("team_id"),
                                    row.get("player_id"),
                                )
                            })
                            .collect();

                    let fresh: Vec<&EventTick> = batch
                        .iter()
                        .filter(|t| {
                            !seen.contains(&(
                                t.match_minute,
                                t.extra_minute,
                                t.kind.clone(),
                                t.detail.clone(),
                                t.team_id,
                                t.player_id,
                            ))
                        })
                        .collect();

                    if fresh.is_empty() {
                        tx.commit().await?;
                        return Ok(0u64);
                    }

                    let result = sqlx::query(
                        r#"
                        INSERT INTO live_event_tick
                            (fixture_id, instant, match_minute, extra_minute, kind,
                             detail, team_id, player_id, assist_id, comment)
                        SELECT * FROM UNNEST(
                            $1::bigint[], $2::timestamptz[], $3::int[], $4::int[], $5::text[],
                            $6::text[], $7::bigint[], $8::bigint[], $9::bigint[], $10::text[]
                        )
                        "#,
                    )
                    .bind(fresh.iter().map(|t| t.fixture_id).collect::<Vec<_>>())
                    .bind(fresh.iter().map(|t| t.instant).collect::<Vec<_>>())
                    .bind(fresh.iter().map(|t| t.match_minute).collect::<Vec<_>>())
                    .bind(fresh.iter().map(|t| t.extra_minute).collect::<Vec<_>>())
                    .bind(fresh.iter().map(|t| t.kind.clone()).collect::<Vec<_>>())
                    .bind(fresh.iter().map(|t| t.detail.clone()).collect::<Vec<_>>())
                    .bind(fresh.iter().map(|t| t.team_id).collect::<Vec<_>>())
                    .bind(fresh.iter().map(|t| t.player_id).collect::<Vec<_>>())
                    .bind(fresh.iter().map(|t| t.assist_id).collect::<Vec<_>>())
                    .bind(fresh.iter().map(|t| t.comment.clone()).collect::<Vec<_>>())
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    Ok(result.rows_affected())
                }
            })
            .await?;

        Counters::add(&self.counters.event_ticks_written, inserted);
        Counters::add(
            &self.counters.duplicate_ticks_dropped,
            batch.len() as u64 - inserted,
        );
        Ok(inserted)
    }

    /// Bulk-append stat snapshots. Rows with possession outside [0, 100]
    /// are dropped and counted.
    pub async fn insert_stat_ticks(&self, batch: &[StatTick]) -> Result<u64> {
        let valid: Vec<&StatTick> = batch
            .iter()
            .filter(|t| {
                let possession_ok = t
                    .possession_pct
                    .map_or(true, |p| (0.0..=100.0).contains(&p));
                if !possession_ok {
                    Counters::bump(&self.counters.validation_dropped);
                }
                possession_ok
            })
            .collect();
        if valid.is_empty() {
            return Ok(0);
        }

        let inserted = self
            .retrying("insert_stat_ticks", || {
                let pool = self.pool.clone();
                let valid: Vec<StatTick> = valid.iter().map(|t| (*t).clone()).collect();
                async move {
                    let result = sqlx::query(
                        r#"
                        INSERT INTO live_stat_tick
                            (fixture_id, team_id, instant, shots_on_goal, shots_off_goal,
                             total_shots, blocked_shots, shots_inside_box, shots_outside_box,
                             possession_pct, corners, offsides, fouls, yellow_cards, red_cards,
                             goalkeeper_saves, total_passes, passes_accurate, passes_pct)
                        SELECT * FROM UNNEST(
                            $1::bigint[], $2::bigint[], $3::timestamptz[], $4::int[], $5::int[],
                            $6::int[], $7::int[], $8::int[], $9::int[],
                            $10::double precision[], $11::int[], $12::int[], $13::int[],
                            $14::int[], $15::int[], $16::int[], $17::int[], $18::int[],
                            $19::double precision[]
                        )
                        ON CONFLICT (fixture_id, team_id, instant) DO NOTHING
                        "#,
                    )
                    .bind(valid.iter().map(|t| t.fixture_id).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.team_id).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.instant).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.shots_on_goal).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.shots_off_goal).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.total_shots).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.blocked_shots).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.shots_inside_box).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.shots_outside_box).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.possession_pct).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.corners).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.offsides).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.fouls).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.yellow_cards).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.red_cards).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.goalkeeper_saves).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.total_passes).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.passes_accurate).collect::<Vec<_>>())
                    .bind(valid.iter().map(|t| t.passes_pct).collect::<Vec<_>>())
                    .execute(&pool)
                    .await?;
                    Ok(result.rows_affected())
                }
            })
            .await?;

        Counters::add(&self.counters.stat_ticks_written, inserted);
        Ok(inserted)
    }

    /// Append prematch price snapshots.
    pub async fn snapshot_prematch_odds(&self, batch: &[PrematchOdds]) -> Result<u64> {
        let valid: Vec<&PrematchOdds> = batch
            .iter()
            .filter(|r| {
                if r.price > 0.0 {
                    true
                } else {
                    Counters::bump(&self.counters.validation_dropped);
                    false
                }
            })
            .collect();
        if valid.is_empty() {
            return Ok(0);
        }

        let inserted = self
            .retrying("snapshot_prematch_odds", || {
                let pool = self.pool.clone();
                let valid: Vec<PrematchOdds> = valid.iter().map(|r| (*r).clone()).collect();
                async move {
                    let result = sqlx::query(
                        r#"
                        INSERT INTO prematch_odds
                            (fixture_id, bookmaker_id, market_id, outcome, sampled_at,
                             price, hours_before_match)
                        SELECT * FROM UNNEST(
                            $1::bigint[], $2::bigint[], $3::bigint[], $4::text[],
                            $5::timestamptz[], $6::double precision[], $7::double precision[]
                        )
                        ON CONFLICT (fixture_id, bookmaker_id, market_id, outcome, sampled_at)
                        DO NOTHING
                        "#,
                    )
                    .bind(valid.iter().map(|r| r.fixture_id).collect::<Vec<_>>())
                    .bind(valid.iter().map(|r| r.bookmaker_id).collect::<Vec<_>>())
                    .bind(valid.iter().map(|r| r.market_id).collect::<Vec<_>>())
                    .bind(valid.iter().map(|r| r.outcome.clone()).collect::<Vec<_>>())
                    .bind(valid.iter().map(|r| r.sampled_at).collect::<Vec<_>>())
                    .bind(valid.iter().map(|r| r.price).collect::<Vec<_>>())
                    .bind(valid.iter().map(|r| r.hours_before_match).collect::<Vec<_>>())
                    .execute(&pool)
                    .await?;
                    Ok(result.rows_affected())
                }
            })
            .await?;

        Counters::add(&self.counters.prematch_rows_written, inserted);
        Ok(inserted)
    }

    // --- Fixture dimension ---

    /// Insert-or-update fixture rows from a poll. `status_changed_at` moves
    /// only when the status actually changes.
    pub async fn upsert_fixtures(&self, fixtures: &[Fixture]) -> Result<()> {
        if fixtures.is_empty() {
            return Ok(());
        }
        self.retrying("upsert_fixtures", || {
            let pool = self.pool.clone();
            let fixtures: Vec<Fixture> = fixtures.to_vec();
            async move {
                let mut tx = pool.begin().await?;
                for f in &fixtures {
                    sqlx::query(
                        r#"
                        INSERT INTO fixture
                            (fixture_id, kickoff, league_id, season, round, venue,
                             home_team_id, home_team, away_team_id, away_team, status,
                             elapsed, home_goals, away_goals, ht_home_goals, ht_away_goals,
                             et_home_goals, et_away_goals, pen_home_goals, pen_away_goals,
                             status_changed_at, updated_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                                $12, $13, $14, $15, $16, $17, $18, $19, $20, now(), now())
                        ON CONFLICT (fixture_id) DO UPDATE SET
                            kickoff = EXCLUDED.kickoff,
                            round = EXCLUDED.round,
                            venue = COALESCE(EXCLUDED.venue, fixture.venue),
                            home_team = EXCLUDED.home_team,
                            away_team = EXCLUDED.away_team,
                            status = EXCLUDED.status,
                            elapsed = EXCLUDED.elapsed,
                            home_goals = EXCLUDED.home_goals,
                            away_goals = EXCLUDED.away_goals,
                            ht_home_goals = EXCLUDED.ht_home_goals,
                            ht_away_goals = EXCLUDED.ht_away_goals,
                            et_home_goals = EXCLUDED.et_home_goals,
                            et_away_goals = EXCLUDED.et_away_goals,
                            pen_home_goals = EXCLUDED.pen_home_goals,
                            pen_away_goals = EXCLUDED.pen_away_goals,
                            status_changed_at = CASE
                                WHEN fixture.status IS DISTINCT FROM EXCLUDED.status THEN now()
                                ELSE fixture.status_changed_at
                            END,
                            updated_at = now()
                        "#,
                    )
                    .bind(f.fixture_id)
                    .bind(f.kickoff)
                    .bind(f.league_id)
                    .bind(f.season)
                    .bind(&f.round)
                    .bind(&f.venue)
                    .bind(f.home_team_id)
                    .bind(&f.home_team)
                    .bind(f.away_team_id)
                    .bind(&f.away_team)
                    .bind(f.status.as_str())
                    .bind(f.elapsed)
                    .bind(f.home_goals)
                    .bind(f.away_goals)
                    .bind(f.ht_home_goals)
                    .bind(f.ht_away_goals)
                    .bind(f.et_home_goals)
                    .bind(f.et_away_goals)
                    .bind(f.pen_home_goals)
                    .bind(f.pen_away_goals)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
                Ok(())
            }
        })
        .await
    }

    pub async fn set_fixture_status(&self, fixture_id: i64, status: FixtureStatus) -> Result<()> {
        self.retrying("set_fixture_status", || {
            let pool = self.pool.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE fixture
                    SET status = $2,
                        status_changed_at = CASE
                            WHEN status IS DISTINCT FROM $2 THEN now()
                            ELSE status_changed_at
                        END,
                        updated_at = now()
                    WHERE fixture_id = $1
                    "#,
                )
                .bind(fixture_id)
                .bind(status.as_str())
                .execute(&pool)
                .await?;
                Ok(())
            }
        })
        .await
    }

    pub async fn mark_finalized(&self, fixture_id: i64) -> Result<()> {
        self.retrying("mark_finalized", || {
            let pool = self.pool.clone();
            async move {
                sqlx::query("UPDATE fixture SET finalized_at = now() WHERE fixture_id = $1")
                    .bind(fixture_id)
                    .execute(&pool)
                    .await?;
                Ok(())
            }
        })
        .await
    }

    pub async fn get_fixture(&self, fixture_id: i64) -> Result<Option<Fixture>> {
        let row = sqlx::query(&format!(
            "SELECT {FIXTURE_COLUMNS} FROM fixture WHERE fixture_id = $1"
        ))
        .bind(fixture_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some(row_to_fixture(&row)?),
            None => None,
        })
    }

    /// Fixtures currently in a live status.
    pub async fn live_fixtures(&self) -> Result<Vec<Fixture>> {
        let rows = sqlx::query(&format!(
            "SELECT {FIXTURE_COLUMNS} FROM fixture WHERE status IN {LIVE_STATUSES} ORDER BY fixture_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| Ok(row_to_fixture(r)?)).collect()
    }

    /// Live fixtures plus not-started ones inside the imminence window.
    /// An empty result lets the live trigger finish without any upstream
    /// call.
    pub async fn live_or_imminent_fixtures(&self) -> Result<Vec<Fixture>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {FIXTURE_COLUMNS} FROM fixture
            WHERE status IN {LIVE_STATUSES}
               OR (status IN ('NS','TBD')
                   AND kickoff BETWEEN now() - INTERVAL '3 hours'
                                   AND now() + INTERVAL '10 minutes')
            ORDER BY fixture_id
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| Ok(row_to_fixture(r)?)).collect()
    }

    /// Not-yet-started fixtures kicking off within the next `hours` hours.
    pub async fn fixtures_kicking_off_within(&self, hours: f64) -> Result<Vec<Fixture>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {FIXTURE_COLUMNS} FROM fixture
            WHERE status IN ('NS','TBD')
              AND kickoff BETWEEN now() AND now() + $1 * INTERVAL '1 hour'
            ORDER BY kickoff
            "#
        ))
        .bind(hours)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| Ok(row_to_fixture(r)?)).collect()
    }

    /// Finished fixtures whose end lies at least `delay_minutes` in the past
    /// and which have not been finalized yet.
    pub async fn fixtures_needing_finalization(&self, delay_minutes: f64) -> Result<Vec<Fixture>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {FIXTURE_COLUMNS} FROM fixture
            WHERE status IN {FINISHED_STATUSES}
              AND finalized_at IS NULL
              AND status_changed_at IS NOT NULL
              AND status_changed_at <= now() - $1 * INTERVAL '1 minute'
            ORDER BY status_changed_at
            "#
        ))
        .bind(delay_minutes)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| Ok(row_to_fixture(r)?)).collect()
    }

    // --- Read paths for the aggregator and catch-up ---

    pub async fn odds_ticks_between(
        &self,
        fixture_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OddsTick>> {
        let rows = sqlx::query(
            r#"
            SELECT fixture_id, bookmaker_id, market_id, outcome, instant, price, match_minute
            FROM live_odds_tick
            WHERE fixture_id = $1 AND instant >= $2 AND instant < $3
            ORDER BY instant ASC
            "#,
        )
        .bind(fixture_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| OddsTick {
                fixture_id: row.get("fixture_id"),
                bookmaker_id: row.get("bookmaker_id"),
                market_id: row.get("market_id"),
                outcome: row.get("outcome"),
                instant: row.get("instant"),
                price: row.get("price"),
                match_minute: row.get("match_minute"),
            })
            .collect())
    }

    pub async fn event_ticks_between(
        &self,
        fixture_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EventTick>> {
        let rows = sqlx::query(
            r#"
            SELECT fixture_id, instant, match_minute, extra_minute, kind, detail,
                   team_id, player_id, assist_id, comment
            FROM live_event_tick
            WHERE fixture_id = $1 AND instant >= $2 AND instant < $3
            ORDER BY instant ASC
            "#,
        )
        .bind(fixture_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| EventTick {
                fixture_id: row.get("fixture_id"),
                instant: row.get("instant"),
                match_minute: row.get("match_minute"),
                extra_minute: row.get("extra_minute"),
                kind: row.get("kind"),
                detail: row.get("detail"),
                team_id: row.get("team_id"),
                player_id: row.get("player_id"),
                assist_id: row.get("assist_id"),
                comment: row.get("comment"),
            })
            .collect())
    }

    pub async fn stat_ticks_between(
        &self,
        fixture_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StatTick>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM live_stat_tick
            WHERE fixture_id = $1 AND instant >= $2 AND instant < $3
            ORDER BY instant ASC
            "#,
        )
        .bind(fixture_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| StatTick {
                fixture_id: row.get("fixture_id"),
                team_id: row.get("team_id"),
                instant: row.get("instant"),
                shots_on_goal: row.get("shots_on_goal"),
                shots_off_goal: row.get("shots_off_goal"),
                total_shots: row.get("total_shots"),
                blocked_shots: row.get("blocked_shots"),
                shots_inside_box: row.get("shots_inside_box"),
                shots_outside_box: row.get("shots_outside_box"),
                possession_pct: row.get("possession_pct"),
                corners: row.get("corners"),
                offsides: row.get("offsides"),
                fouls: row.get("fouls"),
                yellow_cards: row.get("yellow_cards"),
                red_cards: row.get("red_cards"),
                goalkeeper_saves: row.get("goalkeeper_saves"),
                total_passes: row.get("total_passes"),
                passes_accurate: row.get("passes_accurate"),
                passes_pct: row.get("passes_pct"),
            })
            .collect())
    }

    /// Ticks of one kind since an instant, ascending, as wire-shaped JSON.
    /// Serves subscriber catch-up reads that reach past the in-memory ring.
    pub async fn latest_ticks(
        &self,
        fixture_id: i64,
        kind: PullKind,
        since: DateTime<Utc>,
    ) -> Result<serde_json::Value> {
        let far = DateTime::<Utc>::MAX_UTC;
        let value = match kind {
            PullKind::Odds => {
                serde_json::to_value(self.odds_ticks_between(fixture_id, since, far).await?)
            }
            PullKind::Events => {
                serde_json::to_value(self.event_ticks_between(fixture_id, since, far).await?)
            }
            PullKind::Stats => {
                serde_json::to_value(self.stat_ticks_between(fixture_id, since, far).await?)
            }
        };
        Ok(value.unwrap_or(serde_json::Value::Null))
    }

    /// Distinct fixtures with at least one odds or event tick in the window;
    /// the frame maker's work list.
    pub async fn active_fixtures_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT fixture_id FROM live_odds_tick
            WHERE instant >= $1 AND instant < $2
            UNION
            SELECT fixture_id FROM live_event_tick
            WHERE instant >= $1 AND instant < $2
            ORDER BY fixture_id
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("fixture_id")).collect())
    }

    /// Already-materialized frames for a fixture window, ascending.
    pub async fn frames(
        &self,
        fixture_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MatchLiveFrame>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM match_live_frame
            WHERE fixture_id = $1 AND bucket_start >= $2 AND bucket_start < $3
            ORDER BY bucket_start ASC
            "#,
        )
        .bind(fixture_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(MatchLiveFrame {
                    fixture_id: row.get("fixture_id"),
                    bucket_start: row.get("bucket_start"),
                    home_team_id: row.get("home_team_id"),
                    away_team_id: row.get("away_team_id"),
                    status: decode_status(&status)?,
                    elapsed: row.get("elapsed"),
                    home_goals: row.get("home_goals"),
                    away_goals: row.get("away_goals"),
                    avg_home_odd: row.get("avg_home_odd"),
                    avg_draw_odd: row.get("avg_draw_odd"),
                    avg_away_odd: row.get("avg_away_odd"),
                    home_odd_delta: row.get("home_odd_delta"),
                    away_odd_delta: row.get("away_odd_delta"),
                    goals_in_bucket: row.get("goals_in_bucket"),
                    cards_in_bucket: row.get("cards_in_bucket"),
                    subs_in_bucket: row.get("subs_in_bucket"),
                    odds_ticks_in_bucket: row.get("odds_ticks_in_bucket"),
                    event_ticks_in_bucket: row.get("event_ticks_in_bucket"),
                })
            })
            .collect()
    }

    /// Idempotent frame upsert, serialized per (fixture, bucket) with an
    /// advisory transaction lock.
    pub async fn upsert_frame(&self, frame: &MatchLiveFrame) -> Result<()> {
        self.retrying("upsert_frame", || {
            let pool = self.pool.clone();
            let frame = frame.clone();
            async move {
                let mut tx = pool.begin().await?;
                sqlx::query("SELECT pg_advisory_xact_lock($1)")
                    .bind(frame_lock_key(frame.fixture_id, frame.bucket_start))
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(
                    r#"
                    INSERT INTO match_live_frame
                        (fixture_id, bucket_start, home_team_id, away_team_id, status,
                         elapsed, home_goals, away_goals, avg_home_odd, avg_draw_odd,
                         avg_away_odd, home_odd_delta, away_odd_delta, goals_in_bucket,
                         cards_in_bucket, subs_in_bucket, odds_ticks_in_bucket,
                         event_ticks_in_bucket)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                            $11, $12, $13, $14, $15, $16, $17, $18)
                    ON CONFLICT (fixture_id, bucket_start) DO UPDATE SET
                        home_team_id = EXCLUDED.home_team_id,
                        away_team_id = EXCLUDED.away_team_id,
                        status = EXCLUDED.status,
                        elapsed = EXCLUDED.elapsed,
                        home_goals = EXCLUDED.home_goals,
                        away_goals = EXCLUDED.away_goals,
                        avg_home_odd = EXCLUDED.avg_home_odd,
                        avg_draw_odd = EXCLUDED.avg_draw_odd,
                        avg_away_odd = EXCLUDED.avg_away_odd,
                        home_odd_delta = EXCLUDED.home_odd_delta,
                        away_odd_delta = EXCLUDED.away_odd_delta,
                        goals_in_bucket = EXCLUDED.goals_in_bucket,
                        cards_in_bucket = EXCLUDED.cards_in_bucket,
                        subs_in_bucket = EXCLUDED.subs_in_bucket,
                        odds_ticks_in_bucket = EXCLUDED.odds_ticks_in_bucket,
                        event_ticks_in_bucket = EXCLUDED.event_ticks_in_bucket
                    "#,
                )
                .bind(frame.fixture_id)
                .bind(frame.bucket_start)
                .bind(frame.home_team_id)
                .bind(frame.away_team_id)
                .bind(frame.status.as_str())
                .bind(frame.elapsed)
                .bind(frame.home_goals)
                .bind(frame.away_goals)
                .bind(frame.avg_home_odd)
                .bind(frame.avg_draw_odd)
                .bind(frame.avg_away_odd)
                .bind(frame.home_odd_delta)
                .bind(frame.away_odd_delta)
                .bind(frame.goals_in_bucket)
                .bind(frame.cards_in_bucket)
                .bind(frame.subs_in_bucket)
                .bind(frame.odds_ticks_in_bucket)
                .bind(frame.event_ticks_in_bucket)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(())
            }
        })
        .await
    }

    // --- Job catalog ---

    pub async fn load_jobs(&self) -> Result<Vec<JobRow>> {
        let rows = sqlx::query(
            "SELECT name, kind, spec, queue, priority, enabled, soft_limit_secs, \
             hard_limit_secs, retries FROM job ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| JobRow {
                name: row.get("name"),
                kind: row.get("kind"),
                spec: row.get("spec"),
                queue: row.get("queue"),
                priority: row.get("priority"),
                enabled: row.get("enabled"),
                soft_limit_secs: row.get("soft_limit_secs"),
                hard_limit_secs: row.get("hard_limit_secs"),
                retries: row.get("retries"),
            })
            .collect())
    }

    /// Seed a catalog row if absent; existing operator edits win.
    pub async fn seed_job(&self, job: &JobRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job (name, kind, spec, queue, priority, enabled,
                             soft_limit_secs, hard_limit_secs, retries)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&job.name)
        .bind(&job.kind)
        .bind(&job.spec)
        .bind(&job.queue)
        .bind(job.priority)
        .bind(job.enabled)
        .bind(job.soft_limit_secs)
        .bind(job.hard_limit_secs)
        .bind(job.retries)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_job(
        &self,
        name: &str,
        enabled: Option<bool>,
        kind: Option<&str>,
        spec: Option<&str>,
    ) -> Result<Option<JobRow>> {
        let row = sqlx::query(
            r#"
            UPDATE job SET
                enabled = COALESCE($2, enabled),
                kind = COALESCE($3, kind),
                spec = COALESCE($4, spec),
                updated_at = now()
            WHERE name = $1
            RETURNING name, kind, spec, queue, priority, enabled,
                      soft_limit_secs, hard_limit_secs, retries
            "#,
        )
        .bind(name)
        .bind(enabled)
        .bind(kind)
        .bind(spec)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| JobRow {
            name: row.get("name"),
            kind: row.get("kind"),
            spec: row.get("spec"),
            queue: row.get("queue"),
            priority: row.get("priority"),
            enabled: row.get("enabled"),
            soft_limit_secs: row.get("soft_limit_secs"),
            hard_limit_secs: row.get("hard_limit_secs"),
            retries: row.get("retries"),
        }))
    }

    /// Cheap liveness probe for the health endpoint and the dependency
    /// watchdog.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn frame_lock_key(fixture_id: i64, bucket_start: DateTime<Utc>) -> i64 {
    fixture_id
        .wrapping_mul(1_000_003)
        .wrapping_add(bucket_start.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn frame_lock_key_distinguishes_buckets() {
        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 14, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(60);
        assert_ne!(frame_lock_key(1000, t0), frame_lock_key(1000, t1));
        assert_ne!(frame_lock_key(1000, t0), frame_lock_key(1001, t0));
    }

    #[test]
    fn transient_db_detection() {
        assert!(is_transient_db(&sqlx::Error::PoolTimedOut));
        assert!(is_transient_db(&sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))));
        assert!(!is_transient_db(&sqlx::Error::RowNotFound));
    }
}
