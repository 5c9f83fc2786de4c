//! DDL for the durable state of the pipeline: dimension-ish fixture rows,
//! the three time-partitioned tick streams, prematch snapshots, the derived
//! per-minute frame table and the job catalog.

/// Plain-Postgres DDL; must succeed.
pub const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS fixture (
        fixture_id      BIGINT PRIMARY KEY,
        kickoff         TIMESTAMPTZ NOT NULL,
        league_id       BIGINT NOT NULL,
        season          INT NOT NULL,
        round           TEXT,
        venue           TEXT,
        home_team_id    BIGINT NOT NULL,
        home_team       TEXT NOT NULL,
        away_team_id    BIGINT NOT NULL,
        away_team       TEXT NOT NULL,
        status          TEXT NOT NULL,
        elapsed         INT,
        home_goals      INT,
        away_goals      INT,
        ht_home_goals   INT,
        ht_away_goals   INT,
        et_home_goals   INT,
        et_away_goals   INT,
        pen_home_goals  INT,
        pen_away_goals  INT,
        status_changed_at TIMESTAMPTZ,
        finalized_at    TIMESTAMPTZ,
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS fixture_status_idx ON fixture (status)",
    "CREATE INDEX IF NOT EXISTS fixture_kickoff_idx ON fixture (kickoff)",
    r#"
    CREATE TABLE IF NOT EXISTS live_odds_tick (
        fixture_id    BIGINT NOT NULL,
        bookmaker_id  BIGINT NOT NULL,
        market_id     BIGINT NOT NULL,
        outcome       TEXT NOT NULL,
        instant       TIMESTAMPTZ NOT NULL,
        price         DOUBLE PRECISION NOT NULL CHECK (price > 0),
        match_minute  INT
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS live_odds_tick_key
        ON live_odds_tick (fixture_id, bookmaker_id, market_id, outcome, instant)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS live_event_tick (
        fixture_id    BIGINT NOT NULL,
        instant       TIMESTAMPTZ NOT NULL,
        match_minute  INT,
        extra_minute  INT,
        kind          TEXT NOT NULL,
        detail        TEXT NOT NULL,
        team_id       BIGINT,
        player_id     BIGINT,
        assist_id     BIGINT,
        comment       TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS live_event_tick_fixture_idx ON live_event_tick (fixture_id, instant)",
    r#"
    CREATE TABLE IF NOT EXISTS live_stat_tick (
        fixture_id        BIGINT NOT NULL,
        team_id           BIGINT NOT NULL,
        instant           TIMESTAMPTZ NOT NULL,
        shots_on_goal     INT,
        shots_off_goal    INT,
        total_shots       INT,
        blocked_shots     INT,
        shots_inside_box  INT,
        shots_outside_box INT,
        possession_pct    DOUBLE PRECISION CHECK (possession_pct BETWEEN 0 AND 100),
        corners           INT,
        offsides          INT,
        fouls             INT,
        yellow_cards      INT,
        red_cards         INT,
        goalkeeper_saves  INT,
        total_passes      INT,
        passes_accurate   INT,
        passes_pct        DOUBLE PRECISION
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS live_stat_tick_key
        ON live_stat_tick (fixture_id, team_id, instant)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS prematch_odds (
        fixture_id          BIGINT NOT NULL,
        bookmaker_id        BIGINT NOT NULL,
        market_id           BIGINT NOT NULL,
        outcome             TEXT NOT NULL,
        sampled_at          TIMESTAMPTZ NOT NULL,
        price               DOUBLE PRECISION NOT NULL CHECK (price > 0),
        hours_before_match  DOUBLE PRECISION NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS prematch_odds_key
        ON prematch_odds (fixture_id, bookmaker_id, market_id, outcome, sampled_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS match_live_frame (
        fixture_id            BIGINT NOT NULL,
        bucket_start          TIMESTAMPTZ NOT NULL,
        home_team_id          BIGINT NOT NULL,
        away_team_id          BIGINT NOT NULL,
        status                TEXT NOT NULL,
        elapsed               INT,
        home_goals            INT NOT NULL,
        away_goals            INT NOT NULL,
        avg_home_odd          DOUBLE PRECISION,
        avg_draw_odd          DOUBLE PRECISION,
        avg_away_odd          DOUBLE PRECISION,
        home_odd_delta        DOUBLE PRECISION,
        away_odd_delta        DOUBLE PRECISION,
        goals_in_bucket       INT NOT NULL,
        cards_in_bucket       INT NOT NULL,
        subs_in_bucket        INT NOT NULL,
        odds_ticks_in_bucket  INT NOT NULL,
        event_ticks_in_bucket INT NOT NULL,
        PRIMARY KEY (fixture_id, bucket_start)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job (
        name             TEXT PRIMARY KEY,
        kind             TEXT NOT NULL,
        spec             TEXT NOT NULL,
        queue            TEXT NOT NULL,
        priority         INT NOT NULL DEFAULT 0,
        enabled          BOOLEAN NOT NULL DEFAULT TRUE,
        soft_limit_secs  INT NOT NULL,
        hard_limit_secs  INT NOT NULL,
        retries          INT NOT NULL DEFAULT 0,
        updated_at       TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

/// TimescaleDB layer: hypertables and compression settings. Applied
/// best-effort so the engine still runs against plain Postgres (chunks then
/// simply never compress and retention falls back to row deletes).
pub const TIMESCALE: &[&str] = &[
    "SELECT create_hypertable('live_odds_tick', 'instant', if_not_exists => TRUE, migrate_data => TRUE)",
    "SELECT create_hypertable('live_event_tick', 'instant', if_not_exists => TRUE, migrate_data => TRUE)",
    "SELECT create_hypertable('live_stat_tick', 'instant', if_not_exists => TRUE, migrate_data => TRUE)",
    r#"
    ALTER TABLE live_odds_tick SET (
        timescaledb.compress,
        timescaledb.compress_segmentby = 'fixture_id, bookmaker_id, market_id',
        timescaledb.compress_orderby = 'instant DESC'
    )
    "#,
    r#"
    ALTER TABLE live_event_tick SET (
        timescaledb.compress,
        timescaledb.compress_segmentby = 'fixture_id',
        timescaledb.compress_orderby = 'instant DESC'
    )
    "#,
    r#"
    ALTER TABLE live_stat_tick SET (
        timescaledb.compress,
        timescaledb.compress_segmentby = 'fixture_id, team_id',
        timescaledb.compress_orderby = 'instant DESC'
    )
    "#,
];

/// Retention horizons per table, applied by the maintenance job (the write
/// path never deletes).
pub struct RetentionPolicy {
    pub table: &'static str,
    pub compress_after_days: Option<u32>,
    pub delete_after_days: u32,
}

pub const RETENTION: &[RetentionPolicy] = &[
    RetentionPolicy { table: "live_odds_tick", compress_after_days: Some(7), delete_after_days: 30 },
    RetentionPolicy { table: "live_event_tick", compress_after_days: Some(7), delete_after_days: 90 },
    RetentionPolicy { table: "live_stat_tick", compress_after_days: Some(7), delete_after_days: 60 },
    RetentionPolicy { table: "match_live_frame", compress_after_days: None, delete_after_days: 90 },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_matches_declared_horizons() {
        let odds = RETENTION.iter().find(|p| p.table == "live_odds_tick").unwrap();
        assert_eq!(odds.compress_after_days, Some(7));
        assert_eq!(odds.delete_after_days, 30);
        let events = RETENTION.iter().find(|p| p.table == "live_event_tick").unwrap();
        assert_eq!(events.delete_after_days, 90);
        let stats = RETENTION.iter().find(|p| p.table == "live_stat_tick").unwrap();
        assert_eq!(stats.delete_after_days, 60);
        let frames = RETENTION.iter().find(|p| p.table == "match_live_frame").unwrap();
        assert_eq!(frames.compress_after_days, None);
        assert_eq!(frames.delete_after_days, 90);
    }

    #[test]
    fn every_tick_table_has_a_policy() {
        for table in ["live_odds_tick", "live_event_tick", "live_stat_tick"] {
            assert!(RETENTION.iter().any(|p| p.table == table));
        }
    }
}
