//! Job bodies. Each body is a thin orchestration over the components; the
//! dispatcher owns timeouts, retries and run bookkeeping.

use super::JobContext;
use crate::error::{EngineError, Result};
use crate::shared::types::Fixture;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};

/// Fixture refresh horizon for the 6-hourly poll.
const POLL_HORIZON_DAYS: i64 = 7;
/// Wider horizon for the weekly dimension refresh.
const REFRESH_HORIZON_DAYS: i64 = 14;
/// Prematch capture window before kickoff.
const PREMATCH_WINDOW_HOURS: f64 = 24.0;
/// Final pulls run this long after a fixture finishes.
const FINALIZE_DELAY_MINUTES: f64 = 30.0;

pub async fn execute(ctx: &JobContext, job_name: &str) -> Result<()> {
    match job_name {
        "fixture_poll" => fixture_poll(ctx, POLL_HORIZON_DAYS).await,
        "live_trigger" => ctx.ingest.run_trigger().await,
        "prematch_snapshot" => prematch_snapshot(ctx).await,
        "frame_maker" => ctx.frames.run_cycle().await,
        "finalizer" => finalizer(ctx).await,
        "weekly_refresh" => fixture_poll(ctx, REFRESH_HORIZON_DAYS).await,
        "retention_maintenance" => ctx.store.apply_retention().await.map(|_| ()),
        other => Err(EngineError::Config(format!("unknown job '{other}'"))),
    }
}

/// Refresh upcoming fixtures (and their league/team/venue attributes) over
/// the horizon. Also the body of `weekly_refresh`, which just reaches
/// further out.
async fn fixture_poll(ctx: &JobContext, horizon_days: i64) -> Result<()> {
    let settings = ctx.settings.snapshot();
    let today = Utc::now().date_naive();
    let mut kept = 0usize;
    for offset in 0..horizon_days {
        let date = today + ChronoDuration::days(offset);
        let fixtures = ctx.upstream.fixtures_by_date(date, None).await?;
        let keep: Vec<Fixture> = fixtures
            .into_iter()
            .filter(|f| settings.league_enabled(f.league_id))
            .collect();
        kept += keep.len();
        ctx.store.upsert_fixtures(&keep).await?;
    }
    info!("fixture poll upserted {} fixtures over {} days", kept, horizon_days);
    Ok(())
}

/// For fixtures kicking off within the capture window, snapshot one price
/// per (bookmaker, market, outcome). Per-fixture failures are absorbed so
/// one bad fixture never starves the rest.
async fn prematch_snapshot(ctx: &JobContext) -> Result<()> {
    let settings = ctx.settings.snapshot();
    let fixtures: Vec<Fixture> = ctx
        .store
        .fixtures_kicking_off_within(PREMATCH_WINDOW_HOURS)
        .await?
        .into_iter()
        .filter(|f| settings.league_enabled(f.league_id))
        .collect();

    let sampled_at = Utc::now();
    let mut rows_written = 0u64;
    for fixture in &fixtures {
        match ctx
            .upstream
            .odds_prematch(fixture.fixture_id, fixture.kickoff, sampled_at)
            .await
        {
            Ok(rows) => {
                rows_written += ctx.store.snapshot_prematch_odds(&rows).await?;
            }
            Err(e) => warn!(
                "prematch snapshot for fixture {} skipped: {}",
                fixture.fixture_id, e
            ),
        }
    }
    info!(
        "prematch snapshot: {} fixtures, {} rows",
        fixtures.len(),
        rows_written
    );
    Ok(())
}

/// One-shot final pull for fixtures that finished half an hour ago: fetch
/// the closing event and stat payloads for the record, then stamp the
/// fixture as finalized. Tick tables are not touched; a terminal fixture
/// receives no further ticks.
async fn finalizer(ctx: &JobContext) -> Result<()> {
    let fixtures = ctx
        .store
        .fixtures_needing_finalization(FINALIZE_DELAY_MINUTES)
        .await?;
    for fixture in &fixtures {
        let observed_at = Utc::now();
        let events = match ctx
            .upstream
            .fixture_events(fixture.fixture_id, observed_at)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                warn!("final event pull for {} failed: {}", fixture.fixture_id, e);
                continue;
            }
        };
        let stats = match ctx
            .upstream
            .fixture_statistics(fixture.fixture_id, observed_at)
            .await
        {
            Ok(stats) => stats,
            Err(e) => {
                warn!("final stat pull for {} failed: {}", fixture.fixture_id, e);
                continue;
            }
        };
        info!(
            "fixture {} finalized ({} events, {} team stat rows)",
            fixture.fixture_id,
            events.len(),
            stats.len()
        );
        ctx.store.mark_finalized(fixture.fixture_id).await?;
    }
    Ok(())
}
