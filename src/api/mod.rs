//! Minimal operator surface: job catalog management, runtime settings and
//! the health probe.

use crate::metrics::{Counters, LagPercentiles};
use crate::shared::types::JobRow;
use crate::upstream::ratelimit::RateBudget;
use crate::EngineState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub fn routes() -> Router<Arc<EngineState>> {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:name", patch(update_job))
        .route("/settings", get(get_settings))
        .route("/settings/leagues", put(put_leagues))
        .route("/settings/intervals", put(put_intervals))
}

#[derive(Serialize)]
struct PoolHealth {
    size: u32,
    idle: usize,
    max: u32,
    utilization_pct: u32,
}

#[derive(Serialize)]
struct QueueHealth {
    name: &'static str,
    depth: usize,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    db_reachable: bool,
    pool: PoolHealth,
    rate_budget: RateBudget,
    queues: Vec<QueueHealth>,
    ingestion_lag: LagPercentiles,
    subscribers: usize,
    fixtures_closed: u64,
    validation_dropped: u64,
    late_ticks_dropped: u64,
    frames_lag_seconds: u64,
}

async fn health(State(state): State<Arc<EngineState>>) -> Json<HealthResponse> {
    let db_reachable = tokio::time::timeout(Duration::from_secs(2), state.store.ping())
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);

    let pool = state.store.pool();
    let size = pool.size();
    let idle = pool.num_idle();
    let max = state.config.pool_max_connections;
    let busy = size.saturating_sub(idle as u32);
    let utilization_pct = if max == 0 { 0 } else { busy * 100 / max };

    let rate_budget = state.upstream.governor().budget();
    let status = if !db_reachable {
        "down"
    } else if rate_budget.day_remaining == 0 || utilization_pct > 90 {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        db_reachable,
        pool: PoolHealth {
            size,
            idle,
            max,
            utilization_pct,
        },
        rate_budget,
        queues: state
            .scheduler
            .queue_depths()
            .into_iter()
            .map(|(name, depth)| QueueHealth { name, depth })
            .collect(),
        ingestion_lag: state.ingest.lag.percentiles(),
        subscribers: state.bridge.subscriber_count(),
        fixtures_closed: Counters::get(&state.counters.fixtures_closed),
        validation_dropped: Counters::get(&state.counters.validation_dropped),
        late_ticks_dropped: Counters::get(&state.counters.late_ticks_dropped),
        frames_lag_seconds: Counters::get(&state.counters.frames_lag_seconds),
    })
}

#[derive(Serialize)]
struct JobsResponse {
    jobs: Vec<JobRow>,
    recent_runs: Vec<crate::sched::JobRun>,
}

async fn list_jobs(State(state): State<Arc<EngineState>>) -> Json<JobsResponse> {
    Json(JobsResponse {
        jobs: state.scheduler.jobs(),
        recent_runs: state.scheduler.recent_runs(),
    })
}

#[derive(Deserialize)]
struct JobPatch {
    enabled: Option<bool>,
    kind: Option<String>,
    spec: Option<String>,
}

async fn update_job(
    State(state): State<Arc<EngineState>>,
    Path(name): Path<String>,
    Json(patch): Json<JobPatch>,
) -> Result<Json<JobRow>, (StatusCode, String)> {
    // Validate the effective schedule before persisting anything.
    let current = state
        .scheduler
        .jobs()
        .into_iter()
        .find(|job| job.name == name)
        .ok_or((StatusCode::NOT_FOUND, format!("no job named '{name}'")))?;
    let kind = patch.kind.clone().unwrap_or_else(|| current.kind.clone());
    let spec = patch.spec.clone().unwrap_or_else(|| current.spec.clone());
    crate::sched::Schedule::parse(&kind, &spec)
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    let updated = state
        .store
        .update_job(
            &name,
            patch.enabled,
            patch.kind.as_deref(),
            patch.spec.as_deref(),
        )
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or((StatusCode::NOT_FOUND, format!("no job named '{name}'")))?;
    state
        .scheduler
        .apply_row(updated.clone())
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    Ok(Json(updated))
}

#[derive(Serialize)]
struct SettingsResponse {
    enabled_leagues: Option<Vec<i64>>,
    odds_interval_secs: u64,
    events_interval_secs: u64,
    stats_interval_secs: u64,
}

async fn get_settings(State(state): State<Arc<EngineState>>) -> Json<SettingsResponse> {
    let snapshot = state.settings.snapshot();
    let mut leagues: Option<Vec<i64>> = snapshot
        .enabled_leagues
        .as_ref()
        .map(|set| set.iter().copied().collect());
    if let Some(list) = leagues.as_mut() {
        list.sort_unstable();
    }
    Json(SettingsResponse {
        enabled_leagues: leagues,
        odds_interval_secs: snapshot.intervals.odds.as_secs(),
        events_interval_secs: snapshot.intervals.events.as_secs(),
        stats_interval_secs: snapshot.intervals.stats.as_secs(),
    })
}

#[derive(Deserialize)]
struct LeaguesBody {
    /// `null` enables every league; a list narrows ingestion.
    leagues: Option<Vec<i64>>,
}

async fn put_leagues(
    State(state): State<Arc<EngineState>>,
    Json(body): Json<LeaguesBody>,
) -> StatusCode {
    let set: Option<HashSet<i64>> = body.leagues.map(|list| list.into_iter().collect());
    state.settings.update(|settings| {
        settings.enabled_leagues = set.clone();
    });
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct IntervalsBody {
    odds_secs: Option<u64>,
    events_secs: Option<u64>,
    stats_secs: Option<u64>,
}

async fn put_intervals(
    State(state): State<Arc<EngineState>>,
    Json(body): Json<IntervalsBody>,
) -> Result<StatusCode, (StatusCode, String)> {
    for value in [body.odds_secs, body.events_secs, body.stats_secs].into_iter().flatten() {
        if value == 0 {
            return Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                "intervals must be at least 1 second".into(),
            ));
        }
    }
    state.settings.update(|settings| {
        if let Some(secs) = body.odds_secs {
            settings.intervals.odds = Duration::from_secs(secs);
        }
        if let Some(secs) = body.events_secs {
            settings.intervals.events = Duration::from_secs(secs);
        }
        if let Some(secs) = body.stats_secs {
            settings.intervals.stats = Duration::from_secs(secs);
        }
    });
    Ok(StatusCode::NO_CONTENT)
}
