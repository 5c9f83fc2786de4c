pub mod ratelimit;
pub mod types;

use crate::error::{EngineError, Result};
use crate::metrics::Counters;
use crate::shared::types::{EventTick, Fixture, PrematchOdds, StatTick};
use chrono::{DateTime, NaiveDate, Utc};
use self::ratelimit::RateGovernor;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use self::types::{
    ApiEnvelope, LiveOddsBatch, RawEventEntry, RawFixtureEntry, RawOddsEntry, RawStatsEntry,
};

/// Upstream liveness markers read by the dependency-loss watchdog.
#[derive(Default)]
pub struct UpstreamHealth {
    pub last_attempt_ms: AtomicI64,
    pub last_success_ms: AtomicI64,
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_backoff: Duration,
}

/// Thin capability client over the provider's HTTP endpoints. Every attempt
/// is gated through the shared rate governor; the API key is sent as a
/// header and never logged.
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    governor: Arc<RateGovernor>,
    retry: RetryPolicy,
    counters: Arc<Counters>,
    pub health: UpstreamHealth,
}

impl UpstreamClient {
    pub fn new(
        base_url: String,
        api_key: String,
        request_timeout: Duration,
        governor: Arc<RateGovernor>,
        retry: RetryPolicy,
        counters: Arc<Counters>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| EngineError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            api_key,
            governor,
            retry,
            counters,
            health: UpstreamHealth::default(),
        })
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    async fn get_envelope<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<ApiEnvelope<T>> {
        let url = format!("{}{}", self.base_url, path);
        let mut backoff = self.retry.base_delay;
        let mut attempt = 0u32;
        let mut last_error = String::new();

        loop {
            attempt += 1;
            self.governor.acquire().await.map_err(|e| {
                Counters::bump(&self.counters.rate_stalled);
                e
            })?;
            Counters::bump(&self.counters.upstream_calls);
            self.health
                .last_attempt_ms
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

            let sent = self
                .http
                .get(&url)
                .header("x-apisports-key", &self.api_key)
                .query(params)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    last_error = e.to_string();
                    if attempt > self.retry.attempts {
                        break;
                    }
                    Counters::bump(&self.counters.upstream_retries);
                    debug!("upstream {} attempt {} failed: {}", path, attempt, last_error);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry.max_backoff);
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 {
                Counters::bump(&self.counters.upstream_backpressure_429);
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(backoff);
                last_error = "HTTP 429".to_string();
                if attempt > self.retry.attempts {
                    break;
                }
                warn!("upstream {} backpressure (429), sleeping {:?}", path, retry_after.max(backoff));
                tokio::time::sleep(retry_after.max(backoff)).await;
                backoff = (backoff * 2).min(self.retry.max_backoff);
                continue;
            }
            if status.is_client_error() {
                Counters::bump(&self.counters.upstream_rejected);
                let body = response.text().await.unwrap_or_default();
                return Err(EngineError::UpstreamRejected {
                    status: status.as_u16(),
                    body: truncate(&body, 512),
                });
            }
            if status.is_server_error() {
                last_error = format!("HTTP {}", status.as_u16());
                if attempt > self.retry.attempts {
                    break;
                }
                Counters::bump(&self.counters.upstream_retries);
                debug!("upstream {} attempt {}: {}", path, attempt, last_error);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.retry.max_backoff);
                continue;
            }

            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    last_error = e.to_string();
                    if attempt > self.retry.attempts {
                        break;
                    }
                    Counters::bump(&self.counters.upstream_retries);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry.max_backoff);
                    continue;
                }
            };

            return match serde_json::from_str::<ApiEnvelope<T>>(&body) {
                Ok(envelope) => {
                    self.health
                        .last_success_ms
                        .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                    Ok(envelope)
                }
                Err(e) => {
                    // Parse failures are not retried; capture a bounded head
                    // of the payload for the error log.
                    Counters::bump(&self.counters.upstream_malformed);
                    warn!("upstream {} malformed payload: {} ({})", path, e, truncate(&body, 256));
                    Err(EngineError::UpstreamMalformed { cause: e.to_string() })
                }
            };
        }

        Counters::bump(&self.counters.upstream_unavailable);
        Err(EngineError::UpstreamUnavailable {
            attempts: attempt,
            last_error,
        })
    }

    // --- Capabilities ---

    /// Fixtures scheduled on a date, following the provider's paging cursor.
    pub async fn fixtures_by_date(
        &self,
        date: NaiveDate,
        league: Option<i64>,
    ) -> Result<Vec<Fixture>> {
        let mut fixtures = Vec::new();
        let mut page = 1u32;
        loop {
            let mut params = vec![("date", date.format("%Y-%m-%d").to_string())];
            if let Some(league_id) = league {
                params.push(("league", league_id.to_string()));
            }
            if page > 1 {
                params.push(("page", page.to_string()));
            }
            let envelope: ApiEnvelope<RawFixtureEntry> =
                self.get_envelope("/fixtures", &params).await?;
            for entry in envelope.response {
                fixtures.push(types::normalize_fixture(entry)?);
            }
            match envelope.paging {
                Some(paging) if paging.current < paging.total => page = paging.current + 1,
                _ => break,
            }
        }
        Ok(fixtures)
    }

    /// Currently in-play fixtures with live score and elapsed minute.
    pub async fn fixtures_live(&self) -> Result<Vec<Fixture>> {
        let envelope: ApiEnvelope<RawFixtureEntry> = self
            .get_envelope("/fixtures", &[("live", "all".to_string())])
            .await?;
        envelope
            .response
            .into_iter()
            .map(types::normalize_fixture)
            .collect()
    }

    /// Current in-play odds for one fixture.
    pub async fn odds_live(
        &self,
        fixture_id: i64,
        observed_at: DateTime<Utc>,
        match_minute: Option<i32>,
    ) -> Result<LiveOddsBatch> {
        let envelope: ApiEnvelope<RawOddsEntry> = self
            .get_envelope("/odds/live", &[("fixture", fixture_id.to_string())])
            .await?;
        types::normalize_live_odds(envelope.response, fixture_id, observed_at, match_minute)
    }

    /// Prematch odds for one fixture, grouped by bookmaker and market.
    pub async fn odds_prematch(
        &self,
        fixture_id: i64,
        kickoff: DateTime<Utc>,
        sampled_at: DateTime<Utc>,
    ) -> Result<Vec<PrematchOdds>> {
        let envelope: ApiEnvelope<RawOddsEntry> = self
            .get_envelope("/odds", &[("fixture", fixture_id.to_string())])
            .await?;
        types::normalize_prematch_odds(envelope.response, fixture_id, kickoff, sampled_at)
    }

    /// Ordered in-match events for one fixture.
    pub async fn fixture_events(
        &self,
        fixture_id: i64,
        observed_at: DateTime<Utc>,
    ) -> Result<Vec<EventTick>> {
        let envelope: ApiEnvelope<RawEventEntry> = self
            .get_envelope("/fixtures/events", &[("fixture", fixture_id.to_string())])
            .await?;
        types::normalize_events(envelope.response, fixture_id, observed_at)
    }

    /// Per-team cumulative statistics for one fixture.
    pub async fn fixture_statistics(
        &self,
        fixture_id: i64,
        observed_at: DateTime<Utc>,
    ) -> Result<Vec<StatTick>> {
        let envelope: ApiEnvelope<RawStatsEntry> = self
            .get_envelope("/fixtures/statistics", &[("fixture", fixture_id.to_string())])
            .await?;
        types::normalize_stats(envelope.response, fixture_id, observed_at)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 512), "short");
        let long = "é".repeat(300);
        let cut = truncate(&long, 256);
        assert!(cut.len() <= 256 + '…'.len_utf8());
        assert!(cut.ends_with('…'));
    }
}
