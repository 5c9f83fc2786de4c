use crate::error::{EngineError, Result};
use crate::shared::types::{
    EventTick, Fixture, FixtureStatus, OddsTick, PrematchOdds, StatTick,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Provider market id of the 1X2 (match winner) market.
pub const MARKET_MATCH_WINNER: i64 = 1;

// --- Raw payload shapes ---
//
// Tagged per-endpoint structs with mandatory fields validated at parse time.
// Unknown fields are ignored; nothing upstream-shaped crosses this module's
// boundary.

#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default = "Vec::new")]
    pub response: Vec<T>,
    pub paging: Option<Paging>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Paging {
    pub current: u32,
    pub total: u32,
}

#[derive(Debug, Deserialize)]
pub struct RawFixtureEntry {
    pub fixture: RawFixtureCore,
    pub league: RawLeague,
    pub teams: RawTeams,
    #[serde(default)]
    pub goals: RawGoalPair,
    pub score: Option<RawScore>,
}

#[derive(Debug, Deserialize)]
pub struct RawFixtureCore {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub venue: Option<RawVenue>,
    pub status: RawStatus,
}

#[derive(Debug, Deserialize)]
pub struct RawVenue {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawStatus {
    pub short: String,
    pub elapsed: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct RawLeague {
    pub id: i64,
    pub season: i32,
    pub round: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawTeams {
    pub home: RawTeam,
    pub away: RawTeam,
}

#[derive(Debug, Deserialize)]
pub struct RawTeam {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawGoalPair {
    pub home: Option<i32>,
    pub away: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct RawScore {
    #[serde(default)]
    pub halftime: RawGoalPair,
    #[serde(default)]
    pub extratime: RawGoalPair,
    #[serde(default)]
    pub penalty: RawGoalPair,
}

#[derive(Debug, Deserialize)]
pub struct RawOddsEntry {
    pub fixture: Option<RawFixtureRef>,
    #[serde(default)]
    pub update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bookmakers: Vec<RawBookmaker>,
}

#[derive(Debug, Deserialize)]
pub struct RawFixtureRef {
    pub id: i64,
    pub status: Option<RawStatus>,
}

#[derive(Debug, Deserialize)]
pub struct RawBookmaker {
    pub id: i64,
    pub name: Option<String>,
    #[serde(default)]
    pub bets: Vec<RawBet>,
}

#[derive(Debug, Deserialize)]
pub struct RawBet {
    pub id: i64,
    pub name: Option<String>,
    #[serde(default)]
    pub values: Vec<RawQuote>,
}

#[derive(Debug, Deserialize)]
pub struct RawQuote {
    /// Outcome label; the provider mixes strings and numbers here.
    pub value: serde_json::Value,
    /// Decimal price, sent as a string.
    pub odd: String,
}

#[derive(Debug, Deserialize)]
pub struct RawEventEntry {
    pub time: RawEventTime,
    pub team: Option<RawTeamRef>,
    pub player: Option<RawPersonRef>,
    pub assist: Option<RawPersonRef>,
    #[serde(rename = "type")]
    pub kind: String,
    pub detail: Option<String>,
    pub comments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawEventTime {
    pub elapsed: Option<i32>,
    pub extra: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct RawTeamRef {
    pub id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RawPersonRef {
    pub id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RawStatsEntry {
    pub team: RawTeam,
    #[serde(default)]
    pub statistics: Vec<RawStatLine>,
}

#[derive(Debug, Deserialize)]
pub struct RawStatLine {
    #[serde(rename = "type")]
    pub name: String,
    pub value: serde_json::Value,
}

// --- Normalization ---

fn malformed(cause: impl Into<String>) -> EngineError {
    EngineError::UpstreamMalformed { cause: cause.into() }
}

fn parse_status(short: &str) -> Result<FixtureStatus> {
    FixtureStatus::parse(short)
        .ok_or_else(|| malformed(format!("unknown fixture status '{short}'")))
}

fn parse_price(odd: &str) -> Result<f64> {
    odd.parse::<f64>()
        .map_err(|_| malformed(format!("unparseable price '{odd}'")))
}

/// Outcome labels for the 1X2 market are normalized to "1"/"X"/"2"; other
/// markets keep the provider label (handicap lines, totals, ...).
fn outcome_label(market_id: i64, value: &serde_json::Value) -> String {
    let label = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if market_id == MARKET_MATCH_WINNER {
        match label.as_str() {
            "Home" => return "1".to_string(),
            "Draw" => return "X".to_string(),
            "Away" => return "2".to_string(),
            _ => {}
        }
    }
    label
}

pub fn normalize_fixture(entry: RawFixtureEntry) -> Result<Fixture> {
    let status = parse_status(&entry.fixture.status.short)?;
    let score = entry.score;
    Ok(Fixture {
        fixture_id: entry.fixture.id,
        kickoff: entry.fixture.date,
        league_id: entry.league.id,
        season: entry.league.season,
        round: entry.league.round,
        venue: entry.fixture.venue.and_then(|v| v.name),
        home_team_id: entry.teams.home.id,
        home_team: entry.teams.home.name,
        away_team_id: entry.teams.away.id,
        away_team: entry.teams.away.name,
        status,
        elapsed: entry.fixture.status.elapsed,
        home_goals: entry.goals.home,
        away_goals: entry.goals.away,
        ht_home_goals: score.as_ref().and_then(|s| s.halftime.home),
        ht_away_goals: score.as_ref().and_then(|s| s.halftime.away),
        et_home_goals: score.as_ref().and_then(|s| s.extratime.home),
        et_away_goals: score.as_ref().and_then(|s| s.extratime.away),
        pen_home_goals: score.as_ref().and_then(|s| s.penalty.home),
        pen_away_goals: score.as_ref().and_then(|s| s.penalty.away),
        status_changed_at: None,
        finalized_at: None,
    })
}

/// Outcome of normalizing a live odds payload: the ticks plus any status
/// evidence the payload carried about the fixture itself.
#[derive(Debug)]
pub struct LiveOddsBatch {
    pub ticks: Vec<OddsTick>,
    pub status_evidence: Option<FixtureStatus>,
}

pub fn normalize_live_odds(
    entries: Vec<RawOddsEntry>,
    fixture_id: i64,
    observed_at: DateTime<Utc>,
    match_minute: Option<i32>,
) -> Result<LiveOddsBatch> {
    let mut ticks = Vec::new();
    let mut status_evidence = None;

    for entry in entries {
        if let Some(fixture) = &entry.fixture {
            if fixture.id != fixture_id {
                continue;
            }
            if let Some(status) = &fixture.status {
                status_evidence = Some(parse_status(&status.short)?);
            }
        }
        let instant = entry.update.unwrap_or(observed_at);
        for bookmaker in entry.bookmakers {
            for bet in bookmaker.bets {
                for quote in bet.values {
                    ticks.push(OddsTick {
                        fixture_id,
                        bookmaker_id: bookmaker.id,
                        market_id: bet.id,
                        outcome: outcome_label(bet.id, &quote.value),
                        instant,
                        price: parse_price(&quote.odd)?,
                        match_minute,
                    });
                }
            }
        }
    }

    // Natural-key order within the batch; never reordered downstream.
    ticks.sort_by(|a, b| {
        (a.bookmaker_id, a.market_id, a.outcome.as_str(), a.instant)
            .cmp(&(b.bookmaker_id, b.market_id, b.outcome.as_str(), b.instant))
    });

    Ok(LiveOddsBatch { ticks, status_evidence })
}

pub fn normalize_prematch_odds(
    entries: Vec<RawOddsEntry>,
    fixture_id: i64,
    kickoff: DateTime<Utc>,
    sampled_at: DateTime<Utc>,
) -> Result<Vec<PrematchOdds>> {
    let hours_before_match =
        (kickoff - sampled_at).num_milliseconds() as f64 / 3_600_000.0;
    let mut rows = Vec::new();
    for entry in entries {
        if let Some(fixture) = &entry.fixture {
            if fixture.id != fixture_id {
                continue;
            }
        }
        for bookmaker in entry.bookmakers {
            for bet in bookmaker.bets {
                for quote in bet.values {
                    rows.push(PrematchOdds {
                        fixture_id,
                        bookmaker_id: bookmaker.id,
                        market_id: bet.id,
                        outcome: outcome_label(bet.id, &quote.value),
                        sampled_at,
                        price: parse_price(&quote.odd)?,
                        hours_before_match,
                    });
                }
            }
        }
    }
    Ok(rows)
}

pub fn normalize_events(
    entries: Vec<RawEventEntry>,
    fixture_id: i64,
    observed_at: DateTime<Utc>,
) -> Result<Vec<EventTick>> {
    entries
        .into_iter()
        .map(|entry| {
            if entry.kind.is_empty() {
                return Err(malformed("event with empty type"));
            }
            Ok(EventTick {
                fixture_id,
                instant: observed_at,
                match_minute: entry.time.elapsed,
                extra_minute: entry.time.extra,
                kind: entry.kind,
                detail: entry.detail.unwrap_or_default(),
                team_id: entry.team.and_then(|t| t.id),
                player_id: entry.player.and_then(|p| p.id),
                assist_id: entry.assist.and_then(|p| p.id),
                comment: entry.comments,
            })
        })
        .collect()
}

fn stat_int(value: &serde_json::Value) -> Option<i32> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().map(|v| v as i32),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn stat_pct(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    }
}

pub fn normalize_stats(
    entries: Vec<RawStatsEntry>,
    fixture_id: i64,
    observed_at: DateTime<Utc>,
) -> Result<Vec<StatTick>> {
    entries
        .into_iter()
        .map(|entry| {
            let mut tick = StatTick {
                fixture_id,
                team_id: entry.team.id,
                instant: observed_at,
                shots_on_goal: None,
                shots_off_goal: None,
                total_shots: None,
                blocked_shots: None,
                shots_inside_box: None,
                shots_outside_box: None,
                possession_pct: None,
                corners: None,
                offsides: None,
                fouls: None,
                yellow_cards: None,
                red_cards: None,
                goalkeeper_saves: None,
                total_passes: None,
                passes_accurate: None,
                passes_pct: None,
            };
            for line in entry.statistics {
                match line.name.as_str() {
                    "Shots on Goal" => tick.shots_on_goal = stat_int(&line.value),
                    "Shots off Goal" => tick.shots_off_goal = stat_int(&line.value),
                    "Total Shots" => tick.total_shots = stat_int(&line.value),
                    "Blocked Shots" => tick.blocked_shots = stat_int(&line.value),
                    "Shots insidebox" => tick.shots_inside_box = stat_int(&line.value),
                    "Shots outsidebox" => tick.shots_outside_box = stat_int(&line.value),
                    "Ball Possession" => tick.possession_pct = stat_pct(&line.value),
                    "Corner Kicks" => tick.corners = stat_int(&line.value),
                    "Offsides" => tick.offsides = stat_int(&line.value),
                    "Fouls" => tick.fouls = stat_int(&line.value),
                    "Yellow Cards" => tick.yellow_cards = stat_int(&line.value),
                    "Red Cards" => tick.red_cards = stat_int(&line.value),
                    "Goalkeeper Saves" => tick.goalkeeper_saves = stat_int(&line.value),
                    "Total passes" => tick.total_passes = stat_int(&line.value),
                    "Passes accurate" => tick.passes_accurate = stat_int(&line.value),
                    "Passes %" => tick.passes_pct = stat_pct(&line.value),
                    _ => {}
                }
            }
            Ok(tick)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quote(value: serde_json::Value, odd: &str) -> RawQuote {
        RawQuote { value, odd: odd.to_string() }
    }

    #[test]
    fn fixture_normalizes_with_scores() {
        let raw: RawFixtureEntry = serde_json::from_value(json!({
            "fixture": {
                "id": 1000,
                "date": "2026-08-01T14:00:00+00:00",
                "venue": {"name": "Anfield"},
                "status": {"short": "1H", "elapsed": 23}
            },
            "league": {"id": 39, "season": 2026, "round": "Regular Season - 1"},
            "teams": {
                "home": {"id": 40, "name": "Liverpool"},
                "away": {"id": 33, "name": "Manchester United"}
            },
            "goals": {"home": 1, "away": 0},
            "score": {"halftime": {"home": 1, "away": 0}},
            "unknown_field": {"ignored": true}
        }))
        .unwrap();
        let fixture = normalize_fixture(raw).unwrap();
        assert_eq!(fixture.fixture_id, 1000);
        assert_eq!(fixture.status, FixtureStatus::FirstHalf);
        assert_eq!(fixture.elapsed, Some(23));
        assert_eq!(fixture.home_goals, Some(1));
        assert_eq!(fixture.ht_home_goals, Some(1));
        assert_eq!(fixture.venue.as_deref(), Some("Anfield"));
    }

    #[test]
    fn fixture_with_unknown_status_is_malformed() {
        let raw: RawFixtureEntry = serde_json::from_value(json!({
            "fixture": {
                "id": 1,
                "date": "2026-08-01T14:00:00Z",
                "status": {"short": "XX", "elapsed": null}
            },
            "league": {"id": 39, "season": 2026},
            "teams": {"home": {"id": 1, "name": "A"}, "away": {"id": 2, "name": "B"}}
        }))
        .unwrap();
        assert!(matches!(
            normalize_fixture(raw),
            Err(EngineError::UpstreamMalformed { .. })
        ));
    }

    #[test]
    fn live_odds_normalize_single_quote() {
        // Scenario S1 payload shape: bookmaker 8, market 1, outcome "1",
        // price 2.10.
        let observed = Utc::now();
        let entry = RawOddsEntry {
            fixture: Some(RawFixtureRef {
                id: 1000,
                status: Some(RawStatus { short: "1H".into(), elapsed: Some(12) }),
            }),
            update: None,
            bookmakers: vec![RawBookmaker {
                id: 8,
                name: Some("Bet365".into()),
                bets: vec![RawBet {
                    id: MARKET_MATCH_WINNER,
                    name: Some("Match Winner".into()),
                    values: vec![quote(json!("Home"), "2.10")],
                }],
            }],
        };
        let batch = normalize_live_odds(vec![entry], 1000, observed, Some(12)).unwrap();
        assert_eq!(batch.ticks.len(), 1);
        let tick = &batch.ticks[0];
        assert_eq!(tick.bookmaker_id, 8);
        assert_eq!(tick.market_id, 1);
        assert_eq!(tick.outcome, "1");
        assert_eq!(tick.price, 2.10);
        assert_eq!(tick.instant, observed);
        assert_eq!(batch.status_evidence, Some(FixtureStatus::FirstHalf));
    }

    #[test]
    fn live_odds_prefer_provider_update_instant() {
        let observed = Utc::now();
        let update = observed - chrono::Duration::seconds(3);
        let entry = RawOddsEntry {
            fixture: Some(RawFixtureRef { id: 7, status: None }),
            update: Some(update),
            bookmakers: vec![RawBookmaker {
                id: 2,
                name: None,
                bets: vec![RawBet {
                    id: 5,
                    name: None,
                    values: vec![quote(json!("Over 2.5"), "1.85")],
                }],
            }],
        };
        let batch = normalize_live_odds(vec![entry], 7, observed, None).unwrap();
        assert_eq!(batch.ticks[0].instant, update);
        // Non-1X2 markets keep the provider outcome label.
        assert_eq!(batch.ticks[0].outcome, "Over 2.5");
    }

    #[test]
    fn live_odds_bad_price_is_malformed() {
        let entry = RawOddsEntry {
            fixture: None,
            update: None,
            bookmakers: vec![RawBookmaker {
                id: 1,
                name: None,
                bets: vec![RawBet {
                    id: 1,
                    name: None,
                    values: vec![quote(json!("Home"), "n/a")],
                }],
            }],
        };
        assert!(matches!(
            normalize_live_odds(vec![entry], 1, Utc::now(), None),
            Err(EngineError::UpstreamMalformed { .. })
        ));
    }

    #[test]
    fn prematch_computes_hours_before_match() {
        let kickoff = Utc::now() + chrono::Duration::hours(6);
        let sampled_at = Utc::now();
        let entry = RawOddsEntry {
            fixture: None,
            update: None,
            bookmakers: vec![RawBookmaker {
                id: 8,
                name: None,
                bets: vec![RawBet {
                    id: MARKET_MATCH_WINNER,
                    name: None,
                    values: vec![
                        quote(json!("Home"), "2.00"),
                        quote(json!("Draw"), "3.40"),
                        quote(json!("Away"), "3.80"),
                    ],
                }],
            }],
        };
        let rows = normalize_prematch_odds(vec![entry], 55, kickoff, sampled_at).unwrap();
        assert_eq!(rows.len(), 3);
        assert!((rows[0].hours_before_match - 6.0).abs() < 0.01);
        assert_eq!(rows[1].outcome, "X");
    }

    #[test]
    fn events_normalize_and_empty_type_rejected() {
        let observed = Utc::now();
        let entries: Vec<RawEventEntry> = serde_json::from_value(json!([
            {
                "time": {"elapsed": 23, "extra": null},
                "team": {"id": 40, "name": "Liverpool"},
                "player": {"id": 306, "name": "Salah"},
                "assist": {"id": null, "name": null},
                "type": "Goal",
                "detail": "Normal Goal",
                "comments": null
            }
        ]))
        .unwrap();
        let ticks = normalize_events(entries, 1000, observed).unwrap();
        assert_eq!(ticks.len(), 1);
        assert!(ticks[0].is_goal());
        assert_eq!(ticks[0].match_minute, Some(23));
        assert_eq!(ticks[0].player_id, Some(306));

        let bad = vec![RawEventEntry {
            time: RawEventTime { elapsed: None, extra: None },
            team: None,
            player: None,
            assist: None,
            kind: String::new(),
            detail: None,
            comments: None,
        }];
        assert!(normalize_events(bad, 1000, observed).is_err());
    }

    #[test]
    fn stats_normalize_percent_strings() {
        let observed = Utc::now();
        let entries: Vec<RawStatsEntry> = serde_json::from_value(json!([
            {
                "team": {"id": 40, "name": "Liverpool"},
                "statistics": [
                    {"type": "Shots on Goal", "value": 5},
                    {"type": "Ball Possession", "value": "58%"},
                    {"type": "Passes %", "value": "83%"},
                    {"type": "Expected Goals", "value": "1.2"}
                ]
            }
        ]))
        .unwrap();
        let ticks = normalize_stats(entries, 1000, observed).unwrap();
        assert_eq!(ticks[0].shots_on_goal, Some(5));
        assert_eq!(ticks[0].possession_pct, Some(58.0));
        assert_eq!(ticks[0].passes_pct, Some(83.0));
    }
}
