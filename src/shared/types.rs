use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider fixture status codes. The set is closed; anything else coming
/// from upstream is a malformed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FixtureStatus {
    #[serde(rename = "TBD")]
    Tbd,
    #[serde(rename = "NS")]
    NotStarted,
    #[serde(rename = "1H")]
    FirstHalf,
    #[serde(rename = "HT")]
    HalfTime,
    #[serde(rename = "2H")]
    SecondHalf,
    #[serde(rename = "ET")]
    ExtraTime,
    #[serde(rename = "BT")]
    BreakTime,
    #[serde(rename = "P")]
    Penalties,
    #[serde(rename = "SUSP")]
    Suspended,
    #[serde(rename = "INT")]
    Interrupted,
    #[serde(rename = "FT")]
    FullTime,
    #[serde(rename = "AET")]
    AfterExtraTime,
    #[serde(rename = "PEN")]
    PenaltiesDecided,
    #[serde(rename = "PST")]
    Postponed,
    #[serde(rename = "CANC")]
    Cancelled,
    #[serde(rename = "ABD")]
    Abandoned,
    #[serde(rename = "AWD")]
    TechnicalLoss,
    #[serde(rename = "WO")]
    Walkover,
}

impl FixtureStatus {
    pub fn parse(code: &str) -> Option<Self> {
        use FixtureStatus::*;
        Some(match code {
            "TBD" => Tbd,
            "NS" => NotStarted,
            "1H" => FirstHalf,
            "HT" => HalfTime,
            "2H" => SecondHalf,
            "ET" => ExtraTime,
            "BT" => BreakTime,
            "P" => Penalties,
            "SUSP" => Suspended,
            "INT" => Interrupted,
            "FT" => FullTime,
            "AET" => AfterExtraTime,
            "PEN" => PenaltiesDecided,
            "PST" => Postponed,
            "CANC" => Cancelled,
            "ABD" => Abandoned,
            "AWD" => TechnicalLoss,
            "WO" => Walkover,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        use FixtureStatus::*;
        match self {
            Tbd => "TBD",
            NotStarted => "NS",
            FirstHalf => "1H",
            HalfTime => "HT",
            SecondHalf => "2H",
            ExtraTime => "ET",
            BreakTime => "BT",
            Penalties => "P",
            Suspended => "SUSP",
            Interrupted => "INT",
            FullTime => "FT",
            AfterExtraTime => "AET",
            PenaltiesDecided => "PEN",
            Postponed => "PST",
            Cancelled => "CANC",
            Abandoned => "ABD",
            TechnicalLoss => "AWD",
            Walkover => "WO",
        }
    }

    /// In-play subset: the live loop schedules pulls only for these.
    pub fn is_live(&self) -> bool {
        use FixtureStatus::*;
        matches!(
            self,
            FirstHalf | HalfTime | SecondHalf | ExtraTime | BreakTime | Penalties
        )
    }

    pub fn is_finished(&self) -> bool {
        use FixtureStatus::*;
        matches!(
            self,
            FullTime | AfterExtraTime | PenaltiesDecided | TechnicalLoss | Walkover
        )
    }

    /// Finished plus the statuses that will never go live; such fixtures
    /// receive no further ticks of any kind.
    pub fn is_terminal_inactive(&self) -> bool {
        use FixtureStatus::*;
        self.is_finished() || matches!(self, Postponed | Cancelled | Abandoned)
    }
}

/// One scheduled match, keyed by the provider-assigned id. Created by the
/// fixture poll job, mutated by the live loop and the finalizer, never
/// deleted.
#[derive(Debug, Clone, Serialize)]
pub struct Fixture {
    pub fixture_id: i64,
    pub kickoff: DateTime<Utc>,
    pub league_id: i64,
    pub season: i32,
    pub round: Option<String>,
    pub venue: Option<String>,
    pub home_team_id: i64,
    pub home_team: String,
    pub away_team_id: i64,
    pub away_team: String,
    pub status: FixtureStatus,
    /// Match minute; meaningful only while the fixture is live.
    pub elapsed: Option<i32>,
    pub home_goals: Option<i32>,
    pub away_goals: Option<i32>,
    pub ht_home_goals: Option<i32>,
    pub ht_away_goals: Option<i32>,
    pub et_home_goals: Option<i32>,
    pub et_away_goals: Option<i32>,
    pub pen_home_goals: Option<i32>,
    pub pen_away_goals: Option<i32>,
    pub status_changed_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// One observation of one outcome's price at one bookmaker at one instant.
/// Append-only; the natural key is (fixture, bookmaker, market, outcome,
/// instant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsTick {
    pub fixture_id: i64,
    pub bookmaker_id: i64,
    pub market_id: i64,
    pub outcome: String,
    pub instant: DateTime<Utc>,
    pub price: f64,
    pub match_minute: Option<i32>,
}

/// One in-match event observation (goal, card, substitution, VAR, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTick {
    pub fixture_id: i64,
    pub instant: DateTime<Utc>,
    pub match_minute: Option<i32>,
    pub extra_minute: Option<i32>,
    pub kind: String,
    pub detail: String,
    pub team_id: Option<i64>,
    pub player_id: Option<i64>,
    pub assist_id: Option<i64>,
    pub comment: Option<String>,
}

impl EventTick {
    pub fn is_goal(&self) -> bool {
        self.kind == "Goal"
    }

    pub fn is_card(&self) -> bool {
        self.kind == "Card"
    }

    pub fn is_substitution(&self) -> bool {
        self.kind.eq_ignore_ascii_case("subst")
    }
}

/// One snapshot of a team's cumulative match statistics at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatTick {
    pub fixture_id: i64,
    pub team_id: i64,
    pub instant: DateTime<Utc>,
    pub shots_on_goal: Option<i32>,
    pub shots_off_goal: Option<i32>,
    pub total_shots: Option<i32>,
    pub blocked_shots: Option<i32>,
    pub shots_inside_box: Option<i32>,
    pub shots_outside_box: Option<i32>,
    pub possession_pct: Option<f64>,
    pub corners: Option<i32>,
    pub offsides: Option<i32>,
    pub fouls: Option<i32>,
    pub yellow_cards: Option<i32>,
    pub red_cards: Option<i32>,
    pub goalkeeper_saves: Option<i32>,
    pub total_passes: Option<i32>,
    pub passes_accurate: Option<i32>,
    pub passes_pct: Option<f64>,
}

/// One bookmaker's price for one outcome sampled before kickoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrematchOdds {
    pub fixture_id: i64,
    pub bookmaker_id: i64,
    pub market_id: i64,
    pub outcome: String,
    pub sampled_at: DateTime<Utc>,
    pub price: f64,
    pub hours_before_match: f64,
}

/// Per-(fixture, minute) derived row summarizing the ticks of that minute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchLiveFrame {
    pub fixture_id: i64,
    pub bucket_start: DateTime<Utc>,
    pub home_team_id: i64,
    pub away_team_id: i64,
    pub status: FixtureStatus,
    pub elapsed: Option<i32>,
    pub home_goals: i32,
    pub away_goals: i32,
    pub avg_home_odd: Option<f64>,
    pub avg_draw_odd: Option<f64>,
    pub avg_away_odd: Option<f64>,
    pub home_odd_delta: Option<f64>,
    pub away_odd_delta: Option<f64>,
    pub goals_in_bucket: i32,
    pub cards_in_bucket: i32,
    pub subs_in_bucket: i32,
    pub odds_ticks_in_bucket: i32,
    pub event_ticks_in_bucket: i32,
}

/// The three pull workloads the live loop schedules per fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullKind {
    Odds,
    Events,
    Stats,
}

impl PullKind {
    pub const ALL: [PullKind; 3] = [PullKind::Odds, PullKind::Events, PullKind::Stats];

    pub fn as_str(&self) -> &'static str {
        match self {
            PullKind::Odds => "odds",
            PullKind::Events => "events",
            PullKind::Stats => "stats",
        }
    }
}

/// Message types carried on a fixture topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    OddsUpdate,
    EventUpdate,
    StatsUpdate,
    FixtureClosed,
}

impl NoteKind {
    pub const STREAMS: [NoteKind; 4] = [
        NoteKind::OddsUpdate,
        NoteKind::EventUpdate,
        NoteKind::StatsUpdate,
        NoteKind::FixtureClosed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NoteKind::OddsUpdate => "odds_update",
            NoteKind::EventUpdate => "event_update",
            NoteKind::StatsUpdate => "stats_update",
            NoteKind::FixtureClosed => "fixture_closed",
        }
    }

    pub fn for_pull(kind: PullKind) -> Self {
        match kind {
            PullKind::Odds => NoteKind::OddsUpdate,
            PullKind::Events => NoteKind::EventUpdate,
            PullKind::Stats => NoteKind::StatsUpdate,
        }
    }
}

/// One row of the persisted job catalog. The scheduler owns the semantic
/// interpretation of `kind`/`spec`; this is just the table shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRow {
    pub name: String,
    pub kind: String,
    pub spec: String,
    pub queue: String,
    pub priority: i32,
    pub enabled: bool,
    pub soft_limit_secs: i32,
    pub hard_limit_secs: i32,
    pub retries: i32,
}

/// Change note emitted by the ingestion loop after a successful batch write.
/// The bridge assigns the per-(fixture, type) sequence number.
#[derive(Debug, Clone)]
pub struct ChangeNote {
    pub fixture_id: i64,
    pub kind: NoteKind,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    /// Instant range covered by the written batch; used to reconstruct the
    /// message from storage when it has left the in-memory ring.
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Wire frame pushed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub kind: NoteKind,
    pub fixture_id: i64,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for code in [
            "TBD", "NS", "1H", "HT", "2H", "ET", "BT", "P", "SUSP", "INT", "FT", "AET", "PEN",
            "PST", "CANC", "ABD", "AWD", "WO",
        ] {
            let status = FixtureStatus::parse(code).expect(code);
            assert_eq!(status.as_str(), code);
        }
        assert!(FixtureStatus::parse("LIVE").is_none());
    }

    #[test]
    fn live_and_terminal_sets_are_disjoint() {
        use FixtureStatus::*;
        let live = [FirstHalf, HalfTime, SecondHalf, ExtraTime, BreakTime, Penalties];
        for status in live {
            assert!(status.is_live());
            assert!(!status.is_terminal_inactive());
        }
        for status in [FullTime, AfterExtraTime, PenaltiesDecided, TechnicalLoss, Walkover] {
            assert!(status.is_finished());
            assert!(status.is_terminal_inactive());
            assert!(!status.is_live());
        }
        // Postponed and friends are terminal but not finished.
        for status in [Postponed, Cancelled, Abandoned] {
            assert!(status.is_terminal_inactive());
            assert!(!status.is_finished());
        }
        // Suspended and interrupted sit outside both subsets.
        for status in [Suspended, Interrupted] {
            assert!(!status.is_live());
            assert!(!status.is_terminal_inactive());
        }
    }

    #[test]
    fn status_serde_uses_provider_codes() {
        let json = serde_json::to_string(&FixtureStatus::FirstHalf).unwrap();
        assert_eq!(json, "\"1H\"");
        let back: FixtureStatus = serde_json::from_str("\"FT\"").unwrap();
        assert_eq!(back, FixtureStatus::FullTime);
    }

    #[test]
    fn note_kind_matches_pull_kind() {
        assert_eq!(NoteKind::for_pull(PullKind::Odds), NoteKind::OddsUpdate);
        assert_eq!(NoteKind::for_pull(PullKind::Events), NoteKind::EventUpdate);
        assert_eq!(NoteKind::for_pull(PullKind::Stats), NoteKind::StatsUpdate);
        assert_eq!(NoteKind::FixtureClosed.as_str(), "fixture_closed");
    }
}
