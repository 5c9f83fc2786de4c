pub mod ws;

use crate::error::{EngineError, Result};
use crate::metrics::Counters;
use crate::shared::types::{ChangeNote, NoteKind, OutboundFrame};
use crate::store::TickStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug)]
pub struct BridgeConfig {
    /// Messages kept in memory per (fixture, type) stream.
    pub ring_capacity: usize,
    /// Seq->window index entries kept per stream; the catch-up horizon.
    pub horizon: usize,
    /// Back-pressure tolerance before a subscriber is disconnected.
    pub slow_timeout: Duration,
}

/// Seq bookkeeping surviving ring eviction; enough to rebuild a message's
/// payload from storage.
#[derive(Debug, Clone)]
pub struct SeqIndexEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Per-(fixture, type) stream state: monotonically increasing seq, the
/// in-memory ring, and the longer seq index for storage fallback.
#[derive(Debug, Default)]
pub struct StreamState {
    next_seq: u64,
    ring: VecDeque<OutboundFrame>,
    index: VecDeque<SeqIndexEntry>,
}

impl StreamState {
    pub fn current_seq(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }
}

struct SubscriberSlot {
    tx: mpsc::Sender<OutboundFrame>,
    slow_since: Option<Instant>,
}

#[derive(Default)]
struct Topic {
    subscribers: HashMap<u64, SubscriberSlot>,
    streams: HashMap<NoteKind, StreamState>,
}

/// How a catch-up request will be served, decided purely from stream state.
#[derive(Debug)]
pub enum CatchupPlan {
    /// Nothing missed.
    UpToDate,
    /// Everything missed is still in the ring.
    Ring(Vec<OutboundFrame>),
    /// Older messages must be rebuilt from storage, newer ones come from
    /// the ring.
    Mixed {
        storage: Vec<SeqIndexEntry>,
        ring: Vec<OutboundFrame>,
    },
    /// The request reaches beyond the horizon.
    Unavailable { oldest: u64 },
}

/// Decide how to serve `from_seq` against one stream. Pure so the seq
/// arithmetic is testable without a store.
pub fn plan_catchup(stream: &StreamState, from_seq: u64) -> CatchupPlan {
    let current = stream.current_seq();
    if from_seq >= current {
        return CatchupPlan::UpToDate;
    }
    let first_wanted = from_seq + 1;
    let ring_front = stream
        .ring
        .front()
        .map(|f| f.seq)
        .unwrap_or(stream.next_seq);
    if first_wanted >= ring_front {
        return CatchupPlan::Ring(
            stream
                .ring
                .iter()
                .filter(|f| f.seq > from_seq)
                .cloned()
                .collect(),
        );
    }
    let index_front = stream
        .index
        .front()
        .map(|e| e.seq)
        .unwrap_or(stream.next_seq);
    if first_wanted < index_front {
        return CatchupPlan::Unavailable {
            oldest: index_front.saturating_sub(1),
        };
    }
    CatchupPlan::Mixed {
        storage: stream
            .index
            .iter()
            .filter(|e| e.seq >= first_wanted && e.seq < ring_front)
            .cloned()
            .collect(),
        ring: stream.ring.iter().cloned().collect(),
    }
}

fn append_frame(
    stream: &mut StreamState,
    frame: OutboundFrame,
    window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ring_capacity: usize,
    horizon: usize,
) {
    stream.index.push_back(SeqIndexEntry {
        seq: frame.seq,
        timestamp: frame.timestamp,
        window,
    });
    while stream.index.len() > horizon {
        stream.index.pop_front();
    }
    stream.ring.push_back(frame);
    while stream.ring.len() > ring_capacity {
        stream.ring.pop_front();
    }
}

/// Multicasts per-fixture change notifications to live subscribers with
/// per-(fixture, type) ordering, an in-memory catch-up ring and a storage
/// fallback for older gaps.
pub struct FanoutBridge {
    store: Arc<TickStore>,
    counters: Arc<Counters>,
    config: BridgeConfig,
    topics: DashMap<i64, Topic>,
    client_topics: DashMap<u64, HashSet<i64>>,
    next_client: AtomicU64,
}

impl FanoutBridge {
    pub fn new(store: Arc<TickStore>, counters: Arc<Counters>, config: BridgeConfig) -> Self {
        Self {
            store,
            counters,
            config,
            topics: DashMap::new(),
            client_topics: DashMap::new(),
            next_client: AtomicU64::new(1),
        }
    }

    pub fn next_client_id(&self) -> u64 {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }

    /// Consume the change-note stream until shutdown, then flush whatever
    /// is already queued.
    pub async fn run(
        self: Arc<Self>,
        mut notes: mpsc::Receiver<ChangeNote>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("fan-out bridge running");
        loop {
            tokio::select! {
                note = notes.recv() => {
                    match note {
                        Some(note) => self.publish(note),
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    while let Ok(note) = notes.try_recv() {
                        self.publish(note);
                    }
                    info!("fan-out bridge stopped");
                    break;
                }
            }
        }
    }

    /// Assign the next seq for the note's stream, buffer it and multicast
    /// to the topic's subscribers.
    pub fn publish(&self, note: ChangeNote) {
        let mut topic = self.topics.entry(note.fixture_id).or_default();
        let stream = topic.streams.entry(note.kind).or_insert_with(|| StreamState {
            next_seq: 1,
            ..Default::default()
        });
        if stream.next_seq == 0 {
            stream.next_seq = 1;
        }
        let frame = OutboundFrame {
            kind: note.kind,
            fixture_id: note.fixture_id,
            seq: stream.next_seq,
            timestamp: note.timestamp,
            payload: note.payload,
        };
        stream.next_seq += 1;
        append_frame(
            stream,
            frame.clone(),
            note.window,
            self.config.ring_capacity,
            self.config.horizon,
        );

        let slow_timeout = self.config.slow_timeout;
        let mut dropped: Vec<u64> = Vec::new();
        for (&client_id, slot) in topic.subscribers.iter_mut() {
            match slot.tx.try_send(frame.clone()) {
                Ok(()) => {
                    slot.slow_since = None;
                    Counters::bump(&self.counters.messages_delivered);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let since = *slot.slow_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= slow_timeout {
                        dropped.push(client_id);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(client_id),
            }
        }
        for client_id in dropped {
            if topic.subscribers.remove(&client_id).is_some() {
                Counters::bump(&self.counters.slow_consumers_disconnected);
                warn!(
                    "subscriber {} dropped from fixture {} (slow or gone)",
                    client_id, note.fixture_id
                );
            }
        }
    }

    pub fn subscribe(&self, client_id: u64, fixture_id: i64, tx: mpsc::Sender<OutboundFrame>) {
        self.topics
            .entry(fixture_id)
            .or_default()
            .subscribers
            .insert(client_id, SubscriberSlot { tx, slow_since: None });
        self.client_topics
            .entry(client_id)
            .or_default()
            .insert(fixture_id);
        debug!("client {} subscribed to fixture {}", client_id, fixture_id);
    }

    pub fn unsubscribe(&self, client_id: u64, fixture_id: i64) {
        if let Some(mut topic) = self.topics.get_mut(&fixture_id) {
            topic.subscribers.remove(&client_id);
        }
        if let Some(mut topics) = self.client_topics.get_mut(&client_id) {
            topics.remove(&fixture_id);
        }
    }

    /// Dropping the subscriber handle stops delivery promptly.
    pub fn drop_client(&self, client_id: u64) {
        if let Some((_, fixtures)) = self.client_topics.remove(&client_id) {
            for fixture_id in fixtures {
                if let Some(mut topic) = self.topics.get_mut(&fixture_id) {
                    topic.subscribers.remove(&client_id);
                }
            }
        }
    }

    /// Serve missed messages after `from_seq`, in seq order. Ring first;
    /// ring misses within the horizon are rebuilt from a direct store read;
    /// anything older is `CatchupUnavailable`.
    pub async fn catch_up(
        &self,
        fixture_id: i64,
        kind: NoteKind,
        from_seq: u64,
    ) -> Result<Vec<OutboundFrame>> {
        let plan = {
            match self.topics.get(&fixture_id) {
                Some(topic) => match topic.streams.get(&kind) {
                    Some(stream) => plan_catchup(stream, from_seq),
                    None => CatchupPlan::UpToDate,
                },
                None => CatchupPlan::UpToDate,
            }
        };

        match plan {
            CatchupPlan::UpToDate => Ok(Vec::new()),
            CatchupPlan::Ring(frames) => {
                Counters::bump(&self.counters.catchup_served_ring);
                Ok(frames)
            }
            CatchupPlan::Mixed { storage, ring } => {
                let mut frames = Vec::with_capacity(storage.len() + ring.len());
                for entry in &storage {
                    frames.push(self.reconstruct(fixture_id, kind, entry).await?);
                }
                frames.extend(ring);
                frames.sort_by_key(|f| f.seq);
                Counters::bump(&self.counters.catchup_served_store);
                Ok(frames)
            }
            CatchupPlan::Unavailable { oldest } => {
                Counters::bump(&self.counters.catchup_unavailable);
                Err(EngineError::CatchupUnavailable {
                    requested: from_seq,
                    oldest,
                })
            }
        }
    }

    /// Rebuild an evicted message from the ticks its batch covered.
    async fn reconstruct(
        &self,
        fixture_id: i64,
        kind: NoteKind,
        entry: &SeqIndexEntry,
    ) -> Result<OutboundFrame> {
        let payload = match (kind, entry.window) {
            (NoteKind::OddsUpdate, Some((from, to))) => serde_json::to_value(
                self.store
                    .odds_ticks_between(fixture_id, from, to + ChronoDuration::milliseconds(1))
                    .await?,
            ),
            (NoteKind::EventUpdate, Some((from, to))) => serde_json::to_value(
                self.store
                    .event_ticks_between(fixture_id, from, to + ChronoDuration::milliseconds(1))
                    .await?,
            ),
            (NoteKind::StatsUpdate, Some((from, to))) => serde_json::to_value(
                self.store
                    .stat_ticks_between(fixture_id, from, to + ChronoDuration::milliseconds(1))
                    .await?,
            ),
            (NoteKind::FixtureClosed, _) => {
                let status = self
                    .store
                    .get_fixture(fixture_id)
                    .await?
                    .map(|f| f.status.as_str().to_string());
                Ok(serde_json::json!({ "status": status }))
            }
            (_, None) => Ok(serde_json::Value::Array(Vec::new())),
        }
        .unwrap_or(serde_json::Value::Null);

        Ok(OutboundFrame {
            kind,
            fixture_id,
            seq: entry.seq,
            timestamp: entry.timestamp,
            payload,
        })
    }

    /// Current subscriber count, for the health probe.
    pub fn subscriber_count(&self) -> usize {
        self.client_topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> OutboundFrame {
        OutboundFrame {
            kind: NoteKind::OddsUpdate,
            fixture_id: 1000,
            seq,
            timestamp: Utc::now(),
            payload: serde_json::json!([{ "seq": seq }]),
        }
    }

    /// Stream with messages 1..=n, ring holding the last `ring` of them and
    /// an index reaching back `horizon`.
    fn stream(n: u64, ring: usize, horizon: usize) -> StreamState {
        let mut state = StreamState {
            next_seq: 1,
            ..Default::default()
        };
        for seq in 1..=n {
            let f = frame(seq);
            state.next_seq = seq + 1;
            append_frame(&mut state, f, None, ring, horizon);
        }
        state
    }

    #[test]
    fn catchup_from_current_is_up_to_date() {
        let state = stream(10, 256, 4096);
        assert!(matches!(plan_catchup(&state, 10), CatchupPlan::UpToDate));
        assert!(matches!(plan_catchup(&state, 15), CatchupPlan::UpToDate));
    }

    #[test]
    fn catchup_within_ring_returns_missed_frames_in_order() {
        // Scenario S6: current seq 10, request from_seq 4 -> 5..=10.
        let state = stream(10, 256, 4096);
        match plan_catchup(&state, 4) {
            CatchupPlan::Ring(frames) => {
                let seqs: Vec<u64> = frames.iter().map(|f| f.seq).collect();
                assert_eq!(seqs, vec![5, 6, 7, 8, 9, 10]);
            }
            other => panic!("expected ring plan, got {other:?}"),
        }
    }

    #[test]
    fn catchup_just_past_ring_falls_back_to_storage() {
        // Ring of 8 over 20 messages: ring holds 13..=20. A request for
        // current - ring - 1 = 11 needs seq 12 from storage.
        let state = stream(20, 8, 4096);
        match plan_catchup(&state, 11) {
            CatchupPlan::Mixed { storage, ring } => {
                let storage_seqs: Vec<u64> = storage.iter().map(|e| e.seq).collect();
                assert_eq!(storage_seqs, vec![12]);
                assert_eq!(ring.first().unwrap().seq, 13);
                assert_eq!(ring.last().unwrap().seq, 20);
            }
            other => panic!("expected mixed plan, got {other:?}"),
        }
    }

    #[test]
    fn catchup_below_horizon_is_unavailable() {
        // Horizon of 10 over 40 messages: index holds 31..=40.
        let state = stream(40, 4, 10);
        match plan_catchup(&state, 5) {
            CatchupPlan::Unavailable { oldest } => assert_eq!(oldest, 30),
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[test]
    fn ring_and_index_stay_bounded() {
        let state = stream(1000, 256, 512);
        assert_eq!(state.ring.len(), 256);
        assert_eq!(state.index.len(), 512);
        assert_eq!(state.ring.front().unwrap().seq, 745);
        assert_eq!(state.index.front().unwrap().seq, 489);
        assert_eq!(state.current_seq(), 1000);
    }

    #[tokio::test]
    async fn publish_assigns_monotonic_seq_per_stream() {
        let counters = Arc::new(Counters::default());
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://unused/unused")
            .unwrap();
        let store = Arc::new(TickStore::new(pool, counters.clone()));
        let bridge = FanoutBridge::new(
            store,
            counters,
            BridgeConfig {
                ring_capacity: 16,
                horizon: 64,
                slow_timeout: Duration::from_secs(10),
            },
        );

        let (tx, mut rx) = mpsc::channel(8);
        let client = bridge.next_client_id();
        bridge.subscribe(client, 1000, tx);

        for _ in 0..3 {
            bridge.publish(ChangeNote {
                fixture_id: 1000,
                kind: NoteKind::OddsUpdate,
                timestamp: Utc::now(),
                payload: serde_json::json!([]),
                window: None,
            });
        }
        // A different stream on the same topic numbers independently.
        bridge.publish(ChangeNote {
            fixture_id: 1000,
            kind: NoteKind::EventUpdate,
            timestamp: Utc::now(),
            payload: serde_json::json!([]),
            window: None,
        });

        let mut odds_seqs = Vec::new();
        let mut event_seqs = Vec::new();
        for _ in 0..4 {
            let frame = rx.recv().await.unwrap();
            match frame.kind {
                NoteKind::OddsUpdate => odds_seqs.push(frame.seq),
                NoteKind::EventUpdate => event_seqs.push(frame.seq),
                _ => {}
            }
        }
        assert_eq!(odds_seqs, vec![1, 2, 3]);
        assert_eq!(event_seqs, vec![1]);
    }

    #[tokio::test]
    async fn dropped_subscriber_stops_receiving() {
        let counters = Arc::new(Counters::default());
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://unused/unused")
            .unwrap();
        let store = Arc::new(TickStore::new(pool, counters.clone()));
        let bridge = FanoutBridge::new(
            store,
            counters.clone(),
            BridgeConfig {
                ring_capacity: 16,
                horizon: 64,
                slow_timeout: Duration::from_secs(10),
            },
        );

        let (tx, rx) = mpsc::channel(8);
        let client = bridge.next_client_id();
        bridge.subscribe(client, 1000, tx);
        drop(rx);

        bridge.publish(ChangeNote {
            fixture_id: 1000,
            kind: NoteKind::OddsUpdate,
            timestamp: Utc::now(),
            payload: serde_json::json!([]),
            window: None,
        });
        // Closed channel removes the slot on first publish.
        assert_eq!(
            Counters::get(&counters.messages_delivered),
            0,
            "no delivery to a dropped handle"
        );
        bridge.drop_client(client);
        assert_eq!(bridge.subscriber_count(), 0);
    }
}
