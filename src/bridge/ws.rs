use crate::error::EngineError;
use crate::shared::types::{NoteKind, OutboundFrame};
use crate::EngineState;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientRequest {
    Subscribe {
        fixture_id: i64,
    },
    Unsubscribe {
        fixture_id: i64,
    },
    Catchup {
        fixture_id: i64,
        from_seq: u64,
        #[serde(rename = "type")]
        msg_type: Option<NoteKind>,
    },
}

/// WebSocket upgrade handler for the subscriber channel.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<EngineState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

type WsSink = SplitSink<WebSocket, Message>;

/// Per-connection delivery state: the highest seq written per stream.
/// Enforces strictly monotonic seq on the wire even when a catch-up
/// overlaps frames that were already delivered live.
struct Delivery {
    sent: HashMap<(i64, NoteKind), u64>,
}

impl Delivery {
    fn new() -> Self {
        Self { sent: HashMap::new() }
    }

    /// Returns false when the socket is gone.
    async fn send(&mut self, sink: &mut WsSink, frame: &OutboundFrame) -> bool {
        let key = (frame.fixture_id, frame.kind);
        let last = self.sent.get(&key).copied().unwrap_or(0);
        if frame.seq <= last {
            return true;
        }
        let json = match serde_json::to_string(frame) {
            Ok(json) => json,
            Err(e) => {
                warn!("outbound frame serialization failed: {}", e);
                return true;
            }
        };
        if sink.send(Message::Text(json)).await.is_err() {
            return false;
        }
        self.sent.insert(key, frame.seq);
        true
    }
}

async fn send_error(sink: &mut WsSink, error: &str, detail: String) -> bool {
    let json = serde_json::json!({ "type": "error", "error": error, "detail": detail });
    sink.send(Message::Text(json.to_string())).await.is_ok()
}

async fn handle_socket(socket: WebSocket, state: Arc<EngineState>) {
    let bridge = state.bridge.clone();
    let client_id = bridge.next_client_id();
    info!("subscriber {} connected", client_id);

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(state.config.subscriber_buffer);
    let mut delivery = Delivery::new();
    let mut ping = tokio::time::interval(Duration::from_secs(30));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    'conn: loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if !delivery.send(&mut sink, &frame).await {
                            break 'conn;
                        }
                    }
                    None => {
                        // The bridge dropped this handle: back-pressure
                        // exceeded the slow-consumer budget.
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_POLICY_VIOLATION,
                                reason: "slow_consumer".into(),
                            })))
                            .await;
                        break 'conn;
                    }
                }
            }
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { break 'conn };
                match msg {
                    Message::Text(text) => match serde_json::from_str::<ClientRequest>(&text) {
                        Ok(ClientRequest::Subscribe { fixture_id }) => {
                            bridge.subscribe(client_id, fixture_id, tx.clone());
                        }
                        Ok(ClientRequest::Unsubscribe { fixture_id }) => {
                            bridge.unsubscribe(client_id, fixture_id);
                        }
                        Ok(ClientRequest::Catchup { fixture_id, from_seq, msg_type }) => {
                            let kind = msg_type.unwrap_or(NoteKind::OddsUpdate);
                            match bridge.catch_up(fixture_id, kind, from_seq).await {
                                Ok(frames) => {
                                    for frame in &frames {
                                        if !delivery.send(&mut sink, frame).await {
                                            break 'conn;
                                        }
                                    }
                                }
                                Err(EngineError::CatchupUnavailable { requested, oldest }) => {
                                    if !send_error(
                                        &mut sink,
                                        "catchup_unavailable",
                                        format!("seq {requested} is beyond the horizon (oldest {oldest})"),
                                    )
                                    .await
                                    {
                                        break 'conn;
                                    }
                                }
                                Err(e) => {
                                    warn!("catch-up for client {} failed: {}", client_id, e);
                                    if !send_error(&mut sink, "catchup_failed", e.to_string()).await {
                                        break 'conn;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            if !send_error(&mut sink, "bad_request", e.to_string()).await {
                                break 'conn;
                            }
                        }
                    },
                    Message::Ping(payload) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break 'conn;
                        }
                    }
                    Message::Close(_) => break 'conn,
                    _ => {}
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break 'conn;
                }
            }
        }
    }

    bridge.drop_client(client_id);
    info!("subscriber {} disconnected", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_requests_parse() {
        let subscribe: ClientRequest =
            serde_json::from_str(r#"{"action":"subscribe","fixture_id":1000}"#).unwrap();
        assert!(matches!(subscribe, ClientRequest::Subscribe { fixture_id: 1000 }));

        let catchup: ClientRequest = serde_json::from_str(
            r#"{"action":"catchup","fixture_id":1000,"from_seq":4,"type":"odds_update"}"#,
        )
        .unwrap();
        match catchup {
            ClientRequest::Catchup { fixture_id, from_seq, msg_type } => {
                assert_eq!(fixture_id, 1000);
                assert_eq!(from_seq, 4);
                assert_eq!(msg_type, Some(NoteKind::OddsUpdate));
            }
            other => panic!("unexpected parse: {other:?}"),
        }

        // The type field defaults to odds when omitted.
        let bare: ClientRequest =
            serde_json::from_str(r#"{"action":"catchup","fixture_id":7,"from_seq":0}"#).unwrap();
        assert!(matches!(bare, ClientRequest::Catchup { msg_type: None, .. }));

        assert!(serde_json::from_str::<ClientRequest>(r#"{"action":"dance"}"#).is_err());
    }

    #[test]
    fn outbound_frame_wire_shape() {
        let frame = OutboundFrame {
            kind: NoteKind::OddsUpdate,
            fixture_id: 1000,
            seq: 1,
            timestamp: chrono::Utc::now(),
            payload: serde_json::json!([{ "price": 2.10 }]),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "odds_update");
        assert_eq!(value["fixture_id"], 1000);
        assert_eq!(value["seq"], 1);
        assert!(value["payload"].is_array());
        assert!(value["timestamp"].is_string());
    }
}
