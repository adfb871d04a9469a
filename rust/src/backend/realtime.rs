// Realtime change feed over the hosted Phoenix-channel WebSocket.
//
// One socket per subscription: join a topic with a single `postgres_changes`
// binding, heartbeat every 30s, forward decoded changes onto the caller's sink,
// and leave when the subscription is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use flume::Sender;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{BackendError, ChangeEvent, ChangeFilter, ChangeKind, SubscriptionHandle};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const JOIN_REF: &str = "1";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize, Deserialize)]
struct PhoenixFrame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    msg_ref: Option<String>,
}

impl PhoenixFrame {
    fn encode(topic: &str, event: &str, payload: Value, msg_ref: &str) -> String {
        let frame = PhoenixFrame {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            msg_ref: Some(msg_ref.to_string()),
        };
        // A struct of strings and a JSON value always serializes.
        serde_json::to_string(&frame).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Incoming {
    Reply {
        msg_ref: Option<String>,
        ok: bool,
        response: Value,
    },
    Change {
        table: String,
        kind: ChangeKind,
        new: Option<Value>,
        old: Option<Value>,
    },
    Closed,
    Other,
}

pub(crate) fn websocket_url(base_url: &str, anon_key: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(base_url)?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => other,
    }
    .to_string();
    // http(s) -> ws(s) stays within the special schemes, which never fails.
    let _ = url.set_scheme(&scheme);
    let path = format!("{}/realtime/v1/websocket", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", anon_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

pub(crate) fn join_frame(
    topic: &str,
    table: &str,
    filter: &ChangeFilter,
    access_token: Option<&str>,
    msg_ref: &str,
) -> String {
    let mut binding = json!({
        "event": filter.kind.as_wire(),
        "schema": "public",
        "table": table,
    });
    if let Some(eq) = &filter.column_eq {
        binding["filter"] = Value::String(format!("{}=eq.{}", eq.column, eq.value));
    }
    let mut payload = json!({
        "config": {
            "broadcast": {"self": false},
            "presence": {"key": ""},
            "postgres_changes": [binding],
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    PhoenixFrame::encode(topic, "phx_join", payload, msg_ref)
}

pub(crate) fn heartbeat_frame(msg_ref: &str) -> String {
    PhoenixFrame::encode("phoenix", "heartbeat", json!({}), msg_ref)
}

pub(crate) fn leave_frame(topic: &str, msg_ref: &str) -> String {
    PhoenixFrame::encode(topic, "phx_leave", json!({}), msg_ref)
}

pub(crate) fn decode_frame(text: &str) -> Result<Incoming, serde_json::Error> {
    let frame: PhoenixFrame = serde_json::from_str(text)?;
    let incoming = match frame.event.as_str() {
        "phx_reply" => Incoming::Reply {
            msg_ref: frame.msg_ref,
            ok: frame.payload.get("status").and_then(Value::as_str) == Some("ok"),
            response: frame.payload.get("response").cloned().unwrap_or(Value::Null),
        },
        "postgres_changes" => {
            let data = frame.payload.get("data").cloned().unwrap_or(Value::Null);
            let kind = data
                .get("type")
                .and_then(Value::as_str)
                .and_then(ChangeKind::from_wire);
            match kind {
                Some(kind) if kind != ChangeKind::Any => Incoming::Change {
                    table: data
                        .get("table")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    kind,
                    new: non_empty(data.get("record")),
                    old: non_empty(data.get("old_record")),
                },
                _ => Incoming::Other,
            }
        }
        "phx_close" | "phx_error" => Incoming::Closed,
        _ => Incoming::Other,
    };
    Ok(incoming)
}

fn non_empty(v: Option<&Value>) -> Option<Value> {
    match v {
        None | Some(Value::Null) => None,
        Some(Value::Object(m)) if m.is_empty() => None,
        Some(v) => Some(v.clone()),
    }
}

/// Owns the live realtime channels opened through one backend.
pub struct RealtimeClient {
    ws_url: String,
    next_id: AtomicU64,
    channels: Mutex<HashMap<u64, oneshot::Sender<()>>>,
}

impl RealtimeClient {
    pub fn new(base_url: &str, anon_key: &str) -> Result<Self, BackendError> {
        let ws_url = websocket_url(base_url, anon_key)
            .map_err(|e| BackendError::Unavailable(format!("invalid backend URL: {e}")))?;
        Ok(Self {
            ws_url: ws_url.into(),
            next_id: AtomicU64::new(0),
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Open a socket, join one binding and wait for the server to accept it.
    pub async fn subscribe(
        &self,
        table: &str,
        filter: ChangeFilter,
        access_token: Option<String>,
        sink: Sender<ChangeEvent>,
    ) -> Result<SubscriptionHandle, BackendError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = SubscriptionHandle(id);
        let topic = format!("realtime:nearby-{id}");

        let (socket, _) = tokio_tungstenite::connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| BackendError::Realtime(e.to_string()))?;
        let (mut write, mut read) = socket.split();

        let join = join_frame(&topic, table, &filter, access_token.as_deref(), JOIN_REF);
        write
            .send(Message::Text(join.into()))
            .await
            .map_err(|e| BackendError::Realtime(e.to_string()))?;

        match tokio::time::timeout(JOIN_TIMEOUT, await_join_reply(&mut read)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(BackendError::Timeout),
        }
        tracing::info!(%topic, table, filter = ?filter.column_eq, "realtime: joined");

        let (stop_tx, stop_rx) = oneshot::channel();
        match self.channels.lock() {
            Ok(mut g) => g.insert(id, stop_tx),
            Err(poison) => poison.into_inner().insert(id, stop_tx),
        };
        tokio::spawn(run_channel(
            handle,
            topic,
            table.to_string(),
            write,
            read,
            sink,
            stop_rx,
        ));
        Ok(handle)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let stop = match self.channels.lock() {
            Ok(mut g) => g.remove(&handle.0),
            Err(poison) => poison.into_inner().remove(&handle.0),
        };
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
    }
}

async fn await_join_reply(read: &mut SplitStream<Socket>) -> Result<(), BackendError> {
    while let Some(msg) = read.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(_) => continue,
            Err(e) => return Err(BackendError::Realtime(e.to_string())),
        };
        if let Ok(Incoming::Reply {
            msg_ref,
            ok,
            response,
        }) = decode_frame(text.as_str())
        {
            if msg_ref.as_deref() != Some(JOIN_REF) {
                continue;
            }
            return if ok {
                Ok(())
            } else {
                Err(BackendError::Realtime(format!("join rejected: {response}")))
            };
        }
    }
    Err(BackendError::Realtime("socket closed before join reply".into()))
}

async fn run_channel(
    handle: SubscriptionHandle,
    topic: String,
    table: String,
    mut write: SplitSink<Socket, Message>,
    mut read: SplitStream<Socket>,
    sink: Sender<ChangeEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    // The first tick fires immediately; the join just happened.
    heartbeat.tick().await;
    let mut seq: u64 = 1;

    loop {
        tokio::select! {
            _ = &mut stop => {
                seq += 1;
                let _ = write.send(Message::Text(leave_frame(&topic, &seq.to_string()).into())).await;
                let _ = write.close().await;
                tracing::debug!(%topic, "realtime: left");
                return;
            }
            _ = heartbeat.tick() => {
                seq += 1;
                if let Err(e) = write.send(Message::Text(heartbeat_frame(&seq.to_string()).into())).await {
                    tracing::warn!(%e, %topic, "realtime: heartbeat failed");
                    break;
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match decode_frame(text.as_str()) {
                        Ok(Incoming::Change { table: changed, kind, new, old }) => {
                            if changed != table {
                                continue;
                            }
                            let event = ChangeEvent {
                                subscription: handle,
                                table: changed,
                                kind,
                                new,
                                old,
                            };
                            if sink.send(event).is_err() {
                                tracing::debug!(%topic, "realtime: sink closed");
                                return;
                            }
                        }
                        Ok(Incoming::Closed) => {
                            tracing::warn!(%topic, "realtime: channel closed by server");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => tracing::debug!(%e, %topic, "realtime: undecodable frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::warn!(%topic, "realtime: socket closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(%e, %topic, "realtime: socket error");
                        break;
                    }
                }
            }
        }
    }

    let _ = sink.send(ended_event(handle, table));
}

/// Terminal event for a channel that ended without being released.
pub(crate) fn ended_event(handle: SubscriptionHandle, table: String) -> ChangeEvent {
    ChangeEvent {
        subscription: handle,
        table,
        kind: ChangeKind::Closed,
        new: None,
        old: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_swaps_scheme() {
        assert_eq!(
            websocket_url("https://abc.example.co/", "anon").unwrap().as_str(),
            "wss://abc.example.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
        assert_eq!(
            websocket_url("http://127.0.0.1:54321", "k").unwrap().as_str(),
            "ws://127.0.0.1:54321/realtime/v1/websocket?apikey=k&vsn=1.0.0"
        );
    }

    #[test]
    fn websocket_url_encodes_the_api_key() {
        let url = websocket_url("https://x.example.co", "a&b=c d").unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("apikey".to_string(), "a&b=c d".to_string()),
                ("vsn".to_string(), "1.0.0".to_string()),
            ]
        );
        assert!(websocket_url("not a url", "k").is_err());
    }

    #[test]
    fn join_frame_carries_binding_and_token() {
        let text = join_frame(
            "realtime:nearby-1",
            "messages",
            &ChangeFilter::inserts_where("receiver_id", "me"),
            Some("jwt"),
            "1",
        );
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["event"], "phx_join");
        assert_eq!(v["ref"], "1");
        assert_eq!(v["topic"], "realtime:nearby-1");
        let binding = &v["payload"]["config"]["postgres_changes"][0];
        assert_eq!(binding["event"], "INSERT");
        assert_eq!(binding["table"], "messages");
        assert_eq!(binding["filter"], "receiver_id=eq.me");
        assert_eq!(v["payload"]["access_token"], "jwt");
    }

    #[test]
    fn join_frame_without_filter_or_token() {
        let filter = ChangeFilter {
            kind: ChangeKind::Any,
            column_eq: None,
        };
        let v: Value =
            serde_json::from_str(&join_frame("t", "messages", &filter, None, "1")).unwrap();
        let binding = &v["payload"]["config"]["postgres_changes"][0];
        assert_eq!(binding["event"], "*");
        assert!(binding.get("filter").is_none());
        assert!(v["payload"].get("access_token").is_none());
    }

    #[test]
    fn decodes_join_replies() {
        let ok = r#"{"topic":"t","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"1"}"#;
        assert!(matches!(
            decode_frame(ok).unwrap(),
            Incoming::Reply { ok: true, msg_ref: Some(ref r), .. } if r == "1"
        ));
        let err = r#"{"topic":"t","event":"phx_reply","payload":{"status":"error","response":{"reason":"unauthorized"}},"ref":"1"}"#;
        assert!(matches!(
            decode_frame(err).unwrap(),
            Incoming::Reply { ok: false, .. }
        ));
    }

    #[test]
    fn decodes_postgres_insert() {
        let text = r#"{
            "topic":"realtime:nearby-1","event":"postgres_changes","ref":null,
            "payload":{"ids":[1],"data":{
                "schema":"public","table":"messages","type":"INSERT",
                "commit_timestamp":"2024-05-01T10:00:00Z",
                "record":{"id":"m1","content":"hi","sender_id":"a","receiver_id":"b","created_at":"2024-05-01T10:00:00Z"},
                "old_record":{}
            }}
        }"#;
        match decode_frame(text).unwrap() {
            Incoming::Change {
                table,
                kind,
                new,
                old,
            } => {
                assert_eq!(table, "messages");
                assert_eq!(kind, ChangeKind::Insert);
                assert_eq!(new.unwrap()["id"], "m1");
                assert!(old.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn server_close_and_unknown_events() {
        let close = r#"{"topic":"t","event":"phx_close","payload":{},"ref":null}"#;
        assert_eq!(decode_frame(close).unwrap(), Incoming::Closed);
        let presence = r#"{"topic":"t","event":"presence_state","payload":{},"ref":null}"#;
        assert_eq!(decode_frame(presence).unwrap(), Incoming::Other);
        assert!(decode_frame("not json").is_err());
    }

    #[test]
    fn ended_channel_reports_closed_without_rows() {
        let event = ended_event(SubscriptionHandle(4), "messages".into());
        assert_eq!(event.kind, ChangeKind::Closed);
        assert_eq!(event.subscription, SubscriptionHandle(4));
        assert!(event.new.is_none() && event.old.is_none());
    }

    #[test]
    fn heartbeat_targets_phoenix_topic() {
        let v: Value = serde_json::from_str(&heartbeat_frame("7")).unwrap();
        assert_eq!(v["topic"], "phoenix");
        assert_eq!(v["event"], "heartbeat");
        assert_eq!(v["ref"], "7");
        let v: Value = serde_json::from_str(&leave_frame("t", "8")).unwrap();
        assert_eq!(v["event"], "phx_leave");
    }
}
