// In-process backend: offline mode and deterministic tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use flume::Sender;
use serde_json::Value;
use tokio::sync::watch;

use super::{
    compare_cells, Backend, BackendError, ChangeEvent, ChangeFilter, ChangeKind, Identity,
    Predicate, Select, SubscriptionHandle,
};

struct Subscriber {
    table: String,
    filter: ChangeFilter,
    sink: Sender<ChangeEvent>,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Vec<Value>>,
    subscribers: BTreeMap<u64, Subscriber>,
    next_subscription: u64,
    last_created_at: Option<DateTime<Utc>>,
    identity: Option<Identity>,
    blobs: HashMap<String, Vec<u8>>,
}

impl Inner {
    // Server clock: strictly increasing so ordering by created_at is total.
    fn next_created_at(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_created_at {
            if now <= last {
                now = last + chrono::Duration::microseconds(1);
            }
        }
        self.last_created_at = Some(now);
        now
    }

    fn fan_out(&mut self, table: &str, kind: ChangeKind, new: Option<Value>, old: Option<Value>) {
        let Some(sample) = new.as_ref().or(old.as_ref()) else {
            return;
        };
        let mut dead = Vec::new();
        for (id, sub) in &self.subscribers {
            if sub.table != table || !sub.filter.matches(kind, sample) {
                continue;
            }
            let event = ChangeEvent {
                subscription: SubscriptionHandle(*id),
                table: table.to_string(),
                kind,
                new: new.clone(),
                old: old.clone(),
            };
            if sub.sink.send(event).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            tracing::debug!(subscription = id, "memory backend: dropping closed subscriber");
            self.subscribers.remove(&id);
        }
    }
}

/// A [`Backend`] holding tables, subscriptions and blobs in process memory.
///
/// Rows get a UUID v4 `id` and a strictly increasing `created_at` on insert,
/// and every matching subscriber sees the change synchronously. Access tokens
/// are not verified: the identity is whatever [`MemoryBackend::set_identity`]
/// installed, and clearing the token clears it.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    fail_selects: AtomicBool,
    fail_inserts: AtomicBool,
    fail_subscribes: AtomicBool,
    insert_gate: watch::Sender<bool>,
    select_calls: AtomicU64,
    insert_calls: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (insert_gate, _) = watch::channel(true);
        Self {
            inner: Mutex::new(Inner::default()),
            fail_selects: AtomicBool::new(false),
            fail_inserts: AtomicBool::new(false),
            fail_subscribes: AtomicBool::new(false),
            insert_gate,
            select_calls: AtomicU64::new(0),
            insert_calls: AtomicU64::new(0),
        }
    }

    pub fn with_identity(user_id: &str) -> Self {
        let backend = Self::new();
        backend.set_identity(Some(user_id));
        backend
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    pub fn set_identity(&self, user_id: Option<&str>) {
        self.lock().identity = user_id.map(|id| Identity {
            id: id.to_string(),
            email: None,
        });
    }

    /// Store a row exactly as given, without assigning fields or notifying subscribers.
    pub fn seed(&self, table: &str, row: Value) {
        self.lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// Delete a row by `id`, notifying subscribers. Returns whether a row was removed.
    pub fn remove_row(&self, table: &str, id: &str) -> bool {
        let mut inner = self.lock();
        let Some(rows) = inner.tables.get_mut(table) else {
            return false;
        };
        let Some(pos) = rows
            .iter()
            .position(|r| r.get("id").and_then(Value::as_str) == Some(id))
        else {
            return false;
        };
        let old = rows.remove(pos);
        inner.fan_out(table, ChangeKind::Delete, None, Some(old));
        true
    }

    pub fn blob(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(&format!("{bucket}/{path}")).cloned()
    }

    pub fn set_fail_selects(&self, fail: bool) {
        self.fail_selects.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribes(&self, fail: bool) {
        self.fail_subscribes.store(fail, Ordering::SeqCst);
    }

    /// Park every insert until [`MemoryBackend::release_inserts`].
    pub fn hold_inserts(&self) {
        self.insert_gate.send_replace(false);
    }

    pub fn release_inserts(&self) {
        self.insert_gate.send_replace(true);
    }

    pub fn select_calls(&self) -> u64 {
        self.select_calls.load(Ordering::SeqCst)
    }

    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// End every live feed from the backend side, as a dropped socket would.
    pub fn end_feeds(&self) {
        let subscribers = std::mem::take(&mut self.lock().subscribers);
        for (id, sub) in subscribers {
            let _ = sub.sink.send(ChangeEvent {
                subscription: SubscriptionHandle(id),
                table: sub.table,
                kind: ChangeKind::Closed,
                new: None,
                old: None,
            });
        }
    }

    fn store_insert(&self, table: &str, row: Value) -> Result<Value, BackendError> {
        let Value::Object(mut fields) = row else {
            return Err(BackendError::Unavailable("row must be a JSON object".into()));
        };
        let mut inner = self.lock();
        fields
            .entry("id")
            .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
        if !fields.contains_key("created_at") {
            let ts = inner.next_created_at();
            fields.insert(
                "created_at".into(),
                Value::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
            );
        }
        let row = Value::Object(fields);
        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        inner.fan_out(table, ChangeKind::Insert, Some(row.clone()), None);
        Ok(row)
    }

    fn store_update(&self, table: &str, predicate: &Predicate, patch: Value) -> Vec<Value> {
        let Value::Object(patch) = patch else {
            return vec![];
        };
        let mut inner = self.lock();
        let mut changes = Vec::new();
        if let Some(rows) = inner.tables.get_mut(table) {
            for row in rows.iter_mut().filter(|r| predicate.matches(r)) {
                let old = row.clone();
                if let Value::Object(fields) = row {
                    for (k, v) in &patch {
                        fields.insert(k.clone(), v.clone());
                    }
                }
                changes.push((old, row.clone()));
            }
        }
        let mut updated = Vec::with_capacity(changes.len());
        for (old, new) in changes {
            inner.fan_out(table, ChangeKind::Update, Some(new.clone()), Some(old));
            updated.push(new);
        }
        updated
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn current_identity(&self) -> Result<Option<Identity>, BackendError> {
        Ok(self.lock().identity.clone())
    }

    fn set_access_token(&self, token: Option<String>) {
        if token.is_none() {
            self.lock().identity = None;
        }
    }

    async fn select(&self, query: Select) -> Result<Vec<Value>, BackendError> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_selects.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("select failed (injected)".into()));
        }
        let inner = self.lock();
        let mut rows: Vec<Value> = inner
            .tables
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| query.predicate.matches(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ord = compare_cells(a.get(&order.column), b.get(&order.column));
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, BackendError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.insert_gate.subscribe();
        let opened = gate.wait_for(|open| *open).await.is_ok();
        if !opened {
            return Err(BackendError::Unavailable("backend closed".into()));
        }
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("insert failed (injected)".into()));
        }
        self.store_insert(table, row)
    }

    async fn update(
        &self,
        table: &str,
        predicate: &Predicate,
        patch: Value,
    ) -> Result<Vec<Value>, BackendError> {
        Ok(self.store_update(table, predicate, patch))
    }

    async fn subscribe(
        &self,
        table: &str,
        filter: ChangeFilter,
        sink: Sender<ChangeEvent>,
    ) -> Result<SubscriptionHandle, BackendError> {
        if self.fail_subscribes.load(Ordering::SeqCst) {
            return Err(BackendError::Realtime("subscribe failed (injected)".into()));
        }
        let mut inner = self.lock();
        inner.next_subscription += 1;
        let id = inner.next_subscription;
        inner.subscribers.insert(
            id,
            Subscriber {
                table: table.to_string(),
                filter,
                sink,
            },
        );
        Ok(SubscriptionHandle(id))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.lock().subscribers.remove(&handle.0);
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, BackendError> {
        self.lock().blobs.insert(format!("{bucket}/{path}"), bytes);
        Ok(path.to_string())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("memory://{bucket}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{OrderBy, Predicate};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn insert_assigns_id_and_increasing_timestamps() {
        let b = MemoryBackend::new();
        let first = b
            .insert("messages", json!({"sender_id": "a", "receiver_id": "b", "content": "1"}))
            .await
            .unwrap();
        let second = b
            .insert("messages", json!({"sender_id": "a", "receiver_id": "b", "content": "2"}))
            .await
            .unwrap();
        assert!(first["id"].as_str().is_some());
        assert_ne!(first["id"], second["id"]);
        assert!(first["created_at"].as_str().unwrap() < second["created_at"].as_str().unwrap());
    }

    #[tokio::test]
    async fn subscribers_see_only_matching_changes() {
        let b = MemoryBackend::new();
        let (tx, rx) = flume::unbounded();
        let handle = b
            .subscribe("messages", ChangeFilter::inserts_where("receiver_id", "me"), tx)
            .await
            .unwrap();
        b.insert("messages", json!({"sender_id": "x", "receiver_id": "me", "content": "hi"}))
            .await
            .unwrap();
        b.insert("messages", json!({"sender_id": "x", "receiver_id": "other", "content": "no"}))
            .await
            .unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.subscription, handle);
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.new.unwrap()["content"], "hi");
        assert!(rx.try_recv().is_err());

        b.unsubscribe(handle).await;
        assert_eq!(b.subscriber_count(), 0);
        b.insert("messages", json!({"sender_id": "x", "receiver_id": "me", "content": "late"}))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn select_filters_orders_and_limits() {
        let b = MemoryBackend::new();
        b.seed("messages", json!({"id": "1", "sender_id": "a", "created_at": "2024-01-01T00:00:03Z"}));
        b.seed("messages", json!({"id": "2", "sender_id": "b", "created_at": "2024-01-01T00:00:01Z"}));
        b.seed("messages", json!({"id": "3", "sender_id": "a", "created_at": "2024-01-01T00:00:02Z"}));
        let rows = b
            .select(
                Select::from_table("messages")
                    .filter(Predicate::eq("sender_id", "a"))
                    .order(OrderBy::asc("created_at")),
            )
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["3", "1"]);

        let newest = b
            .select(
                Select::from_table("messages")
                    .order(OrderBy::desc("created_at"))
                    .limit(1),
            )
            .await
            .unwrap();
        assert_eq!(newest[0]["id"], "1");
        assert_eq!(b.select_calls(), 2);
    }

    #[tokio::test]
    async fn held_inserts_resolve_after_release() {
        let b = Arc::new(MemoryBackend::new());
        b.hold_inserts();
        let b2 = b.clone();
        let task = tokio::spawn(async move {
            b2.insert("messages", json!({"content": "parked"})).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.rows("messages").is_empty());
        b.release_inserts();
        task.await.unwrap().unwrap();
        assert_eq!(b.rows("messages").len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_errors() {
        let b = MemoryBackend::new();
        b.set_fail_inserts(true);
        b.set_fail_selects(true);
        assert!(b.insert("messages", json!({})).await.is_err());
        assert!(b.select(Select::from_table("messages")).await.is_err());
        assert!(b.rows("messages").is_empty());
    }

    #[tokio::test]
    async fn update_and_delete_notify_with_old_rows() {
        let b = MemoryBackend::new();
        let (tx, rx) = flume::unbounded();
        b.subscribe("profiles", ChangeFilter::all_where("id", "p1"), tx)
            .await
            .unwrap();
        b.seed("profiles", json!({"id": "p1", "latitude": null}));
        let updated = b
            .update("profiles", &Predicate::eq("id", "p1"), json!({"latitude": 1.5}))
            .await
            .unwrap();
        assert_eq!(updated[0]["latitude"], 1.5);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.kind, ChangeKind::Update);
        assert_eq!(ev.old.unwrap()["latitude"], Value::Null);

        assert!(b.remove_row("profiles", "p1"));
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.kind, ChangeKind::Delete);
        assert!(ev.new.is_none());
    }

    #[tokio::test]
    async fn ended_feeds_send_a_final_closed_event() {
        let b = MemoryBackend::new();
        let (tx, rx) = flume::unbounded();
        let handle = b
            .subscribe("messages", ChangeFilter::all_where("receiver_id", "me"), tx)
            .await
            .unwrap();
        b.end_feeds();
        assert_eq!(b.subscriber_count(), 0);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.subscription, handle);
        assert_eq!(ev.kind, ChangeKind::Closed);
        assert!(rx.recv().is_err());
    }

    #[tokio::test]
    async fn select_orders_mixed_timestamp_formats_by_instant() {
        let b = MemoryBackend::new();
        b.seed("messages", json!({"id": "late", "created_at": "2024-01-01T00:00:03.000001Z"}));
        b.seed("messages", json!({"id": "early", "created_at": "2024-01-01T00:00:03Z"}));
        b.seed("messages", json!({"id": "first", "created_at": "2024-01-01T01:00:02+01:00"}));
        let rows = b
            .select(Select::from_table("messages").order(OrderBy::asc("created_at")))
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["first", "early", "late"]);
    }

    #[tokio::test]
    async fn identity_follows_token_clear() {
        let b = MemoryBackend::with_identity("me");
        assert_eq!(b.current_identity().await.unwrap().unwrap().id, "me");
        b.set_access_token(Some("token".into()));
        assert!(b.current_identity().await.unwrap().is_some());
        b.set_access_token(None);
        assert!(b.current_identity().await.unwrap().is_none());
    }
}
