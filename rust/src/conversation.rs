//! Two-party conversation synchronization.
//!
//! [`MessageSynchronizer`] is plain state: it never awaits. The owner issues the
//! backend calls it asks for ([`MessageSynchronizer::begin_fetch`],
//! [`MessageSynchronizer::send`]) and feeds results and pushed changes back in.
//! After [`MessageSynchronizer::close`] every input is ignored.

use chrono::{DateTime, Duration, Utc};
use flume::Sender;

use crate::backend::records::{MessageRecord, NewMessage, MESSAGES_TABLE};
use crate::backend::{
    decode_row, decode_rows, Backend, BackendError, ChangeEvent, ChangeFilter, ChangeKind,
    ColumnEq, OrderBy, Predicate, Select, SubscriptionHandle,
};
use crate::error::SyncError;
use crate::identity::is_valid_identity;
use crate::state::MessageDeliveryState;

/// Prefix of client-assigned ids for optimistic entries.
pub const LOCAL_ID_PREFIX: &str = "local-";
pub const DEFAULT_RECONCILE_WINDOW_MS: u64 = 10_000;
/// Larger configured windows are clamped to one day.
pub const MAX_RECONCILE_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;
/// One live feed per direction.
const LIVE_FEEDS: usize = 2;

/// Trimmed content, or `ValidationFailure` when nothing is left.
pub fn validate_content(content: &str) -> Result<&str, SyncError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(SyncError::ValidationFailure);
    }
    Ok(trimmed)
}

/// The unordered (me, counterparty) pair a synchronizer is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationKey {
    me: String,
    counterparty: String,
}

impl ConversationKey {
    pub fn new(current: Option<&str>, counterparty: &str) -> Result<Self, SyncError> {
        let me = current
            .filter(|id| !id.is_empty())
            .ok_or(SyncError::AuthenticationRequired)?;
        for id in [me, counterparty] {
            if !is_valid_identity(id) {
                return Err(SyncError::InvalidIdentifier(id.to_string()));
            }
        }
        Ok(Self {
            me: me.to_string(),
            counterparty: counterparty.to_string(),
        })
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn counterparty(&self) -> &str {
        &self.counterparty
    }

    pub fn contains(&self, sender_id: &str, receiver_id: &str) -> bool {
        (sender_id == self.me && receiver_id == self.counterparty)
            || (sender_id == self.counterparty && receiver_id == self.me)
    }

    /// `(sender=me AND receiver=them) OR (sender=them AND receiver=me)`, oldest first.
    pub fn history_query(&self) -> Select {
        Select::from_table(MESSAGES_TABLE)
            .filter(Predicate::any_of(vec![
                vec![
                    ColumnEq::new("sender_id", &self.me),
                    ColumnEq::new("receiver_id", &self.counterparty),
                ],
                vec![
                    ColumnEq::new("sender_id", &self.counterparty),
                    ColumnEq::new("receiver_id", &self.me),
                ],
            ]))
            .order(OrderBy::asc("created_at"))
    }

    /// Insert, update and delete feeds for both directions. The hosted feed
    /// filters on one column, so rows for other conversations are dropped by
    /// [`ConversationKey::contains`].
    pub fn live_filters(&self) -> [ChangeFilter; LIVE_FEEDS] {
        [
            ChangeFilter::all_where("receiver_id", &self.me),
            ChangeFilter::all_where("sender_id", &self.me),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedMessage {
    /// Server id once confirmed, otherwise the local id.
    pub id: String,
    /// Set for entries that started as optimistic sends.
    pub local_id: Option<String>,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub delivery: MessageDeliveryState,
}

impl SyncedMessage {
    fn confirmed(row: MessageRecord, local_id: Option<String>) -> Self {
        Self {
            id: row.id,
            local_id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            content: row.content,
            created_at: row.created_at,
            delivery: MessageDeliveryState::Sent,
        }
    }

    fn is_unconfirmed(&self) -> bool {
        !matches!(self.delivery, MessageDeliveryState::Sent)
    }
}

/// An insert the owner must issue; its result goes to
/// [`MessageSynchronizer::apply_send_result`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub local_id: String,
    pub row: NewMessage,
}

#[derive(Debug)]
pub struct MessageSynchronizer {
    key: ConversationKey,
    messages: Vec<SyncedMessage>,
    is_loading: bool,
    error: Option<SyncError>,
    reconcile_window: Duration,
    fetch_token: u64,
    subscriptions: Vec<SubscriptionHandle>,
    closed: bool,
}

impl MessageSynchronizer {
    /// Validate the pair and start in the loading state. The caller follows up
    /// with [`MessageSynchronizer::begin_fetch`] and the live subscriptions.
    pub fn open(
        current: Option<&str>,
        counterparty: &str,
        reconcile_window_ms: u64,
    ) -> Result<Self, SyncError> {
        let key = ConversationKey::new(current, counterparty)?;
        Ok(Self::for_key(key, reconcile_window_ms))
    }

    /// Start in the loading state for an already validated pair.
    pub fn for_key(key: ConversationKey, reconcile_window_ms: u64) -> Self {
        let window_ms = reconcile_window_ms.min(MAX_RECONCILE_WINDOW_MS) as i64;
        Self {
            key,
            messages: vec![],
            is_loading: true,
            error: None,
            reconcile_window: Duration::milliseconds(window_ms),
            fetch_token: 0,
            subscriptions: vec![],
            closed: false,
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn messages(&self) -> &[SyncedMessage] {
        &self.messages
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn error(&self) -> Option<&SyncError> {
        self.error.as_ref()
    }

    pub fn is_live(&self) -> bool {
        !self.closed && self.subscriptions.len() >= LIVE_FEEDS
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn owns_subscription(&self, handle: SubscriptionHandle) -> bool {
        self.subscriptions.contains(&handle)
    }

    /// Start a history fetch. Results tagged with an older token are dropped.
    pub fn begin_fetch(&mut self) -> Option<(u64, Select)> {
        if self.closed {
            return None;
        }
        self.fetch_token += 1;
        self.is_loading = true;
        Some((self.fetch_token, self.key.history_query()))
    }

    /// Apply a history result. Returns whether state changed.
    pub fn apply_history(
        &mut self,
        token: u64,
        result: Result<Vec<MessageRecord>, SyncError>,
    ) -> bool {
        if self.closed || token != self.fetch_token {
            return false;
        }
        self.is_loading = false;
        let rows = match result {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "conversation: history fetch failed");
                self.error = Some(e);
                return true;
            }
        };

        let mut fetched: Vec<SyncedMessage> = rows
            .into_iter()
            .filter(|r| self.key.contains(&r.sender_id, &r.receiver_id))
            .map(|r| SyncedMessage::confirmed(r, None))
            .collect();
        let mut claimed = vec![false; fetched.len()];

        let previous = std::mem::take(&mut self.messages);
        let mut kept = Vec::new();
        for entry in previous.into_iter().filter(SyncedMessage::is_unconfirmed) {
            let hit = fetched
                .iter()
                .enumerate()
                .position(|(i, row)| !claimed[i] && self.reconciles(&entry, row));
            match hit {
                Some(i) => {
                    claimed[i] = true;
                    fetched[i].local_id = entry.local_id;
                }
                None => kept.push(entry),
            }
        }
        fetched.extend(kept);
        self.messages = fetched;
        self.sort();
        self.error = None;
        true
    }

    /// Append an optimistic entry and hand back the insert to issue.
    /// `None` when the trimmed content is empty or the synchronizer is closed.
    pub fn send(&mut self, content: &str, now: DateTime<Utc>) -> Option<OutgoingMessage> {
        if self.closed {
            return None;
        }
        let content = validate_content(content).ok()?.to_string();
        let local_id = format!("{LOCAL_ID_PREFIX}{}", uuid::Uuid::new_v4());
        self.messages.push(SyncedMessage {
            id: local_id.clone(),
            local_id: Some(local_id.clone()),
            sender_id: self.key.me.clone(),
            receiver_id: self.key.counterparty.clone(),
            content: content.clone(),
            created_at: now,
            delivery: MessageDeliveryState::Pending,
        });
        self.sort();
        Some(OutgoingMessage {
            local_id,
            row: NewMessage {
                sender_id: self.key.me.clone(),
                receiver_id: self.key.counterparty.clone(),
                content,
            },
        })
    }

    /// Re-issue the insert for a failed optimistic entry.
    pub fn retry(&mut self, message_id: &str) -> Option<OutgoingMessage> {
        if self.closed {
            return None;
        }
        let entry = self.messages.iter_mut().find(|m| {
            m.id == message_id && matches!(m.delivery, MessageDeliveryState::Failed { .. })
        })?;
        entry.delivery = MessageDeliveryState::Pending;
        let local_id = entry.local_id.clone()?;
        let row = NewMessage {
            sender_id: entry.sender_id.clone(),
            receiver_id: entry.receiver_id.clone(),
            content: entry.content.clone(),
        };
        self.error = None;
        Some(OutgoingMessage { local_id, row })
    }

    pub fn apply_send_result(
        &mut self,
        local_id: &str,
        result: Result<MessageRecord, SyncError>,
    ) -> bool {
        if self.closed {
            return false;
        }
        match result {
            Ok(row) => self.integrate(row, Some(local_id)),
            Err(e) => {
                tracing::warn!(error = %e, local_id, "conversation: send failed");
                if let Some(entry) = self
                    .messages
                    .iter_mut()
                    .find(|m| m.local_id.as_deref() == Some(local_id) && m.is_unconfirmed())
                {
                    entry.delivery = MessageDeliveryState::Failed {
                        reason: e.user_message(),
                    };
                }
                self.error = Some(e);
                true
            }
        }
    }

    /// Apply one pushed change. Rows outside the pair are ignored.
    pub fn apply_change(
        &mut self,
        kind: ChangeKind,
        new: Option<MessageRecord>,
        old_id: Option<&str>,
    ) -> bool {
        if self.closed {
            return false;
        }
        match (kind, new) {
            (ChangeKind::Insert, Some(row)) => self.integrate(row, None),
            (ChangeKind::Update, Some(row)) => {
                if !self.key.contains(&row.sender_id, &row.receiver_id) {
                    return false;
                }
                match self.messages.iter().position(|m| m.id == row.id) {
                    Some(pos) => {
                        let local_id = self.messages[pos].local_id.take();
                        self.messages[pos] = SyncedMessage::confirmed(row, local_id);
                        self.sort();
                        true
                    }
                    None => false,
                }
            }
            (ChangeKind::Delete, _) => {
                let Some(id) = old_id else {
                    return false;
                };
                let before = self.messages.len();
                self.messages.retain(|m| m.is_unconfirmed() || m.id != id);
                self.messages.len() != before
            }
            _ => false,
        }
    }

    /// Record a live feed. Returns `false` when closed; the caller must then
    /// release the handle itself.
    pub fn attach_subscription(&mut self, handle: SubscriptionHandle) -> bool {
        if self.closed {
            return false;
        }
        self.subscriptions.push(handle);
        true
    }

    /// Forget a feed the backend ended on its own. Returns whether it was ours;
    /// the synchronizer stops being live until it is reopened.
    pub fn detach_subscription(&mut self, handle: SubscriptionHandle) -> bool {
        if self.closed {
            return false;
        }
        let before = self.subscriptions.len();
        self.subscriptions.retain(|h| *h != handle);
        self.subscriptions.len() != before
    }

    /// Mark closed and hand back every live feed for release.
    pub fn close(&mut self) -> Vec<SubscriptionHandle> {
        self.closed = true;
        self.is_loading = false;
        std::mem::take(&mut self.subscriptions)
    }

    fn reconciles(&self, local: &SyncedMessage, row: &SyncedMessage) -> bool {
        local.sender_id == row.sender_id
            && local.receiver_id == row.receiver_id
            && local.content == row.content
            && (row.created_at - local.created_at).abs() <= self.reconcile_window
    }

    fn integrate(&mut self, row: MessageRecord, local_id: Option<&str>) -> bool {
        if !self.key.contains(&row.sender_id, &row.receiver_id) {
            return false;
        }
        let incoming = SyncedMessage::confirmed(row, local_id.map(str::to_string));

        if let Some(pos) = self.messages.iter().position(|m| m.id == incoming.id) {
            let local_id = self.messages[pos].local_id.clone().or(incoming.local_id.clone());
            self.messages[pos] = SyncedMessage { local_id, ..incoming };
            // A confirmed row may already sit in place of the optimistic entry.
            if let Some(local_id) = self.messages[pos].local_id.clone() {
                self.messages
                    .retain(|m| !(m.is_unconfirmed() && m.local_id.as_deref() == Some(&local_id)));
            }
            self.sort();
            return true;
        }

        let by_local_id = local_id.and_then(|lid| {
            self.messages
                .iter()
                .position(|m| m.is_unconfirmed() && m.local_id.as_deref() == Some(lid))
        });
        let slot = by_local_id.or_else(|| {
            self.messages
                .iter()
                .position(|m| m.is_unconfirmed() && self.reconciles(m, &incoming))
        });
        match slot {
            Some(pos) => {
                let local_id = self.messages[pos].local_id.clone();
                self.messages[pos] = SyncedMessage { local_id, ..incoming };
            }
            None => self.messages.push(incoming),
        }
        self.sort();
        true
    }

    fn sort(&mut self) {
        // Stable: ties keep arrival order.
        self.messages.sort_by_key(|m| m.created_at);
    }
}

pub async fn fetch_history(
    backend: &dyn Backend,
    query: Select,
) -> Result<Vec<MessageRecord>, SyncError> {
    let rows = backend.select(query).await?;
    Ok(decode_rows(rows)?)
}

pub async fn insert_message(
    backend: &dyn Backend,
    row: &NewMessage,
) -> Result<MessageRecord, SyncError> {
    let value = serde_json::to_value(row).map_err(BackendError::from)?;
    let stored = backend.insert(MESSAGES_TABLE, value).await?;
    Ok(decode_row(stored)?)
}

/// Subscribe both live feeds of `key` onto `sink`. If one fails, the feeds
/// already opened are released before the error is returned.
pub async fn subscribe_live(
    backend: &dyn Backend,
    key: &ConversationKey,
    sink: &Sender<ChangeEvent>,
) -> Result<Vec<SubscriptionHandle>, BackendError> {
    let mut handles = Vec::with_capacity(LIVE_FEEDS);
    for filter in key.live_filters() {
        match backend.subscribe(MESSAGES_TABLE, filter, sink.clone()).await {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                for handle in handles {
                    backend.unsubscribe(handle).await;
                }
                return Err(e);
            }
        }
    }
    Ok(handles)
}
