use chrono::Utc;
use serde_json::Value;

use super::{bounded, AppCore};
use crate::backend::records::{MessageRecord, MESSAGES_TABLE};
use crate::backend::{ChangeEvent, SubscriptionHandle};
use crate::backend::ChangeKind;
use crate::conversation::{
    fetch_history, insert_message, ConversationKey, MessageSynchronizer, OutgoingMessage,
    SyncedMessage,
};
use crate::error::SyncError;
use crate::identity::short_identity;
use crate::state::{ChatMessage, ConversationViewState, Screen};
use crate::updates::{CoreMsg, InternalEvent};

/// The synchronizer bound to the conversation screen on top of the router.
pub(super) struct OpenConversation {
    pub(super) id: u64,
    pub(super) sync: MessageSynchronizer,
}

fn chat_message(m: &SyncedMessage, me: &str) -> ChatMessage {
    ChatMessage {
        id: m.id.clone(),
        sender_id: m.sender_id.clone(),
        receiver_id: m.receiver_id.clone(),
        content: m.content.clone(),
        created_at: m.created_at.timestamp_millis(),
        is_mine: m.sender_id == me,
        delivery: m.delivery.clone(),
    }
}

impl AppCore {
    fn current_conversation_mut(&mut self, id: u64) -> Option<&mut MessageSynchronizer> {
        self.conversation
            .as_mut()
            .filter(|c| c.id == id)
            .map(|c| &mut c.sync)
    }

    /// Open or close so the synchronizer matches the top of the screen stack.
    pub(super) fn sync_conversation_to_router(&mut self) {
        let top = self.state.router.screen_stack.last().cloned();
        match top {
            Some(Screen::Conversation { counterparty_id }) => {
                let already_open = self
                    .conversation
                    .as_ref()
                    .map(|c| c.sync.key().counterparty() == counterparty_id)
                    .unwrap_or(false);
                if already_open {
                    return;
                }
                let me = self.session_user_id();
                match ConversationKey::new(me.as_deref(), &counterparty_id) {
                    Ok(key) => {
                        self.close_conversation();
                        self.open_conversation(key);
                    }
                    Err(e) => {
                        // Whatever was open underneath stays open.
                        tracing::warn!(error = %e, "conversation: open rejected");
                        self.state.router.screen_stack.pop();
                        self.toast(e.user_message());
                        self.sync_conversation_to_router();
                    }
                }
            }
            _ => {
                if self.conversation.is_some() {
                    self.close_conversation();
                }
            }
        }
    }

    fn open_conversation(&mut self, key: ConversationKey) {
        self.conversation_seq += 1;
        let id = self.conversation_seq;
        tracing::info!(
            conversation = id,
            counterparty = %short_identity(key.counterparty()),
            "conversation: open"
        );
        let sync = MessageSynchronizer::for_key(key, self.config.reconcile_window_ms());
        self.conversation = Some(OpenConversation { id, sync });
        self.fetch_conversation();
        self.subscribe_conversation();
        self.project_conversation();
    }

    /// Release the live feeds and drop the synchronizer. Anything still in
    /// flight for it is ignored when it lands.
    pub(super) fn close_conversation(&mut self) {
        if let Some(mut conv) = self.conversation.take() {
            let feeds = conv.sync.close();
            tracing::info!(conversation = conv.id, feeds = feeds.len(), "conversation: close");
            self.release_subscriptions(feeds);
        }
        self.state.current_conversation = None;
    }

    fn fetch_conversation(&mut self) {
        let Some(conv) = self.conversation.as_mut() else {
            return;
        };
        let Some((token, query)) = conv.sync.begin_fetch() else {
            return;
        };
        let id = conv.id;
        let backend = self.backend.clone();
        let timeout = self.config.request_timeout();
        self.spawn_internal(async move {
            let result = bounded(timeout, fetch_history(backend.as_ref(), query)).await;
            InternalEvent::ConversationHistoryFetched {
                conversation: id,
                token,
                result,
            }
        });
    }

    fn subscribe_conversation(&mut self) {
        let Some(conv) = self.conversation.as_ref() else {
            return;
        };
        let id = conv.id;
        let filters = conv.sync.key().live_filters();

        // Both feeds share one sink; the forwarder ends once the backend drops them.
        let (sink, events) = flume::unbounded::<ChangeEvent>();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            while let Ok(event) = events.recv_async().await {
                let msg = CoreMsg::Internal(Box::new(InternalEvent::ConversationChange {
                    conversation: id,
                    event,
                }));
                if tx.send(msg).is_err() {
                    break;
                }
            }
        });

        for filter in filters {
            let backend = self.backend.clone();
            let sink = sink.clone();
            self.spawn_internal(async move {
                let result = backend
                    .subscribe(MESSAGES_TABLE, filter, sink)
                    .await
                    .map_err(|e| e.to_string());
                InternalEvent::ConversationSubscribed {
                    conversation: id,
                    result,
                }
            });
        }
    }

    pub(super) fn refresh_conversation(&mut self) {
        if self.conversation.is_none() {
            return;
        }
        self.fetch_conversation();
        self.project_conversation();
        self.emit_state();
    }

    pub(super) fn send_message(&mut self, content: &str) {
        let Some(conv) = self.conversation.as_mut() else {
            return;
        };
        let Some(outgoing) = conv.sync.send(content, Utc::now()) else {
            return;
        };
        let id = conv.id;
        self.issue_send(id, outgoing);
        self.project_conversation();
        self.emit_state();
    }

    pub(super) fn retry_message(&mut self, message_id: &str) {
        let Some(conv) = self.conversation.as_mut() else {
            return;
        };
        let Some(outgoing) = conv.sync.retry(message_id) else {
            return;
        };
        let id = conv.id;
        self.issue_send(id, outgoing);
        self.project_conversation();
        self.emit_state();
    }

    fn issue_send(&self, conversation: u64, outgoing: OutgoingMessage) {
        let backend = self.backend.clone();
        let timeout = self.config.request_timeout();
        self.spawn_internal(async move {
            let result = bounded(timeout, insert_message(backend.as_ref(), &outgoing.row)).await;
            InternalEvent::MessageSendResult {
                conversation,
                local_id: outgoing.local_id,
                result,
            }
        });
    }

    pub(super) fn on_history_fetched(
        &mut self,
        conversation: u64,
        token: u64,
        result: Result<Vec<MessageRecord>, SyncError>,
    ) {
        let failure = result.as_ref().err().map(SyncError::user_message);
        let Some(sync) = self.current_conversation_mut(conversation) else {
            return;
        };
        if !sync.apply_history(token, result) {
            return;
        }
        self.project_conversation();
        match failure {
            Some(msg) => self.toast(msg),
            None => self.emit_state(),
        }
    }

    pub(super) fn on_send_result(
        &mut self,
        conversation: u64,
        local_id: &str,
        result: Result<MessageRecord, SyncError>,
    ) {
        let failure = result.as_ref().err().map(SyncError::user_message);
        let Some(sync) = self.current_conversation_mut(conversation) else {
            tracing::debug!(local_id, "conversation: send result for closed conversation");
            return;
        };
        if !sync.apply_send_result(local_id, result) {
            return;
        }
        self.project_conversation();
        match failure {
            Some(msg) => self.toast(msg),
            None => self.emit_state(),
        }
    }

    pub(super) fn on_conversation_subscribed(
        &mut self,
        conversation: u64,
        result: Result<SubscriptionHandle, String>,
    ) {
        match result {
            Ok(handle) => {
                let attached = self
                    .current_conversation_mut(conversation)
                    .map(|sync| sync.attach_subscription(handle))
                    .unwrap_or(false);
                if !attached {
                    tracing::debug!(?handle, "conversation: releasing feed of closed conversation");
                    self.release_subscriptions(vec![handle]);
                    return;
                }
                self.project_conversation();
                self.emit_state();
            }
            Err(e) => {
                if self.current_conversation_mut(conversation).is_some() {
                    tracing::warn!(error = %e, "conversation: live feed unavailable, history only");
                }
            }
        }
    }

    pub(super) fn on_conversation_change(&mut self, conversation: u64, event: ChangeEvent) {
        if event.kind == ChangeKind::Closed {
            self.on_conversation_feed_ended(conversation, event.subscription);
            return;
        }
        if event.table != MESSAGES_TABLE {
            return;
        }
        let new = match event.new.map(serde_json::from_value::<MessageRecord>) {
            Some(Ok(row)) => Some(row),
            Some(Err(e)) => {
                tracing::debug!(%e, "conversation: undecodable change row");
                None
            }
            None => None,
        };
        let old_id = event
            .old
            .as_ref()
            .and_then(|old| old.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let Some(sync) = self.current_conversation_mut(conversation) else {
            tracing::debug!(conversation, "conversation: dropping late change");
            return;
        };
        if sync.apply_change(event.kind, new, old_id.as_deref()) {
            self.project_conversation();
            self.emit_state();
        }
    }

    fn on_conversation_feed_ended(&mut self, conversation: u64, handle: SubscriptionHandle) {
        let detached = self
            .current_conversation_mut(conversation)
            .map(|sync| sync.detach_subscription(handle))
            .unwrap_or(false);
        self.release_subscriptions(vec![handle]);
        if detached {
            tracing::warn!(?handle, "conversation: live feed ended, history only");
            self.project_conversation();
            self.emit_state();
        }
    }

    /// Rebuild `current_conversation` from the synchronizer.
    pub(super) fn project_conversation(&mut self) {
        let view = self.conversation.as_ref().map(|c| {
            let key = c.sync.key();
            let (me, cp) = (key.me(), key.counterparty());
            let summary = self
                .state
                .conversation_list
                .iter()
                .find(|s| s.counterparty_id == cp);
            let profile = self.profiles.get(cp);
            ConversationViewState {
                counterparty_id: cp.to_string(),
                counterparty_name: profile
                    .and_then(|p| p.username.clone())
                    .or_else(|| summary.map(|s| s.display_name.clone()))
                    .unwrap_or_else(|| short_identity(cp)),
                counterparty_avatar_url: profile
                    .and_then(|p| p.avatar_url.clone())
                    .or_else(|| summary.and_then(|s| s.avatar_url.clone())),
                messages: c.sync.messages().iter().map(|m| chat_message(m, me)).collect(),
                is_loading: c.sync.is_loading(),
                error: c.sync.error().map(SyncError::user_message),
                is_live: c.sync.is_live(),
            }
        });
        self.state.current_conversation = view;
    }
}
