// Conversation list: coalesced refreshes driven by a live message feed.

use super::*;

use chrono::Utc;

use crate::aggregator::{list_conversations, list_feed_filters};
use crate::backend::records::MESSAGES_TABLE;
use crate::backend::{ChangeEvent, ChangeKind};
use crate::state::ConversationSummary;

impl AppCore {
    /// At most one list fetch runs at a time; requests arriving meanwhile
    /// collapse into a single follow-up fetch.
    pub(super) fn refresh_conversation_list(&mut self) {
        let Some(me) = self.session_user_id() else {
            return;
        };
        if self.list_fetch_in_flight {
            self.list_fetch_dirty = true;
            return;
        }
        self.list_fetch_in_flight = true;
        self.list_fetch_dirty = false;
        self.list_fetch_token = self.list_fetch_token.wrapping_add(1);
        let token = self.list_fetch_token;
        self.set_busy(|b| b.loading_conversations = true);

        let backend = self.backend.clone();
        let timeout = self.config.request_timeout();
        self.spawn_internal(async move {
            let result = bounded(
                timeout,
                list_conversations(backend.as_ref(), &me, Utc::now()),
            )
            .await;
            InternalEvent::ConversationListFetched { token, result }
        });
    }

    pub(super) fn on_conversation_list_fetched(
        &mut self,
        token: u64,
        result: Result<Vec<ConversationSummary>, SyncError>,
    ) {
        if token != self.list_fetch_token {
            return;
        }
        self.list_fetch_in_flight = false;
        self.state.busy.loading_conversations = false;

        match result {
            Ok(list) => {
                tracing::debug!(count = list.len(), "conversations: refreshed");
                self.state.conversation_list = list;
                if self.conversation.is_some() {
                    self.project_conversation();
                }
                self.emit_state();
            }
            Err(e) => {
                tracing::warn!(error = %e, "conversations: refresh failed");
                self.toast(e.user_message());
            }
        }

        if self.list_fetch_dirty {
            self.refresh_conversation_list();
        }
    }

    /// Subscribe to message inserts touching `me`; each one schedules a list refresh.
    pub(super) fn start_list_feed(&mut self, generation: u64, me: String) {
        let (sink, events) = flume::unbounded::<ChangeEvent>();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            while let Ok(event) = events.recv_async().await {
                let internal = if event.kind == ChangeKind::Closed {
                    InternalEvent::ListFeedEnded {
                        generation,
                        handle: event.subscription,
                    }
                } else {
                    InternalEvent::ListFeedChanged { generation }
                };
                if tx.send(CoreMsg::Internal(Box::new(internal))).is_err() {
                    break;
                }
            }
        });

        for filter in list_feed_filters(&me) {
            let backend = self.backend.clone();
            let sink = sink.clone();
            self.spawn_internal(async move {
                let result = backend
                    .subscribe(MESSAGES_TABLE, filter, sink)
                    .await
                    .map_err(|e| e.to_string());
                InternalEvent::ListFeedSubscribed { generation, result }
            });
        }
    }

    pub(super) fn on_list_feed_subscribed(
        &mut self,
        generation: u64,
        result: Result<SubscriptionHandle, String>,
    ) {
        match result {
            Ok(handle) => match self.session.as_mut() {
                Some(sess) if sess.generation == generation => sess.list_feed.push(handle),
                _ => self.release_subscriptions(vec![handle]),
            },
            Err(e) => {
                if self.session_generation() == Some(generation) {
                    tracing::warn!(error = %e, "conversations: live feed unavailable");
                }
            }
        }
    }

    /// The backend ended one list feed; the list stays as last fetched.
    pub(super) fn on_list_feed_ended(&mut self, generation: u64, handle: SubscriptionHandle) {
        if let Some(sess) = self.session.as_mut().filter(|s| s.generation == generation) {
            sess.list_feed.retain(|h| *h != handle);
            tracing::warn!(?handle, "conversations: live feed ended");
        }
        self.release_subscriptions(vec![handle]);
    }
}
