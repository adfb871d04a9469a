mod chat_list;
pub mod config;
mod conversation;
mod home;
mod profile;
mod session;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use flume::Sender;

use crate::actions::AppAction;
use crate::backend::records::ProfileRecord;
use crate::backend::{BackendError, SharedBackend, SubscriptionHandle};
use crate::error::SyncError;
use crate::state::{AppState, BusyState, Screen};
use crate::updates::{AppUpdate, CoreMsg, InternalEvent};

use config::AppConfig;
use conversation::OpenConversation;
use session::Session;

/// Run `fut` under the request timeout; an expired timer is a remote failure.
pub(crate) async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, SyncError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| Err(BackendError::Timeout.into()))
}

pub struct AppCore {
    pub state: AppState,
    rev: u64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,

    config: AppConfig,
    backend: SharedBackend,
    runtime: tokio::runtime::Runtime,

    session: Option<Session>,
    session_seq: u64,
    restore_attempt: u64,

    conversation: Option<OpenConversation>,
    conversation_seq: u64,

    // Conversation list refresh coalescing.
    list_fetch_in_flight: bool,
    list_fetch_dirty: bool,
    list_fetch_token: u64,

    home_token: u64,
    home_profiles: Vec<ProfileRecord>,
    // Profiles seen on the home feed, keyed by id; used for conversation headers.
    profiles: HashMap<String, ProfileRecord>,
}

impl AppCore {
    pub fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        shared_state: Arc<RwLock<AppState>>,
        config: AppConfig,
        backend: Option<SharedBackend>,
    ) -> anyhow::Result<Self> {
        let backend = match backend {
            Some(b) => b,
            None => config.build_backend()?,
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .enable_io()
            .build()
            .context("build tokio runtime")?;

        let this = Self {
            state: AppState::empty(),
            rev: 0,
            update_sender,
            core_sender,
            shared_state,
            config,
            backend,
            runtime,
            session: None,
            session_seq: 0,
            restore_attempt: 0,
            conversation: None,
            conversation_seq: 0,
            list_fetch_in_flight: false,
            list_fetch_dirty: false,
            list_fetch_token: 0,
            home_token: 0,
            home_profiles: vec![],
            profiles: HashMap::new(),
        };

        // Ensure FfiApp.state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        Ok(this)
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit_state(&mut self) {
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    fn toast(&mut self, msg: impl Into<String>) {
        // Keep toast in state until the UI explicitly clears it.
        self.state.toast = Some(msg.into());
        self.emit_state();
    }

    fn set_busy(&mut self, f: impl FnOnce(&mut BusyState)) {
        let mut next = self.state.busy.clone();
        f(&mut next);
        if next != self.state.busy {
            self.state.busy = next;
            self.emit_state();
        }
    }

    fn is_logged_in(&self) -> bool {
        self.session.is_some()
    }

    fn session_user_id(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.user_id.clone())
    }

    fn session_generation(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.generation)
    }

    /// Spawn `fut` on the runtime and feed its event back into the actor.
    fn spawn_internal<F>(&self, fut: F)
    where
        F: Future<Output = InternalEvent> + Send + 'static,
    {
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let event = fut.await;
            let _ = tx.send(CoreMsg::Internal(Box::new(event)));
        });
    }

    fn release_subscriptions(&self, handles: Vec<SubscriptionHandle>) {
        if handles.is_empty() {
            return;
        }
        let backend = self.backend.clone();
        self.runtime.spawn(async move {
            for handle in handles {
                backend.unsubscribe(handle).await;
            }
        });
    }

    fn push_screen(&mut self, screen: Screen) {
        if self.state.router.screen_stack.last() != Some(&screen) {
            self.state.router.screen_stack.push(screen);
        }
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(ref action) => {
                // Never log `?action` directly: it can carry the access token.
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action.clone());
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::SessionResolved { attempt, result } => {
                self.on_session_resolved(attempt, result)
            }
            InternalEvent::MyProfileLoaded { generation, result } => {
                self.on_my_profile_loaded(generation, result)
            }
            InternalEvent::ConversationHistoryFetched {
                conversation,
                token,
                result,
            } => self.on_history_fetched(conversation, token, result),
            InternalEvent::ConversationSubscribed {
                conversation,
                result,
            } => self.on_conversation_subscribed(conversation, result),
            InternalEvent::ConversationChange {
                conversation,
                event,
            } => self.on_conversation_change(conversation, event),
            InternalEvent::MessageSendResult {
                conversation,
                local_id,
                result,
            } => self.on_send_result(conversation, &local_id, result),
            InternalEvent::ConversationListFetched { token, result } => {
                self.on_conversation_list_fetched(token, result)
            }
            InternalEvent::ListFeedSubscribed { generation, result } => {
                self.on_list_feed_subscribed(generation, result)
            }
            InternalEvent::ListFeedChanged { generation } => {
                if self.session_generation() == Some(generation) {
                    tracing::debug!("conversations: feed changed");
                    self.refresh_conversation_list();
                }
            }
            InternalEvent::ListFeedEnded { generation, handle } => {
                self.on_list_feed_ended(generation, handle)
            }
            InternalEvent::HomeFetched { token, result } => self.on_home_fetched(token, result),
            InternalEvent::LocationSaved { generation, error } => {
                if let (Some(e), true) = (error, self.session_generation() == Some(generation)) {
                    tracing::warn!(error = %e, "home: saving location failed");
                }
            }
            InternalEvent::ProfileSaved { generation, result } => {
                self.on_profile_saved(generation, result)
            }
            InternalEvent::AvatarUploaded { generation, result } => {
                self.on_avatar_uploaded(generation, result)
            }
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            // Auth
            AppAction::RestoreSession { access_token } => self.restore_session(access_token),
            AppAction::SignOut => self.sign_out(),

            // Navigation
            AppAction::PushScreen { screen } => {
                if !self.is_logged_in() && screen != Screen::Auth {
                    self.toast("Please sign in first");
                    return;
                }
                self.push_screen(screen);
                self.sync_conversation_to_router();
                self.emit_state();
            }
            AppAction::UpdateScreenStack { stack } => {
                self.state.router.screen_stack = stack;
                self.sync_conversation_to_router();
                self.emit_state();
            }

            // Conversation
            AppAction::OpenConversation { counterparty_id } => {
                self.push_screen(Screen::Conversation { counterparty_id });
                self.sync_conversation_to_router();
                self.emit_state();
            }
            AppAction::CloseConversation => {
                if matches!(
                    self.state.router.screen_stack.last(),
                    Some(Screen::Conversation { .. })
                ) {
                    self.state.router.screen_stack.pop();
                }
                self.sync_conversation_to_router();
                self.emit_state();
            }
            AppAction::RefreshConversation => self.refresh_conversation(),
            AppAction::SendMessage { content } => self.send_message(&content),
            AppAction::RetryMessage { message_id } => self.retry_message(&message_id),

            // Lists
            AppAction::RefreshConversationList => self.refresh_conversation_list(),
            AppAction::RefreshHome => self.refresh_home(),
            AppAction::UpdateLocation {
                latitude,
                longitude,
            } => self.update_location(latitude, longitude),

            // Profile
            AppAction::UpdateProfile {
                username,
                age,
                avatar_url,
            } => self.update_profile(username, age, avatar_url),
            AppAction::UploadAvatar { file_name, bytes } => self.upload_avatar(file_name, bytes),

            // UI
            AppAction::ClearToast => {
                if self.state.toast.is_some() {
                    self.state.toast = None;
                    self.emit_state();
                }
            }

            // Lifecycle
            AppAction::Foregrounded => {
                // Native sends lifecycle signals as actions; Rust owns the refresh.
                if self.is_logged_in() {
                    self.refresh_conversation_list();
                    self.refresh_home();
                    self.refresh_conversation();
                }
            }
        }
    }
}
