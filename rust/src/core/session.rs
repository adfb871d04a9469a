// Session lifecycle: token restore, sign in/out, teardown.

use super::*;

use crate::backend::Identity;
use crate::state::{AuthState, MyProfileState};

pub(super) struct Session {
    pub(super) user_id: String,
    /// Bumped per session; async results started under an older one are dropped.
    pub(super) generation: u64,
    pub(super) list_feed: Vec<SubscriptionHandle>,
}

impl AppCore {
    pub(super) fn restore_session(&mut self, access_token: String) {
        let token = access_token.trim().to_string();
        if token.is_empty() {
            self.toast("Authentication required");
            return;
        }

        self.stop_session();
        if self.state.auth != AuthState::LoggedOut {
            self.state = AppState::empty();
        }
        self.restore_attempt += 1;
        let attempt = self.restore_attempt;
        tracing::info!(attempt, "restore_session");

        self.backend.set_access_token(Some(token));
        self.set_busy(|b| b.restoring_session = true);

        let backend = self.backend.clone();
        let timeout = self.config.request_timeout();
        self.spawn_internal(async move {
            let result = match tokio::time::timeout(timeout, backend.current_identity()).await {
                Ok(r) => r.map_err(|e| e.to_string()),
                Err(_) => Err(BackendError::Timeout.to_string()),
            };
            InternalEvent::SessionResolved { attempt, result }
        });
    }

    pub(super) fn on_session_resolved(
        &mut self,
        attempt: u64,
        result: Result<Option<Identity>, String>,
    ) {
        if attempt != self.restore_attempt {
            tracing::debug!(attempt, "session: dropping stale resolution");
            return;
        }
        self.set_busy(|b| b.restoring_session = false);
        match result {
            Ok(Some(identity)) => self.start_session(identity),
            Ok(None) => {
                tracing::info!("session: token rejected");
                self.backend.set_access_token(None);
                self.toast("Authentication required");
            }
            Err(e) => {
                tracing::warn!(error = %e, "session: identity lookup failed");
                self.backend.set_access_token(None);
                self.toast(SyncError::RemoteFailure(e).user_message());
            }
        }
    }

    fn start_session(&mut self, identity: Identity) {
        self.stop_session();

        self.session_seq += 1;
        let generation = self.session_seq;
        let me = identity.id.clone();
        tracing::info!(user = %crate::identity::short_identity(&me), generation, "start_session");

        self.session = Some(Session {
            user_id: me.clone(),
            generation,
            list_feed: vec![],
        });
        self.state.auth = AuthState::LoggedIn {
            user_id: me.clone(),
            email: identity.email,
        };
        self.state.my_profile = MyProfileState::empty();
        self.state.router.default_screen = Screen::Home;
        self.state.router.screen_stack.clear();
        self.emit_state();

        self.load_my_profile();
        self.refresh_conversation_list();
        self.refresh_home();
        self.start_list_feed(generation, me);
    }

    /// Drop everything bound to the current session. In-flight work keyed to
    /// it becomes stale.
    pub(super) fn stop_session(&mut self) {
        self.close_conversation();

        self.list_fetch_token = self.list_fetch_token.wrapping_add(1);
        self.list_fetch_in_flight = false;
        self.list_fetch_dirty = false;
        self.home_token = self.home_token.wrapping_add(1);
        self.home_profiles.clear();
        self.profiles.clear();

        if let Some(sess) = self.session.take() {
            tracing::info!(generation = sess.generation, "stop_session");
            self.release_subscriptions(sess.list_feed);
        }
    }

    pub(super) fn sign_out(&mut self) {
        self.stop_session();
        // A restore still in flight must not sign back in.
        self.restore_attempt += 1;
        self.backend.set_access_token(None);

        self.state = AppState::empty();
        self.emit_state();
    }
}
