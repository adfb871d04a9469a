// Home feed: fresh faces and nearby users, ordered from the viewer's location.

use super::*;

use crate::backend::records::PROFILES_TABLE;
use crate::backend::Predicate;
use crate::feed::{build_home_feed, fetch_profiles};
use crate::geo::Coordinates;
use crate::profile::location_patch;

impl AppCore {
    pub(super) fn refresh_home(&mut self) {
        if !self.is_logged_in() {
            return;
        }
        self.home_token = self.home_token.wrapping_add(1);
        let token = self.home_token;
        self.state.home.is_loading = true;
        self.set_busy(|b| b.loading_home = true);

        let backend = self.backend.clone();
        let timeout = self.config.request_timeout();
        self.spawn_internal(async move {
            let result = bounded(timeout, fetch_profiles(backend.as_ref())).await;
            InternalEvent::HomeFetched { token, result }
        });
    }

    pub(super) fn on_home_fetched(
        &mut self,
        token: u64,
        result: Result<Vec<ProfileRecord>, SyncError>,
    ) {
        if token != self.home_token {
            return;
        }
        self.state.busy.loading_home = false;
        self.state.home.is_loading = false;

        match result {
            Ok(profiles) => {
                tracing::debug!(count = profiles.len(), "home: refreshed");
                for p in &profiles {
                    self.profiles.insert(p.id.clone(), p.clone());
                }
                self.home_profiles = profiles;
                self.rebuild_home();
                if self.conversation.is_some() {
                    self.project_conversation();
                }
                self.emit_state();
            }
            Err(e) => {
                tracing::warn!(error = %e, "home: refresh failed");
                self.toast(e.user_message());
            }
        }
    }

    /// Recompute the feed from cached profiles and the current location.
    pub(super) fn rebuild_home(&mut self) {
        let Some(me) = self.session_user_id() else {
            return;
        };
        let (fresh_faces, nearby) = build_home_feed(
            &me,
            self.state.my_profile.location,
            &self.home_profiles,
            self.config.fresh_faces_count(),
        );
        self.state.home.fresh_faces = fresh_faces;
        self.state.home.nearby = nearby;
    }

    pub(super) fn update_location(&mut self, latitude: f64, longitude: f64) {
        let (Some(me), Some(generation)) = (self.session_user_id(), self.session_generation())
        else {
            return;
        };
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        if !valid {
            self.toast("Invalid location");
            return;
        }

        self.state.my_profile.location = Some(Coordinates::new(latitude, longitude));
        self.rebuild_home();
        self.emit_state();

        let backend = self.backend.clone();
        let timeout = self.config.request_timeout();
        self.spawn_internal(async move {
            let save = async {
                backend
                    .update(
                        PROFILES_TABLE,
                        &Predicate::eq("id", me),
                        location_patch(latitude, longitude),
                    )
                    .await
                    .map_err(SyncError::from)
            };
            let error = bounded(timeout, save).await.err().map(|e| e.to_string());
            InternalEvent::LocationSaved { generation, error }
        });
    }
}
