// Current user's profile: load, registration edits, avatar upload.

use super::*;

use serde_json::Value;

use crate::backend::records::{AVATARS_BUCKET, PROFILES_TABLE};
use crate::backend::{decode_row, Predicate};
use crate::feed::fetch_profile;
use crate::geo::Coordinates;
use crate::profile::{avatar_object, profile_patch};

impl AppCore {
    pub(super) fn load_my_profile(&mut self) {
        let (Some(me), Some(generation)) = (self.session_user_id(), self.session_generation())
        else {
            return;
        };
        let backend = self.backend.clone();
        let timeout = self.config.request_timeout();
        self.spawn_internal(async move {
            let result = bounded(timeout, fetch_profile(backend.as_ref(), &me)).await;
            InternalEvent::MyProfileLoaded { generation, result }
        });
    }

    pub(super) fn on_my_profile_loaded(
        &mut self,
        generation: u64,
        result: Result<Option<ProfileRecord>, SyncError>,
    ) {
        if self.session_generation() != Some(generation) {
            return;
        }
        match result {
            Ok(Some(p)) => self.apply_my_profile(p),
            Ok(None) => {
                tracing::info!("profile: none yet, routing to registration");
                self.state.router.default_screen = Screen::Register;
            }
            Err(e) => {
                tracing::warn!(error = %e, "profile: load failed");
                self.toast(e.user_message());
                return;
            }
        }
        self.emit_state();
    }

    fn apply_my_profile(&mut self, p: ProfileRecord) {
        let my = &mut self.state.my_profile;
        my.username = p.username.clone();
        my.age = p.age;
        my.avatar_url = p.avatar_url.clone();
        // A fix reported this session wins over the stored one.
        if my.location.is_none() {
            my.location = Coordinates::from_parts(p.latitude, p.longitude);
        }
        self.state.router.default_screen = if p.username.is_some() {
            Screen::Home
        } else {
            Screen::Register
        };
        self.profiles.insert(p.id.clone(), p);
        self.rebuild_home();
    }

    pub(super) fn update_profile(
        &mut self,
        username: Option<String>,
        age: Option<i32>,
        avatar_url: Option<String>,
    ) {
        let (Some(me), Some(generation)) = (self.session_user_id(), self.session_generation())
        else {
            return;
        };
        let avatar_url = avatar_url.or_else(|| self.state.my_profile.draft_avatar_url.clone());
        let patch = match profile_patch(username.as_deref(), age, avatar_url.as_deref()) {
            Ok(patch) => patch,
            Err(e) => {
                self.toast(e.to_string());
                return;
            }
        };
        self.set_busy(|b| b.saving_profile = true);

        let backend = self.backend.clone();
        let timeout = self.config.request_timeout();
        self.spawn_internal(async move {
            let save = async {
                backend
                    .update(PROFILES_TABLE, &Predicate::eq("id", me), patch)
                    .await
                    .map_err(SyncError::from)
            };
            let result = bounded(timeout, save).await.map_err(|e| e.to_string());
            InternalEvent::ProfileSaved { generation, result }
        });
    }

    pub(super) fn on_profile_saved(&mut self, generation: u64, result: Result<Vec<Value>, String>) {
        if self.session_generation() != Some(generation) {
            return;
        }
        self.state.busy.saving_profile = false;
        match result {
            Ok(rows) => {
                match rows.into_iter().next().map(decode_row::<ProfileRecord>) {
                    Some(Ok(p)) => {
                        self.state.my_profile.draft_avatar_url = None;
                        self.apply_my_profile(p);
                    }
                    Some(Err(e)) => tracing::warn!(error = %e, "profile: undecodable saved row"),
                    None => tracing::warn!("profile: update matched no rows"),
                }
                self.emit_state();
            }
            Err(e) => {
                tracing::warn!(error = %e, "profile: save failed");
                self.toast(SyncError::RemoteFailure(e).user_message());
            }
        }
    }

    pub(super) fn upload_avatar(&mut self, file_name: String, bytes: Vec<u8>) {
        let Some(generation) = self.session_generation() else {
            return;
        };
        if bytes.is_empty() {
            self.toast("Image is empty");
            return;
        }
        let (path, content_type) = match avatar_object(&file_name) {
            Ok(v) => v,
            Err(e) => {
                self.toast(e.to_string());
                return;
            }
        };
        tracing::info!(%path, size = bytes.len(), "profile: uploading avatar");
        self.set_busy(|b| b.uploading_avatar = true);

        let backend = self.backend.clone();
        let timeout = self.config.request_timeout();
        self.spawn_internal(async move {
            let upload = async {
                let stored = backend
                    .upload(AVATARS_BUCKET, &path, bytes, content_type)
                    .await?;
                Ok::<_, SyncError>(backend.public_url(AVATARS_BUCKET, &stored))
            };
            let result = bounded(timeout, upload).await.map_err(|e| e.to_string());
            InternalEvent::AvatarUploaded { generation, result }
        });
    }

    pub(super) fn on_avatar_uploaded(&mut self, generation: u64, result: Result<String, String>) {
        if self.session_generation() != Some(generation) {
            return;
        }
        self.state.busy.uploading_avatar = false;
        match result {
            Ok(url) => {
                tracing::debug!(%url, "profile: avatar stored");
                self.state.my_profile.draft_avatar_url = Some(url);
                self.emit_state();
            }
            Err(e) => {
                tracing::warn!(error = %e, "profile: avatar upload failed");
                self.toast(SyncError::RemoteFailure(e).user_message());
            }
        }
    }
}
