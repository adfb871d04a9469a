mod actions;
pub mod aggregator;
pub mod backend;
pub mod conversation;
mod core;
pub mod error;
pub mod feed;
pub mod geo;
pub mod identity;
mod logging;
pub mod profile;
mod state;
mod updates;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use flume::{Receiver, Sender};

pub use actions::AppAction;
pub use backend::SharedBackend;
pub use crate::core::config::{load_app_config, AppConfig};
pub use error::{BackendError, SyncError};
pub use geo::Coordinates;
pub use state::*;
pub use updates::*;

/// Return the default `nearby_config.json` payload used when no config file exists.
pub fn default_config_json() -> String {
    core::config::default_config_json()
}

#[uniffi::export]
pub fn is_valid_user_id(input: &str) -> bool {
    identity::is_valid_identity(input.trim())
}

#[uniffi::export]
pub fn distance_label(from: Option<Coordinates>, to: Option<Coordinates>) -> String {
    geo::format_distance(geo::distance_km(from, to))
}

uniffi::setup_scaffolding!();

#[uniffi::export(callback_interface)]
pub trait AppReconciler: Send + Sync + 'static {
    fn reconcile(&self, update: AppUpdate);
}

#[derive(uniffi::Object)]
pub struct FfiApp {
    core_tx: Sender<CoreMsg>,
    update_rx: Receiver<AppUpdate>,
    listening: AtomicBool,
    shared_state: Arc<RwLock<AppState>>,
}

#[uniffi::export]
impl FfiApp {
    #[uniffi::constructor]
    pub fn new(data_dir: String) -> Arc<Self> {
        Self::start(data_dir, None)
    }

    pub fn state(&self) -> AppState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn dispatch(&self, action: AppAction) {
        // Contract: never block caller.
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    pub fn listen_for_updates(&self, reconciler: Box<dyn AppReconciler>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Avoid multiple listeners that would split messages.
            return;
        }

        let rx = self.update_rx.clone();
        thread::spawn(move || {
            while let Ok(update) = rx.recv() {
                reconciler.reconcile(update);
            }
        });
    }
}

impl FfiApp {
    /// Build an app over a caller-supplied backend instead of the configured one.
    /// Not exposed over UniFFI; integration tests run it over a `MemoryBackend`.
    pub fn with_backend(data_dir: String, backend: SharedBackend) -> Arc<Self> {
        Self::start(data_dir, Some(backend))
    }

    fn start(data_dir: String, backend: Option<SharedBackend>) -> Arc<Self> {
        let config = load_app_config(&data_dir);
        logging::init_logging(&data_dir, config.log_to_file());
        tracing::info!(data_dir = %data_dir, injected = backend.is_some(), "FfiApp starting");

        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let shared_state = Arc::new(RwLock::new(AppState::empty()));

        // Actor loop thread (single threaded "app actor").
        let core_tx_for_core = core_tx.clone();
        let shared_for_core = shared_state.clone();
        thread::spawn(move || {
            let mut core = match crate::core::AppCore::new(
                update_tx,
                core_tx_for_core,
                shared_for_core,
                config,
                backend,
            ) {
                Ok(core) => core,
                Err(e) => {
                    tracing::error!("app core failed to start: {e:#}");
                    return;
                }
            };
            while let Ok(msg) = core_rx.recv() {
                core.handle_message(msg);
            }
        });

        Arc::new(Self {
            core_tx,
            update_rx,
            listening: AtomicBool::new(false),
            shared_state,
        })
    }
}
