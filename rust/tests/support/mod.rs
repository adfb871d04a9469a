#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nearby_core::{AppReconciler, AppState, AppUpdate, FfiApp};

pub const ME: &str = "11111111-1111-4111-8111-111111111111";
pub const THEM: &str = "22222222-2222-4222-8222-222222222222";
pub const OTHER: &str = "33333333-3333-4333-8333-333333333333";

pub fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("{what}: condition not met within {timeout:?}");
}

/// Poll `app.state()` until `f` holds, returning the matching snapshot.
pub fn wait_for_state(app: &FfiApp, what: &str, f: impl Fn(&AppState) -> bool) -> AppState {
    let mut last = None;
    wait_until(what, Duration::from_secs(5), || {
        let s = app.state();
        let ok = f(&s);
        last = Some(s);
        ok
    });
    last.unwrap()
}

pub fn write_config(data_dir: &str, extra: serde_json::Value) {
    let path = std::path::Path::new(data_dir).join("nearby_config.json");
    let mut v = serde_json::json!({ "disable_network": true });
    if let (Some(base), serde_json::Value::Object(extra)) = (v.as_object_mut(), extra) {
        base.extend(extra);
    }
    std::fs::write(path, serde_json::to_vec(&v).unwrap()).unwrap();
}

pub fn block_on<F: Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(fut)
}

pub fn message_row(id: &str, from: &str, to: &str, content: &str, at: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "sender_id": from,
        "receiver_id": to,
        "content": content,
        "created_at": at,
    })
}

pub fn profile_row(id: &str, username: Option<&str>, created_at: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "username": username,
        "created_at": created_at,
    })
}

#[derive(Clone)]
pub struct Collector(pub Arc<Mutex<Vec<AppUpdate>>>);

impl Collector {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn revs(&self) -> Vec<u64> {
        self.0.lock().unwrap().iter().map(AppUpdate::rev).collect()
    }
}

impl AppReconciler for Collector {
    fn reconcile(&self, update: AppUpdate) {
        self.0.lock().unwrap().push(update);
    }
}
