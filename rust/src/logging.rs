/// Logging initialization.
///
/// `tracing-subscriber` `fmt` to stderr, filtered by `RUST_LOG` (default
/// `nearby_core=debug,info`). With `log_to_file`, the same events are appended
/// to `<data_dir>/nearby.log` so they can be pulled off a device.
///
/// Called once at the start of `FfiApp::new()`, before anything else. Later
/// calls (tests build many apps in one process) are no-ops.
pub fn init_logging(data_dir: &str, log_to_file: bool) {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());

    let file_layer = if log_to_file {
        let log_path = std::path::Path::new(data_dir).join("nearby.log");
        let _ = std::fs::create_dir_all(data_dir);
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true),
            ),
            Err(_) => None,
        }
    } else {
        None
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
}

const DEFAULT_FILTER: &str = "nearby_core=debug,info";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_layer_creates_log_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_string_lossy().to_string();
        init_logging(&data_dir, true);
        init_logging(&data_dir, true);
        assert!(dir.path().join("nearby.log").exists());
    }
}
