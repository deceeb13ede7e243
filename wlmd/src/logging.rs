//! Tracing subscriber setup.

use std::fs::OpenOptions;
use std::io;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::LogCfg;

/// `--debug` beats `RUST_LOG`, which beats `[log].level`.
pub fn filter(cfg: &LogCfg, debug: bool) -> EnvFilter {
    if debug {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level))
}

/// Install the global subscriber. Logs go to stderr, or are appended to
/// `[log].file` when set. A second call is a no-op.
pub fn init(cfg: &LogCfg, debug: bool) -> io::Result<()> {
    let filter = filter(cfg, debug);
    match &cfg.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .try_init();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flag_overrides_level() {
        let cfg = LogCfg {
            level: "warn".into(),
            file: None,
        };
        assert_eq!(filter(&cfg, true).to_string(), "debug");
    }

    #[test]
    fn unwritable_log_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LogCfg {
            level: "info".into(),
            file: Some(dir.path().join("missing").join("wlmd.log")),
        };
        assert!(init(&cfg, false).is_err());
    }
}
