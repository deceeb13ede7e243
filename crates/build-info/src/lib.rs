//! Build stamp shared by the wlmd binaries.

use once_cell::sync::Lazy;

/// Values captured by `build.rs` at compile time.
#[derive(Debug, Clone)]
pub struct BuildStamp {
    pub stamp: &'static str,
    pub time: &'static str,
    pub revision: &'static str,
}

static STAMP: Lazy<BuildStamp> = Lazy::new(|| BuildStamp {
    stamp: option_env!("WLM_BUILD_STAMP").unwrap_or("unstamped"),
    time: option_env!("WLM_BUILD_TIME").unwrap_or("unknown"),
    revision: option_env!("WLM_BUILD_REV").unwrap_or("unknown"),
});

pub fn stamp() -> &'static BuildStamp {
    &STAMP
}

/// `"<product> v<version> (<stamp>)"`, used for the startup log line and help output.
pub fn banner(product: &str, version: &str) -> String {
    format!("{} v{} ({})", product, version, STAMP.stamp)
}
