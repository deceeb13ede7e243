use std::env;
use std::path::Path;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-env-changed=WLM_BUILD_STAMP");
    println!("cargo:rerun-if-changed=.git/HEAD");

    let stamp_time = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let revision = git_revision().unwrap_or_else(|| "nogit".to_string());
    let stamp = env::var("WLM_BUILD_STAMP")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("{}+{}", stamp_time, revision));

    println!("cargo:rustc-env=WLM_BUILD_STAMP={}", stamp);
    println!("cargo:rustc-env=WLM_BUILD_TIME={}", stamp_time);
    println!("cargo:rustc-env=WLM_BUILD_REV={}", revision);
}

fn git_revision() -> Option<String> {
    if !Path::new(".git").exists() {
        return None;
    }

    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let rev = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if rev.is_empty() {
        return None;
    }

    let dirty = Command::new("git")
        .args(["diff", "--quiet", "HEAD"])
        .status()
        .map(|status| !status.success())
        .unwrap_or(false);

    Some(if dirty { format!("{}-dirty", rev) } else { rev })
}
