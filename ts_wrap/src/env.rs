//! What the orchestrator learns from the environment it was started in.

use chrono::Local;
use std::io::Write;
use std::process::Command;

/// The operator recorded in provenance documents.
pub fn operator() -> Option<String> {
    std::env::var("USER").ok().filter(|user| !user.is_empty())
}

/// `git describe --always` of the working directory, when it is a checkout.
pub fn revision() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--always"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let revision = String::from_utf8(output.stdout).ok()?.trim().to_string();
    (!revision.is_empty()).then_some(revision)
}

/// Log to stderr at `info` unless RUST_LOG says otherwise.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .try_init();
}
