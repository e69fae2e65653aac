use std::process::{Command, Stdio};

use tracing::trace;

/// Hand a message to the desktop via `notify-send`. Failures of any kind
/// are uninteresting: the tool may not exist, there may be no session bus.
pub fn send(app: &str, summary: &str, body: &str) {
    let result = Command::new("notify-send")
        .args(["-u", "normal", "-t", "3000", "-a", app])
        .arg(summary)
        .arg(body)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(err) = result {
        trace!("notify-send unavailable: {err}");
    }
}
