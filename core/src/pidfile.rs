//! Pidfile write/remove, ported from `Ssm2.startup()` / `Ssm2.shutdown()` in
//! `examples/original_source/ssm/ssm2.py`. Failures here are logged and
//! swallowed rather than propagated: a receiver that cannot write its
//! pidfile should still run, it just won't be detectable by the pre-flight
//! existence check the CLI does before daemonizing.

use std::path::Path;

use tracing::warn;

/// Write the running process id to `pidfile`, one line, trailing newline.
/// Mirrors the plain `open/write/close` in the Python source: any I/O
/// failure is a warning, not a fatal error.
pub fn write_pidfile(pidfile: &Path) {
    let contents = format!("{}\n", std::process::id());
    if let Err(e) = std::fs::write(pidfile, contents) {
        warn!("Failed to create pidfile {}: {}", pidfile.display(), e);
    }
}

/// Remove `pidfile` on shutdown. A missing file and an I/O failure are both
/// warnings: the latter leaves a stale pidfile behind, which the Python
/// source calls out as blocking the next startup until removed by hand.
pub fn remove_pidfile(pidfile: &Path) {
    if !pidfile.exists() {
        warn!("pidfile {} not found.", pidfile.display());
        return;
    }
    if let Err(e) = std::fs::remove_file(pidfile) {
        warn!("Failed to remove pidfile {}: {}", pidfile.display(), e);
        warn!("SSM may not start again until it is removed.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_remove_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssm.pid");
        write_pidfile(&path);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        remove_pidfile(&path);
        assert!(!path.exists());
    }

    #[test]
    fn remove_of_missing_pidfile_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.pid");
        remove_pidfile(&path);
    }
}
