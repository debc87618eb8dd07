//! Durable trace
//!
//! The daemon's log file is the operator-facing trace and is forwarded
//! upstream on request. Next to it lives a small JSON record of the last
//! lifecycle phase, which is what startup classification reads first. When
//! the record is missing, classification falls back to the last line of the
//! log and a fixed set of sentinel substrings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Line left in the log after rotation
pub const ROTATED_MARKER: &str = "Registration successful.";

/// Log-tail markers of a deliberate restart (reboot, update handoff)
const BENIGN_RESTART_MARKERS: [&str; 3] = ["sudo reboot", "python3 daemon.py", "Exiting second update."];

/// Log-tail markers of a clean stop
const CLEAN_STOP_MARKERS: [&str; 2] = ["Exiting update.", "Stopping daemon."];

/// Last lifecycle phase the daemon recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Running,
    Rebooting,
    RestartScheduled,
    SecondUpdateComplete,
    Stopped,
}

impl Phase {
    /// How a process finding this phase on disk should treat its start
    pub fn startup_kind(self) -> StartupKind {
        match self {
            Phase::Running => StartupKind::Crashed,
            Phase::Rebooting | Phase::RestartScheduled | Phase::SecondUpdateComplete => {
                StartupKind::BenignRestart
            }
            Phase::Stopped => StartupKind::Clean,
        }
    }
}

/// Classification of a normal (non first-time) startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupKind {
    /// The previous process stopped cleanly
    Clean,
    /// The previous process handed off through a reboot or an update
    BenignRestart,
    /// The previous process never reached a clean exit
    Crashed,
}

#[derive(Debug, Serialize, Deserialize)]
struct PhaseRecord {
    phase: Phase,
    at: DateTime<Utc>,
}

/// Classifies a startup from the last line of the log
pub fn classify_line(line: &str) -> StartupKind {
    if BENIGN_RESTART_MARKERS.iter().any(|m| line.contains(m)) {
        StartupKind::BenignRestart
    } else if CLEAN_STOP_MARKERS.iter().any(|m| line.contains(m)) {
        StartupKind::Clean
    } else {
        StartupKind::Crashed
    }
}

#[derive(Debug, Clone)]
pub struct Trace {
    log_path: PathBuf,
    record_path: PathBuf,
}

impl Trace {
    pub fn new(log_path: impl Into<PathBuf>, record_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            record_path: record_path.into(),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Whether this host has run the daemon before
    pub fn exists(&self) -> bool {
        self.log_path.exists()
    }

    /// Last non-blank line of the log
    pub fn last_line(&self) -> Option<String> {
        let content = fs::read_to_string(&self.log_path).ok()?;
        content
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(str::to_string)
    }

    /// All non-blank lines of the log
    pub fn read_lines(&self) -> io::Result<Vec<String>> {
        let content = fs::read_to_string(&self.log_path)?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Truncates the log down to the rotation marker
    pub fn reset(&self) -> io::Result<()> {
        fs::write(&self.log_path, format!("{}\n", ROTATED_MARKER))
    }

    pub fn record(&self, phase: Phase) -> io::Result<()> {
        let record = PhaseRecord {
            phase,
            at: Utc::now(),
        };
        let json = serde_json::to_vec(&record).map_err(io::Error::other)?;
        fs::write(&self.record_path, json)
    }

    pub fn last_phase(&self) -> Option<Phase> {
        let bytes = fs::read(&self.record_path).ok()?;
        serde_json::from_slice::<PhaseRecord>(&bytes)
            .ok()
            .map(|r| r.phase)
    }

    /// Classifies this startup; must run before logging opens the file
    pub fn classify_startup(&self) -> StartupKind {
        if let Some(phase) = self.last_phase() {
            return phase.startup_kind();
        }

        self.last_line()
            .map(|line| classify_line(&line))
            .unwrap_or(StartupKind::Crashed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn trace_in(dir: &TempDir) -> Trace {
        Trace::new(dir.path().join("daemon.log"), dir.path().join("lifecycle.json"))
    }

    #[test]
    fn test_benign_restart_markers() {
        for line in [
            "2026-01-01T00:00:00Z DEBUG kiln_daemon::shell: Running command sudo reboot...",
            "INFO Running command echo 'sleep 3; python3 daemon.py' | at now",
            "INFO kiln_daemon: Exiting second update.",
        ] {
            assert_eq!(classify_line(line), StartupKind::BenignRestart, "{}", line);
        }
    }

    #[test]
    fn test_clean_stop_markers() {
        assert_eq!(classify_line("INFO Stopping daemon."), StartupKind::Clean);
        assert_eq!(classify_line("INFO Exiting update."), StartupKind::Clean);
    }

    #[test]
    fn test_anything_else_is_a_crash() {
        assert_eq!(
            classify_line("ERROR Unhandled error in worker"),
            StartupKind::Crashed
        );
        assert_eq!(classify_line(ROTATED_MARKER), StartupKind::Crashed);
    }

    #[test]
    fn test_classification_falls_back_to_log_tail() {
        let dir = TempDir::new().unwrap();
        let trace = trace_in(&dir);
        assert!(!trace.exists());

        fs::write(
            trace.log_path(),
            "INFO started\nINFO Exiting second update.\n\n",
        )
        .unwrap();
        assert!(trace.exists());
        assert_eq!(
            trace.last_line().as_deref(),
            Some("INFO Exiting second update.")
        );
        assert_eq!(trace.classify_startup(), StartupKind::BenignRestart);
    }

    #[test]
    fn test_phase_record_takes_precedence() {
        let dir = TempDir::new().unwrap();
        let trace = trace_in(&dir);
        fs::write(trace.log_path(), "INFO Stopping daemon.\n").unwrap();

        trace.record(Phase::Running).unwrap();
        assert_eq!(trace.last_phase(), Some(Phase::Running));
        assert_eq!(trace.classify_startup(), StartupKind::Crashed);

        trace.record(Phase::RestartScheduled).unwrap();
        assert_eq!(trace.classify_startup(), StartupKind::BenignRestart);

        trace.record(Phase::Stopped).unwrap();
        assert_eq!(trace.classify_startup(), StartupKind::Clean);
    }

    #[test]
    fn test_reset_and_read_lines() {
        let dir = TempDir::new().unwrap();
        let trace = trace_in(&dir);
        fs::write(trace.log_path(), "one\n\n  \ntwo\n").unwrap();
        assert_eq!(trace.read_lines().unwrap(), vec!["one", "two"]);

        trace.reset().unwrap();
        assert_eq!(trace.read_lines().unwrap(), vec![ROTATED_MARKER]);
    }
}
