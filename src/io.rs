//! External collaborator seams: clock, archiver, transport, notifier
//!
//! Byte transfer, remote upload and notification delivery live behind these
//! traits; the core never assumes more than the contracts below.

use crate::{types::RunOutcome, Result, VaultError};
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

/// Time source for `created_at`/`completed_at` stamps. Must be monotonic
/// enough to totally order node creation within one destination.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used in production.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock for tests and replay tooling.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

/// Moves bytes between the source tree, the store and restore destinations.
/// Compression or encryption of payloads belongs to implementations of this
/// trait, never to the core.
pub trait Archiver: Send + Sync {
    fn write(&self, path: &Path, bytes: &[u8]) -> Result<()>;
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
}

/// Plain filesystem archiver.
#[derive(Debug, Default)]
pub struct LocalArchiver;

impl Archiver for LocalArchiver {
    fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }
}

/// Pushes a completed local artifact to remote storage. Failures are
/// surfaced as `TransportError` and logged, but never invalidate the
/// already-completed local node.
pub trait Transport: Send + Sync {
    fn push(&self, local: &Path, remote: &str) -> Result<()>;
}

/// Transport used when no remote is configured.
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn push(&self, _local: &Path, remote: &str) -> Result<()> {
        if !remote.is_empty() {
            return Err(VaultError::Transport {
                reason: format!("no transport configured for remote {remote}"),
            });
        }
        Ok(())
    }
}

/// Fire-and-forget status notification; delivery failures are logged only.
pub trait Notifier: Send + Sync {
    fn notify(&self, status: RunOutcome, details: &str);
}

/// Notifier that reports through the log stream.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, status: RunOutcome, details: &str) {
        match status {
            RunOutcome::Failed => warn!("run {}: {}", status, details),
            _ => info!("run {}: {}", status, details),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), start + Duration::seconds(90));
    }

    #[test]
    fn test_local_archiver_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let archiver = LocalArchiver;
        let path = dir.path().join("nested/dir/file.bin");

        archiver.write(&path, b"payload").unwrap();
        assert_eq!(archiver.read(&path).unwrap(), b"payload");
    }

    #[test]
    fn test_null_transport_rejects_remote() {
        let transport = NullTransport;
        assert!(transport.push(Path::new("/tmp/x"), "").is_ok());
        assert!(matches!(
            transport.push(Path::new("/tmp/x"), "s3://bucket"),
            Err(VaultError::Transport { .. })
        ));
    }
}
