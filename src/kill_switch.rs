//! The fleet-wide kill switch.
//!
//! A single flag file under the data directory: present means active. The
//! file is the source of truth so the switch survives supervisor restarts
//! and can be flipped by out-of-band tooling; an in-memory mirror with a
//! short refresh window keeps the hot runtime loops off the filesystem.
//! Runtimes observe a flip within two seconds.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// File name of the flag under the data directory.
pub const KILL_SWITCH_FILE: &str = "KILL_SWITCH";

/// Longest a runtime may act on a stale reading.
pub const OBSERVATION_WINDOW: Duration = Duration::from_secs(2);

/// How long the in-memory mirror is trusted before re-checking the file.
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Process-global pause flag backed by an on-disk file.
#[derive(Debug)]
pub struct KillSwitch {
    path: PathBuf,
    active: AtomicBool,
    checked_at: Mutex<Instant>,
}

impl KillSwitch {
    /// Binds the switch to its flag file, probing the current state.
    #[must_use]
    pub fn new(data_dir: &Path) -> Self {
        let path = data_dir.join(KILL_SWITCH_FILE);
        let active = path.exists();
        Self {
            path,
            active: AtomicBool::new(active),
            checked_at: Mutex::new(Instant::now()),
        }
    }

    /// Activates the switch by writing the flag file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn activate(&self) -> std::io::Result<()> {
        tokio::fs::write(&self.path, b"active\n").await?;
        self.active.store(true, Ordering::SeqCst);
        info!("kill switch activated");
        Ok(())
    }

    /// Deactivates the switch by removing the flag file. Removing an
    /// already-clear switch is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub async fn deactivate(&self) -> std::io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.active.store(false, Ordering::SeqCst);
        info!("kill switch deactivated");
        Ok(())
    }

    /// Whether the switch is active, re-probing the file when the mirror
    /// has gone stale. Cheap enough for every loop iteration.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let mut checked_at = self
            .checked_at
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if checked_at.elapsed() >= REFRESH_INTERVAL {
            self.active.store(self.path.exists(), Ordering::SeqCst);
            *checked_at = Instant::now();
        }
        drop(checked_at);
        self.active.load(Ordering::SeqCst)
    }
}
