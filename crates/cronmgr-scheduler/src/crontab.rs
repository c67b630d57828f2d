//! Enabled schedules → the system crontab.

use std::io::Write;
use std::path::Path;
use std::process::Command;

use tracing::{info, warn};

use crate::error::{Result, SchedulerError};
use crate::store::Store;
use crate::types::Schedule;

/// Registers a crontab file with the OS.
pub trait CrontabInstaller: Send + Sync {
    fn install(&self, path: &Path) -> Result<()>;
}

/// Runs `crontab <path>` for the current user.
pub struct SystemCrontab;

impl CrontabInstaller for SystemCrontab {
    fn install(&self, path: &Path) -> Result<()> {
        let output = Command::new("crontab").arg(path).output()?;
        if output.status.success() {
            return Ok(());
        }
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(SchedulerError::Crontab {
            reason: output.status.to_string(),
            output: combined.trim().to_string(),
        })
    }
}

/// One `<cron> <executable> <schedule id>` line per schedule.
pub fn render_crontab(schedules: &[Schedule], executable: &str) -> String {
    schedules
        .iter()
        .map(|s| format!("{} {} {}\n", s.schedule, executable, s.id))
        .collect()
}

/// Regenerate and install the crontab from enabled schedules.
///
/// The new content is written to a temp file beside `path` and installed
/// from there. Only after a successful install does it replace `path`; a
/// rejected file leaves the previous one untouched. Returns the number of
/// entries installed.
pub fn sync_crontab(
    store: &Store,
    path: impl AsRef<Path>,
    executable: &str,
    installer: &dyn CrontabInstaller,
) -> Result<usize> {
    let path = path.as_ref();
    let schedules = store.list_enabled_schedules()?;
    let content = render_crontab(&schedules, executable);

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix("crontab-")
        .tempfile_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;

    installer.install(tmp.path())?;

    // Installed already; a stale copy on disk only affects the next diff.
    if let Err(e) = tmp.persist(path) {
        warn!(path = %path.display(), error = %e.error, "crontab installed but file not replaced");
    }
    info!(entries = schedules.len(), path = %path.display(), "crontab synced");
    Ok(schedules.len())
}
