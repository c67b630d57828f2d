//! Declarative schedule file → store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tracing::{debug, info};

use crate::error::{Result, SchedulerError};
use crate::store::Store;
use crate::types::Schedule;

/// Counts of what a sync changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

/// Read the schedule file. A missing or empty file means no schedules.
pub fn load_schedules(path: impl AsRef<Path>) -> Result<Vec<Schedule>> {
    let path = path.as_ref();
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no schedule file, treating as empty");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    parse_schedules(&data)
}

/// Parse a JSON array of schedules and apply persisted defaults.
pub fn parse_schedules(data: &str) -> Result<Vec<Schedule>> {
    if data.trim().is_empty() {
        return Ok(Vec::new());
    }
    let schedules: Vec<Schedule> = serde_json::from_str(data)?;

    let mut seen = BTreeSet::new();
    for schedule in &schedules {
        if schedule.name.trim().is_empty() {
            return Err(SchedulerError::InvalidSchedule(
                "schedule name must not be empty".to_string(),
            ));
        }
        if !seen.insert(schedule.name.as_str()) {
            return Err(SchedulerError::InvalidSchedule(format!(
                "duplicate schedule name: {}",
                schedule.name
            )));
        }
    }

    Ok(schedules.into_iter().map(Schedule::with_defaults).collect())
}

/// Make the store's schedules match `desired`, keyed by name.
///
/// Existing schedules are overwritten wholesale when their definition
/// differs. Schedules missing from `desired` are deleted along with their
/// jobs.
pub fn sync_schedules(store: &Store, desired: Vec<Schedule>) -> Result<SyncReport> {
    let existing: BTreeMap<String, Schedule> = store
        .list_schedules()?
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();

    let mut report = SyncReport::default();
    for schedule in desired.iter().cloned().map(Schedule::with_defaults) {
        match existing.get(&schedule.name) {
            None => {
                store.create_schedule(&schedule)?;
                report.created += 1;
            }
            Some(current) if current.same_definition(&schedule) => {
                debug!(name = %schedule.name, "schedule unchanged");
                report.unchanged += 1;
            }
            Some(_) => {
                store.update_schedule(&schedule)?;
                report.updated += 1;
            }
        }
    }

    let wanted: BTreeSet<&str> = desired.iter().map(|s| s.name.as_str()).collect();
    for (name, schedule) in &existing {
        if !wanted.contains(name.as_str()) {
            store.delete_schedule(schedule.id)?;
            report.deleted += 1;
        }
    }

    info!(
        created = report.created,
        updated = report.updated,
        unchanged = report.unchanged,
        deleted = report.deleted,
        "schedules synced"
    );
    Ok(report)
}

pub fn sync_schedules_from_file(store: &Store, path: impl AsRef<Path>) -> Result<SyncReport> {
    sync_schedules(store, load_schedules(path)?)
}
