//! Append-only JSONL provenance event log.

use crate::core::types::{ProvenanceEvent, TimestampedEvent};
use crate::error::{InfraError, Result};
use chrono::{SecondsFormat, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};

/// ISO 8601 UTC timestamp with second precision.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Event log location inside the state directory.
pub fn event_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join("events.jsonl")
}

/// Append an event to the log.
pub fn append_event(state_dir: &Path, event: ProvenanceEvent) -> Result<()> {
    let path = event_log_path(state_dir);
    std::fs::create_dir_all(state_dir).map_err(|source| InfraError::Write {
        path: state_dir.to_path_buf(),
        source,
    })?;

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te)?;

    let write_err = |source| InfraError::Write {
        path: path.clone(),
        source,
    };
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(write_err)?;
    writeln!(file, "{}", json).map_err(write_err)?;

    Ok(())
}

/// Read every event back, skipping lines that fail to parse.
pub fn read_events(state_dir: &Path) -> Result<Vec<TimestampedEvent>> {
    let path = event_log_path(state_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path).map_err(|source| InfraError::Read {
        path: path.clone(),
        source,
    })?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
