//! Audit trail of maintenance actions
//!
//! Two files in the state directory:
//! - `maintenance.log`: one timestamped line per record, append-only
//! - `last_action`: name of the most recently started action

use anyhow::{Context, Result};
use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

pub const LOG_FILE: &str = "maintenance.log";
pub const LAST_ACTION_FILE: &str = "last_action";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Start,
    Success,
    Error,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Start => "START",
            ActionStatus::Success => "SUCCESS",
            ActionStatus::Error => "ERROR",
        }
    }

    fn level(&self) -> &'static str {
        match self {
            ActionStatus::Error => "ERROR",
            _ => "INFO",
        }
    }
}

pub trait ActionLog: Send + Sync {
    fn record(&self, action: &str, status: ActionStatus, detail: Option<&str>) -> Result<()>;

    fn last_action(&self) -> Option<String>;

    /// Last `count` lines of the log, oldest first
    fn recent(&self, count: usize) -> Result<Vec<String>>;
}

/// File-backed log; all writes go through one lock
#[derive(Debug)]
pub struct FileActionLog {
    dir: PathBuf,
    writer: Mutex<()>,
}

impl FileActionLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn last_action_path(&self) -> PathBuf {
        self.dir.join(LAST_ACTION_FILE)
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create state directory {:?}", self.dir))
    }
}

impl ActionLog for FileActionLog {
    fn record(&self, action: &str, status: ActionStatus, detail: Option<&str>) -> Result<()> {
        let _lock = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_dir()?;

        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let line = format_entry(&timestamp, action, status, detail);

        let path = self.log_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {:?}", path))?;
        writeln!(file, "{}", line).with_context(|| format!("Failed to write {:?}", path))?;

        if status == ActionStatus::Start {
            let marker = self.last_action_path();
            fs::write(&marker, action)
                .with_context(|| format!("Failed to write {:?}", marker))?;
        }

        Ok(())
    }

    fn last_action(&self) -> Option<String> {
        let content = fs::read_to_string(self.last_action_path()).ok()?;
        let action = content.trim();
        if action.is_empty() {
            None
        } else {
            Some(action.to_string())
        }
    }

    fn recent(&self, count: usize) -> Result<Vec<String>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        let lines: Vec<&str> = content.lines().collect();
        let skip = lines.len().saturating_sub(count);
        Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
    }
}

/// `2024-05-01 12:00:00 [ERROR] Update - ERROR | Error: <detail>`
fn format_entry(timestamp: &str, action: &str, status: ActionStatus, detail: Option<&str>) -> String {
    let mut line = format!(
        "{} [{}] {} - {}",
        timestamp,
        status.level(),
        action,
        status.as_str()
    );
    if let Some(detail) = detail {
        // Keep one record per line
        let flat: Vec<&str> = detail.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        line.push_str(" | Error: ");
        line.push_str(&flat.join("; "));
    }
    line
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub type Entry = (String, ActionStatus, Option<String>);

    #[derive(Default)]
    pub struct MemoryActionLog {
        pub entries: Mutex<Vec<Entry>>,
    }

    impl MemoryActionLog {
        pub fn entries(&self) -> Vec<Entry> {
            self.entries.lock().unwrap().clone()
        }
    }

    impl ActionLog for MemoryActionLog {
        fn record(&self, action: &str, status: ActionStatus, detail: Option<&str>) -> Result<()> {
            self.entries
                .lock()
                .unwrap()
                .push((action.to_string(), status, detail.map(str::to_string)));
            Ok(())
        }

        fn last_action(&self) -> Option<String> {
            self.entries
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(_, status, _)| *status == ActionStatus::Start)
                .map(|(action, _, _)| action.clone())
        }

        fn recent(&self, count: usize) -> Result<Vec<String>> {
            let entries = self.entries.lock().unwrap();
            let skip = entries.len().saturating_sub(count);
            Ok(entries[skip..]
                .iter()
                .map(|(action, status, detail)| {
                    format_entry("-", action, *status, detail.as_deref())
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_entry() {
        assert_eq!(
            format_entry("2024-05-01 12:00:00", "Update", ActionStatus::Start, None),
            "2024-05-01 12:00:00 [INFO] Update - START"
        );
        assert_eq!(
            format_entry(
                "2024-05-01 12:00:00",
                "Upgrade",
                ActionStatus::Error,
                Some("\"apt upgrade -y\" exited with code 100:\nE: lock held\n")
            ),
            "2024-05-01 12:00:00 [ERROR] Upgrade - ERROR | Error: \"apt upgrade -y\" exited with code 100:; E: lock held"
        );
    }

    #[test]
    fn test_record_and_read_back() {
        let dir = TempDir::new().unwrap();
        let log = FileActionLog::new(dir.path().join("state"));

        assert_eq!(log.last_action(), None);
        assert!(log.recent(10).unwrap().is_empty());

        log.record("Update", ActionStatus::Start, None).unwrap();
        log.record("Update", ActionStatus::Success, None).unwrap();
        log.record("Setup", ActionStatus::Start, None).unwrap();
        log.record("Setup", ActionStatus::Error, Some("boom")).unwrap();

        assert_eq!(log.last_action().as_deref(), Some("Setup"));

        let lines = log.recent(2).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] Setup - START"));
        assert!(lines[1].ends_with("[ERROR] Setup - ERROR | Error: boom"));
        assert_eq!(log.recent(100).unwrap().len(), 4);
    }
}
