use super::error::SchedulerError;
use super::task::TaskRecord;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// JSON file holding message tasks. The file is rewritten as a whole on
/// every save. There is no file locking: concurrent writers lose updates.
#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file reads as an empty list.
    pub fn load(&self) -> Result<Vec<TaskRecord>, SchedulerError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let s = fs::read_to_string(&self.path).map_err(SchedulerError::ReadError)?;
        let records: Vec<TaskRecord> = serde_json::from_str(&s)?;
        debug!(path = %self.path.display(), count = records.len(), "tasks file loaded");
        Ok(records)
    }

    pub fn save(&self, records: &[TaskRecord]) -> Result<(), SchedulerError> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).map_err(SchedulerError::CreateDirError)?;
        }
        let json = serde_json::to_string_pretty(records)?;
        fs::write(&self.path, json).map_err(|e| {
            error!(?e, "Failed to write tasks file: {:?}", self.path);
            SchedulerError::WriteError(e)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("nested/tasks.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn partial_records_get_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(
            &path,
            r#"[{"task_id":"task_abc123","cron_expression":"0 9 * * 1-5","message":"Good morning"}]"#,
        )
        .unwrap();

        let records = TaskStore::new(&path).load().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "");
        assert!(records[0].enabled);
        assert_eq!(records[0].run_count, 0);
    }

    #[test]
    fn save_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("amira/scheduled_tasks.json"));
        store.save(&[]).unwrap();
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "[]");
    }

    #[test]
    fn corrupt_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            TaskStore::new(&path).load(),
            Err(SchedulerError::ParseError(_))
        ));
    }
}
