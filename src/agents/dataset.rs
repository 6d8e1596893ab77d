//! Dataset loader for `dataset_operation` messages.
//!
//! Finds a `.csv`/`.tsv` path in the message, reads its header and counts
//! rows. No completion call is made.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use csv::ReaderBuilder;
use regex::Regex;
use tracing::{info, warn};

use crate::context::{ContextField, ContextPatch};
use crate::models::{AgentResult, DatasetDescriptor, StageOutput, Task};
use crate::types::{AppError, AppResult};

static PATH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)["'`]?([\w~./\\:-]+\.(?:csv|tsv))["'`]?"#)
        .expect("regex to match a .csv/.tsv path")
});

pub struct DatasetLoader {
    base_dir: PathBuf,
}

impl DatasetLoader {
    pub const WRITES: &'static [ContextField] = &[ContextField::Dataset];

    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        "dataset"
    }

    /// First `.csv`/`.tsv` path mentioned in the message.
    pub fn find_path(message: &str) -> Option<String> {
        PATH_PATTERN
            .captures(message)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    pub async fn execute(&self, task: &Task) -> AgentResult {
        let Some(raw_path) = Self::find_path(task.message()) else {
            return AgentResult::failed(
                "I couldn't find a dataset path in that message.",
                Some("mention the file explicitly, e.g. 'load data/cohort.csv'"),
            );
        };

        let path = self.resolve(&raw_path);
        info!(task_id = %task.id, path = %path.display(), "Loading dataset");

        let loaded = tokio::task::spawn_blocking(move || describe_file(&path))
            .await
            .map_err(|e| AppError::Internal(format!("Dataset loader task failed: {}", e)))
            .and_then(|r| r);

        match loaded {
            Ok(descriptor) => {
                let patch = ContextPatch {
                    dataset: Some(descriptor.clone()),
                    ..Default::default()
                };
                AgentResult::completed(StageOutput::Dataset(descriptor), patch)
            }
            Err(e) => {
                warn!(path = %raw_path, error = %e, "Failed to load dataset");
                AgentResult::failed(
                    format!("Could not read {}: {}", raw_path, e),
                    Some("check that the file exists and is a delimited text file with a header row"),
                )
            }
        }
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

/// The descriptor records the resolved path so generated code can open the
/// file regardless of the interpreter's working directory.
fn describe_file(path: &Path) -> AppResult<DatasetDescriptor> {
    let is_tsv = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("tsv"));

    let mut rdr = ReaderBuilder::new()
        .delimiter(if is_tsv { b'\t' } else { b',' })
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let columns: Vec<String> = rdr
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect();
    if columns.is_empty() {
        return Err(AppError::InvalidRequest("the file has no header row".to_string()));
    }

    let mut row_count = 0usize;
    for record in rdr.records() {
        record?;
        row_count += 1;
    }

    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("dataset")
        .to_string();

    Ok(DatasetDescriptor {
        name,
        path: Some(path.display().to_string()),
        row_count,
        columns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stage;
    use std::io::Write;

    #[test]
    fn test_find_path() {
        assert_eq!(
            DatasetLoader::find_path("please load 'data/cohort.csv' now").as_deref(),
            Some("data/cohort.csv")
        );
        assert_eq!(DatasetLoader::find_path("use trial.TSV").as_deref(), Some("trial.TSV"));
        assert_eq!(DatasetLoader::find_path("load my data"), None);
    }

    #[tokio::test]
    async fn test_loads_header_and_counts_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("cohort.csv")).unwrap();
        writeln!(file, "statin,mi,age").unwrap();
        writeln!(file, "1,0,64").unwrap();
        writeln!(file, "0,1,71").unwrap();

        let loader = DatasetLoader::new(dir.path());
        let task = Task::for_message(Stage::Formulation, "load", "load cohort.csv");
        let result = loader.execute(&task).await;

        assert!(result.success);
        let dataset = result.patch.dataset.unwrap();
        assert_eq!(dataset.name, "cohort");
        assert_eq!(dataset.row_count, 2);
        assert_eq!(dataset.columns, vec!["statin", "mi", "age"]);
        assert_eq!(
            dataset.path,
            Some(dir.path().join("cohort.csv").display().to_string())
        );
    }

    #[tokio::test]
    async fn test_relative_path_is_stored_resolved_against_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("trials")).unwrap();
        std::fs::write(dir.path().join("trials").join("arm.csv"), "x,y
1,2
").unwrap();

        let loader = DatasetLoader::new(dir.path());
        let task = Task::for_message(Stage::Formulation, "load", "load trials/arm.csv");
        let dataset = loader.execute(&task).await.patch.dataset.unwrap();

        let stored = PathBuf::from(dataset.path.unwrap());
        assert!(stored.is_absolute());
        assert!(stored.starts_with(dir.path()));
        assert!(stored.exists());
    }

    #[tokio::test]
    async fn test_tsv_delimiter() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t.tsv"), "a\tb\n1\t2\n").unwrap();

        let loader = DatasetLoader::new(dir.path());
        let task = Task::for_message(Stage::Formulation, "load", "load t.tsv");
        let dataset = loader.execute(&task).await.patch.dataset.unwrap();

        assert_eq!(dataset.columns, vec!["a", "b"]);
        assert_eq!(dataset.row_count, 1);
    }

    #[tokio::test]
    async fn test_missing_file_fails_without_patch() {
        let dir = tempfile::tempdir().unwrap();
        let loader = DatasetLoader::new(dir.path());
        let task = Task::for_message(Stage::Formulation, "load", "load missing.csv");

        let result = loader.execute(&task).await;

        assert!(!result.success);
        assert!(result.patch.is_empty());
        assert!(result.is_consistent());
    }

    #[tokio::test]
    async fn test_no_path_in_message() {
        let loader = DatasetLoader::new(".");
        let task = Task::for_message(Stage::Formulation, "load", "load my dataset please");
        let result = loader.execute(&task).await;
        assert!(!result.success);
    }
}
