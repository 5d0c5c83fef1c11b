// ABOUTME: Batch-level checkpoints so an interrupted import can resume
// ABOUTME: Persisted as JSON and tied to the dump they were taken from

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::models::Phase;
use super::options::{ImportOptions, PlanLayout, ResumePoint};
use crate::error::{ImporterError, Result};

/// `<epoch millis>-<random suffix>`, unique per run.
pub fn new_run_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{}-{}", super::models::now_millis(), suffix)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub run_id: String,
    pub dump_fingerprint: String,
    pub phase: Phase,
    /// Completed batches within `phase`, counted from the phase's first statement.
    pub batch: usize,
    pub total_batches: usize,
    pub executed: usize,
    pub failed: usize,
    pub timestamp: i64,
    #[serde(flatten)]
    pub layout: PlanLayout,
}

impl Checkpoint {
    pub fn resume_point(&self) -> ResumePoint {
        ResumePoint {
            phase: self.phase,
            batch_index: self.batch,
        }
    }

    pub fn matches(&self, dump_fingerprint: &str) -> bool {
        self.dump_fingerprint == dump_fingerprint
    }

    /// Fails when `options` would batch the dump differently from the run that wrote
    /// this checkpoint, since the resume offset would then land on the wrong statement.
    pub fn check_layout(&self, options: &ImportOptions) -> Result<()> {
        let current = PlanLayout::of(options);
        let mut diffs = Vec::new();
        if current.batch_size != self.layout.batch_size {
            diffs.push(format!(
                "batch size {} (checkpoint {})",
                current.batch_size, self.layout.batch_size
            ));
        }
        if current.execution_order != self.layout.execution_order {
            diffs.push(format!(
                "execution order {} (checkpoint {})",
                current.execution_order, self.layout.execution_order
            ));
        }
        if current.skip_copy_from_stdin != self.layout.skip_copy_from_stdin {
            diffs.push("COPY FROM STDIN filtering".to_string());
        }
        if current.skip_ownership_statements != self.layout.skip_ownership_statements {
            diffs.push("ownership statement filtering".to_string());
        }
        if diffs.is_empty() {
            Ok(())
        } else {
            Err(ImporterError::Checkpoint(format!(
                "cannot resume with a different batch layout: {}",
                diffs.join(", ")
            )))
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ImporterError::Checkpoint(format!("Failed to serialize: {}", e)))?;
        tokio::fs::write(path, json).await.map_err(|e| {
            ImporterError::Checkpoint(format!("Failed to write {}: {}", path.display(), e))
        })
    }

    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ImporterError::Checkpoint(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| ImporterError::Checkpoint(format!("Invalid checkpoint: {}", e)))
    }

    pub async fn clear(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ImporterError::Checkpoint(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn checkpoint() -> Checkpoint {
        Checkpoint {
            run_id: new_run_id(),
            dump_fingerprint: "abc123".to_string(),
            phase: Phase::Data,
            batch: 4,
            total_batches: 9,
            executed: 380,
            failed: 20,
            timestamp: 1_700_000_000_000,
            layout: PlanLayout::of(&ImportOptions::default()),
        }
    }

    #[tokio::test]
    async fn test_save_load_and_clear() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("import.checkpoint.json");

        assert!(Checkpoint::load(&path).await.unwrap().is_none());

        let saved = checkpoint();
        saved.save(&path).await.unwrap();
        let loaded = Checkpoint::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert!(loaded.matches("abc123"));
        assert_eq!(
            loaded.resume_point(),
            ResumePoint {
                phase: Phase::Data,
                batch_index: 4
            }
        );

        Checkpoint::clear(&path).await.unwrap();
        assert!(Checkpoint::load(&path).await.unwrap().is_none());
        Checkpoint::clear(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{").unwrap();
        assert!(matches!(
            Checkpoint::load(&path).await,
            Err(ImporterError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let saved = checkpoint();
        assert!(saved.check_layout(&ImportOptions::default()).is_ok());

        let bigger = ImportOptions {
            batch_size: 500,
            ..Default::default()
        };
        let err = saved.check_layout(&bigger).unwrap_err();
        assert!(err.to_string().contains("batch size 500 (checkpoint 100)"));

        let file_order = ImportOptions {
            execution_order: crate::import::ExecutionOrder::FileOrder,
            ..Default::default()
        };
        assert!(matches!(
            saved.check_layout(&file_order),
            Err(ImporterError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_layout_applied_before_overrides() {
        let mut saved = checkpoint();
        saved.layout.batch_size = 250;
        let mut options = ImportOptions::default();
        saved.layout.apply_to(&mut options);
        assert_eq!(options.batch_size, 250);
        assert!(saved.check_layout(&options).is_ok());
    }

    #[tokio::test]
    async fn test_layout_persisted_flat() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("import.checkpoint.json");
        checkpoint().save(&path).await.unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"batchSize\": 100"));
        assert!(raw.contains("\"executionOrder\": \"schema-first\""));
    }

    #[test]
    fn test_run_ids_are_unique() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        assert!(a.contains('-'));
    }
}
