// ABOUTME: Categorized pg_dump statements as produced by the external SQL file parser
// ABOUTME: Loads parser output from JSON and fingerprints it for checkpoint matching

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::{ImporterError, Result};

/// Parser output. Read-only to the import core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParsedDump {
    pub schema_statements: Vec<String>,
    pub table_statements: Vec<String>,
    pub sequence_statements: Vec<String>,
    pub data_statements: Vec<String>,
    pub constraint_statements: Vec<String>,
    pub index_statements: Vec<String>,
    pub function_statements: Vec<String>,
    pub trigger_statements: Vec<String>,
    pub policy_statements: Vec<String>,
    /// Every statement in original file order.
    pub statements: Vec<String>,
    pub metadata: DumpMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DumpMetadata {
    pub file_size_bytes: u64,
    pub estimated_row_count: u64,
}

impl ParsedDump {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ImporterError::Dump(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| ImporterError::Dump(format!("Invalid parsed dump: {}", e)))
    }

    /// Sum of all categorized statements; the full-order list is not counted again.
    pub fn total_statements(&self) -> usize {
        self.schema_statements.len()
            + self.table_statements.len()
            + self.sequence_statements.len()
            + self.data_statements.len()
            + self.constraint_statements.len()
            + self.index_statements.len()
            + self.function_statements.len()
            + self.trigger_statements.len()
            + self.policy_statements.len()
    }

    pub fn file_size_bytes(&self) -> u64 {
        self.metadata.file_size_bytes
    }

    /// Hex sha256 over every category, used to tie a checkpoint to the dump it came from.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        let categories = [
            &self.schema_statements,
            &self.table_statements,
            &self.sequence_statements,
            &self.data_statements,
            &self.constraint_statements,
            &self.index_statements,
            &self.function_statements,
            &self.trigger_statements,
            &self.policy_statements,
            &self.statements,
        ];
        for category in categories {
            hasher.update((category.len() as u64).to_le_bytes());
            for statement in category {
                hasher.update((statement.len() as u64).to_le_bytes());
                hasher.update(statement.as_bytes());
            }
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}
