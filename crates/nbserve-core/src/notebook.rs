//! Notebook file access.
//!
//! Reads and writes `.ipynb` files (nbformat 4) with enough structure
//! to select cells, run their code, and write results back. Fields
//! this crate does not model (cell ids, custom metadata, exotic output
//! shapes) pass through untouched so a round trip never loses data.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::outputs::ExecutionResult;

/// nbformat allows cell source as either one string or a list of lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Source {
    Text(String),
    Lines(Vec<String>),
}

impl Source {
    /// Joined source code. Lines in nbformat carry their own newlines.
    pub fn as_code(&self) -> String {
        match self {
            Source::Text(text) => text.clone(),
            Source::Lines(lines) => lines.concat(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.as_code().trim().is_empty()
    }
}

impl Default for Source {
    fn default() -> Self {
        Source::Text(String::new())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub cell_type: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u32>,
    /// Existing outputs stay as raw JSON; only cells we execute get
    /// rewritten with structured outputs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Cell {
    pub fn is_code(&self) -> bool {
        self.cell_type == "code"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notebook {
    #[serde(default)]
    pub cells: Vec<Cell>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "nbformat_major")]
    pub nbformat: u32,
    #[serde(default = "nbformat_minor")]
    pub nbformat_minor: u32,
}

fn nbformat_major() -> u32 {
    4
}

fn nbformat_minor() -> u32 {
    5
}

impl Notebook {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Notebook(format!("cannot read '{}': {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::Notebook(format!("'{}' is not a valid notebook: {}", path.display(), e))
        })
    }

    /// Write the notebook back, via a sibling temp file and rename so
    /// a crash mid-write cannot truncate the original.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut raw = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("failed to encode notebook: {}", e)))?;
        raw.push('\n');

        let tmp = path.with_extension("ipynb.tmp");
        tokio::fs::write(&tmp, raw).await.map_err(|e| {
            Error::Notebook(format!("cannot write '{}': {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            Error::Notebook(format!("cannot replace '{}': {}", path.display(), e))
        })?;
        Ok(())
    }

    pub fn cell(&self, index: usize) -> Result<&Cell> {
        self.cells.get(index).ok_or(Error::CellIndexOutOfRange {
            index,
            count: self.cells.len(),
        })
    }

    /// Validate an inclusive cell range. `end` defaults to the last
    /// cell.
    pub fn cell_range(
        &self,
        start: usize,
        end: Option<usize>,
    ) -> Result<std::ops::RangeInclusive<usize>> {
        let count = self.cells.len();
        let end = end.unwrap_or(count.saturating_sub(1));
        if count == 0 || start > end || end >= count {
            return Err(Error::InvalidRange { start, end, count });
        }
        Ok(start..=end)
    }

    /// Replace a code cell's outputs and execution count with an
    /// execution's results.
    pub fn apply_result(&mut self, index: usize, result: &ExecutionResult) -> Result<()> {
        let count = self.cells.len();
        let cell = self
            .cells
            .get_mut(index)
            .ok_or(Error::CellIndexOutOfRange { index, count })?;
        if !cell.is_code() {
            return Err(Error::Notebook(format!(
                "cell {} is a {} cell, not code",
                index, cell.cell_type
            )));
        }

        cell.execution_count = result.execution_count;
        cell.outputs = result
            .outputs
            .iter()
            .map(|o| {
                serde_json::to_value(o)
                    .map_err(|e| Error::Serialization(format!("failed to encode output: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    /// Drop every code cell's outputs and execution count.
    pub fn clear_outputs(&mut self) {
        for cell in &mut self.cells {
            if cell.is_code() {
                cell.outputs.clear();
                cell.execution_count = None;
            }
        }
    }
}

/// Document store seam; the coordinator reads and writes notebooks
/// through this so tests can substitute in-memory documents.
pub trait NotebookStore: Send + Sync + 'static {
    fn load(&self, path: &Path) -> impl std::future::Future<Output = Result<Notebook>> + Send;
    fn save(
        &self,
        path: &Path,
        notebook: &Notebook,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Stores notebooks as `.ipynb` files on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpynbStore;

impl NotebookStore for IpynbStore {
    async fn load(&self, path: &Path) -> Result<Notebook> {
        Notebook::load(path).await
    }

    async fn save(&self, path: &Path, notebook: &Notebook) -> Result<()> {
        notebook.save(path).await
    }
}
