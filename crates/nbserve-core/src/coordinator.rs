//! Execution coordinator.
//!
//! The top-level entry point: resolves notebook paths through the
//! access policy, routes work to per-notebook sessions via the
//! registry, and persists executed outputs back into the notebook
//! file. Callers never touch sessions directly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::ExecConfig;
use crate::error::Result;
use crate::kernel::KernelLauncher;
use crate::notebook::{IpynbStore, NotebookStore};
use crate::outputs::ExecutionResult;
use crate::policy::AccessPolicy;
use crate::registry::{SessionRegistry, SessionStatus};

/// Why a cell in a range did not execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Markdown or raw cell.
    NotCode,
    /// An earlier cell failed and the run stops on error.
    AfterError,
}

/// Per-cell outcome of a range execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CellOutcome {
    Executed {
        #[serde(flatten)]
        result: ExecutionResult,
    },
    Skipped {
        reason: SkipReason,
    },
}

impl CellOutcome {
    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            CellOutcome::Executed { result } => Some(result),
            CellOutcome::Skipped { .. } => None,
        }
    }
}

/// One cell's slot in a range execution report.
#[derive(Debug, Clone, Serialize)]
pub struct CellExecution {
    pub index: usize,
    #[serde(flatten)]
    pub outcome: CellOutcome,
}

pub struct Coordinator<L: KernelLauncher, S: NotebookStore = IpynbStore> {
    policy: AccessPolicy,
    registry: SessionRegistry<L>,
    store: S,
}

impl<L: KernelLauncher> Coordinator<L, IpynbStore> {
    pub fn new(policy: AccessPolicy, launcher: Arc<L>, config: ExecConfig) -> Self {
        Self::with_store(policy, launcher, config, IpynbStore)
    }
}

impl<L: KernelLauncher, S: NotebookStore> Coordinator<L, S> {
    pub fn with_store(
        policy: AccessPolicy,
        launcher: Arc<L>,
        config: ExecConfig,
        store: S,
    ) -> Self {
        Self {
            policy,
            registry: SessionRegistry::new(launcher, config),
            store,
        }
    }

    /// Run a code block against the notebook's kernel. Nothing is
    /// written back to the notebook file. `timeout` falls back to the
    /// configured default.
    pub async fn execute_code(
        &self,
        path: impl AsRef<Path>,
        code: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let identity = self.policy.resolve_notebook(path)?;
        let session = self.registry.get_or_start(&identity).await?;
        session.execute(code, timeout).await
    }

    /// Execute one cell by index and persist its outputs.
    pub async fn execute_cell(
        &self,
        path: impl AsRef<Path>,
        index: usize,
        timeout: Option<Duration>,
    ) -> Result<CellExecution> {
        let identity = self.policy.resolve_notebook(path)?;
        let mut notebook = self.store.load(&identity).await?;
        notebook.cell(index)?;

        if !notebook.cells[index].is_code() {
            return Ok(CellExecution {
                index,
                outcome: CellOutcome::Skipped {
                    reason: SkipReason::NotCode,
                },
            });
        }

        let code = notebook.cells[index].source.as_code();
        let session = self.registry.get_or_start(&identity).await?;
        let result = session.execute(code, timeout).await?;

        // Cut-short executions (timeout, interrupt, kernel death) have
        // no terminal reply; the notebook keeps its previous outputs.
        if result.status.completed() {
            notebook.apply_result(index, &result)?;
            self.store.save(&identity, &notebook).await?;
        }

        Ok(CellExecution {
            index,
            outcome: CellOutcome::Executed { result },
        })
    }

    /// Execute an inclusive cell range in order, persisting outputs
    /// once at the end. Non-code cells report `skipped`; with
    /// `stop_on_error`, the first non-ok execution marks the rest of
    /// the range `skipped` too.
    pub async fn execute_range(
        &self,
        path: impl AsRef<Path>,
        start: usize,
        end: Option<usize>,
        stop_on_error: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<CellExecution>> {
        let identity = self.policy.resolve_notebook(path)?;
        let mut notebook = self.store.load(&identity).await?;
        let range = notebook.cell_range(start, end)?;

        let session = self.registry.get_or_start(&identity).await?;
        let mut report = Vec::with_capacity(range.clone().count());
        let mut dirty = false;
        let mut failed_at: Option<usize> = None;

        for index in range {
            if failed_at.is_some() {
                report.push(CellExecution {
                    index,
                    outcome: CellOutcome::Skipped {
                        reason: SkipReason::AfterError,
                    },
                });
                continue;
            }
            if !notebook.cells[index].is_code() {
                report.push(CellExecution {
                    index,
                    outcome: CellOutcome::Skipped {
                        reason: SkipReason::NotCode,
                    },
                });
                continue;
            }

            let code = notebook.cells[index].source.as_code();
            let result = session.execute(code, timeout).await?;
            if result.status.completed() {
                notebook.apply_result(index, &result)?;
                dirty = true;
            }
            let ok = result.status == crate::outputs::ExecutionStatus::Ok;
            report.push(CellExecution {
                index,
                outcome: CellOutcome::Executed { result },
            });
            if stop_on_error && !ok {
                failed_at = Some(index);
            }
        }

        if dirty {
            self.store.save(&identity, &notebook).await?;
        }
        if let Some(index) = failed_at {
            tracing::info!(
                path = %identity.display(),
                cell = index,
                "range execution stopped on error"
            );
        }
        Ok(report)
    }

    /// Execute every cell in the notebook.
    pub async fn execute_all(
        &self,
        path: impl AsRef<Path>,
        stop_on_error: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<CellExecution>> {
        self.execute_range(path, 0, None, stop_on_error, timeout)
            .await
    }

    /// Interrupt the notebook's running execution, if any. `false`
    /// when no session exists or nothing is running.
    pub async fn interrupt(&self, path: impl AsRef<Path>) -> Result<bool> {
        let identity = self.policy.resolve_notebook(path)?;
        Ok(self
            .registry
            .get(&identity)
            .is_some_and(|session| session.interrupt()))
    }

    /// Restart the notebook's kernel, starting one if none exists.
    /// All interpreter state is lost.
    pub async fn restart(&self, path: impl AsRef<Path>) -> Result<()> {
        let identity = self.policy.resolve_notebook(path)?;
        let session = self.registry.get_or_start(&identity).await?;
        session.restart().await
    }

    /// Kernel status for one notebook; `None` means no kernel is
    /// running. Never starts a kernel.
    pub async fn status(&self, path: impl AsRef<Path>) -> Result<Option<SessionStatus>> {
        let identity = self.policy.resolve_notebook(path)?;
        Ok(self.registry.get(&identity).map(|session| SessionStatus {
            path: session.path().to_path_buf(),
            state: session.state(),
            idle_for: session.idle_for(),
        }))
    }

    /// Shut down the notebook's kernel. Returns whether one existed.
    pub async fn shutdown(&self, path: impl AsRef<Path>) -> Result<bool> {
        let identity = self.policy.resolve_notebook(path)?;
        Ok(self.registry.remove(&identity).await)
    }

    /// Shut down every kernel.
    pub async fn shutdown_all(&self) {
        self.registry.shutdown_all().await;
    }

    /// Reap sessions idle past the configured limit.
    pub async fn reap_idle(&self) -> usize {
        self.registry.reap_idle().await
    }

    /// Every live session.
    pub fn sessions(&self) -> Vec<SessionStatus> {
        self.registry.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::kernel::fake::FakeLauncher;
    use crate::notebook::Notebook;
    use crate::outputs::ExecutionStatus;
    use crate::session::SessionState;
    use std::path::PathBuf;

    fn write_notebook(dir: &Path, name: &str, sources: &[(&str, &str)]) -> PathBuf {
        let cells: Vec<serde_json::Value> = sources
            .iter()
            .map(|(cell_type, source)| {
                if *cell_type == "code" {
                    serde_json::json!({
                        "cell_type": "code",
                        "source": source,
                        "execution_count": null,
                        "outputs": [],
                        "metadata": {}
                    })
                } else {
                    serde_json::json!({
                        "cell_type": cell_type,
                        "source": source,
                        "metadata": {}
                    })
                }
            })
            .collect();
        let doc = serde_json::json!({
            "cells": cells,
            "metadata": {},
            "nbformat": 4,
            "nbformat_minor": 5
        });
        let path = dir.join(name);
        std::fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();
        path
    }

    fn coordinator(
        dir: &Path,
        launcher: FakeLauncher,
    ) -> (Coordinator<FakeLauncher>, Arc<FakeLauncher>) {
        let launcher = Arc::new(launcher);
        let policy = AccessPolicy::new([dir]).unwrap();
        (
            Coordinator::new(policy, launcher.clone(), ExecConfig::default()),
            launcher,
        )
    }

    #[tokio::test]
    async fn execute_code_counts_in_call_order() {
        let dir = tempfile::tempdir().unwrap();
        let nb = write_notebook(dir.path(), "a.ipynb", &[("code", "x")]);
        let (coord, launcher) = coordinator(dir.path(), FakeLauncher::arithmetic());

        let first = coord.execute_code(&nb, "x = 1", None).await.unwrap();
        // Alias of the same file hits the same session.
        let alias = dir.path().join(".").join("a.ipynb");
        let second = coord.execute_code(&alias, "x + 1", None).await.unwrap();

        assert_eq!(first.execution_count, Some(1));
        assert_eq!(second.execution_count, Some(2));
        assert_eq!(launcher.start_count(), 1);
    }

    #[tokio::test]
    async fn execute_cell_persists_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let nb = write_notebook(dir.path(), "a.ipynb", &[("markdown", "# t"), ("code", "1+1")]);
        let (coord, _) = coordinator(dir.path(), FakeLauncher::arithmetic());

        let run = coord.execute_cell(&nb, 1, None).await.unwrap();
        let result = run.outcome.result().unwrap();
        assert_eq!(result.status, ExecutionStatus::Ok);

        let saved = Notebook::load(&nb).await.unwrap();
        assert_eq!(saved.cells[1].execution_count, Some(1));
        assert_eq!(saved.cells[1].outputs.len(), 1);
        assert_eq!(saved.cells[1].outputs[0]["data"]["text/plain"], "2");
    }

    #[tokio::test]
    async fn execute_cell_on_markdown_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let nb = write_notebook(dir.path(), "a.ipynb", &[("markdown", "# t")]);
        let (coord, launcher) = coordinator(dir.path(), FakeLauncher::arithmetic());

        let run = coord.execute_cell(&nb, 0, None).await.unwrap();
        assert!(matches!(
            run.outcome,
            CellOutcome::Skipped {
                reason: SkipReason::NotCode
            }
        ));
        // No kernel gets started for a skip.
        assert_eq!(launcher.start_count(), 0);
    }

    #[tokio::test]
    async fn execute_range_stops_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let nb = write_notebook(
            dir.path(),
            "a.ipynb",
            &[("code", "1+1"), ("code", "boom"), ("code", "1+1"), ("code", "1+1")],
        );
        let (coord, _) = coordinator(dir.path(), FakeLauncher::arithmetic());

        let report = coord.execute_range(&nb, 0, Some(3), true, None).await.unwrap();
        assert_eq!(report.len(), 4);
        assert_eq!(
            report[0].outcome.result().unwrap().status,
            ExecutionStatus::Ok
        );
        assert_eq!(
            report[1].outcome.result().unwrap().status,
            ExecutionStatus::Error
        );
        assert!(matches!(
            report[2].outcome,
            CellOutcome::Skipped {
                reason: SkipReason::AfterError
            }
        ));
        assert!(matches!(
            report[3].outcome,
            CellOutcome::Skipped {
                reason: SkipReason::AfterError
            }
        ));
    }

    #[tokio::test]
    async fn execute_range_without_stop_runs_everything() {
        let dir = tempfile::tempdir().unwrap();
        let nb = write_notebook(
            dir.path(),
            "a.ipynb",
            &[("code", "boom"), ("markdown", "# t"), ("code", "1+1")],
        );
        let (coord, _) = coordinator(dir.path(), FakeLauncher::arithmetic());

        let report = coord.execute_all(&nb, false, None).await.unwrap();
        assert_eq!(
            report[0].outcome.result().unwrap().status,
            ExecutionStatus::Error
        );
        assert!(matches!(
            report[1].outcome,
            CellOutcome::Skipped {
                reason: SkipReason::NotCode
            }
        ));
        assert_eq!(
            report[2].outcome.result().unwrap().status,
            ExecutionStatus::Ok
        );

        // Both completed cells persisted.
        let saved = Notebook::load(&nb).await.unwrap();
        assert_eq!(saved.cells[0].outputs[0]["output_type"], "error");
        assert_eq!(saved.cells[2].outputs[0]["data"]["text/plain"], "2");
    }

    #[tokio::test]
    async fn per_call_timeout_reaches_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let nb = write_notebook(dir.path(), "a.ipynb", &[("code", "x")]);
        let (coord, _) = coordinator(dir.path(), FakeLauncher::arithmetic());

        // Default config timeout is 60s; the per-call one wins.
        let result = coord
            .execute_code(&nb, "hang", Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Timeout);
    }

    #[tokio::test]
    async fn interrupt_without_session_reports_false() {
        let dir = tempfile::tempdir().unwrap();
        let nb = write_notebook(dir.path(), "a.ipynb", &[("code", "x")]);
        let (coord, _) = coordinator(dir.path(), FakeLauncher::arithmetic());

        assert!(!coord.interrupt(&nb).await.unwrap());
        assert!(coord.status(&nb).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restart_gives_a_fresh_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let nb = write_notebook(dir.path(), "a.ipynb", &[("code", "x")]);
        let (coord, launcher) = coordinator(dir.path(), FakeLauncher::arithmetic());

        coord.execute_code(&nb, "x = 1", None).await.unwrap();
        coord.restart(&nb).await.unwrap();
        assert_eq!(launcher.start_count(), 2);

        let result = coord.execute_code(&nb, "1+1", None).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Ok);
        assert_eq!(result.execution_count, Some(1));
        assert_eq!(result.outputs.len(), 1);
    }

    #[tokio::test]
    async fn out_of_scope_paths_are_denied() {
        let allowed = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let nb = write_notebook(outside.path(), "a.ipynb", &[("code", "x")]);
        let (coord, launcher) = coordinator(allowed.path(), FakeLauncher::arithmetic());

        let err = coord.execute_code(&nb, "1+1", None).await.unwrap_err();
        assert!(matches!(err, Error::AccessDenied { .. }));
        assert_eq!(launcher.start_count(), 0);
    }

    #[tokio::test]
    async fn status_reflects_session_state() {
        let dir = tempfile::tempdir().unwrap();
        let nb = write_notebook(dir.path(), "a.ipynb", &[("code", "x")]);
        let (coord, _) = coordinator(dir.path(), FakeLauncher::arithmetic());

        coord.execute_code(&nb, "x", None).await.unwrap();
        let status = coord.status(&nb).await.unwrap().unwrap();
        assert_eq!(status.state, SessionState::Idle);

        assert!(coord.shutdown(&nb).await.unwrap());
        assert!(coord.status(&nb).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bad_range_is_rejected_before_any_execution() {
        let dir = tempfile::tempdir().unwrap();
        let nb = write_notebook(dir.path(), "a.ipynb", &[("code", "x")]);
        let (coord, launcher) = coordinator(dir.path(), FakeLauncher::arithmetic());

        let err = coord.execute_range(&nb, 0, Some(5), false, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRange { .. }));
        assert_eq!(launcher.start_count(), 0);
    }
}
