//! Exec command: run one code snippet against a notebook's kernel.

use std::path::Path;
use std::time::Duration;

use nbserve_core::{Coordinator, ExecutionStatus, ProcessLauncher};

use crate::output;

pub async fn execute(
    coordinator: &Coordinator<ProcessLauncher>,
    notebook: &Path,
    code: &str,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let result = coordinator.execute_code(notebook, code, timeout).await?;
    output::print_outputs(&result);

    if result.status != ExecutionStatus::Ok {
        anyhow::bail!("execution finished: {}", output::status_line(result.status));
    }
    Ok(())
}
