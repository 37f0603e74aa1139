//! Run command: execute notebook cells in order.

use std::path::Path;
use std::time::{Duration, Instant};

use nbserve_core::{
    CellOutcome, Coordinator, Error, ExecutionStatus, ProcessLauncher, SkipReason,
};

use crate::colors;
use crate::output;

pub async fn execute(
    coordinator: &Coordinator<ProcessLauncher>,
    notebook: &Path,
    from: usize,
    to: Option<usize>,
    stop_on_error: bool,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let start = Instant::now();

    let report = match coordinator
        .execute_range(notebook, from, to, stop_on_error, timeout)
        .await
    {
        Ok(report) => report,
        Err(Error::InvalidRange { count: 0, .. }) => {
            println!("{}No cells found in notebook.{}", colors::YELLOW, colors::RESET);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let mut executed = 0usize;
    let mut failed = 0usize;
    for cell in &report {
        match &cell.outcome {
            CellOutcome::Executed { result } => {
                executed += 1;
                println!(
                    "{}cell {}{} [{}] {}{:.2}s{}",
                    colors::BOLD,
                    cell.index,
                    colors::RESET,
                    output::status_line(result.status),
                    colors::DIM,
                    result.duration.as_secs_f64(),
                    colors::RESET,
                );
                output::print_outputs(result);
                if result.status != ExecutionStatus::Ok {
                    failed += 1;
                }
            }
            CellOutcome::Skipped { reason } => {
                let why = match reason {
                    SkipReason::NotCode => "not code",
                    SkipReason::AfterError => "after error",
                };
                println!(
                    "{}cell {} skipped ({}){}",
                    colors::DIM,
                    cell.index,
                    why,
                    colors::RESET
                );
            }
        }
    }

    println!(
        "\n{}{}{} of {} cells executed in {:.2}s",
        colors::BOLD,
        executed,
        colors::RESET,
        report.len(),
        start.elapsed().as_secs_f64(),
    );

    if failed > 0 {
        anyhow::bail!("{} cell(s) failed", failed);
    }
    Ok(())
}
