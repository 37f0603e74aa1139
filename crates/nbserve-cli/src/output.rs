//! Terminal rendering for execution results.

use nbserve_core::{CellOutput, ExecutionResult, ExecutionStatus};
use nbserve_core::protocol::StreamName;

use crate::colors;

/// Print one execution's outputs in arrival order.
pub fn print_outputs(result: &ExecutionResult) {
    for output in &result.outputs {
        match output {
            CellOutput::Stream { name, text } => match name {
                StreamName::Stdout => print!("{}", text),
                StreamName::Stderr => eprint!("{}{}{}", colors::YELLOW, text, colors::RESET),
            },
            CellOutput::ExecuteResult { data, .. } | CellOutput::DisplayData { data, .. } => {
                if let Some(repr) = data.get("text/plain").and_then(|v| v.as_str()) {
                    println!("{}{}{}", colors::BOLD, repr, colors::RESET);
                } else {
                    // No plain-text form; show what MIME types exist.
                    let mimes: Vec<&str> = data.keys().map(String::as_str).collect();
                    println!("{}<{}>{}", colors::DIM, mimes.join(", "), colors::RESET);
                }
            }
            CellOutput::Error {
                ename,
                evalue,
                traceback,
            } => {
                eprintln!("{}{}: {}{}", colors::RED, ename, evalue, colors::RESET);
                for line in traceback {
                    eprintln!("{}  {}{}", colors::DIM, line, colors::RESET);
                }
            }
        }
    }
}

/// One-line status summary, colored by outcome.
pub fn status_line(status: ExecutionStatus) -> String {
    let (color, label) = match status {
        ExecutionStatus::Ok => (colors::GREEN, "ok"),
        ExecutionStatus::Error => (colors::RED, "error"),
        ExecutionStatus::Timeout => (colors::RED, "timeout"),
        ExecutionStatus::Interrupted => (colors::YELLOW, "interrupted"),
    };
    format!("{}{}{}", color, label, colors::RESET)
}
