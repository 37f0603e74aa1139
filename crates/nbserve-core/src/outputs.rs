//! Output aggregation for one execution.
//!
//! An [`OutputAggregator`] folds the kernel's message stream for a
//! single `msg_id` into an ordered list of cell outputs plus a terminal
//! status. It is a pure state machine: the session loop feeds it every
//! [`Inbound`] item and asks whether the execution finished.
//!
//! Cell outputs serialize in nbformat shape (`output_type` tagged), so
//! a finished result can be written straight into a notebook file.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::{Inbound, KernelMessage, ReplyStatus, StreamName};

/// One output entry for a notebook cell, in nbformat shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum CellOutput {
    /// Textual output on stdout or stderr.
    Stream { name: StreamName, text: String },

    /// Rich display payload.
    DisplayData {
        data: Map<String, Value>,
        #[serde(default)]
        metadata: Map<String, Value>,
    },

    /// The value the execution produced.
    ExecuteResult {
        execution_count: u32,
        data: Map<String, Value>,
        #[serde(default)]
        metadata: Map<String, Value>,
    },

    /// Execution raised.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Reply arrived with `status: ok`.
    Ok,
    /// Reply arrived with `status: error`; outputs carry the error entry.
    Error,
    /// The timeout elapsed and the execution was cut short.
    Timeout,
    /// Cut short before a reply: explicit interrupt, restart, or the
    /// kernel process dying mid-execution.
    Interrupted,
}

impl ExecutionStatus {
    /// Whether the execution ran to a reply (successfully or not).
    pub fn completed(self) -> bool {
        matches!(self, ExecutionStatus::Ok | ExecutionStatus::Error)
    }
}

/// Completed (or cut-short) execution of one code block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub msg_id: String,
    pub status: ExecutionStatus,
    /// Kernel-side counter, present when a reply was received.
    pub execution_count: Option<u32>,
    pub outputs: Vec<CellOutput>,
    pub duration: Duration,
}

impl ExecutionResult {
    /// First error entry, if any.
    pub fn error(&self) -> Option<(&str, &str)> {
        self.outputs.iter().find_map(|o| match o {
            CellOutput::Error { ename, evalue, .. } => Some((ename.as_str(), evalue.as_str())),
            _ => None,
        })
    }

    /// Concatenated stream text for one stream.
    pub fn stream_text(&self, which: StreamName) -> String {
        self.outputs
            .iter()
            .filter_map(|o| match o {
                CellOutput::Stream { name, text } if *name == which => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Folds kernel messages for one `msg_id` into ordered outputs.
#[derive(Debug)]
pub struct OutputAggregator {
    msg_id: String,
    outputs: Vec<CellOutput>,
    execution_count: Option<u32>,
    reply: Option<ReplyStatus>,
    malformed: usize,
}

impl OutputAggregator {
    pub fn new(msg_id: impl Into<String>) -> Self {
        Self {
            msg_id: msg_id.into(),
            outputs: Vec::new(),
            execution_count: None,
            reply: None,
            malformed: 0,
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    /// Whether the terminal reply for this execution has arrived.
    pub fn finished(&self) -> bool {
        self.reply.is_some()
    }

    /// Absorb one inbound item. Returns `true` once the terminal reply
    /// for this aggregator's `msg_id` has been observed.
    ///
    /// Messages tagged with a different `msg_id` are stale leftovers
    /// from an earlier (interrupted or timed-out) execution and are
    /// dropped. Status messages carry no output. Malformed frames
    /// surface as a decode-error output entry but never abort the
    /// execution.
    pub fn absorb(&mut self, inbound: &Inbound) -> bool {
        let msg = match inbound {
            Inbound::Message(msg) => msg,
            Inbound::Malformed { detail } => {
                tracing::warn!(msg_id = %self.msg_id, "{}", detail);
                self.push_decode_error(detail.clone());
                return self.finished();
            }
        };

        match msg {
            KernelMessage::Stream { msg_id, name, text } if *msg_id == self.msg_id => {
                self.push_stream(*name, text);
            }
            KernelMessage::DisplayData { msg_id, data } if *msg_id == self.msg_id => {
                self.outputs.push(CellOutput::DisplayData {
                    data: data.clone(),
                    metadata: Map::new(),
                });
            }
            KernelMessage::ExecuteResult {
                msg_id,
                execution_count,
                data,
            } if *msg_id == self.msg_id => {
                self.outputs.push(CellOutput::ExecuteResult {
                    execution_count: *execution_count,
                    data: data.clone(),
                    metadata: Map::new(),
                });
            }
            KernelMessage::Error {
                msg_id,
                ename,
                evalue,
                traceback,
            } if *msg_id == self.msg_id => {
                self.outputs.push(CellOutput::Error {
                    ename: ename.clone(),
                    evalue: evalue.clone(),
                    traceback: traceback.clone(),
                });
            }
            KernelMessage::ExecuteReply {
                msg_id,
                status,
                execution_count,
            } if *msg_id == self.msg_id => {
                self.reply = Some(*status);
                if execution_count.is_some() {
                    self.execution_count = *execution_count;
                }
            }
            KernelMessage::Status { .. } => {}
            other => {
                tracing::trace!(
                    msg_id = %self.msg_id,
                    "dropping message for another execution: {:?}",
                    other
                );
            }
        }

        self.finished()
    }

    /// Consecutive writes to the same stream coalesce into one entry,
    /// matching how notebook frontends render incremental prints.
    fn push_stream(&mut self, name: StreamName, text: &str) {
        if let Some(CellOutput::Stream {
            name: last_name,
            text: last_text,
        }) = self.outputs.last_mut()
            && *last_name == name
        {
            last_text.push_str(text);
            return;
        }
        self.outputs.push(CellOutput::Stream {
            name,
            text: text.to_string(),
        });
    }

    /// Record kernel messages lost to broadcast channel lag. Lost
    /// messages are accounted for the same way as undecodable ones.
    pub fn record_lost(&mut self, skipped: u64) {
        self.push_decode_error(format!("{} kernel messages lost to channel lag", skipped));
    }

    fn push_decode_error(&mut self, evalue: String) {
        self.malformed += 1;
        self.outputs.push(CellOutput::Error {
            ename: "ProtocolDecodeError".to_string(),
            evalue,
            traceback: Vec::new(),
        });
    }

    /// Consume the aggregator into a result.
    ///
    /// When a reply was absorbed its status wins; `cut_short` only
    /// applies when the execution never reached a reply.
    pub fn finish(self, cut_short: ExecutionStatus, duration: Duration) -> ExecutionResult {
        let status = match self.reply {
            Some(ReplyStatus::Ok) => ExecutionStatus::Ok,
            Some(ReplyStatus::Error) => ExecutionStatus::Error,
            None => cut_short,
        };
        if self.malformed > 0 {
            tracing::warn!(
                msg_id = %self.msg_id,
                count = self.malformed,
                "execution produced malformed kernel frames"
            );
        }
        ExecutionResult {
            msg_id: self.msg_id,
            status,
            execution_count: self.execution_count,
            outputs: self.outputs,
            duration,
        }
    }
}
