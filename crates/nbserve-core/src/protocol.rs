//! Wire protocol between the execution manager and kernel subprocesses.
//!
//! Uses length-prefixed JSON messages over the kernel's stdin/stdout.
//! Format: 4-byte length (u32 LE) + JSON-encoded message.
//!
//! Requests travel parent -> kernel on stdin; the kernel emits status,
//! stream, result and reply messages on stdout independently of request
//! timing. Decoding is total: a frame that does not match any known
//! message shape is surfaced as [`Inbound::Malformed`] so every observed
//! message is accounted for.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Reject absurdly large frames (100MB).
const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Request sent from the execution manager to a kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelRequest {
    /// Execute a block of source code.
    Execute {
        /// Unique message id; all resulting kernel messages carry it.
        msg_id: String,
        /// Source code to execute.
        code: String,
    },

    /// Liveness check.
    Ping,

    /// Ask the kernel to exit cleanly.
    Shutdown,
}

/// Kernel execution state reported by status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Busy,
    Idle,
}

/// Stream name for textual output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Terminal status carried by an execute_reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Message sent from a kernel to the execution manager.
///
/// The kernel emits one `status: idle` on boot as its readiness signal,
/// then wraps each execution in `status: busy` .. `status: idle` and
/// terminates it with an `execute_reply` for the matching `msg_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelMessage {
    /// Kernel busy/idle transition. `msg_id` is absent for the boot signal.
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg_id: Option<String>,
        execution_state: ExecutionState,
    },

    /// Partial textual output on stdout or stderr.
    Stream {
        msg_id: String,
        name: StreamName,
        text: String,
    },

    /// Rich display payload (MIME type -> representation).
    DisplayData {
        msg_id: String,
        data: Map<String, Value>,
    },

    /// Value produced by the execution (MIME type -> representation).
    ExecuteResult {
        msg_id: String,
        execution_count: u32,
        data: Map<String, Value>,
    },

    /// Execution raised an error.
    Error {
        msg_id: String,
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },

    /// Terminal reply for one execution request.
    ExecuteReply {
        msg_id: String,
        status: ReplyStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_count: Option<u32>,
    },

    /// Response to [`KernelRequest::Ping`].
    Pong,

    /// Acknowledgement of a shutdown request.
    ShuttingDown,
}

/// One item on a kernel's broadcast channel.
///
/// Frames that fail to decode are forwarded as [`Inbound::Malformed`]
/// rather than dropped, so consumers receive a deterministic accounting
/// of every message the kernel produced.
#[derive(Debug, Clone)]
pub enum Inbound {
    Message(KernelMessage),
    Malformed { detail: String },
}

/// Decode one frame payload into an [`Inbound`] item. Never fails.
pub fn decode_inbound(bytes: &[u8]) -> Inbound {
    match serde_json::from_slice::<KernelMessage>(bytes) {
        Ok(msg) => Inbound::Message(msg),
        Err(e) => Inbound::Malformed {
            detail: format!("unrecognized kernel message: {}", e),
        },
    }
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(message)
        .map_err(|e| Error::Serialization(format!("failed to encode message: {}", e)))?;

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| Error::Ipc(format!("failed to write frame length: {}", e)))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| Error::Ipc(format!("failed to write frame body: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Ipc(format!("failed to flush frame: {}", e)))?;

    Ok(())
}

/// Read one length-prefixed frame payload.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary (the kernel
/// closed its end), and an error for truncated or oversized frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Ipc(format!("failed to read frame length: {}", e))),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("frame too large: {} bytes", len)));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| Error::Ipc(format!("failed to read frame body: {}", e)))?;

    Ok(Some(bytes))
}

/// Blocking variant of [`write_frame`], for the kernel side of the protocol.
pub fn write_frame_blocking<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let bytes = serde_json::to_vec(message)
        .map_err(|e| Error::Serialization(format!("failed to encode message: {}", e)))?;

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("failed to write frame length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("failed to write frame body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("failed to flush frame: {}", e)))?;

    Ok(())
}

/// Blocking variant of [`read_frame`], for the kernel side of the protocol.
pub fn read_frame_blocking<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Ipc(format!("failed to read frame length: {}", e))),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("frame too large: {} bytes", len)));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("failed to read frame body: {}", e)))?;

    Ok(Some(bytes))
}

/// Build a text/plain MIME bundle for a value representation.
pub fn text_plain(repr: &str) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("text/plain".to_string(), Value::String(repr.to_string()));
    data
}
