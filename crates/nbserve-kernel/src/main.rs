//! Reference interpreter kernel.
//!
//! Speaks the nbserve wire protocol over stdin/stdout: length-prefixed
//! JSON frames, one `status: idle` on boot as the readiness signal, a
//! busy/idle envelope plus `execute_reply` per execution. The language
//! is the small integer interpreter in [`eval`]; interpreter state
//! lives for the life of the process.
//!
//! SIGINT aborts the current execution (reported as a
//! `KeyboardInterrupt` error) without exiting the process, mirroring
//! how notebook kernels treat Ctrl-C.

mod eval;

use std::io::{BufReader, BufWriter, Write};
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use nbserve_core::protocol::{
    self, ExecutionState, KernelMessage, KernelRequest, ReplyStatus, StreamName, text_plain,
};

use eval::{INTERRUPTED, Interpreter};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    install_interrupt_handler();

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = BufWriter::new(stdout.lock());

    let mut interpreter = Interpreter::new();
    let mut execution_count: u32 = 0;

    // Readiness signal.
    emit(
        &mut writer,
        &KernelMessage::Status {
            msg_id: None,
            execution_state: ExecutionState::Idle,
        },
    )?;

    while let Some(bytes) = protocol::read_frame_blocking(&mut reader).context("reading request")? {
        let request: KernelRequest = match serde_json::from_slice(&bytes) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("dropping undecodable request: {}", e);
                continue;
            }
        };

        match request {
            KernelRequest::Ping => emit(&mut writer, &KernelMessage::Pong)?,
            KernelRequest::Shutdown => {
                emit(&mut writer, &KernelMessage::ShuttingDown)?;
                break;
            }
            KernelRequest::Execute { msg_id, code } => {
                execution_count += 1;
                INTERRUPTED.store(false, Ordering::SeqCst);
                execute(&mut writer, &mut interpreter, execution_count, &msg_id, &code)?;
            }
        }
    }

    Ok(())
}

fn execute<W: Write>(
    writer: &mut W,
    interpreter: &mut Interpreter,
    execution_count: u32,
    msg_id: &str,
    code: &str,
) -> anyhow::Result<()> {
    emit(
        writer,
        &KernelMessage::Status {
            msg_id: Some(msg_id.to_string()),
            execution_state: ExecutionState::Busy,
        },
    )?;

    // Stream prints as they happen; a write failure here means the
    // parent is gone, surfaced after eval through the sink error flag.
    let mut sink_err = None;
    let outcome = interpreter.eval_block(code, &mut |text| {
        let message = KernelMessage::Stream {
            msg_id: msg_id.to_string(),
            name: StreamName::Stdout,
            text,
        };
        if let Err(e) = protocol::write_frame_blocking(writer, &message) {
            sink_err.get_or_insert(e);
        }
    });
    if let Some(e) = sink_err {
        return Err(e).context("streaming output");
    }

    let status = match outcome {
        Ok(value) => {
            if let Some(value) = value {
                emit(
                    writer,
                    &KernelMessage::ExecuteResult {
                        msg_id: msg_id.to_string(),
                        execution_count,
                        data: text_plain(&value.to_string()),
                    },
                )?;
            }
            ReplyStatus::Ok
        }
        Err(error) => {
            emit(
                writer,
                &KernelMessage::Error {
                    msg_id: msg_id.to_string(),
                    ename: error.ename.clone(),
                    evalue: error.evalue.clone(),
                    traceback: vec![format!("{}: {}", error.ename, error.evalue)],
                },
            )?;
            ReplyStatus::Error
        }
    };

    emit(
        writer,
        &KernelMessage::ExecuteReply {
            msg_id: msg_id.to_string(),
            status,
            execution_count: Some(execution_count),
        },
    )?;
    emit(
        writer,
        &KernelMessage::Status {
            msg_id: Some(msg_id.to_string()),
            execution_state: ExecutionState::Idle,
        },
    )?;

    Ok(())
}

fn emit<W: Write>(writer: &mut W, message: &KernelMessage) -> anyhow::Result<()> {
    protocol::write_frame_blocking(writer, message).context("writing kernel message")
}

#[cfg(unix)]
fn install_interrupt_handler() {
    extern "C" fn on_sigint(_: libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }
    let handler = on_sigint as extern "C" fn(libc::c_int) as usize;
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_interrupt_handler() {}
