//! Child-process pump: spawns one OS process with piped stdio
//!
//! - stdout and stderr are drained concurrently, line by line, into the
//!   event sink passed to [`ProcessPump::spawn`]
//! - stdin accepts whole lines via [`ProcessPump::write_line`]
//! - exit is reported exactly once as [`PumpEvent::Stopped`], after both
//!   readers finished and after `is_running()` already reads `false`
//!
//! The same pump runs inside the daemon and inside embedded containers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::ControlError;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// Notifications emitted by a pump, in order per pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEvent {
    Line { source: OutputSource, text: String },
    /// The process is gone. `exit` is a human readable status, `None` when
    /// the process never started.
    Stopped { exit: Option<String> },
}

pub type PumpSink = mpsc::UnboundedSender<PumpEvent>;

/// A running (or finished) child process.
pub struct ProcessPump {
    label: String,
    pid: Option<u32>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    running_rx: watch::Receiver<bool>,
}

impl ProcessPump {
    /// Spawn `command` (argv, no shell) in `working_dir`.
    ///
    /// On failure a single `Stopped { exit: None }` is sent to `sink` before
    /// the error is returned, so listeners see a launch failure exactly like
    /// an immediate exit.
    pub fn spawn(
        label: &str,
        command: &[String],
        working_dir: &str,
        sink: PumpSink,
    ) -> Result<Self, ControlError> {
        let spawn_failed = |reason: String| {
            tracing::error!("[{}] Failed to spawn process: {}", label, reason);
            let _ = sink.send(PumpEvent::Stopped { exit: None });
            ControlError::SpawnFailed {
                server: label.to_string(),
                reason,
            }
        };

        let (program, args) = match command.split_first() {
            Some(split) => split,
            None => return Err(spawn_failed("empty command".to_string())),
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);
        hide_console_window(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_failed(format!("'{}': {}", program, e)))?;

        let pid = child.id();
        let (running_tx, running_rx) = watch::channel(true);
        let stdin = Arc::new(Mutex::new(child.stdin.take()));

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(drain_lines(out, OutputSource::Stdout, sink.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(drain_lines(err, OutputSource::Stderr, sink.clone())));

        // ── process waiter ───────────────────────────────────
        {
            let label = label.to_string();
            let stdin = stdin.clone();
            tokio::spawn(async move {
                for task in [stdout_task, stderr_task].into_iter().flatten() {
                    let _ = task.await;
                }
                let exit = match child.wait().await {
                    Ok(status) => format!("Process exited with {}", status),
                    Err(e) => format!("Failed to wait for process: {}", e),
                };
                tracing::info!("[{}] {}", label, exit);

                // handle first, notification second
                stdin.lock().await.take();
                running_tx.send_replace(false);
                let _ = sink.send(PumpEvent::Stopped { exit: Some(exit) });
            });
        }

        tracing::info!("[{}] Process started with PID {:?}: {:?}", label, pid, command);
        Ok(Self {
            label: label.to_string(),
            pid,
            stdin,
            running_rx,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process is still alive.
    pub fn is_running(&self) -> bool {
        *self.running_rx.borrow()
    }

    /// Wait until the process exits.
    pub async fn wait_for_exit(&self) {
        let mut rx = self.running_rx.clone();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Write `text` plus a line terminator to the child's stdin and flush.
    pub async fn write_line(&self, text: &str) -> Result<(), ControlError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| ControlError::NotRunning(self.label.clone()))?;

        tracing::debug!("[{}] stdin <- {}", self.label, text);
        let mut data = String::with_capacity(text.len() + 1);
        data.push_str(text);
        data.push('\n');

        let result = match stdin.write_all(data.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        result.map_err(|e| {
            tracing::warn!("[{}] Failed to write to process: {}", self.label, e);
            ControlError::WriteFailed {
                target: self.label.clone(),
                reason: e.to_string(),
            }
        })
    }
}

async fn drain_lines<R>(pipe: R, source: OutputSource, sink: PumpSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                // 콘솔 인코딩이 UTF-8 이 아닐 수 있음 (GBK, Latin-1 ...)
                let text = String::from_utf8_lossy(trim_line_ending(&buf)).into_owned();
                // a closed sink still drains so the child never blocks on a full pipe
                let _ = sink.send(PumpEvent::Line { source, text });
            }
            Err(e) => {
                tracing::warn!("Error reading {:?}: {}", source, e);
                break;
            }
        }
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(target_os = "windows")]
fn hide_console_window(cmd: &mut Command) {
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(target_os = "windows"))]
fn hide_console_window(_cmd: &mut Command) {}
