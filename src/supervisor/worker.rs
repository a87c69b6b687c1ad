//! The supervisor's single-child owner.
//!
//! At most one process is alive per worker. Its output goes to every
//! connected controller as `RS` lines and its state as `PS` reports.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::registry::ConnectionRegistry;
use crate::error::ControlError;
use crate::process::{ProcessPump, PumpEvent};
use crate::protocol::{Message, ProcessState};

const PROCESS_LABEL: &str = "daemon";

pub struct ProcessWorker {
    registry: Arc<ConnectionRegistry>,
    current: Mutex<Option<Arc<ProcessPump>>>,
}

impl ProcessWorker {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            current: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<ProcessPump>>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_pump(&self) -> Option<Arc<ProcessPump>> {
        self.lock().clone()
    }

    pub fn process_state(&self) -> ProcessState {
        let running = self
            .current_pump()
            .map(|pump| pump.is_running())
            .unwrap_or(false);
        ProcessState::from_running(running)
    }

    pub fn is_running(&self) -> bool {
        self.process_state().is_running()
    }

    pub fn pid(&self) -> Option<u32> {
        self.current_pump()
            .filter(|pump| pump.is_running())
            .and_then(|pump| pump.pid())
    }

    /// Launch `command` in `work_dir` unless a process is already alive.
    pub async fn start_process(
        self: &Arc<Self>,
        command: &[String],
        work_dir: &str,
    ) -> Result<(), ControlError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let spawned = {
            let mut current = self.lock();
            if current.as_ref().map_or(false, |pump| pump.is_running()) {
                tracing::warn!("Rejected start request: a process is already running");
                return Err(ControlError::AlreadyRunning(PROCESS_LABEL.to_string()));
            }

            let spawned = ProcessPump::spawn(PROCESS_LABEL, command, work_dir, tx).map(Arc::new);
            *current = spawned.as_ref().ok().cloned();
            spawned
        };

        if let Err(e) = spawned {
            // 실패한 경우에도 Stopped 이벤트가 PS,0 으로 전달됨
            tokio::spawn(self.clone().forward_events(rx));
            return Err(e);
        }

        // PS,1 goes out before any output or the exit report of this child
        self.registry
            .broadcast(&Message::ProcessState(ProcessState::Running))
            .await;
        tokio::spawn(self.clone().forward_events(rx));
        Ok(())
    }

    /// Write one line to the current process.
    pub async fn write_line(&self, text: &str) -> Result<(), ControlError> {
        let pump = match self.current_pump() {
            Some(pump) => pump,
            None => {
                tracing::warn!("Dropped input, no process running: {}", text);
                return Err(ControlError::NotRunning(PROCESS_LABEL.to_string()));
            }
        };
        pump.write_line(text).await.map_err(|e| {
            tracing::warn!("Failed to relay input: {}", e);
            e
        })
    }

    async fn forward_events(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<PumpEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                PumpEvent::Line { text, .. } => {
                    self.registry.broadcast(&Message::ReceivedStdio(text)).await;
                }
                PumpEvent::Stopped { exit } => {
                    if let Some(exit) = exit {
                        tracing::info!("Child finished: {}", exit);
                    }
                    self.clear_finished();
                    // a replacement may already be running
                    let state = self.process_state();
                    self.registry.broadcast(&Message::ProcessState(state)).await;
                    break;
                }
            }
        }
    }

    fn clear_finished(&self) {
        let mut current = self.lock();
        if current.as_ref().map_or(false, |pump| !pump.is_running()) {
            *current = None;
        }
    }

    /// Broadcast the current state every `interval` until cancelled.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let state = worker.process_state();
                        tracing::trace!("Heartbeat PS,{}", state.code());
                        worker.registry.broadcast(&Message::ProcessState(state)).await;
                    }
                }
            }
            tracing::debug!("Heartbeat stopped");
        })
    }

    /// Relay lines from `input` (normally the supervisor's own stdin) to the
    /// current process.
    pub fn spawn_input_relay<R>(self: &Arc<Self>, input: R, cancel: CancellationToken) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let worker = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(input).lines();
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        // errors are already logged by write_line
                        let _ = worker.write_line(&line).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Console input error: {}", e);
                        break;
                    }
                }
            }
            tracing::debug!("Console relay stopped");
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::supervisor::registry::Peer;
    use tokio::io::DuplexStream;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    /// A worker with one in-memory controller attached.
    fn worker_with_peer() -> (Arc<ProcessWorker>, Arc<Peer>, tokio::io::Lines<BufReader<DuplexStream>>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (write, read) = tokio::io::duplex(64 * 1024);
        let peer = Arc::new(Peer::new(registry.next_peer_id(), "test", write));
        registry.register(&peer);
        let worker = Arc::new(ProcessWorker::new(registry));
        (worker, peer, BufReader::new(read).lines())
    }

    async fn next_message(lines: &mut tokio::io::Lines<BufReader<DuplexStream>>) -> Message {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("no message in time")
            .unwrap()
            .expect("stream closed");
        Message::decode(&line).unwrap()
    }

    #[tokio::test]
    async fn test_output_and_state_are_broadcast() {
        let (worker, _peer, mut lines) = worker_with_peer();
        worker.start_process(&sh("echo hello"), ".").await.unwrap();

        let mut seen = Vec::new();
        loop {
            let msg = next_message(&mut lines).await;
            let done = msg == Message::ProcessState(ProcessState::Idle);
            seen.push(msg);
            if done {
                break;
            }
        }
        assert!(seen.contains(&Message::ProcessState(ProcessState::Running)));
        assert!(seen.contains(&Message::ReceivedStdio("hello".into())));
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (worker, _peer, _lines) = worker_with_peer();
        worker.start_process(&sh("sleep 5"), ".").await.unwrap();

        let err = worker.start_process(&sh("echo nope"), ".").await.unwrap_err();
        assert!(matches!(err, ControlError::AlreadyRunning(_)));
        assert!(worker.is_running());

        worker.write_line("ignored").await.unwrap();
        if let Some(pid) = worker.pid() {
            let _ = std::process::Command::new("kill").arg(pid.to_string()).status();
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_idle() {
        let (worker, _peer, mut lines) = worker_with_peer();
        let err = worker
            .start_process(&["/no/such/binary".to_string()], ".")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::SpawnFailed { .. }));
        assert_eq!(
            next_message(&mut lines).await,
            Message::ProcessState(ProcessState::Idle)
        );
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_write_without_process_is_not_running() {
        let (worker, _peer, _lines) = worker_with_peer();
        let err = worker.write_line("say hi").await.unwrap_err();
        assert!(matches!(err, ControlError::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_input_relay_reaches_child() {
        let (worker, _peer, mut lines) = worker_with_peer();
        worker
            .start_process(&sh("read line; echo \"relay $line\""), ".")
            .await
            .unwrap();

        let (mut console, input) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        let relay = worker.spawn_input_relay(input, cancel.clone());
        tokio::io::AsyncWriteExt::write_all(&mut console, b"ping\n")
            .await
            .unwrap();

        loop {
            if next_message(&mut lines).await == Message::ReceivedStdio("relay ping".into()) {
                break;
            }
        }
        cancel.cancel();
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_reports_state() {
        let (worker, _peer, mut lines) = worker_with_peer();
        let cancel = CancellationToken::new();
        let heartbeat = worker.spawn_heartbeat(Duration::from_millis(50), cancel.clone());

        assert_eq!(
            next_message(&mut lines).await,
            Message::ProcessState(ProcessState::Idle)
        );
        assert_eq!(
            next_message(&mut lines).await,
            Message::ProcessState(ProcessState::Idle)
        );
        cancel.cancel();
        heartbeat.await.unwrap();
    }
}
