//! Handle for a single PHP worker process.
//!
//! A worker owns its child process and both pipe ends. All frame traffic is
//! serialized by the handle's I/O mutex, so two dispatches that land on the
//! same worker can never interleave frames.

use crate::error::{MembraneError, Result};
use crate::protocol::wire::{
    self, Frame, ProtocolError, TYPE_ERROR, TYPE_PING, TYPE_WORKER_READY,
};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

/// How long a stopping worker gets before it is killed.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// Current state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Ready for a request.
    Idle = 0,
    /// Processing a request.
    Busy = 1,
    /// Stopped; must not be dispatched onto.
    Stopped = 2,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Busy,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug)]
struct WorkerIo {
    /// Taken on graceful stop so the child sees EOF.
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

/// What a completed turn produced.
pub enum TurnReply {
    /// The frame the caller asked for.
    Response(Frame),
    /// The worker answered with an ERROR frame; this is a logical failure,
    /// not protocol corruption.
    Reported(String),
}

/// Result of one request/response turn.
pub struct TurnOutcome {
    pub reply: TurnReply,
    /// Whether the worker signalled WORKER_READY after the response. A
    /// worker that did not is not safe to dispatch onto again.
    pub ready: bool,
}

/// A single PHP worker process.
#[derive(Debug)]
pub struct Worker {
    id: u32,
    pid: u32,
    state: AtomicU8,
    jobs: AtomicU64,
    last_used: StdMutex<Instant>,
    io: Mutex<WorkerIo>,
    child: Mutex<Child>,
}

impl Worker {
    /// Spawn a worker process and wait for its initial WORKER_READY.
    pub async fn spawn(
        id: u32,
        binary: &str,
        script: &str,
        env: &[(String, String)],
    ) -> Result<std::sync::Arc<Self>> {
        let mut cmd = Command::new(binary);
        cmd.arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| MembraneError::Spawn(format!("starting {}: {}", binary, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| MembraneError::Spawn(format!("worker {} exited during startup", id)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MembraneError::Spawn("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MembraneError::Spawn("worker stdout not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(id, stderr));
        }

        let mut stdout = BufReader::with_capacity(PIPE_BUFFER_SIZE, stdout);

        // The worker is not usable until it announces itself.
        match wire::read_frame(&mut stdout).await {
            Ok(frame) if frame.frame_type == TYPE_WORKER_READY => {}
            Ok(frame) => {
                let _ = child.kill().await;
                return Err(MembraneError::Spawn(format!(
                    "worker {}: expected WORKER_READY, got frame type 0x{:02x}",
                    id, frame.frame_type
                )));
            }
            Err(e) => {
                let _ = child.kill().await;
                return Err(MembraneError::Spawn(format!(
                    "worker {}: waiting for WORKER_READY: {}",
                    id, e
                )));
            }
        }

        debug!(worker_id = id, pid, "worker ready");
        Ok(std::sync::Arc::new(Self {
            id,
            pid,
            state: AtomicU8::new(WorkerState::Idle as u8),
            jobs: AtomicU64::new(0),
            last_used: StdMutex::new(Instant::now()),
            io: Mutex::new(WorkerIo {
                stdin: Some(stdin),
                stdout,
            }),
            child: Mutex::new(child),
        }))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Number of turns this worker has completed.
    pub fn jobs(&self) -> u64 {
        self.jobs.load(Ordering::Relaxed)
    }

    /// When the worker last finished a turn.
    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().expect("last_used lock poisoned")
    }

    /// Perform one turn: write `frame`, read the reply (which must be of
    /// `expected` type or ERROR), then read the trailing WORKER_READY.
    pub async fn exec(&self, frame: Frame, expected: u8) -> Result<TurnOutcome> {
        let mut io = self.io.lock().await;
        let io = &mut *io;
        self.set_state(WorkerState::Busy);

        let stdin = io.stdin.as_mut().ok_or_else(|| MembraneError::WorkerWrite {
            id: self.id,
            source: ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "worker stdin closed",
            )),
        })?;
        wire::write_frame(stdin, &frame)
            .await
            .map_err(|e| MembraneError::WorkerWrite {
                id: self.id,
                source: e,
            })?;

        let first = wire::read_frame(&mut io.stdout)
            .await
            .map_err(|e| self.classify_read_error(e))?;

        let reply = if first.frame_type == expected {
            TurnReply::Response(first)
        } else if first.frame_type == TYPE_ERROR {
            TurnReply::Reported(String::from_utf8_lossy(&first.payload).into_owned())
        } else {
            // State stays Busy; the pool replaces protocol violators.
            return Err(MembraneError::ProtocolViolation {
                id: self.id,
                source: ProtocolError::UnexpectedFrameType {
                    expected,
                    found: first.frame_type,
                },
            });
        };

        let ready = match wire::read_frame(&mut io.stdout).await {
            Ok(f) if f.frame_type == TYPE_WORKER_READY => true,
            Ok(f) => {
                warn!(
                    worker_id = self.id,
                    frame_type = f.frame_type,
                    "expected WORKER_READY after response"
                );
                false
            }
            Err(e) => {
                warn!(worker_id = self.id, error = %e, "reading WORKER_READY after response");
                false
            }
        };

        self.jobs.fetch_add(1, Ordering::Relaxed);
        *self.last_used.lock().expect("last_used lock poisoned") = Instant::now();
        self.set_state(WorkerState::Idle);

        Ok(TurnOutcome { reply, ready })
    }

    fn classify_read_error(&self, e: ProtocolError) -> MembraneError {
        match e {
            ProtocolError::Io(_) | ProtocolError::ShortRead => MembraneError::WorkerRead {
                id: self.id,
                source: e,
            },
            _ => MembraneError::ProtocolViolation {
                id: self.id,
                source: e,
            },
        }
    }

    /// Liveness probe: write PING and expect the matching PONG within
    /// `deadline`. Only meaningful on an idle worker.
    pub async fn ping(&self, deadline: Duration) -> Result<()> {
        let mut io = self.io.lock().await;
        let io = &mut *io;
        let probe = async {
            let stdin = io.stdin.as_mut().ok_or_else(|| MembraneError::WorkerWrite {
                id: self.id,
                source: ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "worker stdin closed",
                )),
            })?;
            wire::write_frame(stdin, &Frame::ping())
                .await
                .map_err(|e| MembraneError::WorkerWrite {
                    id: self.id,
                    source: e,
                })?;
            let frame = wire::read_frame(&mut io.stdout)
                .await
                .map_err(|e| self.classify_read_error(e))?;
            if frame.frame_type == TYPE_PING && frame.payload == b"pong" {
                Ok(())
            } else {
                Err(MembraneError::ProtocolViolation {
                    id: self.id,
                    source: ProtocolError::UnexpectedFrameType {
                        expected: TYPE_PING,
                        found: frame.frame_type,
                    },
                })
            }
        };
        match timeout(deadline, probe).await {
            Ok(result) => result,
            Err(_) => Err(MembraneError::RequestTimeout { elapsed: deadline }),
        }
    }

    /// Gracefully stop the worker: best-effort WORKER_STOP and stdin close,
    /// then wait up to [`STOP_GRACE`] before killing the process.
    pub async fn stop(&self) -> Result<()> {
        self.set_state(WorkerState::Stopped);

        // Skip the graceful frame when a hung turn holds the pipes; the
        // bounded wait below still applies.
        if let Ok(mut io) = self.io.try_lock()
            && let Some(mut stdin) = io.stdin.take()
        {
            let _ = wire::write_frame(&mut stdin, &Frame::worker_stop()).await;
            let _ = stdin.shutdown().await;
        }

        let mut child = self.child.lock().await;
        match timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(_status)) => Ok(()),
            Ok(Err(e)) => Err(MembraneError::Io(e)),
            Err(_elapsed) => {
                warn!(worker_id = self.id, "worker did not exit in time, killing");
                child.kill().await.map_err(MembraneError::Io)
            }
        }
    }

    /// Whether the underlying process is still running.
    pub async fn is_alive(&self) -> bool {
        matches!(self.child.lock().await.try_wait(), Ok(None))
    }

    /// Force-kill the process without touching the pipe mutex. Unblocks a
    /// turn that is stuck on pipe I/O.
    pub fn kill_process(&self) {
        let _ = signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
    }
}

/// Forward a worker's stderr lines through tracing.
async fn forward_stderr(worker_id: u32, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let lower = line.to_lowercase();
        if lower.contains("fatal error") || lower.contains("parse error") {
            warn!(worker_id, "{}", line);
        } else {
            debug!(worker_id, "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_state_from_u8() {
        assert_eq!(WorkerState::from_u8(0), WorkerState::Idle);
        assert_eq!(WorkerState::from_u8(1), WorkerState::Busy);
        assert_eq!(WorkerState::from_u8(2), WorkerState::Stopped);
        assert_eq!(WorkerState::from_u8(99), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_spawn_fails_for_missing_binary() {
        let err = Worker::spawn(1, "/nonexistent/php-binary", "worker.php", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, MembraneError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_spawn_fails_when_process_never_signals_ready() {
        // `true` exits immediately without emitting any frame.
        let err = Worker::spawn(1, "true", "worker.php", &[]).await.unwrap_err();
        assert!(matches!(err, MembraneError::Spawn(_)));
    }
}
