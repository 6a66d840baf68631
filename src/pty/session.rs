//! One PTY-attached child process.
//!
//! A session owns the PTY master and the child, and feeds input through a
//! dedicated writer thread so slow terminal writes never stall the async
//! runtime. Output is read by the caller from the cloned reader handle.

use std::io::{Read, Write as IoWrite};
use std::path::PathBuf;
use std::sync::mpsc::SyncSender;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tracing::{debug, error, warn};

pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 30;
pub(crate) const READ_BUFFER_SIZE: usize = 4096;
const WRITE_CHUNK_SIZE: usize = 512;
const INPUT_CHANNEL_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to open PTY: {0}")]
    Open(String),

    #[error("failed to spawn {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("session input channel closed")]
    InputClosed,

    #[error("failed to resize PTY: {0}")]
    Resize(String),
}

/// Exit details reported once the child has been reaped.
///
/// portable-pty does not expose which signal reaped a child, so `signal` is
/// carried for wire compatibility and stays `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

struct PtySessionInner {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn portable_pty::Child + Send>,
}

/// A PTY session bound to one spawned process.
pub struct PtySession {
    /// Unique session ID, for logging and acknowledgement only.
    pub id: String,
    /// Command the process was spawned from.
    pub command: String,
    /// Arguments the process was spawned with.
    pub args: Vec<String>,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: f64,
    /// Process ID.
    pub pid: u32,
    inner: Mutex<PtySessionInner>,
    input_tx: SyncSender<Vec<u8>>,
}

impl PtySession {
    /// Spawns `command` inside a fresh PTY of the given size.
    ///
    /// The child inherits the server environment with terminal-capability
    /// variables overridden, and runs from the operator's home directory.
    /// Returns the session together with the blocking output reader.
    pub fn spawn(
        id: String,
        command: &str,
        args: &[String],
        cols: u16,
        rows: u16,
    ) -> Result<(Self, Box<dyn Read + Send>), SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(command);
        if !args.is_empty() {
            cmd.args(args.iter().map(|a| a.as_str()));
        }
        cmd.cwd(working_dir());
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        let child = pair.slave.spawn_command(cmd).map_err(|e| SessionError::Spawn {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.process_id().unwrap_or(0);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Open(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Open(e.to_string()))?;

        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let (input_tx, input_rx) = std::sync::mpsc::sync_channel(INPUT_CHANNEL_SIZE);
        spawn_writer_thread(id.clone(), writer, input_rx);

        let session = Self {
            id,
            command: command.to_string(),
            args: args.to_vec(),
            created_at,
            pid,
            inner: Mutex::new(PtySessionInner {
                master: pair.master,
                child,
            }),
            input_tx,
        };

        Ok((session, reader))
    }

    /// Whether the child process is still running.
    pub fn is_alive(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.child.try_wait().ok().flatten().is_none()
    }

    /// Queues input bytes for the writer thread, verbatim.
    pub fn write_input(&self, data: &[u8]) -> Result<(), SessionError> {
        self.input_tx.send(data.to_vec()).map_err(|_| {
            warn!(session_id = %self.id, "input dropped: writer thread gone");
            SessionError::InputClosed
        })
    }

    /// Resizes the PTY window.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let inner = self.inner.lock();
        inner
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Resize(e.to_string()))
    }

    /// Kills the child and blocks until it has been reaped.
    ///
    /// Safe to call on an already-dead child: the kill failure is ignored and
    /// the wait returns whatever status the OS still has for it.
    pub fn kill_and_wait(&self) -> ExitInfo {
        let mut inner = self.inner.lock();
        if let Err(e) = inner.child.kill() {
            debug!(session_id = %self.id, error = %e, "kill failed, process may have already exited");
        }
        match inner.child.wait() {
            Ok(status) => ExitInfo {
                exit_code: Some(status.exit_code() as i32),
                signal: None,
            },
            Err(e) => {
                debug!(session_id = %self.id, error = %e, "wait after kill failed");
                ExitInfo::default()
            }
        }
    }

}

/// Sessions run from the operator's home directory; `/config` is the operator
/// volume when the bridge ships in a container without one.
fn working_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/config"))
}

/// Drains queued input into the PTY in small chunks so one large paste cannot
/// monopolize the terminal line discipline.
fn spawn_writer_thread(
    session_id: String,
    mut writer: Box<dyn IoWrite + Send>,
    input_rx: std::sync::mpsc::Receiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        while let Ok(data) = input_rx.recv() {
            for chunk in data.chunks(WRITE_CHUNK_SIZE) {
                if let Err(e) = writer.write_all(chunk) {
                    error!(session_id = %session_id, error = %e, "PTY write failed");
                    return;
                }
                if let Err(e) = writer.flush() {
                    error!(session_id = %session_id, error = %e, "PTY flush failed");
                    return;
                }
            }
        }
        debug!(session_id = %session_id, "writer thread finished");
    });
}

/// Finds the longest prefix of `bytes` that is valid UTF-8, so multibyte
/// sequences split across read boundaries can be carried to the next chunk.
pub(crate) fn find_utf8_boundary(bytes: &[u8]) -> usize {
    if bytes.is_empty() {
        return 0;
    }

    if std::str::from_utf8(bytes).is_ok() {
        return bytes.len();
    }

    // Look back up to 4 bytes for a complete sequence
    for i in 1..=4.min(bytes.len()) {
        let check_pos = bytes.len() - i;
        if std::str::from_utf8(&bytes[..check_pos]).is_ok() {
            return check_pos;
        }
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spawn_sh() -> (PtySession, Box<dyn Read + Send>) {
        PtySession::spawn(
            "test-session".to_string(),
            "/bin/sh",
            &[],
            DEFAULT_COLS,
            DEFAULT_ROWS,
        )
        .expect("failed to spawn /bin/sh")
    }

    #[test]
    fn spawn_reports_running_child() {
        let (session, _reader) = spawn_sh();
        assert!(session.is_alive());
        assert!(session.pid > 0);
        assert_eq!(session.command, "/bin/sh");
        session.kill_and_wait();
    }

    #[test]
    fn spawn_failure_surfaces_as_error() {
        let result = PtySession::spawn(
            "test-session".to_string(),
            "/definitely/not/a/real/binary",
            &[],
            DEFAULT_COLS,
            DEFAULT_ROWS,
        );
        match result {
            Err(SessionError::Spawn { command, .. }) => {
                assert_eq!(command, "/definitely/not/a/real/binary");
            }
            other => panic!("expected spawn error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn write_input_reaches_the_process() {
        let (session, mut reader) = spawn_sh();
        session.write_input(b"echo marker_for_write_test\n").unwrap();

        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        for _ in 0..100 {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&collected).contains("marker_for_write_test") {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        assert!(
            String::from_utf8_lossy(&collected).contains("marker_for_write_test"),
            "did not see echoed marker in PTY output"
        );
        session.kill_and_wait();
    }

    #[test]
    fn resize_succeeds_while_running() {
        let (session, _reader) = spawn_sh();
        session.resize(80, 24).expect("resize failed");
        session.kill_and_wait();
    }

    #[test]
    fn kill_and_wait_is_idempotent() {
        let (session, _reader) = spawn_sh();
        session.kill_and_wait();
        assert!(!session.is_alive());
        // Second call hits an already-reaped child and must not panic.
        session.kill_and_wait();
    }

    #[test]
    fn natural_exit_reports_code() {
        let (session, mut reader) = PtySession::spawn(
            "test-session".to_string(),
            "/bin/sh",
            &["-c".to_string(), "exit 7".to_string()],
            DEFAULT_COLS,
            DEFAULT_ROWS,
        )
        .unwrap();

        // Drain until EOF so the child can finish.
        let mut buf = [0u8; 1024];
        while matches!(reader.read(&mut buf), Ok(n) if n > 0) {}

        // The child is already gone; the kill is a no-op and the wait
        // returns the recorded status.
        let info = session.kill_and_wait();
        assert_eq!(info.exit_code, Some(7));
        assert_eq!(info.signal, None);
    }

    #[test]
    fn writer_thread_drains_queued_input() {
        let (session, _reader) = spawn_sh();
        // Larger than one write chunk, to exercise the chunked path.
        let big = vec![b' '; 2048];
        session.write_input(&big).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        session.kill_and_wait();
    }

    #[test]
    fn utf8_boundary_on_clean_input() {
        assert_eq!(find_utf8_boundary(b"hello"), 5);
        assert_eq!(find_utf8_boundary(b""), 0);
    }

    #[test]
    fn utf8_boundary_on_split_multibyte() {
        let s = "héllo".as_bytes();
        // Cut inside the two-byte 'é' sequence.
        assert_eq!(find_utf8_boundary(&s[..2]), 1);
        let emoji = "a😀".as_bytes();
        assert_eq!(find_utf8_boundary(&emoji[..3]), 1);
    }
}
