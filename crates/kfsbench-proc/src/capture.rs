//! Run a command to completion (or deadline) while capturing its output.

use std::io::{BufRead, BufReader, Read};
use std::mem;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use parking_lot::Mutex;

use crate::error::ProcError;
use crate::group::{spawn_group, GroupChild, Termination};

/// Knobs for [`run_captured`].
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Deadline for the command's leader process.
    pub timeout: Duration,
    /// Signal sent to the group when the deadline passes.
    pub kill_signal: Signal,
    /// Time the group gets to exit after `kill_signal` before `SIGKILL`.
    pub grace: Duration,
    /// Mirror each captured line to the harness's own stdout/stderr.
    pub echo: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            kill_signal: Signal::SIGQUIT,
            grace: Duration::from_secs(10),
            echo: false,
        }
    }
}

/// Output of a command that exited on its own.
#[derive(Debug, Clone)]
pub struct Captured {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl Captured {
    /// Stdout followed by stderr, for parsers that scan both.
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len());
        out.push_str(&self.stdout);
        out.push_str(&self.stderr);
        out
    }
}

/// Result of [`run_captured`].
#[derive(Debug)]
pub enum CaptureOutcome {
    Exited(Captured),
    /// Deadline passed; the group was signaled and has exited.
    TimedOut {
        elapsed: Duration,
        termination: Termination,
        stdout: String,
        stderr: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Text read from one stream so far, shared with its reader thread.
type Buffer = Arc<Mutex<String>>;

fn spawn_reader<R>(reader: R, stream: Stream, echo: bool, buffer: Buffer, done: mpsc::Sender<Stream>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    if echo {
                        match stream {
                            Stream::Stdout => print!("{text}"),
                            Stream::Stderr => eprint!("{text}"),
                        }
                    }
                    buffer.lock().push_str(&text);
                }
                Err(e) => {
                    tracing::debug!("Stopped reading {:?}: {}", stream, e);
                    break;
                }
            }
        }
        let _ = done.send(stream);
    });
}

/// Reader threads for a child's stdout and stderr.
struct Readers {
    stdout: Buffer,
    stderr: Buffer,
    done: mpsc::Receiver<Stream>,
    running: usize,
}

impl Readers {
    fn start(child: &mut GroupChild, echo: bool) -> Self {
        let (tx, done) = mpsc::channel();
        let mut readers = Self {
            stdout: Buffer::default(),
            stderr: Buffer::default(),
            done,
            running: 0,
        };
        if let Some(stdout) = child.child_mut().stdout.take() {
            spawn_reader(stdout, Stream::Stdout, echo, Arc::clone(&readers.stdout), tx.clone());
            readers.running += 1;
        }
        if let Some(stderr) = child.child_mut().stderr.take() {
            spawn_reader(stderr, Stream::Stderr, echo, Arc::clone(&readers.stderr), tx);
            readers.running += 1;
        }
        readers
    }

    /// Wait at most `bound` for the pipes to close, then take whatever has
    /// been read. Readers still blocked on an open pipe are left detached.
    fn collect(mut self, bound: Duration) -> (String, String) {
        let deadline = Instant::now() + bound;
        while self.running > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.done.recv_timeout(remaining) {
                Ok(_) => self.running -= 1,
                Err(_) => {
                    tracing::warn!(
                        "Child output pipes still open after {:?}; keeping the output read so far",
                        bound
                    );
                    break;
                }
            }
        }
        let stdout = mem::take(&mut *self.stdout.lock());
        let stderr = mem::take(&mut *self.stderr.lock());
        (stdout, stderr)
    }
}

/// Launch `cmd` in its own process group and capture its output.
///
/// On deadline the group receives `options.kill_signal`, escalating to
/// `SIGKILL`; an unkillable group surfaces as [`ProcError::Unkillable`].
pub fn run_captured(cmd: &mut Command, options: &CaptureOptions) -> Result<CaptureOutcome, ProcError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let started = Instant::now();
    let mut child = spawn_group(cmd)?;

    let readers = Readers::start(&mut child, options.echo);

    match child.wait_timeout(options.timeout)? {
        Some(status) => {
            // Helpers forked by the command would otherwise hold the pipes.
            if let Err(e) = child.sweep_stragglers() {
                tracing::warn!("{}", e);
            }
            let (stdout, stderr) = readers.collect(options.grace);
            Ok(CaptureOutcome::Exited(Captured {
                status,
                stdout,
                stderr,
                elapsed: started.elapsed(),
            }))
        }
        None => {
            let elapsed = started.elapsed();
            tracing::debug!("Group {} exceeded {:?}", child.pgid(), options.timeout);
            let termination = child.terminate(options.kill_signal, options.grace)?;
            let (stdout, stderr) = readers.collect(options.grace);
            Ok(CaptureOutcome::TimedOut {
                elapsed,
                termination,
                stdout,
                stderr,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn quick() -> CaptureOptions {
        CaptureOptions {
            timeout: Duration::from_secs(10),
            grace: Duration::from_secs(2),
            ..CaptureOptions::default()
        }
    }

    #[test]
    fn test_captures_both_streams() {
        let outcome = run_captured(&mut sh("echo 'elapsed time: 1.5'; echo oops >&2"), &quick()).unwrap();
        let CaptureOutcome::Exited(captured) = outcome else {
            panic!("expected exit");
        };
        assert!(captured.status.success());
        assert_eq!(captured.stdout, "elapsed time: 1.5\n");
        assert_eq!(captured.stderr, "oops\n");
        assert!(captured.combined().contains("oops"));
    }

    #[test]
    fn test_nonzero_exit_is_not_an_error() {
        let outcome = run_captured(&mut sh("exit 7"), &quick()).unwrap();
        assert!(matches!(outcome, CaptureOutcome::Exited(c) if c.status.code() == Some(7)));
    }

    #[test]
    fn test_timeout_kills_group() {
        let options = CaptureOptions {
            timeout: Duration::from_millis(200),
            grace: Duration::from_secs(2),
            ..CaptureOptions::default()
        };
        let outcome = run_captured(&mut sh("echo started; sleep 30 & wait"), &options).unwrap();
        match outcome {
            CaptureOutcome::TimedOut { stdout, elapsed, .. } => {
                assert_eq!(stdout, "started\n");
                assert!(elapsed >= Duration::from_millis(200));
            }
            CaptureOutcome::Exited(_) => panic!("expected timeout"),
        }
    }

    #[test]
    fn test_forked_helper_does_not_hold_output() {
        let started = Instant::now();
        let outcome = run_captured(&mut sh("echo partial; sleep 30 & exit 0"), &quick()).unwrap();
        let CaptureOutcome::Exited(captured) = outcome else {
            panic!("expected exit");
        };
        assert_eq!(captured.stdout, "partial\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_open_pipe_keeps_partial_output() {
        let (reader, mut writer) = std::io::pipe().unwrap();
        let (tx, done) = mpsc::channel();
        let readers = Readers {
            stdout: Buffer::default(),
            stderr: Buffer::default(),
            done,
            running: 1,
        };
        spawn_reader(reader, Stream::Stdout, false, Arc::clone(&readers.stdout), tx);
        std::io::Write::write_all(&mut writer, b"elapsed time: 2.0\n").unwrap();

        // The line lands in the buffer before the bounded wait gives up.
        thread::sleep(Duration::from_millis(100));
        let (stdout, stderr) = readers.collect(Duration::from_millis(200));
        assert_eq!(stdout, "elapsed time: 2.0\n");
        assert!(stderr.is_empty());
        drop(writer);
    }

    #[test]
    fn test_lossy_utf8() {
        let outcome = run_captured(&mut sh("printf 'a\\377b\\n'"), &quick()).unwrap();
        let CaptureOutcome::Exited(captured) = outcome else {
            panic!("expected exit");
        };
        assert!(captured.stdout.starts_with('a'));
        assert!(captured.stdout.ends_with("b\n"));
    }
}
