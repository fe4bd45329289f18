use std::any::Any;
use std::io::{ErrorKind, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// Shorten `s` to at most `max` characters, marking the cut with `...` when there is room.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    if max <= 3 {
        return s.chars().take(max).collect();
    }
    let mut out: String = s.chars().take(max - 3).collect();
    out.push_str("...");
    out
}

/// Keep the last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect::<String>()
}

/// Reduce an arbitrary label to a filesystem-safe path component.
pub fn sanitize_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let cleaned = out.trim_matches(|c| c == '_' || c == '.').to_string();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}

/// Text of a panic payload caught by `catch_unwind` or a task join.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    /// A pipe was still open when the grace period ran out, so the captured
    /// output may be missing its end.
    pub output_truncated: bool,
}

impl CommandRunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to keep reading output after the child is gone. Descendants that
/// inherited the pipes can hold them open indefinitely.
const OUTPUT_GRACE: Duration = Duration::from_secs(5);

/// Run `command` with stdin closed, killing it once `timeout` elapses.
///
/// Output is read on background threads so a chatty child never blocks on a
/// full pipe.
pub fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<CommandRunResult, String> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) if Instant::now() >= deadline => {
                timed_out = true;
                let _ = child.kill();
                break child.wait().ok();
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(format!("Failed to wait for command: {}", e));
            }
        }
    };

    let grace_deadline = Instant::now() + OUTPUT_GRACE;
    let (stdout, stdout_complete) = collect(&stdout, grace_deadline);
    let (stderr, stderr_complete) = collect(&stderr, grace_deadline);
    Ok(CommandRunResult {
        status,
        stdout,
        stderr,
        timed_out,
        output_truncated: !(stdout_complete && stderr_complete),
    })
}

/// Forward everything read from `pipe` in chunks until it closes.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
    rx
}

/// Everything received before the pipe closed or `deadline` passed, and
/// whether the pipe closed in time.
fn collect(rx: &Receiver<Vec<u8>>, deadline: Instant) -> (Vec<u8>, bool) {
    let mut out = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(chunk) => out.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Disconnected) => return (out, true),
            Err(RecvTimeoutError::Timeout) => return (out, false),
        }
    }
}
