//! Child process runner with a hard timeout and bounded capture.

use std::io::{Read, Write};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes discarded beyond the limit, per stream.
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn truncated(&self) -> bool {
        self.stdout_truncated > 0 || self.stderr_truncated > 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Grace period for the output readers once the child is gone.
///
/// A grandchild that inherited the pipes can keep them open after the child
/// exits; whatever was captured by then is returned.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

type Captured = Arc<Mutex<(Vec<u8>, usize)>>;

/// Run `cmd` to completion or until `timeout`, whichever comes first.
///
/// stdout and stderr are drained on reader threads while the child runs so a
/// chatty child cannot deadlock on a full pipe, and stdin is fed from its own
/// thread so a child that never reads cannot stall the timeout. At most
/// `output_limit_bytes` per stream are kept; the rest is counted and dropped.
///
/// On unix the child leads its own process group. A timed out child is
/// killed together with everything it spawned, then reaped.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    debug!(program = ?cmd.get_program(), "spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let (done_tx, done_rx) = mpsc::channel();
    let stdout_buf = spawn_reader(stdout, output_limit_bytes, done_tx.clone());
    let stderr_buf = spawn_reader(stderr, output_limit_bytes, done_tx);

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        // Detached: a child that never reads is killed below, which ends
        // the write with a broken pipe.
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                warn!(err = %e, "child closed stdin early");
            }
        });
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_tree(&mut child).context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };
    let elapsed = started.elapsed();

    let deadline = Instant::now() + DRAIN_GRACE;
    let mut finished = 0;
    while finished < 2 {
        let left = deadline.saturating_duration_since(Instant::now());
        match done_rx.recv_timeout(left) {
            Ok(Ok(())) => finished += 1,
            Ok(Err(err)) => return Err(err).context("read command output"),
            Err(_) => {
                warn!("output pipes still held open after exit, returning partial output");
                break;
            }
        }
    }
    let (stdout, stdout_truncated) = take_captured(&stdout_buf)?;
    let (stderr, stderr_truncated) = take_captured(&stderr_buf)?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed,
    })
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) -> std::io::Result<()> {
    // The child leads its own group, so its pid is the group id.
    let group = format!("-{}", child.id());
    let killed = Command::new("kill")
        .args(["-KILL", "--", group.as_str()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match killed {
        Ok(status) if status.success() => Ok(()),
        _ => {
            warn!("process group kill failed, killing child only");
            child.kill()
        }
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    limit: usize,
    done: mpsc::Sender<Result<()>>,
) -> Captured {
    let captured: Captured = Arc::new(Mutex::new((Vec::new(), 0)));
    let sink = Arc::clone(&captured);
    thread::spawn(move || {
        let _ = done.send(read_stream_limited(reader, limit, &sink));
    });
    captured
}

fn take_captured(captured: &Captured) -> Result<(Vec<u8>, usize)> {
    let mut guard = captured
        .lock()
        .map_err(|_| anyhow!("output reader thread panicked"))?;
    Ok(std::mem::take(&mut *guard))
}

fn read_stream_limited<R: Read>(
    mut reader: R,
    limit: usize,
    sink: &Mutex<(Vec<u8>, usize)>,
) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let mut guard = sink.lock().map_err(|_| anyhow!("output buffer poisoned"))?;
        let (buf, truncated) = &mut *guard;
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        *truncated += n - keep;
    }

    Ok(())
}
