//! Container runtime invocation for the build manager's stage pipeline:
//! the workspace is bind-mounted
//! read-write, stage-identifying environment variables are set, stdout and
//! stderr are streamed line-by-line back to the caller, and the exit code
//! determines stage success or failure.
//!
//! The process-exec shape mirrors a run-with-timeout-and-kill pattern:
//! spawn, poll `try_wait` against a deadline, and drain stdout/stderr as
//! lines arrive rather than only at the end, since the build manager needs
//! to persist `BuildLog` rows as the container runs, not after it exits.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Cooperative cancellation flag shared between the caller and the running
/// container invocation. Checked at least between I/O steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One line of container output, tagged with the stream it came from so
/// the caller can apply the level-classification rule (stderr does not
/// automatically mean `error`; classification is by message prefix).
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: Stream,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

/// Invokes a container runtime binary (`docker`, `podman`, ...) for one
/// build stage, bind-mounting `workspace` read-write and setting the
/// stage's environment variables. `on_line` is called for every line of
/// stdout/stderr as it arrives, in the order lines are read (stdout and
/// stderr are drained from separate threads, so interleaving across
/// streams is not guaranteed — the build manager tags each `BuildLog` row
/// with its own timestamp rather than relying on ordering).
pub fn run_stage(
    runtime_binary: &str,
    image: &str,
    workspace: &Path,
    env: &BTreeMap<String, String>,
    timeout: Option<Duration>,
    cancel: &CancelToken,
    mut on_line: impl FnMut(OutputLine) + Send,
) -> Result<RunOutcome> {
    let start = Instant::now();
    let mut command = Command::new(runtime_binary);
    command
        .arg("run")
        .arg("--rm")
        .arg("-v")
        .arg(format!("{}:/workspace:rw", workspace.display()));
    for (k, v) in env {
        command.arg("-e").arg(format!("{k}={v}"));
    }
    command.arg(image);

    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn container runtime {runtime_binary}"))?;

    let lines = Arc::new(Mutex::new(Vec::<OutputLine>::new()));
    let stdout_handle = spawn_line_reader(child.stdout.take(), Stream::Stdout, lines.clone());
    let stderr_handle = spawn_line_reader(child.stderr.take(), Stream::Stderr, lines.clone());

    let deadline = timeout.map(|t| Instant::now() + t);
    let (exit_code, timed_out, cancelled) = poll_until_done(&mut child, deadline, cancel, &lines, &mut on_line);

    if let Some(h) = stdout_handle {
        let _ = h.join();
    }
    if let Some(h) = stderr_handle {
        let _ = h.join();
    }
    drain_remaining(&lines, &mut on_line);

    Ok(RunOutcome {
        exit_code,
        timed_out,
        cancelled,
        duration: start.elapsed(),
    })
}

fn spawn_line_reader(
    pipe: Option<impl std::io::Read + Send + 'static>,
    stream: Stream,
    sink: Arc<Mutex<Vec<OutputLine>>>,
) -> Option<thread::JoinHandle<()>> {
    let pipe = pipe?;
    Some(thread::spawn(move || {
        let reader = BufReader::new(pipe);
        for line in reader.lines().map_while(Result::ok) {
            sink.lock()
                .expect("output line buffer poisoned")
                .push(OutputLine { stream, line });
        }
    }))
}

fn drain_remaining(sink: &Arc<Mutex<Vec<OutputLine>>>, on_line: &mut impl FnMut(OutputLine)) {
    let mut buf = sink.lock().expect("output line buffer poisoned");
    for line in buf.drain(..) {
        on_line(line);
    }
}

fn poll_until_done(
    child: &mut Child,
    deadline: Option<Instant>,
    cancel: &CancelToken,
    lines: &Arc<Mutex<Vec<OutputLine>>>,
    on_line: &mut impl FnMut(OutputLine),
) -> (i32, bool, bool) {
    loop {
        drain_remaining(lines, on_line);

        match child.try_wait() {
            Ok(Some(status)) => return (status.code().unwrap_or(-1), false, false),
            Ok(None) => {}
            Err(_) => return (-1, false, false),
        }

        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            drain_remaining(lines, on_line);
            return (-1, false, true);
        }

        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            let _ = child.kill();
            let _ = child.wait();
            drain_remaining(lines, on_line);
            return (-1, true, false);
        }

        thread::sleep(Duration::from_millis(100));
    }
}
