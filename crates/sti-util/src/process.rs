//! Process execution helpers for sti.

use std::fs::File;
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::UtilError;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long to keep collecting output from a child that was killed.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Structured output from a command execution.
#[derive(Debug)]
pub struct CommandOutput {
    /// Raw standard output. Some engine calls stream binary data here.
    pub stdout: Vec<u8>,
    /// Standard error as a string.
    pub stderr: String,
    /// Whether the command exited successfully.
    pub success: bool,
    /// The exit code, if the process was not killed by a signal.
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// Standard output decoded as UTF-8, lossily.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

/// Execute a command and capture its output.
///
/// # Errors
/// Returns an error if the command cannot be spawned (e.g. binary not found).
/// A non-zero exit code is **not** an error; check `CommandOutput::success` instead.
pub fn run_command(cmd: &mut Command) -> Result<CommandOutput, UtilError> {
    let output = cmd.output().map_err(|source| UtilError::CommandExec {
        program: program_name(cmd),
        source,
    })?;

    Ok(CommandOutput {
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        success: output.status.success(),
        exit_code: output.status.code(),
    })
}

/// Execute a command, feeding `stdin` (or nothing), and kill it if it runs
/// longer than `timeout`.
///
/// # Errors
/// Returns `UtilError::CommandExec` if the command cannot be spawned or
/// polled, and `UtilError::Timeout` if it was killed on expiry. A non-zero
/// exit code is not an error.
pub fn run_command_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
    stdin: Option<File>,
) -> Result<CommandOutput, UtilError> {
    let program = program_name(cmd);
    let mut child = spawn_piped(cmd, &program, stdin)?;

    // Drain both pipes concurrently so a chatty child never blocks on a full pipe.
    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let status = wait_with_deadline(&mut child, &program, timeout, || {
        std::thread::sleep(POLL_INTERVAL);
    })?;

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout,
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        success: status.success(),
        exit_code: status.code(),
    })
}

/// Like [`run_command_with_timeout`], but forwards both output streams to
/// `sink` as they arrive instead of holding them until the child exits.
///
/// Output produced before a timeout still reaches `sink`. The returned
/// `CommandOutput` carries a copy of everything that was forwarded.
///
/// # Errors
/// Returns `UtilError::CommandExec` if the command cannot be spawned or
/// polled, `UtilError::Timeout` if it was killed on expiry, and
/// `UtilError::Output` if writing to `sink` failed. A non-zero exit code is
/// not an error.
pub fn run_command_streaming(
    cmd: &mut Command,
    timeout: Duration,
    stdin: Option<File>,
    sink: &mut dyn Write,
) -> Result<CommandOutput, UtilError> {
    let program = program_name(cmd);
    let mut child = spawn_piped(cmd, &program, stdin)?;

    let (tx, rx) = mpsc::channel();
    forward_chunks(child.stdout.take(), Stream::Stdout, tx.clone());
    forward_chunks(child.stderr.take(), Stream::Stderr, tx);

    let mut relay = Relay::new(sink);
    let waited = wait_with_deadline(&mut child, &program, timeout, || {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(chunk) => relay.accept(chunk),
            Err(RecvTimeoutError::Timeout) => {}
            // Both pipes closed but the child has not been reaped yet.
            Err(RecvTimeoutError::Disconnected) => std::thread::sleep(POLL_INTERVAL),
        }
    });

    match &waited {
        Ok(_) => rx.iter().for_each(|chunk| relay.accept(chunk)),
        Err(_) => drain_for(&rx, DRAIN_GRACE, &mut relay),
    }
    let flushed = relay.finish(&program);
    let status = waited?;
    let (stdout, stderr) = flushed?;

    Ok(CommandOutput {
        stdout,
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        success: status.success(),
        exit_code: status.code(),
    })
}

fn spawn_piped(cmd: &mut Command, program: &str, stdin: Option<File>) -> Result<Child, UtilError> {
    let stdin = stdin.map_or_else(Stdio::null, Stdio::from);
    cmd.stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| UtilError::CommandExec {
            program: program.to_owned(),
            source,
        })
}

/// Poll `child` until it exits, calling `idle` between polls, and kill it
/// once `timeout` has passed.
fn wait_with_deadline(
    child: &mut Child,
    program: &str,
    timeout: Duration,
    mut idle: impl FnMut(),
) -> Result<ExitStatus, UtilError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(UtilError::Timeout {
                    program: program.to_owned(),
                    seconds: timeout.as_secs(),
                });
            }
            Ok(None) => idle(),
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(UtilError::CommandExec {
                    program: program.to_owned(),
                    source,
                });
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

struct Chunk {
    stream: Stream,
    bytes: Vec<u8>,
}

fn forward_chunks<R: Read + Send + 'static>(pipe: Option<R>, stream: Stream, tx: Sender<Chunk>) {
    let Some(mut pipe) = pipe else {
        return;
    };
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let bytes = buf.get(..n).unwrap_or_default().to_vec();
                    if tx.send(Chunk { stream, bytes }).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Collect what is still in flight, giving up once nothing arrives for `grace`.
fn drain_for(rx: &Receiver<Chunk>, grace: Duration, relay: &mut Relay<'_>) {
    while let Ok(chunk) = rx.recv_timeout(grace) {
        relay.accept(chunk);
    }
}

/// Copies output chunks to the sink while keeping them for the caller.
struct Relay<'s> {
    sink: &'s mut dyn Write,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    error: Option<std::io::Error>,
}

impl<'s> Relay<'s> {
    fn new(sink: &'s mut dyn Write) -> Self {
        Self {
            sink,
            stdout: Vec::new(),
            stderr: Vec::new(),
            error: None,
        }
    }

    fn accept(&mut self, chunk: Chunk) {
        // After the first failed write the sink is left alone.
        if self.error.is_none() {
            if let Err(e) = self.sink.write_all(&chunk.bytes) {
                self.error = Some(e);
            }
        }
        match chunk.stream {
            Stream::Stdout => self.stdout.extend_from_slice(&chunk.bytes),
            Stream::Stderr => self.stderr.extend_from_slice(&chunk.bytes),
        }
    }

    fn finish(mut self, program: &str) -> Result<(Vec<u8>, Vec<u8>), UtilError> {
        let error = match self.error {
            Some(e) => Some(e),
            None => self.sink.flush().err(),
        };
        match error {
            Some(source) => Err(UtilError::Output {
                program: program.to_owned(),
                source,
            }),
            None => Ok((self.stdout, self.stderr)),
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Turn an unsuccessful `CommandOutput` into a `CommandFailed` error.
///
/// # Errors
/// Returns `UtilError::CommandFailed` carrying the trimmed stderr (or the
/// exit code when stderr is empty) if the command did not succeed.
pub fn ensure_success(program: &str, output: CommandOutput) -> Result<CommandOutput, UtilError> {
    if output.success {
        return Ok(output);
    }
    let stderr = output.stderr.trim();
    let message = if stderr.is_empty() {
        match output.exit_code {
            Some(code) => format!("exited with status {code}"),
            None => "terminated by a signal".to_owned(),
        }
    } else {
        stderr.to_owned()
    };
    Err(UtilError::CommandFailed {
        program: program.to_owned(),
        message,
    })
}
