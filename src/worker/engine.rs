// Solving engine contract and the external-command adapter
use std::collections::HashMap;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// What the `content` field of a solve request holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Player,
    Preprocessed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeKind {
    Signature,
    NParameter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub kind: ChallengeKind,
    pub challenges: Vec<String>,
}

/// Input handed to the engine, one per worker task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverInput {
    pub kind: InputKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub emit_preprocessed: bool,
    pub requests: Vec<ChallengeRequest>,
}

/// Per-request engine answer, in the same order as the input requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChallengeResponse {
    Result { data: HashMap<String, String> },
    Error { message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocessed_output: Option<String>,
    #[serde(default)]
    pub responses: Vec<ChallengeResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SolverOutput {
    Result(SolveResult),
    Error { message: String },
}

impl SolverOutput {
    pub fn error(message: impl Into<String>) -> Self {
        SolverOutput::Error {
            message: message.into(),
        }
    }
}

/// Set by the pool when a task times out or the pool shuts down. Engines
/// that block should poll it and give up early.
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

/// The black-box decoder. Runs on a pool worker thread, never on the async
/// runtime, so implementations may block.
///
/// A worker thread stays counted against the pool size until `solve`
/// returns, so long-running implementations must honour `cancel`.
pub trait SolvingEngine: Send + Sync + 'static {
    fn solve(&self, input: &SolverInput, cancel: &CancelToken) -> SolverOutput;
}

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Runs an external program per task: JSON input on stdin, JSON output on
/// stdout.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Builds an engine from `[program, args...]`
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    fn run(&self, input: &SolverInput, cancel: &CancelToken) -> Result<SolverOutput, String> {
        let payload = serde_json::to_vec(input).map_err(|e| format!("encode input: {}", e))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("spawn {}: {}", self.program, e))?;

        // Pipes are serviced on their own threads so a chatty child cannot
        // block on a full pipe while we wait for it to exit
        let mut stdin = child.stdin.take().ok_or("child stdin unavailable")?;
        let writer = thread::spawn(move || stdin.write_all(&payload));
        let stdout = read_pipe(child.stdout.take().ok_or("child stdout unavailable")?);
        let stderr = read_pipe(child.stderr.take().ok_or("child stderr unavailable")?);

        let status = loop {
            if cancel.is_cancelled() {
                // Reader threads finish on their own once the pipes close
                let _ = child.kill();
                let _ = child.wait();
                return Err(format!("{} was cancelled", self.program));
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(CHILD_POLL_INTERVAL),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!("wait for {}: {}", self.program, e));
                }
            }
        };

        let stdout = join_pipe(stdout, "stdout")?;
        let stderr = join_pipe(stderr, "stderr")?;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(format!("{} exited with {}: {}", self.program, status, stderr.trim()));
        }

        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(format!("write input: {}", e)),
            Err(_) => return Err("stdin writer panicked".to_string()),
        }

        serde_json::from_slice(&stdout).map_err(|e| format!("decode output: {}", e))
    }
}

fn read_pipe<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<std::io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).map(|_| buf)
    })
}

fn join_pipe(reader: JoinHandle<std::io::Result<Vec<u8>>>, name: &str) -> Result<Vec<u8>, String> {
    match reader.join() {
        Ok(Ok(buf)) => Ok(buf),
        Ok(Err(e)) => Err(format!("read {}: {}", name, e)),
        Err(_) => Err(format!("{} reader panicked", name)),
    }
}

impl SolvingEngine for CommandEngine {
    fn solve(&self, input: &SolverInput, cancel: &CancelToken) -> SolverOutput {
        debug!("Running solver command {}", self.program);
        self.run(input, cancel).unwrap_or_else(SolverOutput::error)
    }
}
