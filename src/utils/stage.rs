// src/utils/stage.rs: running one external stage
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use log::{debug, error, warn};
use tokio::process::Command;


/// One external invocation: a program, its ordered arguments and the
/// artifacts it is expected to leave behind.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub outputs: Vec<PathBuf>,
    /// Log the tool writes besides stdout; appended to the captured output.
    pub side_log: Option<PathBuf>,
}

impl StageSpec {
    pub fn new(name: &str, program: &str) -> Self {
        StageSpec {
            name: name.to_string(),
            program: program.to_string(),
            args: Vec::new(),
            outputs: Vec::new(),
            side_log: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn output(mut self, path: PathBuf) -> Self {
        self.outputs.push(path);
        self
    }

    pub fn side_log(mut self, path: PathBuf) -> Self {
        self.side_log = Some(path);
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}


#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub success: bool,
    /// stdout + side log on success, stderr verbatim on failure.
    pub combined_output: String,
    pub error_detail: Option<String>,
    pub elapsed: Duration,
}

impl StageResult {
    pub fn succeeded(output: String, elapsed: Duration) -> Self {
        StageResult { success: true, combined_output: output, error_detail: None, elapsed }
    }

    pub fn failed(output: String, detail: String, elapsed: Duration) -> Self {
        StageResult { success: false, combined_output: output, error_detail: Some(detail), elapsed }
    }
}


/// Runs stages. The orchestrator only ever talks to the outside world
/// through this.
pub trait StageExecutor: Send + Sync + 'static {
    fn execute(&self, spec: &StageSpec) -> impl Future<Output = StageResult> + Send;
}


/// Executes a `StageSpec` as a child process and waits for it to exit.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl StageExecutor for ProcessExecutor {
    async fn execute(&self, spec: &StageSpec) -> StageResult {
        debug!("Running {}: {}", spec.name, spec.command_line());
        let start = Instant::now();

        let output = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        let elapsed = start.elapsed();
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                let detail = format!("Failed to spawn {}: {}. Is it installed?", spec.program, e);
                error!("{} failed: {}", spec.name, detail);
                return StageResult::failed(String::new(), detail, elapsed);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            let detail = format!("{} exited with {}\n{}", spec.name, output.status, stderr);
            return StageResult::failed(stderr, detail, elapsed);
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        if let Some(log_path) = &spec.side_log {
            match tokio::fs::read_to_string(log_path).await {
                Ok(log_text) => combined.push_str(&log_text),
                Err(e) => warn!("Could not read {} log {}: {}", spec.name, log_path.display(), e),
            }
        }
        StageResult::succeeded(combined, elapsed)
    }
}
