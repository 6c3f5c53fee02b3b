use std::ffi::OsString;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Environment variable the LLVM profiling runtime writes its raw profile to.
pub const PROFILE_ENV_VAR: &str = "LLVM_PROFILE_FILE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok,
    Timeout,
    Failed(String),
    SpawnError(String),
}

impl ExecutionStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ExecutionStatus::Ok)
    }
}

/// Where the child's stdout/stderr go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Collected into [`ProcessOutput`].
    #[default]
    Capture,
    /// Shared with this process' terminal.
    Inherit,
    /// Thrown away.
    Discard,
}

/// A single external program run.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Value for [`PROFILE_ENV_VAR`]; every run gets its own file.
    pub profile_file: Option<PathBuf>,
    pub output: OutputMode,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            profile_file: None,
            output: OutputMode::Capture,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn profile_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.profile_file = Some(path.into());
        self
    }

    pub fn output(mut self, mode: OutputMode) -> Self {
        self.output = mode;
        self
    }

    /// Human-readable command line for diagnostics.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

#[derive(Debug, Default)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessOutput {
    const SIGINT: i32 = 2;

    /// `true` if the child died from the interrupt signal, which a Ctrl-C
    /// delivers to the child and to us at the same time.
    pub fn interrupted(&self) -> bool {
        self.signal == Some(Self::SIGINT)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Last few lines of stderr, for error messages.
    pub fn stderr_tail(&self, max_lines: usize) -> String {
        let text = String::from_utf8_lossy(&self.stderr);
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

#[derive(Debug)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub output: ProcessOutput,
}

/// Runs external tools synchronously, optionally bounded by a timeout.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    timeout: Option<Duration>,
}

impl CommandExecutor {
    const POLL_INTERVAL: Duration = Duration::from_millis(50);
    const SPAWN_ATTEMPTS: usize = 3;

    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn execute(&self, invocation: &Invocation) -> ExecutionResult {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        cmd.stdin(Stdio::null());
        if let Some(profile) = &invocation.profile_file {
            cmd.env(PROFILE_ENV_VAR, profile);
        }

        // Output goes to unnamed temp files rather than pipes so a chatty child
        // can never block on a full pipe while we poll for the timeout.
        let mut captured: Option<(File, File)> = None;
        match invocation.output {
            OutputMode::Capture => {
                let files = match tempfile::tempfile().and_then(|out| {
                    let err = tempfile::tempfile()?;
                    Ok((out, err))
                }) {
                    Ok(files) => files,
                    Err(e) => {
                        return Self::not_started(format!(
                            "Failed to create capture files for '{}': {}",
                            invocation.command_line(),
                            e
                        ));
                    }
                };
                match (files.0.try_clone(), files.1.try_clone()) {
                    (Ok(out), Ok(err)) => {
                        cmd.stdout(out);
                        cmd.stderr(err);
                    }
                    (Err(e), _) | (_, Err(e)) => {
                        return Self::not_started(format!(
                            "Failed to share capture files with '{}': {}",
                            invocation.command_line(),
                            e
                        ));
                    }
                }
                captured = Some(files);
            }
            OutputMode::Inherit => {
                cmd.stdout(Stdio::inherit());
                cmd.stderr(Stdio::inherit());
            }
            OutputMode::Discard => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
        }

        log::trace!("Running {}", invocation.command_line());
        let child = match self.spawn(&mut cmd) {
            Ok(child) => child,
            Err(e) => {
                return Self::not_started(format!(
                    "Failed to spawn command '{}': {}",
                    invocation.command_line(),
                    e
                ));
            }
        };
        // Our copies of the capture handles must not outlive the child's.
        drop(cmd);

        let wait_result = self.run_and_wait_with_timeout(child);

        let mut output = ProcessOutput::default();
        if let Some((mut out, mut err)) = captured {
            output.stdout = read_back(&mut out);
            output.stderr = read_back(&mut err);
        }

        let status = match wait_result {
            Ok(exit) => {
                output.exit_code = exit.code();
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    output.signal = exit.signal();
                }
                if exit.success() {
                    ExecutionStatus::Ok
                } else {
                    ExecutionStatus::Failed(describe_exit(&output))
                }
            }
            Err(status) => status,
        };
        ExecutionResult { status, output }
    }

    fn spawn(&self, cmd: &mut Command) -> std::io::Result<Child> {
        let mut attempt = 1;
        loop {
            match cmd.spawn() {
                // ETXTBSY: the program was written moments ago and another thread
                // still held it open for writing when it forked.
                Err(e) if e.raw_os_error() == Some(26) && attempt < Self::SPAWN_ATTEMPTS => {
                    attempt += 1;
                    std::thread::sleep(Duration::from_millis(10));
                }
                result => return result,
            }
        }
    }

    fn run_and_wait_with_timeout(&self, mut child: Child) -> Result<ExitStatus, ExecutionStatus> {
        let Some(timeout) = self.timeout else {
            return child
                .wait()
                .map_err(|e| ExecutionStatus::Failed(format!("Error waiting for child: {e}")));
        };

        let start_time = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start_time.elapsed() > timeout {
                        log::warn!("Child timed out after {timeout:?}, killing...");
                        if let Err(e) = child.kill() {
                            return Err(ExecutionStatus::Failed(format!(
                                "Failed to kill timed-out process: {e}"
                            )));
                        }
                        let _ = child.wait();
                        return Err(ExecutionStatus::Timeout);
                    }
                    std::thread::sleep(Self::POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(ExecutionStatus::Failed(format!(
                        "Error waiting for child: {e}"
                    )));
                }
            }
        }
    }

    fn not_started(message: String) -> ExecutionResult {
        ExecutionResult {
            status: ExecutionStatus::SpawnError(message),
            output: ProcessOutput::default(),
        }
    }
}

fn read_back(file: &mut File) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(e) = file
        .seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_end(&mut buf))
    {
        log::warn!("Could not read captured child output: {e}");
    }
    buf
}

fn describe_exit(output: &ProcessOutput) -> String {
    let mut desc = if let Some(code) = output.exit_code {
        format!("Exited with code {code}")
    } else if let Some(signal) = output.signal {
        format!("Terminated by signal {signal}")
    } else {
        "Exited abnormally".to_string()
    };
    let tail = output.stderr_tail(5);
    if !tail.is_empty() {
        desc.push_str(": ");
        desc.push_str(&tail);
    }
    desc
}
