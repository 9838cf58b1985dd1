use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{BuildError, BuildResult, IoContext};

const DEFAULT_MAX_CAPTURE_BYTES: usize = 1024 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// An external toolchain invocation (compiler, package installer, git).
#[derive(Debug, Clone)]
pub struct Toolchain {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    clear_env: bool,
}

impl Toolchain {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            clear_env: false,
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Replaces the inherited environment with exactly `envs`.
    #[must_use]
    pub fn exact_env(mut self, envs: Vec<(String, String)>) -> Self {
        self.envs = envs;
        self.clear_env = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Runs to completion in `cwd`, failing on a non-zero exit. The child is
    /// killed as soon as `cancel` trips.
    pub fn run(&self, cwd: &Path, cancel: &CancelToken) -> BuildResult<ToolOutput> {
        let output = self.run_unchecked(cwd, cancel)?;
        if output.code != 0 {
            return Err(BuildError::Toolchain {
                program: self.display(),
                status: format!("status {}", output.code),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Like [`Toolchain::run`] but hands back non-zero exits to the caller.
    pub fn run_unchecked(&self, cwd: &Path, cancel: &CancelToken) -> BuildResult<ToolOutput> {
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled {
                program: self.program.clone(),
            });
        }
        debug!(command = %self.display(), cwd = %cwd.display(), "running toolchain");
        let mut command = self.configured_command(cwd);
        let mut child = command.spawn().at("failed to start", &self.program)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_handle = thread::spawn(move || read_to_string_limited(stdout));
        let stderr_handle = thread::spawn(move || read_to_string_limited(stderr));

        let status = loop {
            if let Some(status) = child.try_wait().at("failed to wait for", &self.program)? {
                break status;
            }
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                debug!(program = %self.program, "toolchain cancelled");
                return Err(BuildError::Cancelled {
                    program: self.program.clone(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        Ok(ToolOutput {
            code: exit_code(status),
            stdout,
            stderr,
        })
    }

    fn configured_command(&self, cwd: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if self.clear_env {
            command.env_clear();
        }
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        command.current_dir(cwd);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn read_to_string_limited(reader: Option<impl Read>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buffer = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    while let Ok(read) = reader.read(&mut chunk) {
        if read == 0 {
            break;
        }
        let room = DEFAULT_MAX_CAPTURE_BYTES.saturating_sub(buffer.len());
        if read > room {
            truncated = true;
        }
        buffer.extend_from_slice(&chunk[..read.min(room)]);
    }
    let mut text = String::from_utf8_lossy(&buffer).to_string();
    if truncated {
        text.push_str("\n[...truncated...]\n");
    }
    text
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn captures_output_and_status() {
        let output = Toolchain::new("/bin/sh")
            .args(["-c", "printf out && printf err >&2; exit 7"])
            .run_unchecked(Path::new("."), &CancelToken::new())
            .expect("run");
        assert_eq!(output.code, 7);
        assert_eq!(output.stdout, "out");
        assert_eq!(output.stderr, "err");
    }

    #[test]
    fn non_zero_exit_is_a_toolchain_error_with_stderr() {
        let err = Toolchain::new("/bin/sh")
            .args(["-c", "echo 'undefined: main' >&2; exit 2"])
            .run(Path::new("."), &CancelToken::new())
            .unwrap_err();
        match err {
            BuildError::Toolchain { stderr, status, .. } => {
                assert_eq!(stderr, "undefined: main");
                assert_eq!(status, "status 2");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn cancellation_kills_the_child_promptly() {
        let cancel = CancelToken::new().with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let err = Toolchain::new("/bin/sh")
            .args(["-c", "sleep 30"])
            .run(Path::new("."), &cancel)
            .unwrap_err();
        assert!(matches!(err, BuildError::Cancelled { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn exact_env_replaces_inherited_environment() {
        let output = Toolchain::new("/bin/sh")
            .args(["-c", "printf \"$ONLY:${HOME:-unset}\""])
            .exact_env(vec![("ONLY".into(), "yes".into())])
            .run(Path::new("."), &CancelToken::new())
            .expect("run");
        assert_eq!(output.stdout, "yes:unset");
    }

    #[test]
    fn missing_program_is_an_io_error() {
        let err = Toolchain::new("/definitely/not/a/tool")
            .run(Path::new("."), &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.code(), "FP110");
    }
}
