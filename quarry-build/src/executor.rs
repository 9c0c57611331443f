//! Privileged Executor: runs commands under a root-faking wrapper,
//! with timeouts, retries, and captured output.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Named execution profiles pre-setting timeout/retry defaults.
#[derive(Debug, Clone, Copy)]
pub struct ExecProfile {
    pub timeout: Duration,
    pub retries: u32,
}

impl ExecProfile {
    pub const fn default_profile() -> Self {
        ExecProfile {
            timeout: Duration::from_secs(300),
            retries: 1,
        }
    }

    pub const fn build() -> Self {
        ExecProfile {
            timeout: Duration::from_secs(3600),
            retries: 0,
        }
    }

    pub const fn test() -> Self {
        ExecProfile {
            timeout: Duration::from_secs(900),
            retries: 1,
        }
    }

    pub const fn package() -> Self {
        ExecProfile {
            timeout: Duration::from_secs(600),
            retries: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Attempt {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub success: bool,
    pub attempts: Vec<Attempt>,
}

impl ExecResult {
    pub fn last(&self) -> &Attempt {
        self.attempts.last().expect("at least one attempt recorded")
    }
}

/// A single command invocation request.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<std::path::PathBuf>,
    pub privileged: bool,
}

type HookFn = Box<dyn Fn(&Invocation) + Send + Sync>;

/// Scoped runner that wraps commands through a `fakeroot`-style tool when
/// `privileged=true`, captures stdout/stderr via the same piped-thread idiom
/// the build pipeline uses for any child process, and retries with
/// exponential backoff.
pub struct PrivilegedExecutor {
    fakeroot_bin: Option<std::path::PathBuf>,
    pre_hooks: Vec<HookFn>,
    post_hooks: Vec<HookFn>,
}

impl PrivilegedExecutor {
    pub fn new() -> Self {
        Self {
            fakeroot_bin: which::which("fakeroot").ok(),
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        }
    }

    pub fn register_pre_hook(&mut self, f: impl Fn(&Invocation) + Send + Sync + 'static) {
        self.pre_hooks.push(Box::new(f));
    }

    pub fn register_post_hook(&mut self, f: impl Fn(&Invocation) + Send + Sync + 'static) {
        self.post_hooks.push(Box::new(f));
    }

    /// Run `invocation` under `profile`, retrying on failure with
    /// exponential backoff (`timeout * 2^attempt`, informational only — the
    /// per-attempt timeout itself stays fixed, only the wait before the
    /// next retry grows).
    pub fn run(&self, invocation: &Invocation, profile: ExecProfile, check: bool) -> Result<ExecResult> {
        for hook in &self.pre_hooks {
            hook(invocation);
        }

        let mut attempts = Vec::new();
        let mut success = false;

        for attempt_num in 0..=profile.retries {
            let attempt = self.run_once(invocation, profile.timeout)?;
            success = attempt.exit_code == Some(0);
            attempts.push(attempt);

            if success {
                break;
            }
            if attempt_num < profile.retries {
                let backoff = profile.timeout / 10 * 2u32.pow(attempt_num);
                warn!(
                    command = %invocation.argv.join(" "),
                    attempt = attempt_num,
                    backoff_ms = backoff.as_millis() as u64,
                    "executor: retrying after failure"
                );
                thread::sleep(backoff.min(Duration::from_secs(30)));
            }
        }

        for hook in &self.post_hooks {
            hook(invocation);
        }

        if check && !success {
            let last = attempts.last().unwrap();
            return Err(Error::Exec {
                command: invocation.argv.join(" "),
                exit_code: last.exit_code,
                stdout: last.stdout.clone(),
                stderr: last.stderr.clone(),
            });
        }

        Ok(ExecResult { success, attempts })
    }

    fn run_once(&self, invocation: &Invocation, timeout: Duration) -> Result<Attempt> {
        let mut argv = invocation.argv.clone();
        if invocation.privileged {
            if let Some(fakeroot) = &self.fakeroot_bin {
                let mut wrapped = vec![fakeroot.to_string_lossy().into_owned(), "--".to_string()];
                wrapped.append(&mut argv);
                argv = wrapped;
            } else {
                warn!("executor: privileged requested but no fakeroot-style tool found; running unwrapped");
            }
        }

        let (program, rest) = argv.split_first().ok_or_else(|| {
            Error::Exec {
                command: String::new(),
                exit_code: None,
                stdout: String::new(),
                stderr: "empty argv".to_string(),
            }
        })?;

        let mut command = Command::new(program);
        command.args(rest);
        command.env_clear();
        command.envs(std::env::vars().filter(|(k, _)| k == "PATH" || k == "HOME"));
        command.envs(invocation.env.iter().cloned());
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(Stdio::null());

        let start = Instant::now();
        let mut child = command.spawn()?;

        let stdout_pipe = child.stdout.take().expect("stdout piped");
        let stderr_pipe = child.stderr.take().expect("stderr piped");
        let (tx, rx) = mpsc::channel();

        let stdout_tx = tx.clone();
        let stdout_thread = thread::spawn(move || {
            let reader = BufReader::new(stdout_pipe);
            let mut buf = String::new();
            for line in reader.lines().map_while(std::result::Result::ok) {
                buf.push_str(&line);
                buf.push('\n');
            }
            let _ = stdout_tx.send(("stdout", buf));
        });
        let stderr_thread = thread::spawn(move || {
            let reader = BufReader::new(stderr_pipe);
            let mut buf = String::new();
            for line in reader.lines().map_while(std::result::Result::ok) {
                buf.push_str(&line);
                buf.push('\n');
            }
            let _ = tx.send(("stderr", buf));
        });

        // Poll rather than hand `child` to a dedicated wait thread: staying
        // on the main thread keeps ownership so a timeout can actually kill
        // the process instead of merely giving up on waiting for it.
        const POLL_INTERVAL: Duration = Duration::from_millis(50);
        enum Outcome {
            Exited(std::process::ExitStatus),
            TimedOut,
        }
        let wait_result: Result<Outcome> = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ok(Outcome::Exited(status)),
                Ok(None) => {
                    if start.elapsed() >= timeout {
                        break Ok(Outcome::TimedOut);
                    }
                    thread::sleep(POLL_INTERVAL.min(timeout));
                }
                Err(e) => break Err(Error::Io(e)),
            }
        };
        let wait_result = wait_result?;

        let timed_out = matches!(wait_result, Outcome::TimedOut);
        if timed_out {
            warn!(command = %invocation.argv.join(" "), "executor: timed out, killing child");
            let _ = child.kill();
            let _ = child.wait();
        }

        let mut stdout = String::new();
        let mut stderr = String::new();
        for _ in 0..2 {
            if let Ok((which, buf)) = rx.recv_timeout(Duration::from_secs(5)) {
                if which == "stdout" {
                    stdout = buf;
                } else {
                    stderr = buf;
                }
            }
        }
        let _ = stdout_thread.join();
        let _ = stderr_thread.join();

        let duration = start.elapsed();

        match wait_result {
            Outcome::Exited(status) => {
                debug!(command = %invocation.argv.join(" "), code = ?status.code(), "executor: command finished");
                Ok(Attempt {
                    exit_code: status.code(),
                    stdout,
                    stderr,
                    duration,
                    timed_out: false,
                })
            }
            Outcome::TimedOut => Ok(Attempt {
                exit_code: None,
                stdout,
                stderr,
                duration,
                timed_out: true,
            }),
        }
    }

    /// Run a list of commands piped together (argv[0]'s stdout feeds
    /// argv[1]'s stdin, and so on), returning the final stage's output.
    pub fn run_pipeline(&self, stages: &[Vec<String>], cwd: Option<&std::path::Path>) -> Result<ExecResult> {
        if stages.is_empty() {
            return Ok(ExecResult {
                success: true,
                attempts: vec![],
            });
        }

        let mut children = Vec::new();
        let mut previous_stdout = None;

        for (idx, argv) in stages.iter().enumerate() {
            let (program, rest) = argv.split_first().expect("non-empty stage argv");
            let mut command = Command::new(program);
            command.args(rest);
            if let Some(cwd) = cwd {
                command.current_dir(cwd);
            }
            command.stdin(previous_stdout.take().unwrap_or(Stdio::null()));
            command.stdout(if idx == stages.len() - 1 {
                Stdio::piped()
            } else {
                Stdio::piped()
            });
            command.stderr(Stdio::piped());

            let mut child = command.spawn()?;
            previous_stdout = child.stdout.take().map(Stdio::from);
            children.push(child);
        }

        let mut last_attempt = None;
        for mut child in children {
            let start = Instant::now();
            let output = child.wait_with_output()?;
            last_attempt = Some(Attempt {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                duration: start.elapsed(),
                timed_out: false,
            });
        }

        let attempt = last_attempt.expect("at least one stage");
        let success = attempt.exit_code == Some(0);
        Ok(ExecResult {
            success,
            attempts: vec![attempt],
        })
    }

    /// Run a batch of invocations with bounded parallelism, returning
    /// results in input order.
    pub fn run_bounded(
        &self,
        invocations: Vec<(Invocation, ExecProfile, bool)>,
        concurrency: usize,
    ) -> Vec<Result<ExecResult>> {
        use std::sync::{Arc, Mutex as StdMutex};

        let results: Arc<StdMutex<Vec<Option<Result<ExecResult>>>>> =
            Arc::new(StdMutex::new((0..invocations.len()).map(|_| None).collect()));
        let queue: Arc<StdMutex<Vec<(usize, Invocation, ExecProfile, bool)>>> = Arc::new(StdMutex::new(
            invocations
                .into_iter()
                .enumerate()
                .map(|(i, (inv, p, c))| (i, inv, p, c))
                .collect(),
        ));

        thread::scope(|scope| {
            for _ in 0..concurrency.max(1) {
                let queue = Arc::clone(&queue);
                let results = Arc::clone(&results);
                scope.spawn(move || loop {
                    let item = { queue.lock().unwrap().pop() };
                    let Some((idx, invocation, profile, check)) = item else {
                        break;
                    };
                    let result = self.run(&invocation, profile, check);
                    results.lock().unwrap()[idx] = Some(result);
                });
            }
        });

        Arc::try_unwrap(results)
            .unwrap()
            .into_inner()
            .unwrap()
            .into_iter()
            .map(|r| r.expect("every index populated"))
            .collect()
    }
}

impl Default for PrivilegedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inv(argv: &[&str]) -> Invocation {
        Invocation {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            env: vec![],
            cwd: None,
            privileged: false,
        }
    }

    #[test]
    fn successful_command_no_retry() {
        let executor = PrivilegedExecutor::new();
        let result = executor
            .run(&inv(&["true"]), ExecProfile::default_profile(), true)
            .unwrap();
        assert!(result.success);
        assert_eq!(result.attempts.len(), 1);
    }

    #[test]
    fn failing_command_with_check_errors() {
        let executor = PrivilegedExecutor::new();
        let profile = ExecProfile {
            timeout: Duration::from_secs(5),
            retries: 0,
        };
        let result = executor.run(&inv(&["false"]), profile, true);
        assert!(result.is_err());
    }

    #[test]
    fn failing_command_without_check_returns_ok() {
        let executor = PrivilegedExecutor::new();
        let profile = ExecProfile {
            timeout: Duration::from_secs(5),
            retries: 0,
        };
        let result = executor.run(&inv(&["false"]), profile, false).unwrap();
        assert!(!result.success);
    }

    #[test]
    fn retries_recorded() {
        let executor = PrivilegedExecutor::new();
        let profile = ExecProfile {
            timeout: Duration::from_secs(5),
            retries: 2,
        };
        let result = executor.run(&inv(&["false"]), profile, false).unwrap();
        assert_eq!(result.attempts.len(), 3);
    }
}
