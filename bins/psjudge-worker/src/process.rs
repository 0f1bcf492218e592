/// Process backend - toolchains run as local subprocesses
///
/// **Safety Guarantees:**
/// - Hard wall-clock timeout per step; on expiry the whole process group is
///   killed, including forked children still holding the step's output
/// - Bounded output capture: at most `max_output_bytes` per stream are kept,
///   the rest is drained and dropped
/// - Optional `prlimit` wrapper for run steps (files, processes, CPU, memory)
use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use psjudge_common::languages::LanguageConfig;
use std::io::ErrorKind;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::evaluator::TestExecutionOutput;
use crate::toolchain::{render_command, CompileOutcome, Program, Toolchain};

const EXECUTABLE_NAME: &str = "solution";
const TRUNCATION_MARKER: &str = "\n[output truncated]";

#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub success: bool,
    pub timed_out: bool,
    pub truncated: bool,
    pub elapsed: Duration,
}

/// Keep the first `cap` bytes, drain the rest so the writer never blocks.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        kept.extend_from_slice(&buf[..n.min(room)]);
        if n > room {
            truncated = true;
        }
    }
    Ok((kept, truncated))
}

/// Only called while the group is known to exist: either the leader is not
/// reaped yet or a member still holds one of our pipes. Once the group is
/// gone its id can be reused by an unrelated process group.
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // ESRCH just means the group is already gone
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

/// Run one command to completion or until `limit` expires.
pub async fn run_command(
    argv: &[String],
    cwd: &Path,
    stdin_data: Option<&str>,
    limit: Duration,
    max_output_bytes: usize,
) -> Result<CommandOutput> {
    let (program, args) = argv.split_first().context("Empty command")?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", program))?;
    let pid = child.id();

    let stdin = child.stdin.take();
    let stdout = child.stdout.take().context("Child stdout not captured")?;
    let stderr = child.stderr.take().context("Child stderr not captured")?;
    let input = stdin_data.map(|s| s.as_bytes().to_vec());

    let feed = async move {
        if let (Some(mut pipe), Some(data)) = (stdin, input) {
            match pipe.write_all(&data).await {
                // The program is allowed to exit without reading its input
                Err(e) if e.kind() != ErrorKind::BrokenPipe => return Err(e),
                _ => {}
            }
        }
        Ok(())
    };

    let io = async {
        let (fed, out, err, status) = tokio::join!(
            feed,
            read_capped(stdout, max_output_bytes),
            read_capped(stderr, max_output_bytes),
            child.wait()
        );
        fed?;
        Ok::<_, std::io::Error>((out?, err?, status?))
    };
    let result = timeout(limit, io).await;

    match result {
        Ok(io_result) => {
            let ((out, out_truncated), (err, err_truncated), status) =
                io_result.with_context(|| format!("I/O error while running '{}'", program))?;
            let exit_code = status
                .code()
                .map(i64::from)
                .or_else(|| status.signal().map(|sig| 128 + i64::from(sig)));
            Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
                exit_code,
                success: status.success(),
                timed_out: false,
                truncated: out_truncated || err_truncated,
                elapsed: start.elapsed(),
            })
        }
        Err(_) => {
            kill_group(pid);
            if let Err(e) = child.kill().await {
                warn!(error = %e, command = %program, "Failed to reap timed-out process");
            }
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
                success: false,
                timed_out: true,
                truncated: false,
                elapsed: start.elapsed(),
            })
        }
    }
}

/// Toolchain driven by a `languages.json` entry with `"backend": "process"`
pub struct ProcessToolchain {
    config: LanguageConfig,
}

impl ProcessToolchain {
    pub fn new(config: LanguageConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Toolchain for ProcessToolchain {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[tracing::instrument(skip(self, source), fields(language = %self.config.name))]
    async fn compile(&self, source: &str, workdir: &Path) -> Result<CompileOutcome> {
        let source_path = workdir.join(&self.config.source_file);
        tokio::fs::write(&source_path, source)
            .await
            .with_context(|| format!("Failed to write {}", source_path.display()))?;

        let source_arg = source_path.display().to_string();
        let exe_arg = workdir.join(EXECUTABLE_NAME).display().to_string();
        let dir_arg = workdir.display().to_string();

        let mut run_argv = render_command(&self.config.run, &source_arg, &exe_arg, &dir_arg);
        if self.config.use_prlimit {
            let mut wrapped = vec!["prlimit".to_string()];
            wrapped.extend(self.config.limits.prlimit_args());
            wrapped.push("--".to_string());
            wrapped.append(&mut run_argv);
            run_argv = wrapped;
        }
        let program = ProcessProgram {
            argv: run_argv,
            workdir: workdir.to_path_buf(),
            timeout: Duration::from_millis(self.config.run_timeout_ms),
            max_output_bytes: self.config.max_output_bytes,
        };

        let Some(template) = &self.config.compile else {
            return Ok(CompileOutcome::succeeded(String::new(), Box::new(program)));
        };

        let argv = render_command(template, &source_arg, &exe_arg, &dir_arg);
        let output = run_command(
            &argv,
            workdir,
            None,
            Duration::from_millis(self.config.compile_timeout_ms),
            self.config.max_output_bytes,
        )
        .await?;

        let mut log = output.stdout;
        log.push_str(&output.stderr);
        if output.truncated {
            log.push_str(TRUNCATION_MARKER);
        }

        debug!(
            elapsed_ms = output.elapsed.as_millis() as u64,
            exit_code = ?output.exit_code,
            timed_out = output.timed_out,
            "Compiler finished"
        );

        if output.timed_out {
            log.push_str(&format!(
                "\n[compilation timed out after {} ms]",
                self.config.compile_timeout_ms
            ));
            return Ok(CompileOutcome::failed(log, true));
        }
        if !output.success {
            return Ok(CompileOutcome::failed(log, false));
        }
        Ok(CompileOutcome::succeeded(log, Box::new(program)))
    }
}

struct ProcessProgram {
    argv: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    max_output_bytes: usize,
}

#[async_trait]
impl Program for ProcessProgram {
    async fn run(&self, input: &str) -> Result<TestExecutionOutput> {
        let output = run_command(
            &self.argv,
            &self.workdir,
            Some(input),
            self.timeout,
            self.max_output_bytes,
        )
        .await?;

        Ok(TestExecutionOutput {
            runtime_error: !output.success && !output.timed_out,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            execution_time_ms: output.elapsed.as_millis() as u64,
            timed_out: output.timed_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psjudge_common::languages::LanguagesFile;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("psjudge-process-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sh_toolchain(run_timeout_ms: u64) -> ProcessToolchain {
        let file: LanguagesFile = serde_json::from_str(&format!(
            r#"{{"languages": [{{
                "name": "sh",
                "source_file": "main.sh",
                "compile": ["sh", "-n", "{{source}}"],
                "run": ["sh", "{{source}}"],
                "run_timeout_ms": {}
            }}]}}"#,
            run_timeout_ms
        ))
        .unwrap();
        ProcessToolchain::new(file.languages[0].clone())
    }

    #[tokio::test]
    async fn test_run_command_feeds_stdin() {
        let dir = scratch_dir();
        let out = run_command(&argv(&["cat"]), &dir, Some("hello\n"), Duration::from_secs(5), 1024)
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_run_command_timeout_kills_process_group() {
        let dir = scratch_dir();
        let start = Instant::now();
        let out = run_command(
            &argv(&["sh", "-c", "sleep 30 & sleep 30"]),
            &dir,
            None,
            Duration::from_millis(200),
            1024,
        )
        .await
        .unwrap();
        assert!(out.timed_out);
        assert!(!out.success);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    fn read_pid(dir: &Path) -> i32 {
        std::fs::read_to_string(dir.join("pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    }

    /// Live and not a zombie waiting to be reaped.
    fn is_alive(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !stat
                .rsplit_once(") ")
                .is_some_and(|(_, rest)| rest.starts_with('Z') || rest.starts_with('X')),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_background_child_holding_output() {
        let dir = scratch_dir();
        let out = run_command(
            &argv(&["sh", "-c", "sleep 30 & echo $! > pid; echo done"]),
            &dir,
            None,
            Duration::from_millis(300),
            1024,
        )
        .await
        .unwrap();
        assert!(out.timed_out);

        let child = read_pid(&dir);
        let mut alive = true;
        for _ in 0..40 {
            alive = is_alive(child);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive, "background child {} survived the timeout", child);
    }

    #[tokio::test]
    async fn test_finished_command_does_not_signal_its_group() {
        let dir = scratch_dir();
        let out = run_command(
            &argv(&["sh", "-c", "sleep 30 >/dev/null 2>&1 & echo $! > pid"]),
            &dir,
            None,
            Duration::from_secs(5),
            1024,
        )
        .await
        .unwrap();
        assert!(out.success);

        let child = read_pid(&dir);
        assert!(is_alive(child));
        let _ = nix::sys::signal::kill(Pid::from_raw(child), Signal::SIGKILL);
    }

    #[tokio::test]
    async fn test_run_command_caps_output() {
        let dir = scratch_dir();
        let out = run_command(
            &argv(&["sh", "-c", "yes | head -c 100000"]),
            &dir,
            None,
            Duration::from_secs(5),
            100,
        )
        .await
        .unwrap();
        assert!(out.success);
        assert!(out.truncated);
        assert_eq!(out.stdout.len(), 100);
    }

    #[tokio::test]
    async fn test_program_ignoring_stdin() {
        let dir = scratch_dir();
        let big_input = "x".repeat(1 << 20);
        let out = run_command(&argv(&["true"]), &dir, Some(&big_input), Duration::from_secs(5), 1024)
            .await
            .unwrap();
        assert!(out.success);
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let dir = scratch_dir();
        let out = run_command(&argv(&["sh", "-c", "exit 3"]), &dir, None, Duration::from_secs(5), 1024)
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let dir = scratch_dir();
        let result = run_command(
            &argv(&["/nonexistent/compiler"]),
            &dir,
            None,
            Duration::from_secs(1),
            1024,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_compile_and_run_sh() {
        let dir = scratch_dir();
        let toolchain = sh_toolchain(2000);
        let outcome = toolchain
            .compile("read a; read b; echo $((a+b))", &dir)
            .await
            .unwrap();
        assert!(outcome.success);

        let program = outcome.program.unwrap();
        let output = program.run("1\n2\n").await.unwrap();
        assert_eq!(output.stdout, "3\n");
        assert!(!output.runtime_error);
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn test_compile_failure_keeps_log() {
        let dir = scratch_dir();
        let toolchain = sh_toolchain(2000);
        let outcome = toolchain.compile("if true; then", &dir).await.unwrap();
        assert!(!outcome.success);
        assert!(!outcome.timed_out);
        assert!(!outcome.log.is_empty());
        assert!(outcome.program.is_none());
    }

    #[tokio::test]
    async fn test_runtime_error_detected() {
        let dir = scratch_dir();
        let toolchain = sh_toolchain(2000);
        let program = toolchain.compile("exit 1", &dir).await.unwrap().program.unwrap();
        let output = program.run("").await.unwrap();
        assert!(output.runtime_error);
        assert_eq!(output.exit_code, Some(1));
    }
}
