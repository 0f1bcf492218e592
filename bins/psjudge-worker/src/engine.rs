/// Docker backend - compile once per job in a throwaway container
///
/// **Docker Execution Rules:**
/// 1. Pulls the language image if not present
/// 2. Creates one container per job with security constraints:
///    - Network disabled
///    - CPU/memory/pid limits enforced
/// 3. Writes the source through an exec's stdin
/// 4. Compiles once, then runs one exec per test case
/// 5. Measures execution time and enforces timeouts
/// 6. Removes the container when the program handle is dropped
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use psjudge_common::languages::LanguageConfig;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::evaluator::TestExecutionOutput;
use crate::toolchain::{render_command, CompileOutcome, Program, Toolchain};

const CODE_DIR: &str = "/code";
const EXECUTABLE_PATH: &str = "/code/solution";
/// Extra wall-clock time granted to the exec around the in-container `timeout`
const EXEC_GRACE: Duration = Duration::from_secs(2);

/// Container cleanup guard - guarantees container removal on drop
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        // Cannot be async in Drop; best effort on the current runtime
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container_id = %self.container_id, "No runtime to remove container");
            return;
        };
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        handle.spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to remove container");
            }
        });
    }
}

struct ExecOutput {
    stdout: String,
    stderr: String,
    exit_code: Option<i64>,
    truncated: bool,
}

fn push_capped(buf: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    let room = cap.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    chunk.len() > room
}

/// Run `cmd` in the container, optionally feeding `stdin`, and collect its
/// output up to `cap` bytes per stream.
async fn exec_in_container(
    docker: &Docker,
    container_id: &str,
    cmd: Vec<String>,
    stdin: Option<&[u8]>,
    cap: usize,
) -> Result<ExecOutput> {
    let exec = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                cmd: Some(cmd),
                attach_stdin: Some(stdin.is_some()),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                working_dir: Some(CODE_DIR.to_string()),
                ..Default::default()
            },
        )
        .await
        .context("Failed to create exec")?;

    let started = docker
        .start_exec(
            &exec.id,
            Some(StartExecOptions {
                detach: false,
                ..Default::default()
            }),
        )
        .await
        .context("Failed to start exec")?;

    let StartExecResults::Attached { mut output, mut input } = started else {
        bail!("Exec did not attach");
    };

    let feed = async {
        if let Some(data) = stdin {
            if let Err(e) = input.write_all(data).await {
                debug!(error = %e, "Exec closed stdin early");
            }
            let _ = input.shutdown().await;
        }
    };

    let collect = async {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut truncated = false;
        while let Some(msg) = output.next().await {
            match msg? {
                LogOutput::StdOut { message } => truncated |= push_capped(&mut stdout, &message, cap),
                LogOutput::StdErr { message } => truncated |= push_capped(&mut stderr, &message, cap),
                _ => {}
            }
        }
        Ok::<_, bollard::errors::Error>((stdout, stderr, truncated))
    };

    let ((), collected) = tokio::join!(feed, collect);
    let (stdout, stderr, truncated) = collected.context("Failed to read exec output")?;

    let inspect = docker
        .inspect_exec(&exec.id)
        .await
        .context("Failed to inspect exec")?;

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: inspect.exit_code,
        truncated,
    })
}

/// Toolchain driven by a `languages.json` entry with `"backend": "docker"`
pub struct DockerToolchain {
    docker: Docker,
    config: LanguageConfig,
}

impl DockerToolchain {
    pub fn connect() -> Result<Docker> {
        Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")
    }

    pub fn new(docker: Docker, config: LanguageConfig) -> Self {
        Self { docker, config }
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    async fn start_container(&self, image: &str) -> Result<ContainerGuard> {
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            entrypoint: Some(vec![]),
            network_disabled: Some(true),
            working_dir: Some(CODE_DIR.to_string()),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(i64::from(self.config.memory_limit_mb) * 1024 * 1024),
                nano_cpus: Some((f64::from(self.config.cpu_limit) * 1_000_000_000.0) as i64),
                pids_limit: Some(i64::from(self.config.limits.processes)),
                ..Default::default()
            }),
            ..Default::default()
        };

        let name = format!("psjudge-{}", uuid::Uuid::new_v4());
        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .context("Failed to create Docker container")?;

        // Guard first, so a failed start still removes the container
        let guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container.id,
        };

        self.docker
            .start_container(&guard.container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        Ok(guard)
    }
}

#[async_trait]
impl Toolchain for DockerToolchain {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[tracing::instrument(skip(self, source, _workdir), fields(language = %self.config.name))]
    async fn compile(&self, source: &str, _workdir: &Path) -> Result<CompileOutcome> {
        let image = self
            .config
            .image
            .as_deref()
            .context("Docker toolchain has no image")?;
        self.ensure_image(image).await?;

        let guard = self.start_container(image).await?;
        let source_path = format!("{}/{}", CODE_DIR, self.config.source_file);

        let write = exec_in_container(
            &self.docker,
            &guard.container_id,
            vec!["sh".to_string(), "-c".to_string(), format!("cat > '{}'", source_path)],
            Some(source.as_bytes()),
            self.config.max_output_bytes,
        )
        .await?;
        if write.exit_code != Some(0) {
            bail!("Failed to write source into container: {}", write.stderr);
        }

        let run_argv = render_command(&self.config.run, &source_path, EXECUTABLE_PATH, CODE_DIR);
        let program = DockerProgram {
            docker: self.docker.clone(),
            argv: run_argv,
            timeout: Duration::from_millis(self.config.run_timeout_ms),
            max_output_bytes: self.config.max_output_bytes,
            guard,
        };

        let Some(template) = &self.config.compile else {
            return Ok(CompileOutcome::succeeded(String::new(), Box::new(program)));
        };

        let argv = render_command(template, &source_path, EXECUTABLE_PATH, CODE_DIR);
        let limit = Duration::from_millis(self.config.compile_timeout_ms);
        let start = Instant::now();
        let result = tokio::time::timeout(
            limit,
            exec_in_container(
                &self.docker,
                &program.guard.container_id,
                argv,
                None,
                self.config.max_output_bytes,
            ),
        )
        .await;

        let output = match result {
            Ok(output) => output?,
            Err(_) => {
                let log = format!(
                    "[compilation timed out after {} ms]",
                    self.config.compile_timeout_ms
                );
                return Ok(CompileOutcome::failed(log, true));
            }
        };

        let mut log = output.stdout;
        log.push_str(&output.stderr);
        if output.truncated {
            log.push_str("\n[output truncated]");
        }

        let compilation_time_ms = start.elapsed().as_millis() as u64;
        if output.exit_code != Some(0) {
            warn!(
                compilation_time_ms,
                exit_code = ?output.exit_code,
                error_preview = log.lines().next().unwrap_or(""),
                "Compilation failed"
            );
            return Ok(CompileOutcome::failed(log, false));
        }

        info!(compilation_time_ms, "Compilation succeeded");
        Ok(CompileOutcome::succeeded(log, Box::new(program)))
    }
}

/// Compiled artifact inside a running container. Dropping it removes the
/// container.
struct DockerProgram {
    docker: Docker,
    argv: Vec<String>,
    timeout: Duration,
    max_output_bytes: usize,
    guard: ContainerGuard,
}

impl DockerProgram {
    /// `timeout -s KILL` bounds the program even if the exec stream hangs.
    fn command(&self) -> Vec<String> {
        let secs = self.timeout.as_millis().div_ceil(1000).max(1);
        let mut cmd = vec![
            "timeout".to_string(),
            "-s".to_string(),
            "KILL".to_string(),
            secs.to_string(),
        ];
        cmd.extend(self.argv.iter().cloned());
        cmd
    }
}

#[async_trait]
impl Program for DockerProgram {
    async fn run(&self, input: &str) -> Result<TestExecutionOutput> {
        let start = Instant::now();
        let result = tokio::time::timeout(
            self.timeout + EXEC_GRACE,
            exec_in_container(
                &self.docker,
                &self.guard.container_id,
                self.command(),
                Some(input.as_bytes()),
                self.max_output_bytes,
            ),
        )
        .await;
        let elapsed = start.elapsed();

        let output = match result {
            Ok(output) => output?,
            Err(_) => {
                return Ok(TestExecutionOutput {
                    stderr: "[Execution timed out]".to_string(),
                    execution_time_ms: elapsed.as_millis() as u64,
                    timed_out: true,
                    ..Default::default()
                });
            }
        };

        // 124 from `timeout`, 137 when it had to SIGKILL
        let timed_out =
            elapsed >= self.timeout && matches!(output.exit_code, Some(124) | Some(137));
        let mut stderr = output.stderr;
        if output.exit_code == Some(137) && !timed_out {
            stderr.push_str("\n[Container killed: likely OOM or exceeded memory limit]");
        } else if output.exit_code == Some(139) {
            stderr.push_str("\n[Container killed: segmentation fault]");
        }

        Ok(TestExecutionOutput {
            runtime_error: !timed_out && output.exit_code != Some(0),
            stdout: output.stdout,
            stderr,
            exit_code: output.exit_code,
            execution_time_ms: elapsed.as_millis() as u64,
            timed_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psjudge_common::languages::LanguagesFile;

    fn python_config() -> LanguageConfig {
        let file: LanguagesFile = serde_json::from_str(
            r#"{"languages": [{
                "name": "python",
                "source_file": "main.py",
                "backend": "docker",
                "image": "python:3.12-slim",
                "compile": ["python3", "-m", "py_compile", "{source}"],
                "run": ["python3", "-u", "{source}"],
                "run_timeout_ms": 2000
            }]}"#,
        )
        .unwrap();
        file.languages[0].clone()
    }

    #[test]
    fn test_push_capped() {
        let mut buf = Vec::new();
        assert!(!push_capped(&mut buf, b"abc", 5));
        assert!(push_capped(&mut buf, b"defg", 5));
        assert_eq!(buf, b"abcde");
        assert!(push_capped(&mut buf, b"h", 5));
        assert_eq!(buf.len(), 5);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_docker_compile_once_python() {
        let docker = DockerToolchain::connect().expect("Failed to connect to Docker");
        let toolchain = DockerToolchain::new(docker, python_config());

        let outcome = toolchain
            .compile("a = int(input())\nb = int(input())\nprint(a + b)\n", Path::new("/unused"))
            .await
            .expect("compile should not be an infrastructure error");
        assert!(outcome.success, "build log: {}", outcome.log);

        let program = outcome.program.unwrap();
        for (input, expected) in [("1\n2\n", "3\n"), ("10\n20\n", "30\n")] {
            let output = program.run(input).await.unwrap();
            assert_eq!(output.stdout, expected);
            assert!(!output.runtime_error);
        }
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_docker_timeout() {
        let docker = DockerToolchain::connect().expect("Failed to connect to Docker");
        let toolchain = DockerToolchain::new(docker, python_config());

        let outcome = toolchain
            .compile("while True:\n    pass\n", Path::new("/unused"))
            .await
            .unwrap();
        let output = outcome.program.unwrap().run("").await.unwrap();
        assert!(output.timed_out);
    }
}
