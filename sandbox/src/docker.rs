//! The real sandbox backend: shells out to the docker CLI and runs the tool
//! inside `percona/percona-toolkit`.
//!
//! Secrets are never placed on a docker command line. Environment variables
//! are forwarded with name-only `-e KEY` flags while the values are set on
//! the CLI process itself, so the daemon picks them up without them showing
//! in the process list.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::{debug, warn};

use crate::{LogSink, SandboxConfig, SandboxDriver, SandboxError, SandboxExit, SandboxResult};

pub const DEFAULT_IMAGE: &str = "percona/percona-toolkit:latest";

pub struct DockerCliDriver {
    docker_bin: String,
    image: String,
    /// Start instants per container, for exit durations.
    started: Mutex<HashMap<String, Instant>>,
}

impl Default for DockerCliDriver {
    fn default() -> Self {
        Self::new("docker", DEFAULT_IMAGE)
    }
}

impl DockerCliDriver {
    pub fn new(docker_bin: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            image: image.into(),
            started: Mutex::new(HashMap::new()),
        }
    }

    /// Run one docker subcommand to completion, with extra environment set on
    /// the CLI process.
    async fn run(
        &self,
        args: &[&str],
        env: &HashMap<String, String>,
    ) -> SandboxResult<std::process::Output> {
        let mut command = Command::new(&self.docker_bin);
        command.args(args);
        for (key, value) in env {
            command.env(key, value);
        }
        let output = command.output().await?;
        if !output.status.success() {
            return Err(SandboxError::Cli {
                command: format!("{} {}", self.docker_bin, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl SandboxDriver for DockerCliDriver {
    async fn create(&self, config: &SandboxConfig) -> SandboxResult<String> {
        let cpus = format!("{}", config.cpu_limit);
        let memory = format!("{}", config.memory_bytes);
        let mut args: Vec<&str> = vec![
            "create",
            "--cpus",
            &cpus,
            "--memory",
            &memory,
            "--network",
            &config.network_mode,
            "--workdir",
            &config.working_dir,
        ];
        let env_flags: Vec<String> = config.env.keys().map(|key| format!("-e{key}")).collect();
        for flag in &env_flags {
            args.push(flag);
        }
        args.extend([self.image.as_str(), "sh", "-lc", &config.command]);

        let output = self.run(&args, &config.env).await?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(SandboxError::Malformed(
                "docker create returned no container id".to_string(),
            ));
        }
        debug!(sandbox_id = %id, "created sandbox");
        Ok(id)
    }

    async fn start(&self, id: &str) -> SandboxResult<()> {
        self.run(&["start", id], &HashMap::new()).await?;
        self.started
            .lock()
            .unwrap()
            .insert(id.to_string(), Instant::now());
        Ok(())
    }

    async fn stop(&self, id: &str, grace: Duration) -> SandboxResult<()> {
        let timeout = grace.as_secs().to_string();
        self.run(&["stop", "-t", &timeout, id], &HashMap::new())
            .await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> SandboxResult<SandboxExit> {
        let output = self.run(&["wait", id], &HashMap::new()).await?;
        let exit_code: i64 = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|_| {
                SandboxError::Malformed(format!(
                    "docker wait returned a non-numeric exit status for {id}"
                ))
            })?;

        let logs = self.run(&["logs", id], &HashMap::new()).await?;
        let stdout = String::from_utf8_lossy(&logs.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&logs.stderr).into_owned();

        let duration = self
            .started
            .lock()
            .unwrap()
            .remove(id)
            .map(|start| start.elapsed())
            .unwrap_or_default();

        Ok(SandboxExit {
            exit_code,
            output: format!("{stdout}{stderr}"),
            error: stderr,
            duration,
        })
    }

    async fn stream_logs(&self, id: &str, sink: LogSink) -> SandboxResult<()> {
        let mut child = Command::new(&self.docker_bin)
            .args(["logs", "-f", id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            SandboxError::Malformed("docker logs follower has no stdout".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            SandboxError::Malformed("docker logs follower has no stderr".to_string())
        })?;

        let sink_out = sink.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink_out(line);
            }
        });
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink(line);
            }
        });
        // Reap the follower once the container exits.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> SandboxResult<()> {
        let result = if force {
            self.run(&["rm", "-f", id], &HashMap::new()).await
        } else {
            self.run(&["rm", id], &HashMap::new()).await
        };
        self.started.lock().unwrap().remove(id);
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(sandbox_id = %id, %err, "failed to remove sandbox");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The docker paths are exercised end to end against a real daemon; here
    // we only pin down the failure shape when the binary is absent.
    #[tokio::test]
    async fn missing_docker_binary_is_an_io_error() {
        let driver = DockerCliDriver::new("definitely-not-docker-bin", DEFAULT_IMAGE);
        let err = driver
            .start("whatever")
            .await
            .expect_err("binary does not exist");
        assert!(matches!(err, SandboxError::Io(_)));
    }
}
