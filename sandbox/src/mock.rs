//! Inert scripted driver for tests: emits a fixed log script, exits with a
//! fixed code, and honours stop requests the way a forced kill would.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{LogSink, SandboxConfig, SandboxDriver, SandboxError, SandboxExit, SandboxResult};

/// Exit code reported when a scripted sandbox is stopped before finishing,
/// mirroring a SIGKILLed process.
pub const KILLED_EXIT_CODE: i64 = 137;

/// What a scripted sandbox does when run.
#[derive(Debug, Clone)]
pub struct MockScript {
    pub log_lines: Vec<String>,
    pub exit_code: i64,
    /// Exit codes consumed in order by the first waits, before `exit_code`
    /// takes over. Lets tests script a failure followed by a clean retry.
    pub first_exit_codes: Vec<i64>,
    /// Pause before each emitted line
    pub line_delay: Duration,
    /// Extra time the sandbox keeps running after its last line
    pub hold: Duration,
    pub stderr: String,
    pub fail_create: bool,
    pub fail_start: bool,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            log_lines: vec![
                "Creating triggers...".to_string(),
                "Copying approximately 1000 rows".to_string(),
                "Copied 750/1000 rows (75%)".to_string(),
                "Current copy rate: 5420 rows/sec".to_string(),
                "Successfully altered the table".to_string(),
            ],
            exit_code: 0,
            first_exit_codes: Vec::new(),
            line_delay: Duration::from_millis(5),
            hold: Duration::ZERO,
            stderr: String::new(),
            fail_create: false,
            fail_start: false,
        }
    }
}

struct MockSandbox {
    config: SandboxConfig,
    stop_tx: watch::Sender<bool>,
}

/// Scripted in-memory sandbox driver.
pub struct MockDriver {
    script: MockScript,
    sandboxes: Mutex<HashMap<String, MockSandbox>>,
    removed: Mutex<Vec<String>>,
    counter: AtomicU64,
    wait_seq: AtomicU64,
}

impl MockDriver {
    pub fn new(script: MockScript) -> Self {
        Self {
            script,
            sandboxes: Mutex::new(HashMap::new()),
            removed: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
            wait_seq: AtomicU64::new(0),
        }
    }

    /// Whether an instance is still present (created and not removed).
    pub fn contains(&self, id: &str) -> bool {
        self.sandboxes.lock().unwrap().contains_key(id)
    }

    /// Ids that have been removed, in removal order.
    pub fn removed_ids(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    /// The environment a given instance was created with.
    pub fn env_of(&self, id: &str) -> Option<HashMap<String, String>> {
        self.sandboxes
            .lock()
            .unwrap()
            .get(id)
            .map(|sandbox| sandbox.config.env.clone())
    }

    /// The command a given instance was created with.
    pub fn command_of(&self, id: &str) -> Option<String> {
        self.sandboxes
            .lock()
            .unwrap()
            .get(id)
            .map(|sandbox| sandbox.config.command.clone())
    }

    fn stop_rx(&self, id: &str) -> SandboxResult<watch::Receiver<bool>> {
        self.sandboxes
            .lock()
            .unwrap()
            .get(id)
            .map(|sandbox| sandbox.stop_tx.subscribe())
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))
    }

    fn run_time(&self) -> Duration {
        self.script.line_delay * self.script.log_lines.len() as u32 + self.script.hold
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new(MockScript::default())
    }
}

#[async_trait]
impl SandboxDriver for MockDriver {
    async fn create(&self, config: &SandboxConfig) -> SandboxResult<String> {
        if self.script.fail_create {
            return Err(SandboxError::Cli {
                command: "mock create".to_string(),
                stderr: "scripted create failure".to_string(),
            });
        }
        let id = format!("mock-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        let (stop_tx, _) = watch::channel(false);
        self.sandboxes.lock().unwrap().insert(
            id.clone(),
            MockSandbox {
                config: config.clone(),
                stop_tx,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> SandboxResult<()> {
        if self.script.fail_start {
            return Err(SandboxError::Cli {
                command: "mock start".to_string(),
                stderr: "scripted start failure".to_string(),
            });
        }
        if !self.sandboxes.lock().unwrap().contains_key(id) {
            return Err(SandboxError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn stop(&self, id: &str, _grace: Duration) -> SandboxResult<()> {
        let sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = sandboxes
            .get(id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
        sandbox.stop_tx.send_replace(true);
        Ok(())
    }

    async fn wait(&self, id: &str) -> SandboxResult<SandboxExit> {
        let mut stop_rx = self.stop_rx(id)?;
        let started_at = Instant::now();

        let stopped = if *stop_rx.borrow() {
            true
        } else {
            tokio::select! {
                _ = tokio::time::sleep(self.run_time()) => false,
                result = stop_rx.wait_for(|stopped| *stopped) => result.is_ok(),
            }
        };

        let attempt = self.wait_seq.fetch_add(1, Ordering::SeqCst) as usize;
        let scripted_code = self
            .script
            .first_exit_codes
            .get(attempt)
            .copied()
            .unwrap_or(self.script.exit_code);
        let exit_code = if stopped { KILLED_EXIT_CODE } else { scripted_code };
        let mut output = self.script.log_lines.join("\n");
        if !output.is_empty() {
            output.push('\n');
        }
        if !self.script.stderr.is_empty() {
            output.push_str(&self.script.stderr);
            output.push('\n');
        }
        Ok(SandboxExit {
            exit_code,
            output,
            error: self.script.stderr.clone(),
            duration: started_at.elapsed(),
        })
    }

    async fn stream_logs(&self, id: &str, sink: LogSink) -> SandboxResult<()> {
        let stop_rx = self.stop_rx(id)?;
        let lines = self.script.log_lines.clone();
        let delay = self.script.line_delay;
        tokio::spawn(async move {
            for line in lines {
                tokio::time::sleep(delay).await;
                if *stop_rx.borrow() {
                    break;
                }
                sink(line);
            }
        });
        Ok(())
    }

    async fn remove(&self, id: &str, _force: bool) -> SandboxResult<()> {
        let existed = self.sandboxes.lock().unwrap().remove(id).is_some();
        if !existed {
            return Err(SandboxError::NotFound(id.to_string()));
        }
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn scripted_run_streams_lines_and_exits() {
        let driver = MockDriver::default();
        let id = driver.create(&SandboxConfig::default()).await.unwrap();
        driver.start(&id).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_sink = seen.clone();
        driver
            .stream_logs(
                &id,
                Arc::new(move |line| seen_in_sink.lock().unwrap().push(line)),
            )
            .await
            .unwrap();

        let exit = driver.wait(&id).await.unwrap();
        assert_eq!(exit.exit_code, 0);
        assert!(exit.output.contains("(75%)"));
        // Give the follower a beat to drain.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), 5);

        driver.remove(&id, false).await.unwrap();
        assert!(!driver.contains(&id));
        assert_eq!(driver.removed_ids(), vec![id]);
    }

    #[tokio::test]
    async fn stop_forces_a_killed_exit() {
        let script = MockScript {
            hold: Duration::from_secs(60),
            ..Default::default()
        };
        let driver = Arc::new(MockDriver::new(script));
        let id = driver.create(&SandboxConfig::default()).await.unwrap();
        driver.start(&id).await.unwrap();

        let waiter = {
            let driver = driver.clone();
            let id = id.clone();
            tokio::spawn(async move { driver.wait(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        driver.stop(&id, Duration::from_secs(10)).await.unwrap();

        let exit = waiter.await.unwrap().unwrap();
        assert_eq!(exit.exit_code, KILLED_EXIT_CODE);
    }

    #[tokio::test]
    async fn scripted_failures_surface_as_cli_errors() {
        let driver = MockDriver::new(MockScript {
            fail_create: true,
            ..Default::default()
        });
        assert!(matches!(
            driver.create(&SandboxConfig::default()).await,
            Err(SandboxError::Cli { .. })
        ));
    }
}
