//! Container engine — Docker CLI driver behind a trait seam
//!
//! Every engine call is fallible I/O: wrapped in an explicit timeout and a
//! bounded retry-with-backoff. The `ContainerEngine` trait exists so the
//! pool and gateway can be exercised against a mock.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{EngineConfig, ResourceLimits};
use crate::error::SandboxError;

/// Captured result of a command executed inside a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Point-in-time resource metrics for one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub pids: u64,
}

/// Everything needed to start a container.
#[derive(Debug, Clone)]
pub struct StartSpec {
    pub name: String,
    pub image: String,
    /// Engine network to join; None means no network at all.
    pub network: Option<String>,
    pub command: Vec<String>,
    pub limits: ResourceLimits,
}

/// The container runtime boundary.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn ping(&self) -> Result<(), SandboxError>;
    async fn start(&self, spec: &StartSpec) -> Result<(), SandboxError>;
    async fn stop(&self, name: &str) -> Result<(), SandboxError>;
    async fn remove(&self, name: &str) -> Result<(), SandboxError>;
    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        timeout: Duration,
        max_output_bytes: usize,
    ) -> Result<ExecOutput, SandboxError>;
    async fn is_running(&self, name: &str) -> Result<bool, SandboxError>;
    async fn stats(&self, name: &str) -> Result<ResourceUsage, SandboxError>;
    async fn commit(&self, name: &str, image: &str) -> Result<(), SandboxError>;
    async fn network_create(
        &self,
        name: &str,
        cidr: &str,
        internal: bool,
    ) -> Result<(), SandboxError>;
    async fn network_exists(&self, name: &str) -> Result<bool, SandboxError>;
}

/// Shell wrapper around an exec'd command. The child's PID lands in a
/// file inside the container so a timeout kill hits exactly this
/// execution, not every process with the same name in a shared container.
const EXEC_WRAPPER: &str =
    r#""$@" & pid=$!; echo "$pid" > "$0"; wait "$pid"; status=$?; rm -f "$0"; exit "$status""#;

fn exec_args(name: &str, pid_file: &str, argv: &[String]) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        name.to_string(),
        "sh".to_string(),
        "-c".to_string(),
        EXEC_WRAPPER.to_string(),
        pid_file.to_string(),
    ];
    args.extend(argv.iter().cloned());
    args
}

/// Docker CLI implementation.
pub struct DockerEngine {
    binary: String,
    call_timeout: Duration,
    retries: u32,
}

impl DockerEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            retries: config.call_retries,
        }
    }

    /// Run one docker CLI call with timeout and retry-with-backoff.
    /// Retries cover spawn failures and call timeouts; a docker-level
    /// failure (non-zero exit) is returned to the caller to interpret.
    async fn cli(&self, args: &[&str]) -> Result<std::process::Output, SandboxError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let call = Command::new(&self.binary).args(args).output();
            match tokio::time::timeout(self.call_timeout, call).await {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(e)) if attempt > self.retries => {
                    return Err(SandboxError::EngineUnavailable(format!(
                        "failed to invoke {}: {}",
                        self.binary, e
                    )));
                }
                Err(_) if attempt > self.retries => {
                    return Err(SandboxError::EngineUnavailable(format!(
                        "{} {} timed out after {:?}",
                        self.binary,
                        args.first().copied().unwrap_or(""),
                        self.call_timeout
                    )));
                }
                Ok(Err(e)) => {
                    warn!("Engine call failed (attempt {}): {}", attempt, e);
                }
                Err(_) => {
                    warn!(
                        "Engine call timed out after {:?} (attempt {})",
                        self.call_timeout, attempt
                    );
                }
            }
            let backoff = Duration::from_millis(200 * 2u64.pow(attempt - 1));
            tokio::time::sleep(backoff).await;
        }
    }

    /// Run a call and require success, mapping failures to the taxonomy.
    async fn cli_ok(&self, args: &[&str]) -> Result<std::process::Output, SandboxError> {
        let output = self.cli(args).await?;
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("No such container") || stderr.contains("No such network") {
            Err(SandboxError::NotFound(stderr))
        } else {
            Err(SandboxError::EngineUnavailable(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().copied().unwrap_or(""),
                stderr
            )))
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), SandboxError> {
        self.cli_ok(&["info", "--format", "{{.ServerVersion}}"])
            .await
            .map(|_| ())
    }

    async fn start(&self, spec: &StartSpec) -> Result<(), SandboxError> {
        let memory = format!("{}m", spec.limits.memory_mb);
        let cpu_shares = spec.limits.cpu_shares.to_string();
        let pids = spec.limits.max_pids.to_string();
        let mut args: Vec<&str> = vec![
            "run", "-d", "--name", &spec.name,
            "--memory", &memory,
            "--cpu-shares", &cpu_shares,
            "--pids-limit", &pids,
            "--security-opt", "no-new-privileges",
            "--cap-drop", "ALL",
        ];
        let network = spec.network.as_deref().unwrap_or("none");
        args.push("--network");
        args.push(network);
        if spec.limits.read_only_root {
            args.push("--read-only");
            args.push("--tmpfs");
            args.push("/tmp:rw,noexec,nosuid,size=64m");
        }
        args.push(&spec.image);
        for part in &spec.command {
            args.push(part);
        }
        debug!("Engine: starting container '{}' from '{}'", spec.name, spec.image);
        self.cli_ok(&args).await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<(), SandboxError> {
        self.cli_ok(&["stop", "--time", "5", name]).await.map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<(), SandboxError> {
        self.cli_ok(&["rm", "-f", name]).await.map(|_| ())
    }

    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        timeout: Duration,
        max_output_bytes: usize,
    ) -> Result<ExecOutput, SandboxError> {
        let start = Instant::now();
        let pid_file = format!("/tmp/.rk-exec-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let mut cmd = Command::new(&self.binary);
        cmd.args(exec_args(name, &pid_file, argv)).kill_on_drop(true);

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                let mut stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let mut stderr = String::from_utf8_lossy(&output.stderr).to_string();
                if stdout.len() > max_output_bytes {
                    stdout.truncate(max_output_bytes);
                    stdout.push_str("\n... [output truncated]");
                }
                if stderr.len() > max_output_bytes {
                    stderr.truncate(max_output_bytes);
                    stderr.push_str("\n... [output truncated]");
                }
                Ok(ExecOutput {
                    stdout,
                    stderr,
                    exit_code: output.status.code().unwrap_or(-1),
                    timed_out: false,
                    duration_ms,
                })
            }
            Ok(Err(e)) => Err(SandboxError::EngineUnavailable(format!(
                "exec in '{}' failed: {}",
                name, e
            ))),
            Err(_) => {
                // The local child is killed on drop; the remote process must
                // die too, not merely detach.
                warn!(
                    "Exec in '{}' timed out after {:?}, killing remote process",
                    name, timeout
                );
                let kill = format!("kill -9 \"$(cat {0})\" 2>/dev/null; rm -f {0}", pid_file);
                let _ = self.cli(&["exec", name, "sh", "-c", &kill]).await;
                Ok(ExecOutput {
                    stdout: String::new(),
                    stderr: format!("execution timed out after {:?}", timeout),
                    exit_code: -1,
                    timed_out: true,
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
        }
    }

    async fn is_running(&self, name: &str) -> Result<bool, SandboxError> {
        let output = self
            .cli(&["inspect", "--format", "{{.State.Running}}", name])
            .await?;
        if !output.status.success() {
            // Missing container is simply not running.
            return Ok(false);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    async fn stats(&self, name: &str) -> Result<ResourceUsage, SandboxError> {
        let output = self
            .cli_ok(&["stats", "--no-stream", "--format", "{{json .}}", name])
            .await?;
        let raw = String::from_utf8_lossy(&output.stdout);
        let parsed: serde_json::Value = serde_json::from_str(raw.trim()).map_err(|e| {
            SandboxError::EngineUnavailable(format!("unparseable stats for '{}': {}", name, e))
        })?;
        Ok(ResourceUsage {
            cpu_percent: parse_percent(parsed["CPUPerc"].as_str().unwrap_or("0%")),
            memory_bytes: parse_mem_usage(parsed["MemUsage"].as_str().unwrap_or("0B / 0B")),
            pids: parsed["PIDs"]
                .as_str()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0),
        })
    }

    async fn commit(&self, name: &str, image: &str) -> Result<(), SandboxError> {
        debug!("Engine: committing '{}' to image '{}'", name, image);
        self.cli_ok(&["commit", name, image]).await.map(|_| ())
    }

    async fn network_create(
        &self,
        name: &str,
        cidr: &str,
        internal: bool,
    ) -> Result<(), SandboxError> {
        let mut args = vec!["network", "create", "--subnet", cidr];
        if internal {
            args.push("--internal");
        }
        args.push(name);
        self.cli_ok(&args).await.map(|_| ())
    }

    async fn network_exists(&self, name: &str) -> Result<bool, SandboxError> {
        let output = self.cli(&["network", "inspect", name]).await?;
        Ok(output.status.success())
    }
}

fn parse_percent(s: &str) -> f64 {
    s.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

/// Parse the used half of docker's "10.5MiB / 1GiB" memory column.
fn parse_mem_usage(s: &str) -> u64 {
    let used = s.split('/').next().unwrap_or("").trim();
    let split = used
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(used.len());
    let (value, unit) = used.split_at(split);
    let value: f64 = value.trim().parse().unwrap_or(0.0);
    let multiplier: f64 = match unit.trim() {
        "B" | "" => 1.0,
        "kB" | "KB" => 1e3,
        "KiB" => 1024.0,
        "MB" => 1e6,
        "MiB" => 1024.0 * 1024.0,
        "GB" => 1e9,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        other => {
            debug!("Unknown memory unit '{}'", other);
            1.0
        }
    };
    (value * multiplier) as u64
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! In-memory engine for exercising the pool and gateway without Docker.

    use super::*;
    use dashmap::DashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct MockEngine {
        pub containers: DashMap<String, bool>,
        pub networks: DashMap<String, bool>,
        pub commits: Mutex<Vec<(String, String)>>,
        pub exec_calls: Mutex<Vec<(String, Vec<String>)>>,
        pub start_count: AtomicUsize,
        /// Fail this many starts before succeeding.
        pub fail_starts: AtomicUsize,
        /// Fail this many network creations before succeeding.
        pub fail_network_creates: AtomicUsize,
        /// Simulated execution time.
        pub exec_delay: Option<Duration>,
    }

    impl MockEngine {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn starts(&self) -> usize {
            self.start_count.load(Ordering::SeqCst)
        }

        pub fn execs(&self) -> Vec<(String, Vec<String>)> {
            self.exec_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerEngine for MockEngine {
        async fn ping(&self) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn start(&self, spec: &StartSpec) -> Result<(), SandboxError> {
            if self
                .fail_starts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SandboxError::EngineUnavailable("mock start failure".into()));
            }
            self.start_count.fetch_add(1, Ordering::SeqCst);
            self.containers.insert(spec.name.clone(), true);
            Ok(())
        }

        async fn stop(&self, name: &str) -> Result<(), SandboxError> {
            self.containers.insert(name.to_string(), false);
            Ok(())
        }

        async fn remove(&self, name: &str) -> Result<(), SandboxError> {
            self.containers.remove(name);
            Ok(())
        }

        async fn exec(
            &self,
            name: &str,
            argv: &[String],
            timeout: Duration,
            _max_output_bytes: usize,
        ) -> Result<ExecOutput, SandboxError> {
            self.exec_calls
                .lock()
                .unwrap()
                .push((name.to_string(), argv.to_vec()));
            if let Some(delay) = self.exec_delay {
                if delay > timeout {
                    return Ok(ExecOutput {
                        stdout: String::new(),
                        stderr: "execution timed out".to_string(),
                        exit_code: -1,
                        timed_out: true,
                        duration_ms: timeout.as_millis() as u64,
                    });
                }
                tokio::time::sleep(delay).await;
            }
            Ok(ExecOutput {
                stdout: format!("mock output from {}", name),
                stderr: String::new(),
                exit_code: 0,
                timed_out: false,
                duration_ms: 5,
            })
        }

        async fn is_running(&self, name: &str) -> Result<bool, SandboxError> {
            Ok(self.containers.get(name).map(|v| *v).unwrap_or(false))
        }

        async fn stats(&self, _name: &str) -> Result<ResourceUsage, SandboxError> {
            Ok(ResourceUsage {
                cpu_percent: 1.5,
                memory_bytes: 10 * 1024 * 1024,
                pids: 3,
            })
        }

        async fn commit(&self, name: &str, image: &str) -> Result<(), SandboxError> {
            self.commits
                .lock()
                .unwrap()
                .push((name.to_string(), image.to_string()));
            Ok(())
        }

        async fn network_create(
            &self,
            name: &str,
            _cidr: &str,
            internal: bool,
        ) -> Result<(), SandboxError> {
            if self
                .fail_network_creates
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SandboxError::EngineUnavailable(
                    "mock network failure".into(),
                ));
            }
            self.networks.insert(name.to_string(), internal);
            Ok(())
        }

        async fn network_exists(&self, name: &str) -> Result<bool, SandboxError> {
            Ok(self.networks.contains_key(name))
        }
    }
}
