//! Thin, stateless adapter over a local container-runtime CLI.
//!
//! Every operation shells out to a single CLI invocation (`docker` by
//! default) and parses its stdout. The driver holds no state of its own —
//! everything it knows about a sandbox it re-derives from the runtime or
//! from the caller on every call. This mirrors the original control plane's
//! container manager, which never kept an in-process model of running
//! containers either.

use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::Stream;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::{io::AsyncBufReadExt, process::Command};
use tokio_stream::{wrappers::LinesStream, StreamExt as _};
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors surfaced at the boundary of the sandbox crate, distinct from the
/// persisted job status stored by `store`.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox for container '{0}' not found")]
    NotFound(String),
    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

/// Lifecycle status as reported by the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Created,
    Running,
    Exited,
    Dead,
    Removing,
    Unknown,
}

impl SandboxStatus {
    fn parse(raw: &str) -> Self {
        match raw {
            "created" => SandboxStatus::Created,
            "running" => SandboxStatus::Running,
            "exited" => SandboxStatus::Exited,
            "dead" => SandboxStatus::Dead,
            "removing" => SandboxStatus::Removing,
            _ => SandboxStatus::Unknown,
        }
    }
}

/// Runtime-reported snapshot of a single container, as returned by `inspect`
/// or `list_owned`.
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    pub container_id: String,
    pub name: String,
    pub status: SandboxStatus,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Configuration for the container-runtime adapter.
#[derive(Debug, Clone)]
pub struct SandboxDriverConfig {
    /// CLI binary to invoke. Defaults to `docker`; overridable so the same
    /// driver logic works against Podman or any Docker-compatible CLI.
    pub binary: String,
    /// Image used for every job's sandbox container.
    pub image: String,
    /// Name prefix applied to every container this driver creates. Used to
    /// recognize containers it owns when listing.
    pub container_name_prefix: String,
    /// Grace period given to a container on `stop` before the runtime kills it.
    pub stop_timeout: Duration,
}

impl Default for SandboxDriverConfig {
    fn default() -> Self {
        Self {
            binary: "docker".into(),
            image: "python:3.11-slim".into(),
            container_name_prefix: "ci_job_".into(),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Stateless adapter over the container-runtime CLI.
#[derive(Debug, Clone)]
pub struct SandboxDriver {
    config: SandboxDriverConfig,
    owned_name_pattern: Regex,
}

impl SandboxDriver {
    pub fn new(config: SandboxDriverConfig) -> Self {
        let escaped_prefix = regex::escape(&config.container_name_prefix);
        let owned_name_pattern = Regex::new(&format!(
            "^{escaped_prefix}([0-9a-fA-F]{{8}}-[0-9a-fA-F]{{4}}-[0-9a-fA-F]{{4}}-[0-9a-fA-F]{{4}}-[0-9a-fA-F]{{12}})$"
        ))
        .expect("owned-name pattern is a valid regex");
        Self {
            config,
            owned_name_pattern,
        }
    }

    pub fn container_name(&self, job_id: Uuid) -> String {
        format!("{}{}", self.config.container_name_prefix, job_id)
    }

    /// Extracts the job id from a container name this driver would have
    /// produced, or `None` if the name doesn't belong to this driver.
    pub fn job_id_for_name(&self, name: &str) -> Option<Uuid> {
        let captures = self.owned_name_pattern.captures(name)?;
        Uuid::parse_str(&captures[1]).ok()
    }

    /// Creates (but does not start) a container bound to `workspace`, which
    /// must already contain the job's extracted archive and a
    /// `requirements.txt` at its root.
    pub async fn create(&self, job_id: Uuid, workspace: &Path) -> Result<String> {
        let name = self.container_name(job_id);
        let mount = format!("{}:/workspace:ro", workspace.display());
        let output = Command::new(&self.config.binary)
            .args([
                "create",
                "--name",
                &name,
                "-v",
                &mount,
                "-w",
                "/workspace",
                &self.config.image,
                "sh",
                "-c",
                "pip install -q -r requirements.txt && python -m pytest -v",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("spawning `{} create`", self.config.binary))?;

        if !output.status.success() {
            return Err(anyhow!(
                "container create failed for job {job_id}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn start(&self, container_id: &str) -> Result<()> {
        self.run_checked(["start", container_id]).await
    }

    pub async fn stop(&self, container_id: &str) -> Result<()> {
        let timeout_secs = self.config.stop_timeout.as_secs().to_string();
        self.run_checked(["stop", "--time", &timeout_secs, container_id])
            .await
    }

    /// Removes a container. Tolerates the container already being gone.
    pub async fn remove(&self, container_id: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm"];
        if force {
            args.push("--force");
        }
        args.push(container_id);

        let output = Command::new(&self.config.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("spawning `{} rm`", self.config.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") {
                return Ok(());
            }
            return Err(anyhow!("container rm failed for {container_id}: {}", stderr.trim()));
        }
        Ok(())
    }

    /// Best-effort teardown used when reconciliation gives up on a job.
    /// Swallows every error: a container that can't be removed will be
    /// picked up by orphan cleanup on a later tick.
    pub async fn cleanup(&self, container_id: &str) {
        if let Err(err) = self.remove(container_id, true).await {
            warn!(container_id, error = %err, "cleanup failed to remove container");
        }
    }

    /// Like [`Self::inspect`] but treats a missing container as an error.
    /// Useful for callers (the API's log-streaming endpoint) that have
    /// nothing sensible to do with `None`.
    pub async fn require_inspect(&self, container_id: &str) -> Result<SandboxInfo, SandboxError> {
        self.inspect(container_id)
            .await?
            .ok_or_else(|| SandboxError::NotFound(container_id.to_string()))
    }

    pub async fn inspect(&self, container_id: &str) -> Result<Option<SandboxInfo>> {
        let output = Command::new(&self.config.binary)
            .args(["inspect", container_id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("spawning `{} inspect`", self.config.binary))?;

        if !output.status.success() {
            return Ok(None);
        }

        let parsed: Vec<InspectEntry> = serde_json::from_slice(&output.stdout)
            .context("parsing `docker inspect` output")?;
        let Some(entry) = parsed.into_iter().next() else {
            return Ok(None);
        };
        Ok(Some(entry.into_sandbox_info()))
    }

    /// Lists every container this driver owns (by name prefix), regardless
    /// of status.
    pub async fn list_owned(&self) -> Result<Vec<SandboxInfo>> {
        let output = Command::new(&self.config.binary)
            .args([
                "ps",
                "-a",
                "--filter",
                &format!("name={}", self.config.container_name_prefix),
                "--format",
                "{{.Names}}",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("spawning `{} ps`", self.config.binary))?;

        if !output.status.success() {
            return Err(anyhow!(
                "listing containers failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let names = String::from_utf8_lossy(&output.stdout);
        let mut infos = Vec::new();
        for name in names.lines().map(str::trim).filter(|n| !n.is_empty()) {
            if self.job_id_for_name(name).is_none() {
                continue;
            }
            if let Some(info) = self.inspect(name).await? {
                infos.push(info);
            } else {
                debug!(name, "container disappeared between ps and inspect");
            }
        }
        Ok(infos)
    }

    /// Streams container logs line by line. When `follow` is true the
    /// returned stream stays open for new output until the container stops
    /// or the caller drops the stream (which kills the underlying process).
    pub fn stream_logs(
        &self,
        container_id: &str,
        follow: bool,
    ) -> Result<impl Stream<Item = Result<String>>> {
        let mut args = vec!["logs".to_string()];
        if follow {
            args.push("--follow".to_string());
        }
        args.push(container_id.to_string());

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning `{} logs`", self.config.binary))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("docker logs child missing stdout"))?;
        let reader = tokio::io::BufReader::new(stdout);
        let lines = LinesStream::new(reader.lines());

        // Keep the child alive for as long as the stream is polled; dropping
        // it here (via kill_on_drop) is what stops `--follow` when the
        // caller stops consuming.
        Ok(async_stream::stream! {
            tokio::pin!(lines);
            let _child_guard = child;
            while let Some(line) = lines.next().await {
                match line {
                    Ok(text) => yield Ok(text),
                    Err(err) => {
                        yield Err(anyhow!("reading container logs: {err}"));
                        break;
                    }
                }
            }
        })
    }

    async fn run_checked<const N: usize>(&self, args: [&str; N]) -> Result<()> {
        let output = Command::new(&self.config.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("spawning `{} {}`", self.config.binary, args.join(" ")))?;

        if !output.status.success() {
            return Err(anyhow!(
                "`{} {}` failed: {}",
                self.config.binary,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "State")]
    state: InspectState,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "ExitCode")]
    exit_code: i64,
    #[serde(rename = "StartedAt")]
    started_at: String,
    #[serde(rename = "FinishedAt")]
    finished_at: String,
}

impl InspectEntry {
    fn into_sandbox_info(self) -> SandboxInfo {
        let status = SandboxStatus::parse(&self.state.status);
        let exit_code = if status == SandboxStatus::Exited || status == SandboxStatus::Dead {
            Some(self.state.exit_code as i32)
        } else {
            None
        };
        SandboxInfo {
            container_id: self.id,
            name: self.name.trim_start_matches('/').to_string(),
            status,
            exit_code,
            started_at: parse_docker_timestamp(&self.state.started_at),
            finished_at: parse_docker_timestamp(&self.state.finished_at),
        }
    }
}

/// `docker inspect` reports zero-value timestamps (`0001-01-01T00:00:00Z`)
/// for events that haven't happened yet.
fn parse_docker_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if raw.starts_with("0001-01-01") {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_round_trips_through_job_id_extraction() {
        let driver = SandboxDriver::new(SandboxDriverConfig::default());
        let job_id = Uuid::new_v4();
        let name = driver.container_name(job_id);
        assert_eq!(driver.job_id_for_name(&name), Some(job_id));
    }

    #[test]
    fn unrelated_names_are_not_owned() {
        let driver = SandboxDriver::new(SandboxDriverConfig::default());
        assert_eq!(driver.job_id_for_name("some_other_container"), None);
        assert_eq!(driver.job_id_for_name("ci_job_not-a-uuid"), None);
    }

    #[test]
    fn zero_value_docker_timestamp_is_none() {
        assert_eq!(parse_docker_timestamp("0001-01-01T00:00:00Z"), None);
        assert!(parse_docker_timestamp("2024-01-01T00:00:00Z").is_some());
    }
}
