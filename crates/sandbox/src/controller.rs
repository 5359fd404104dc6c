//! Reconciliation loop: drives jobs from `queued` to a terminal status by
//! comparing the Store against what the [`SandboxDriver`] reports and
//! closing the gap on every tick.
//!
//! Logs are never stored in the database — they are streamed directly from
//! the container runtime on demand by SSE clients. Failure reasons are
//! logged here but not persisted; a caller who wants the reason has to have
//! been watching the stream when it happened.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use store::{Database, JobRecord, JobStatus};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::driver::{SandboxDriver, SandboxInfo, SandboxStatus};

/// How long a `running` job may go without a visible container before the
/// controller gives up and marks it failed. Covers the gap between `docker
/// create` returning and the container becoming inspectable.
const MISSING_CONTAINER_GRACE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Interval between reconciliation passes.
    pub reconcile_interval: Duration,
    /// Root directory under which each job gets a scratch workspace.
    pub scratch_root: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(2),
            scratch_root: std::env::temp_dir().join("ci_job_workspaces"),
        }
    }
}

/// Owns the reconciliation loop. One instance per running service.
pub struct Controller {
    store: Database,
    driver: SandboxDriver,
    config: ControllerConfig,
    missing_since: Mutex<HashMap<Uuid, Instant>>,
    scratch_dirs: Mutex<HashMap<Uuid, PathBuf>>,
    stopping: AtomicBool,
    stopped: Notify,
}

impl Controller {
    pub fn new(store: Database, driver: SandboxDriver, config: ControllerConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            driver,
            config,
            missing_since: Mutex::new(HashMap::new()),
            scratch_dirs: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            stopped: Notify::new(),
        })
    }

    pub fn driver(&self) -> &SandboxDriver {
        &self.driver
    }

    pub fn store(&self) -> &Database {
        &self.store
    }

    /// Spawns the reconciliation loop as a background task.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move { controller.run_loop().await })
    }

    /// Signals the loop to stop after its current tick and waits for it.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.stopped.notified().await;
    }

    async fn run_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        loop {
            ticker.tick().await;
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = self.reconcile_once().await {
                error!(error = %err, "reconciliation pass failed");
            }
        }
        self.stopped.notify_one();
    }

    /// Runs a single reconciliation pass: advances every non-terminal job
    /// and removes containers that no longer correspond to a known job.
    pub async fn reconcile_once(&self) -> Result<()> {
        let jobs = self.store.list_jobs().await.context("listing jobs")?;

        for job in &jobs {
            if job.is_terminal() {
                continue;
            }
            if let Err(err) = self.reconcile_job(job).await {
                warn!(job_id = %job.id, error = %err, "failed to reconcile job, will retry next tick");
            }
        }

        let containers = self.driver.list_owned().await.context("listing containers")?;
        self.cleanup_orphaned_containers(&containers, &jobs).await;

        debug!(job_count = jobs.len(), container_count = containers.len(), "reconciliation tick complete");
        Ok(())
    }

    async fn reconcile_job(&self, job: &JobRecord) -> Result<()> {
        match job.status {
            JobStatus::Queued => self.start_job(job).await,
            JobStatus::Running => self.reconcile_running_job(job).await,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => Ok(()),
        }
    }

    async fn reconcile_running_job(&self, job: &JobRecord) -> Result<()> {
        let name = self.driver.container_name(job.id);
        match self.driver.inspect(&name).await? {
            Some(info) if info.status == SandboxStatus::Exited => {
                self.missing_since.lock().remove(&job.id);
                self.finalize_job(job.id, &info).await
            }
            Some(info) if info.status == SandboxStatus::Dead => {
                self.missing_since.lock().remove(&job.id);
                self.mark_job_failed(job.id, "container entered dead state").await
            }
            Some(info) if info.status == SandboxStatus::Removing => {
                self.missing_since.lock().remove(&job.id);
                self.mark_job_failed(job.id, "container entered removing state").await
            }
            Some(_) => {
                self.missing_since.lock().remove(&job.id);
                Ok(())
            }
            None => self.handle_missing_container(job.id).await,
        }
    }

    async fn handle_missing_container(&self, job_id: Uuid) -> Result<()> {
        let since = *self
            .missing_since
            .lock()
            .entry(job_id)
            .or_insert_with(Instant::now);

        if since.elapsed() >= MISSING_CONTAINER_GRACE {
            self.missing_since.lock().remove(&job_id);
            self.mark_job_failed(job_id, "container never became visible to the runtime")
                .await
        } else {
            Ok(())
        }
    }

    /// Extracts the job's archive into a scratch workspace, creates and
    /// starts its container, and transitions it to `running`.
    async fn start_job(&self, job: &JobRecord) -> Result<()> {
        let name = self.driver.container_name(job.id);
        let existing = self.driver.inspect(&name).await.unwrap_or_else(|err| {
            warn!(job_id = %job.id, error = %err, "failed to inspect container for queued job, assuming none exists");
            None
        });
        if let Some(info) = existing {
            return match info.status {
                SandboxStatus::Created => {
                    self.driver.start(&info.container_id).await?;
                    self.store
                        .update_job_status(job.id, JobStatus::Running, Some(Utc::now()), Some(&info.container_id))
                        .await
                        .context("persisting running status")?;
                    info!(job_id = %job.id, container_id = %info.container_id, "resumed idle container");
                    Ok(())
                }
                _ => {
                    warn!(job_id = %job.id, container = %name, "unexpected container for queued job");
                    self.driver.cleanup(&info.container_id).await;
                    Ok(())
                }
            };
        }

        let Some(archive_path) = job.archive_path.clone() else {
            self.mark_job_failed(job.id, "job has no archive to run").await?;
            return Ok(());
        };

        let workspace = self
            .config
            .scratch_root
            .join(format!("ci_job_{}_workspace", job.id));
        tokio::fs::create_dir_all(&workspace)
            .await
            .with_context(|| format!("creating scratch workspace {}", workspace.display()))?;

        let extract_dest = workspace.clone();
        let extract_source = PathBuf::from(&archive_path);
        let extracted = tokio::task::spawn_blocking(move || extract_archive(&extract_source, &extract_dest))
            .await
            .context("archive extraction task panicked")?;

        if let Err(err) = extracted {
            self.mark_job_failed(job.id, &format!("failed to extract archive: {err}"))
                .await?;
            return Ok(());
        }

        if !workspace.join("requirements.txt").exists() {
            self.mark_job_failed(job.id, "archive missing requirements.txt").await?;
            return Ok(());
        }

        self.scratch_dirs.lock().insert(job.id, workspace.clone());

        let container_id = match self.driver.create(job.id, &workspace).await {
            Ok(id) => id,
            Err(err) => {
                self.mark_job_failed(job.id, &format!("failed to create container: {err}"))
                    .await?;
                return Ok(());
            }
        };

        if let Err(err) = self.driver.start(&container_id).await {
            self.mark_job_failed(job.id, &format!("failed to start container: {err}"))
                .await?;
            return Ok(());
        }

        self.store
            .update_job_status(job.id, JobStatus::Running, Some(Utc::now()), Some(&container_id))
            .await
            .context("persisting running status")?;
        info!(job_id = %job.id, container_id = %container_id, "job started");
        Ok(())
    }

    async fn finalize_job(&self, job_id: Uuid, info: &SandboxInfo) -> Result<()> {
        let success = info.exit_code == Some(0);
        let end_time = info.finished_at.unwrap_or_else(Utc::now);

        self.store
            .complete_job(job_id, JobStatus::Completed, success, end_time)
            .await
            .context("persisting job completion")?;
        info!(job_id = %job_id, success, exit_code = ?info.exit_code, "job finished");
        self.forget_scratch_dir(job_id).await;
        Ok(())
    }

    async fn mark_job_failed(&self, job_id: Uuid, reason: &str) -> Result<()> {
        error!(job_id = %job_id, reason, "marking job failed");
        self.store
            .complete_job(job_id, JobStatus::Failed, false, Utc::now())
            .await
            .context("persisting job failure")?;
        self.forget_scratch_dir(job_id).await;
        Ok(())
    }

    async fn forget_scratch_dir(&self, job_id: Uuid) {
        let dir = self.scratch_dirs.lock().remove(&job_id);
        if let Some(dir) = dir {
            if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                debug!(job_id = %job_id, path = %dir.display(), error = %err, "scratch dir cleanup failed");
            }
        }
    }

    async fn cleanup_orphaned_containers(&self, containers: &[SandboxInfo], jobs: &[JobRecord]) {
        let known_job_ids: std::collections::HashSet<Uuid> = jobs.iter().map(|j| j.id).collect();
        for container in containers {
            let Some(job_id) = self.driver.job_id_for_name(&container.name) else {
                continue;
            };
            if !known_job_ids.contains(&job_id) {
                warn!(job_id = %job_id, container = %container.name, "removing orphaned container");
                self.driver.cleanup(&container.container_id).await;
            }
        }
    }
}

/// Extracts a zip archive's contents into `dest`, which must already exist.
fn extract_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)
        .with_context(|| format!("opening archive {}", archive_path.display()))?;
    let mut zip = zip::ZipArchive::new(file).context("reading zip archive")?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative_path) = entry.enclosed_name().map(Path::to_path_buf) else {
            continue;
        };
        let out_path = dest.join(relative_path);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out_file = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out_file)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SandboxDriverConfig;
    use std::io::Write;

    fn write_test_archive(path: &Path, files: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        for (name, contents) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(contents.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn extract_archive_writes_files_to_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let archive_path = tmp.path().join("job.zip");
        write_test_archive(
            &archive_path,
            &[("requirements.txt", "pytest\n"), ("tests/test_a.py", "def test_a(): pass\n")],
        );

        let dest = tmp.path().join("workspace");
        std::fs::create_dir_all(&dest).unwrap();
        extract_archive(&archive_path, &dest).unwrap();

        assert!(dest.join("requirements.txt").exists());
        assert!(dest.join("tests/test_a.py").exists());
    }

    #[tokio::test]
    async fn queued_job_without_archive_is_marked_failed() {
        let store = Database::connect("sqlite::memory:").await.unwrap();
        let user = store
            .create_user(store::NewUser {
                display_name: "Alice",
                email: "alice@example.com",
            })
            .await
            .unwrap();

        // Simulate a job whose archive path was lost: create normally, then
        // exercise mark_job_failed's persistence directly since Store always
        // requires an archive_path on creation.
        let job_id = Uuid::new_v4();
        store
            .create_job(store::NewJob {
                id: job_id,
                archive_path: "/nonexistent/archive.zip",
                user_id: user.id,
            })
            .await
            .unwrap();

        let driver = SandboxDriver::new(SandboxDriverConfig::default());
        let controller = Controller::new(
            store.clone(),
            driver,
            ControllerConfig {
                reconcile_interval: Duration::from_millis(50),
                scratch_root: tempfile::tempdir().unwrap().into_path(),
            },
        );

        let job = store.get_job(job_id).await.unwrap().unwrap();
        controller.start_job(&job).await.unwrap();

        let updated = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(updated.status, JobStatus::Failed);
        assert_eq!(updated.success, Some(false));
    }
}
