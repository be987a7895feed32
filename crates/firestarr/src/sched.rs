//! Bounded-concurrency, resumable simulation scheduling.
//!
//! Groups run in priority buckets: everything sharing a `(priority, region)`
//! pair is one bucket, buckets run in order, and the aggregator callback
//! fires after each bucket so high-priority regions publish before the rest
//! of the run finishes. Within a bucket order is unspecified; a semaphore
//! bounds the local process pool.

use crate::prepare::{self, SimSpec};
use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Target for the fire-order log; every group logs enter/exit under it.
use firestarr_logging::FIRE_ORDER_TARGET;

#[derive(Debug, Clone)]
pub struct SimTask {
    pub fire_name: String,
    pub dir: PathBuf,
    pub priority: u32,
    pub region_id: String,
    pub duration_days: u32,
    pub area_ha: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Outputs were already present; nothing ran.
    Skipped,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SimResult {
    pub task: SimTask,
    pub outcome: TaskOutcome,
    pub attempts: u32,
    /// Wall time spent in the simulator, all attempts included.
    pub sim_time: Duration,
}

/// Where simulations execute.
///
/// Selection happens once per run under an advisory lock so two pipeline
/// processes sharing a directory agree on the backend. A configured batch
/// account is reported but this build always dispatches locally; the batch
/// pool is driven by a separate deployment.
pub enum Backend {
    Local { permits: Arc<Semaphore> },
}

impl Backend {
    pub fn select(lock_dir: &Path, batch_configured: bool, pool_size: usize) -> Result<Backend> {
        fs::create_dir_all(lock_dir)?;
        let lock_path = lock_dir.join("backend.lock");
        let lock = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        lock.lock_exclusive()?;
        let backend = if batch_configured {
            warn!("batch account configured but unsupported here, dispatching locally");
            Backend::Local {
                permits: Arc::new(Semaphore::new(pool_size)),
            }
        } else {
            info!(pool_size, "selected local simulation backend");
            Backend::Local {
                permits: Arc::new(Semaphore::new(pool_size)),
            }
        };
        let _ = fs2::FileExt::unlock(&lock);
        Ok(backend)
    }

    fn permits(&self) -> Arc<Semaphore> {
        match self {
            Backend::Local { permits } => Arc::clone(permits),
        }
    }
}

pub struct Scheduler {
    pub backend: Backend,
    pub retries: u32,
    /// With `--no-wait`, a group already running in another process is
    /// treated as not ours to wait for.
    pub no_wait: bool,
    cancelled: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(backend: Backend, retries: u32, no_wait: bool) -> Scheduler {
        Scheduler {
            backend,
            retries,
            no_wait,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked before each new dispatch; set on SIGINT.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Run every task bucket to completion, invoking `publish` after each
    /// bucket that ran anything.
    pub async fn run_all<F>(&self, mut tasks: Vec<SimTask>, mut publish: F) -> Result<Vec<SimResult>>
    where
        F: FnMut(&[SimResult]) -> Result<()>,
    {
        tasks.sort_by(|a, b| {
            (a.priority, &a.region_id, a.duration_days)
                .cmp(&(b.priority, &b.region_id, b.duration_days))
                .then(
                    a.area_ha
                        .partial_cmp(&b.area_ha)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });

        let mut results = Vec::with_capacity(tasks.len());
        let mut bucket: Vec<SimTask> = Vec::new();
        let mut bucket_key: Option<(u32, String)> = None;
        let mut buckets: Vec<Vec<SimTask>> = Vec::new();
        for task in tasks {
            let key = (task.priority, task.region_id.clone());
            if bucket_key.as_ref() != Some(&key) {
                if !bucket.is_empty() {
                    buckets.push(std::mem::take(&mut bucket));
                }
                bucket_key = Some(key);
            }
            bucket.push(task);
        }
        if !bucket.is_empty() {
            buckets.push(bucket);
        }

        for bucket in buckets {
            if self.cancelled.load(Ordering::SeqCst) {
                warn!("cancelled, skipping remaining buckets");
                break;
            }
            let (priority, region) = (bucket[0].priority, bucket[0].region_id.clone());
            info!(
                target: FIRE_ORDER_TARGET,
                priority, region = %region, groups = bucket.len(), "bucket start"
            );
            let bucket_results = self.run_bucket(bucket).await;
            let ran_any = bucket_results
                .iter()
                .any(|r| r.outcome != TaskOutcome::Skipped);
            info!(target: FIRE_ORDER_TARGET, priority, region = %region, "bucket end");
            if ran_any {
                // aggregator failures must not poison later buckets
                if let Err(e) = publish(&bucket_results) {
                    error!(error = %e, "bucket publish failed");
                }
            }
            results.extend(bucket_results);
        }
        Ok(results)
    }

    async fn run_bucket(&self, bucket: Vec<SimTask>) -> Vec<SimResult> {
        let mut handles = Vec::with_capacity(bucket.len());
        for task in bucket {
            if self.cancelled.load(Ordering::SeqCst) {
                handles.push(tokio::spawn(async move {
                    SimResult {
                        task,
                        outcome: TaskOutcome::Skipped,
                        attempts: 0,
                        sim_time: Duration::ZERO,
                    }
                }));
                continue;
            }
            let permits = self.backend.permits();
            let retries = self.retries;
            let no_wait = self.no_wait;
            handles.push(tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore open");
                run_task(task, retries, no_wait).await
            }));
        }
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => error!(error = %e, "simulation task panicked"),
            }
        }
        results
    }
}

async fn run_task(task: SimTask, retries: u32, no_wait: bool) -> SimResult {
    info!(target: FIRE_ORDER_TARGET, fire = %task.fire_name, "group enter");
    let started = Instant::now();
    let result = run_task_inner(&task, retries, no_wait).await;
    let sim_time = started.elapsed();
    info!(target: FIRE_ORDER_TARGET, fire = %task.fire_name, "group exit");
    match result {
        Ok((outcome, attempts)) => SimResult {
            task,
            outcome,
            attempts,
            sim_time,
        },
        Err(e) => {
            error!(fire = %task.fire_name, error = %e, "group failed");
            let _ = fs::write(task.dir.join("error.txt"), format!("{e:#}\n"));
            SimResult {
                task,
                outcome: TaskOutcome::Failed,
                attempts: retries,
                sim_time,
            }
        }
    }
}

async fn run_task_inner(task: &SimTask, retries: u32, no_wait: bool) -> Result<(TaskOutcome, u32)> {
    let spec = prepare::read_spec(&task.dir, &task.fire_name)?;

    if outputs_complete(&task.dir, &spec) {
        info!(fire = %task.fire_name, "outputs already present, skipping");
        return Ok((TaskOutcome::Skipped, 0));
    }

    if is_running_elsewhere(&task.dir)? {
        if no_wait {
            bail!("simulation already running in another process");
        }
        info!(fire = %task.fire_name, "waiting on simulation in another process");
        wait_until_not_running(&task.dir).await?;
        if outputs_complete(&task.dir, &spec) {
            return Ok((TaskOutcome::Done, 0));
        }
        warn!(fire = %task.fire_name, "external run left no outputs, relaunching");
    }

    for attempt in 1..=retries {
        let output = Command::new("bash")
            .arg("sim.sh")
            .current_dir(&task.dir)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to launch sim.sh in {}", task.dir.display()))?;
        // stdout/stderr persist for post-mortem even on success
        fs::write(task.dir.join("sim_stdout.txt"), &output.stdout)?;
        fs::write(task.dir.join("sim_stderr.txt"), &output.stderr)?;

        if output.status.success() {
            if outputs_complete(&task.dir, &spec) {
                return Ok((TaskOutcome::Done, attempt));
            }
            warn!(
                fire = %task.fire_name,
                attempt, "simulator exited 0 but outputs are missing"
            );
        } else {
            warn!(
                fire = %task.fire_name,
                attempt,
                status = output.status.code().unwrap_or(-1),
                "simulator failed"
            );
        }
    }
    bail!("simulation failed after {retries} attempts")
}

/// All expected probability rasters exist and are non-empty.
pub fn outputs_complete(dir: &Path, spec: &SimSpec) -> bool {
    spec.expected_outputs().iter().all(|name| {
        dir.join(name)
            .metadata()
            .map(|m| m.len() > 0)
            .unwrap_or(false)
    })
}

/// Detect another live process already simulating this group by scanning
/// process working directories.
pub fn is_running_elsewhere(dir: &Path) -> Result<bool> {
    let target = fs::canonicalize(dir)?;
    let me = std::process::id();
    let Ok(entries) = fs::read_dir("/proc") else {
        return Ok(false);
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if pid == me {
            continue;
        }
        if let Ok(cwd) = fs::read_link(entry.path().join("cwd")) {
            if cwd == target {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

async fn wait_until_not_running(dir: &Path) -> Result<()> {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        if !is_running_elsewhere(dir)? {
            return Ok(());
        }
    }
}
