//! Job lifecycle: configuration, process supervision, ingestion and
//! bookkeeping for every scanner run.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    cache::ResultCache,
    command::{HttpxCommand, NucleiCommand, ScanRequest, ToolCommand},
    db::{Database, JobFinish, NewJob},
    error::{Result, ScanError},
    ingest::{load_artifact, Ingestor},
    models::{IngestReport, JobKind, JobStatus, MonitoredTarget, SchedulerSettings, ToolSettings},
    parser::{count_probe_results, normalize_record, parse_results, validate_import_record},
    runner::{Invocation, LogArtifact, OutputSink, ProcessOutcome, ProcessRunner, RunnerError},
    security::{host_of, validate_target},
    settings::{load_scheduler_settings, load_tool_settings},
};

const SPAWN_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub scans_dir: PathBuf,
    pub nuclei_bin: String,
    pub httpx_bin: String,
    pub batch_concurrency: usize,
    pub spawn_retries: u32,
    pub scan_timeout: Option<Duration>,
    pub scope_allowlist: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            scans_dir: PathBuf::from("scans"),
            nuclei_bin: "nuclei".into(),
            httpx_bin: "httpx".into(),
            batch_concurrency: 1,
            spawn_retries: 0,
            scan_timeout: None,
            scope_allowlist: vec![],
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub target: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub report: IngestReport,
    pub new_findings: Vec<String>,
    /// A targeted rescan came back empty: the finding may have been fixed.
    pub possibly_fixed: bool,
    pub probe_job: Option<String>,
}

impl JobOutcome {
    fn new(job: &PreparedJob, status: JobStatus) -> Self {
        Self {
            job_id: job.id.clone(),
            target: job.target.clone(),
            kind: job.kind,
            status,
            report: IngestReport::default(),
            new_findings: vec![],
            possibly_fixed: false,
            probe_job: None,
        }
    }
}

/// Result of one target within a batch. Failures are collected, not raised.
#[derive(Debug)]
pub struct TargetRun {
    pub target: String,
    pub result: Result<JobOutcome>,
}

#[derive(Debug, Clone)]
struct PreparedJob {
    id: String,
    target: String,
    kind: JobKind,
    log_path: PathBuf,
    output_path: PathBuf,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultMode {
    Findings,
    Probe,
}

/// Releases the target's in-flight slot when dropped.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

struct Inner {
    db: Database,
    ingestor: Ingestor,
    runner: Arc<dyn ProcessRunner>,
    cache: Arc<ResultCache>,
    config: ExecutorConfig,
    in_flight: Arc<Mutex<HashSet<String>>>,
    running: Mutex<HashMap<String, CancellationToken>>,
}

#[derive(Clone)]
pub struct JobExecutor {
    inner: Arc<Inner>,
}

impl JobExecutor {
    pub fn new(
        db: Database,
        runner: Arc<dyn ProcessRunner>,
        cache: Arc<ResultCache>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ingestor: Ingestor::new(db.clone()),
                db,
                runner,
                cache,
                config,
                in_flight: Arc::default(),
                running: Mutex::default(),
            }),
        }
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.inner.cache
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Hosts with a job in flight, sorted.
    pub fn active_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.inner.in_flight.lock().iter().cloned().collect();
        targets.sort();
        targets
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.inner.running.lock().contains_key(job_id)
    }

    pub fn log_path(&self, job_id: &str) -> PathBuf {
        self.inner.config.scans_dir.join(format!("{job_id}.log"))
    }

    fn claim(&self, target: &str) -> Result<InFlightGuard> {
        let key = host_of(target).to_string();
        if !self.inner.in_flight.lock().insert(key.clone()) {
            return Err(ScanError::AlreadyRunning(key));
        }
        Ok(InFlightGuard {
            set: self.inner.in_flight.clone(),
            key,
        })
    }

    /// Starts a scan in the background and returns its job id.
    pub async fn spawn_scan(&self, req: ScanRequest) -> Result<String> {
        let kind = if req.template_id.is_some() {
            JobKind::Rescan
        } else {
            JobKind::Scan
        };
        let (guard, job, invocation, tool) = self.begin(&req, kind).await?;
        let job_id = job.id.clone();
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_claimed(guard, job, invocation, tool).await {
                warn!(error = %e, "background scan failed");
            }
        });
        Ok(job_id)
    }

    pub async fn run_scan(&self, req: ScanRequest) -> Result<JobOutcome> {
        let (guard, job, invocation, tool) = self.begin(&req, JobKind::Scan).await?;
        self.run_claimed(guard, job, invocation, tool).await
    }

    /// Scans every target with bounded concurrency. One target failing never
    /// aborts the others.
    pub async fn run_batch(&self, targets: Vec<MonitoredTarget>) -> Vec<TargetRun> {
        let limit = self.inner.config.batch_concurrency.max(1);
        info!(targets = targets.len(), concurrency = limit, "batch started");
        let runs: Vec<TargetRun> = stream::iter(targets)
            .map(|target| {
                let this = self.clone();
                async move {
                    let result = this.run_scan(ScanRequest::new(&target.address)).await;
                    match &result {
                        Err(ScanError::AlreadyRunning(_)) => {
                            info!(target = %target.address, "skipped: job already in flight")
                        }
                        Err(e) => warn!(target = %target.address, error = %e, "target scan failed"),
                        Ok(_) => {}
                    }
                    TargetRun {
                        target: target.address,
                        result,
                    }
                }
            })
            .buffer_unordered(limit)
            .collect()
            .await;
        let failed = runs.iter().filter(|r| r.result.is_err()).count();
        info!(total = runs.len(), failed, "batch finished");
        runs
    }

    /// Terminates a running job and marks it stopped. Finished jobs are left
    /// as they are. Artifacts are kept.
    pub async fn stop(&self, job_id: &str) -> Result<JobStatus> {
        let token = self.inner.running.lock().get(job_id).cloned();
        let Some(token) = token else {
            let job = self.inner.db.job(job_id).await?;
            if job.status.is_terminal() {
                return Ok(job.status);
            }
            // no live process, e.g. a queued job that never started
            self.inner.cache.invalidate_pattern("scans");
            self.inner
                .db
                .finish_job(job_id, JobStatus::Stopped, &stopped_finish())
                .await?;
            return Ok(JobStatus::Stopped);
        };

        token.cancel();
        self.inner.cache.invalidate_pattern("scans");
        if !self
            .inner
            .db
            .finish_job(job_id, JobStatus::Stopped, &stopped_finish())
            .await?
        {
            return Ok(self.inner.db.job(job_id).await?.status);
        }
        info!(job_id, "job stopped");
        Ok(JobStatus::Stopped)
    }

    /// Re-runs the template that produced a finding against its host. An
    /// empty result leaves the finding untouched and sets `possibly_fixed`.
    pub async fn rescan_finding(&self, finding_id: i64) -> Result<JobOutcome> {
        let finding = self.inner.db.finding(finding_id).await?;
        let req = ScanRequest::targeted(&finding.host, &finding.template_id);
        let (guard, job, invocation, tool) = self.begin(&req, JobKind::Rescan).await?;
        let mut outcome = self.run_claimed(guard, job, invocation, tool).await?;
        if outcome.status == JobStatus::Completed && outcome.report.total() == 0 {
            outcome.possibly_fixed = true;
            info!(finding_id, job_id = %outcome.job_id, "no vulnerabilities found, possibly fixed");
        }
        Ok(outcome)
    }

    /// Ingests results produced elsewhere. Every record must name its
    /// template and carry `info.name` and `info.severity`.
    pub async fn import_results(&self, raw: &[u8], source_name: &str) -> Result<JobOutcome> {
        let records = parse_results(raw)?;
        for (i, record) in records.iter().enumerate() {
            validate_import_record(i, record).map_err(|e| ScanError::Validation(e.to_string()))?;
        }
        let findings = records
            .iter()
            .enumerate()
            .map(|(i, v)| normalize_record(i, v))
            .collect::<Result<Vec<_>, _>>()?;

        let job = PreparedJob {
            id: Uuid::new_v4().to_string(),
            target: source_name.to_string(),
            kind: JobKind::Import,
            log_path: PathBuf::new(),
            output_path: PathBuf::new(),
            cancel: CancellationToken::new(),
        };
        self.inner
            .db
            .insert_job(&NewJob {
                id: job.id.clone(),
                target: job.target.clone(),
                kind: JobKind::Import,
                config: json!({ "source": source_name, "records": findings.len() }),
                log_path: None,
                output_path: None,
            })
            .await?;
        if let Err(e) = self.inner.db.mark_running(&job.id).await {
            return Err(self.fail(&job, e, None).await);
        }

        let report = match self.inner.ingestor.ingest(&job.id, &findings).await {
            Ok(report) => report,
            Err(e) => return Err(self.fail(&job, e, None).await),
        };
        self.complete(&job, report, None).await
    }

    async fn begin(
        &self,
        req: &ScanRequest,
        kind: JobKind,
    ) -> Result<(InFlightGuard, PreparedJob, Invocation, ToolSettings)> {
        let target = validate_target(&req.target, &self.inner.config.scope_allowlist)?;
        let guard = self.claim(&target)?;
        let req = ScanRequest {
            target: target.clone(),
            template_id: req.template_id.clone(),
        };

        let tool = load_tool_settings(&self.inner.db).await?;
        let command = NucleiCommand {
            binary: self.inner.config.nuclei_bin.clone(),
            settings: tool.clone(),
        };
        let id = Uuid::new_v4().to_string();
        let output = self.inner.config.scans_dir.join(format!("{id}.json"));
        let invocation = command.invocation(&req, &output)?;
        let job = self
            .prepare(id, &target, kind, json!({ "request": req, "command": invocation }))
            .await?;
        Ok((guard, job, invocation, tool))
    }

    async fn prepare(
        &self,
        id: String,
        target: &str,
        kind: JobKind,
        config: serde_json::Value,
    ) -> Result<PreparedJob> {
        tokio::fs::create_dir_all(&self.inner.config.scans_dir).await?;
        let job = PreparedJob {
            log_path: self.log_path(&id),
            output_path: self.inner.config.scans_dir.join(format!("{id}.json")),
            id,
            target: target.to_string(),
            kind,
            cancel: CancellationToken::new(),
        };
        self.inner
            .db
            .insert_job(&NewJob {
                id: job.id.clone(),
                target: job.target.clone(),
                kind,
                config,
                log_path: Some(job.log_path.display().to_string()),
                output_path: Some(job.output_path.display().to_string()),
            })
            .await?;
        self.inner
            .running
            .lock()
            .insert(job.id.clone(), job.cancel.clone());
        self.inner.cache.invalidate_pattern("scans");
        info!(job_id = %job.id, target, kind = kind.as_str(), "job queued");
        Ok(job)
    }

    async fn run_claimed(
        &self,
        _guard: InFlightGuard,
        job: PreparedJob,
        invocation: Invocation,
        tool: ToolSettings,
    ) -> Result<JobOutcome> {
        let mut outcome = self.drive(&job, invocation, ResultMode::Findings).await?;
        if job.kind == JobKind::Scan && outcome.status == JobStatus::Completed {
            if let Err(e) = self.inner.db.record_target_scan(&job.target, Utc::now()).await {
                warn!(target = %job.target, error = %e, "failed to update target stats");
            }
            outcome.probe_job = self.maybe_probe(&job.target, &outcome, &tool).await;
        }
        Ok(outcome)
    }

    async fn maybe_probe(&self, target: &str, outcome: &JobOutcome, tool: &ToolSettings) -> Option<String> {
        let scheduler: SchedulerSettings = match load_scheduler_settings(&self.inner.db).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "could not read scheduler settings, skipping probe");
                return None;
            }
        };
        if !scheduler.auto_secondary_scan {
            return None;
        }
        let monitored = self.inner.db.target_by_address(target).await.ok().flatten()?;
        if !monitored.tool_enabled {
            return None;
        }
        let threshold = tool.max_new_findings_threshold as usize;
        if outcome.report.inserted > threshold {
            info!(target, new = outcome.report.inserted, threshold, "skipping probe: too many new findings");
            return None;
        }

        let id = Uuid::new_v4().to_string();
        let command = HttpxCommand {
            binary: self.inner.config.httpx_bin.clone(),
        };
        let output = self.inner.config.scans_dir.join(format!("{id}.json"));
        let invocation = command.invocation(&ScanRequest::new(target), &output).ok()?;
        let job = match self
            .prepare(id, target, JobKind::Probe, json!({ "command": invocation }))
            .await
        {
            Ok(job) => job,
            Err(e) => {
                warn!(target, error = %e, "could not record probe job");
                return None;
            }
        };
        if let Err(e) = self.drive(&job, invocation, ResultMode::Probe).await {
            warn!(target, job_id = %job.id, error = %e, "probe failed");
        }
        Some(job.id)
    }

    async fn drive(&self, job: &PreparedJob, invocation: Invocation, mode: ResultMode) -> Result<JobOutcome> {
        let result = self.drive_inner(job, invocation, mode).await;
        self.inner.running.lock().remove(&job.id);
        result
    }

    async fn drive_inner(
        &self,
        job: &PreparedJob,
        mut invocation: Invocation,
        mode: ResultMode,
    ) -> Result<JobOutcome> {
        let mut log = match LogArtifact::create(&job.log_path).await {
            Ok(log) => log,
            Err(e) => return Err(self.fail(job, e.into(), None).await),
        };
        if let Err(e) = log
            .write_chunk(format!("$ {}\n", invocation.command_line()).as_bytes())
            .await
        {
            warn!(job_id = %job.id, error = %e, "log write failed");
        }
        if let Err(e) = self.inner.db.mark_running(&job.id).await {
            return Err(self.fail(job, e, None).await);
        }
        invocation.timeout = self.inner.config.scan_timeout;

        let outcome = match self.run_with_retries(&invocation, &mut log, job.cancel.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log.note(&format!("[failed to start: {e}]")).await.ok();
                return Err(self.fail(job, e.into(), None).await);
            }
        };
        let exit_code = outcome.exit_code.map(i64::from);
        log.note(&exit_note(&outcome)).await.ok();

        if outcome.killed || job.cancel.is_cancelled() {
            let finish = JobFinish {
                exit_code,
                ..stopped_finish()
            };
            self.inner
                .db
                .finish_job(&job.id, JobStatus::Stopped, &finish)
                .await?;
            return Ok(JobOutcome::new(job, JobStatus::Stopped));
        }
        if outcome.timed_out {
            let secs = invocation.timeout.map(|t| t.as_secs()).unwrap_or_default();
            let err = ScanError::Process(format!("timed out after {secs}s"));
            return Err(self.fail(job, err, exit_code).await);
        }
        if !outcome.success() {
            let last_line = outcome.output_tail.lines().last().unwrap_or_default().trim();
            let err = ScanError::Process(format!(
                "exited with code {}: {last_line}",
                outcome.exit_code.map_or("none".to_string(), |c| c.to_string())
            ));
            return Err(self.fail(job, err, exit_code).await);
        }

        // a clean exit without an artifact means no results
        if !tokio::fs::try_exists(&job.output_path).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::write(&job.output_path, b"[]").await {
                return Err(self.fail(job, e.into(), exit_code).await);
            }
        }

        match mode {
            ResultMode::Findings => {
                let findings = match load_artifact(&job.output_path).await {
                    Ok(findings) => findings,
                    Err(e) => return Err(self.fail(job, e.into(), exit_code).await),
                };
                let report = match self.inner.ingestor.ingest(&job.id, &findings).await {
                    Ok(report) => report,
                    Err(e) => return Err(self.fail(job, e, exit_code).await),
                };
                self.complete(job, report, exit_code).await
            }
            ResultMode::Probe => {
                let raw = match tokio::fs::read(&job.output_path).await {
                    Ok(raw) => raw,
                    Err(e) => return Err(self.fail(job, e.into(), exit_code).await),
                };
                let live = match count_probe_results(&raw) {
                    Ok(n) => n,
                    Err(e) => return Err(self.fail(job, e.into(), exit_code).await),
                };
                info!(job_id = %job.id, target = %job.target, live, "probe finished");
                let report = IngestReport {
                    inserted: live,
                    ..IngestReport::default()
                };
                let finish = JobFinish {
                    exit_code,
                    inserted: live as i64,
                    ..JobFinish::default()
                };
                let status = self.finish_or_current(&job.id, &finish).await?;
                Ok(JobOutcome {
                    report,
                    ..JobOutcome::new(job, status)
                })
            }
        }
    }

    async fn run_with_retries(
        &self,
        invocation: &Invocation,
        sink: &mut dyn OutputSink,
        cancel: CancellationToken,
    ) -> Result<ProcessOutcome, RunnerError> {
        let retries = self.inner.config.spawn_retries;
        let mut attempt = 0;
        loop {
            match self.inner.runner.run(invocation, sink, cancel.clone()).await {
                Err(e) if e.is_transient() && attempt < retries => {
                    attempt += 1;
                    warn!(binary = %invocation.binary, attempt, error = %e, "spawn failed, retrying");
                    tokio::time::sleep(SPAWN_BACKOFF * attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn complete(&self, job: &PreparedJob, report: IngestReport, exit_code: Option<i64>) -> Result<JobOutcome> {
        let finish = JobFinish {
            exit_code,
            inserted: report.inserted as i64,
            updated: report.updated as i64,
            ..JobFinish::default()
        };
        let status = self.finish_or_current(&job.id, &finish).await?;
        if report.total() > 0 {
            self.inner.cache.invalidate_pattern("findings");
        }
        let new_findings = if report.inserted > 0 {
            self.inner.db.new_finding_names(&job.id).await?
        } else {
            vec![]
        };
        info!(
            job_id = %job.id,
            target = %job.target,
            inserted = report.inserted,
            updated = report.updated,
            "job completed"
        );
        Ok(JobOutcome {
            report,
            new_findings,
            ..JobOutcome::new(job, status)
        })
    }

    /// Completes the job unless something else (a stop) finished it first.
    async fn finish_or_current(&self, job_id: &str, finish: &JobFinish) -> Result<JobStatus> {
        self.inner.cache.invalidate_pattern("scans");
        if self
            .inner
            .db
            .finish_job(job_id, JobStatus::Completed, finish)
            .await?
        {
            Ok(JobStatus::Completed)
        } else {
            Ok(self.inner.db.job(job_id).await?.status)
        }
    }

    /// Persists the failure and hands the error back to the caller.
    async fn fail(&self, job: &PreparedJob, err: ScanError, exit_code: Option<i64>) -> ScanError {
        error!(job_id = %job.id, target = %job.target, kind = err.kind(), error = %err, "job failed");
        self.inner.cache.invalidate_pattern("scans");
        let finish = JobFinish {
            exit_code,
            failure_kind: Some(err.kind().to_string()),
            failure_reason: Some(err.to_string()),
            ..JobFinish::default()
        };
        if let Err(e) = self
            .inner
            .db
            .finish_job(&job.id, JobStatus::Failed, &finish)
            .await
        {
            error!(job_id = %job.id, error = %e, "failed to persist job failure");
        }
        err
    }
}

fn stopped_finish() -> JobFinish {
    JobFinish {
        failure_reason: Some("stopped by operator".into()),
        ..JobFinish::default()
    }
}

fn exit_note(outcome: &ProcessOutcome) -> String {
    if outcome.killed {
        "[stopped]".into()
    } else if outcome.timed_out {
        "[timed out]".into()
    } else {
        match outcome.exit_code {
            Some(code) => format!("[exit {code}]"),
            None => "[terminated by signal]".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        db::SettingsStore,
        ingest::normalize_all,
        models::FindingStatus,
        testing::{FakeRunner, Script, SAMPLE},
    };

    async fn executor(runner: Arc<FakeRunner>, dir: &tempfile::TempDir) -> JobExecutor {
        executor_with(runner, dir, ExecutorConfig::default()).await
    }

    async fn executor_with(runner: Arc<FakeRunner>, dir: &tempfile::TempDir, config: ExecutorConfig) -> JobExecutor {
        let db = Database::in_memory().await.unwrap();
        let config = ExecutorConfig {
            scans_dir: dir.path().to_path_buf(),
            ..config
        };
        JobExecutor::new(db, runner, Arc::new(ResultCache::default()), config)
    }

    #[tokio::test]
    async fn batch_keeps_going_when_one_target_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new(|inv, _| {
            if inv.args.contains(&"bad.test".to_string()) {
                Script::Exit {
                    code: 2,
                    log: "partial output\nfatal: template load failed\n",
                    results: None,
                }
            } else {
                Script::Exit {
                    code: 0,
                    log: "ok\n",
                    results: Some(SAMPLE),
                }
            }
        });
        let exec = executor(runner, &dir).await;
        let db = exec.db().clone();
        db.add_target("good.test").await.unwrap();
        db.add_target("bad.test").await.unwrap();

        let runs = exec.run_batch(db.scheduler_targets().await.unwrap()).await;
        assert_eq!(runs.len(), 2);

        let good = runs.iter().find(|r| r.target == "good.test").unwrap();
        let outcome = good.result.as_ref().unwrap();
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.report.inserted, 3);
        assert_eq!(db.count_findings().await.unwrap(), 3);

        let bad = runs.iter().find(|r| r.target == "bad.test").unwrap();
        assert!(matches!(bad.result, Err(ScanError::Process(_))));

        let jobs = db.list_jobs(10).await.unwrap();
        let failed = jobs.iter().find(|j| j.target == "bad.test").unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.failure_kind.as_deref(), Some("process"));
        assert_eq!(failed.exit_code, Some(2));
        let log = tokio::fs::read_to_string(failed.log_path.as_ref().unwrap()).await.unwrap();
        assert!(log.contains("partial output"));

        let good_target = db.target_by_address("good.test").await.unwrap().unwrap();
        assert!(good_target.last_scan_date.is_some());
        assert_eq!(good_target.total_findings_count, 3);
        assert!(exec.active_targets().is_empty());
    }

    #[tokio::test]
    async fn empty_rescan_signals_possibly_fixed() {
        let dir = tempfile::tempdir().unwrap();
        // exits cleanly without writing an artifact
        let runner = FakeRunner::new(|_, _| Script::Exit {
            code: 0,
            log: "",
            results: None,
        });
        let exec = executor(runner, &dir).await;
        let db = exec.db().clone();
        Ingestor::new(db.clone())
            .ingest("scan-0", &normalize_all(SAMPLE.as_bytes()).unwrap())
            .await
            .unwrap();
        let finding = db
            .list_findings(&Default::default())
            .await
            .unwrap()
            .into_iter()
            .find(|f| f.template_id == "CVE-2021-44228")
            .unwrap();

        let outcome = exec.rescan_finding(finding.id).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.kind, JobKind::Rescan);
        assert!(outcome.possibly_fixed);

        let after = db.finding(finding.id).await.unwrap();
        assert_eq!(after.status, FindingStatus::New);
        assert_eq!(after.scan_id, "scan-0");
        assert_eq!(db.count_findings().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_unknown_jobs_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(FakeRunner::new(|_, _| Script::BlockUntilCancelled), &dir).await;

        let job_id = exec.spawn_scan(ScanRequest::new("slow.test")).await.unwrap();
        assert!(exec.is_running(&job_id));
        assert_eq!(exec.stop(&job_id).await.unwrap(), JobStatus::Stopped);
        assert_eq!(exec.stop(&job_id).await.unwrap(), JobStatus::Stopped);
        assert_eq!(exec.db().job(&job_id).await.unwrap().status, JobStatus::Stopped);
        assert!(matches!(exec.stop("missing").await, Err(ScanError::NotFound(_))));
    }

    #[tokio::test]
    async fn second_scan_of_same_target_is_rejected_while_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(FakeRunner::new(|_, _| Script::BlockUntilCancelled), &dir).await;

        let first = exec.spawn_scan(ScanRequest::new("a.test")).await.unwrap();
        assert!(matches!(
            exec.spawn_scan(ScanRequest::new("A.test")).await,
            Err(ScanError::AlreadyRunning(_))
        ));
        assert_eq!(exec.active_targets(), vec!["a.test".to_string()]);
        exec.stop(&first).await.unwrap();
    }

    #[tokio::test]
    async fn transient_spawn_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new(|_, call| {
            if call == 0 {
                Script::TransientSpawnFailure
            } else {
                Script::Exit {
                    code: 0,
                    log: "",
                    results: Some("[]"),
                }
            }
        });
        let config = ExecutorConfig {
            spawn_retries: 1,
            ..ExecutorConfig::default()
        };
        let exec = executor_with(runner.clone(), &dir, config).await;
        let outcome = exec.run_scan(ScanRequest::new("a.test")).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn without_retries_spawn_failure_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(FakeRunner::new(|_, _| Script::TransientSpawnFailure), &dir).await;
        let err = exec.run_scan(ScanRequest::new("a.test")).await.unwrap_err();
        assert!(matches!(err, ScanError::Process(_)));
    }

    #[tokio::test]
    async fn garbage_results_fail_with_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(
            FakeRunner::new(|_, _| Script::Exit {
                code: 0,
                log: "",
                results: Some("not json"),
            }),
            &dir,
        )
        .await;
        let err = exec.run_scan(ScanRequest::new("a.test")).await.unwrap_err();
        assert_eq!(err.kind(), "parse");
        let job = &exec.db().list_jobs(1).await.unwrap()[0];
        assert_eq!(job.failure_kind.as_deref(), Some("parse"));
    }

    #[tokio::test]
    async fn probe_follows_scan_when_enabled_for_target() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new(|inv, _| {
            if inv.binary == "httpx" {
                Script::Exit {
                    code: 0,
                    log: "",
                    results: Some("{\"url\":\"https://a.test\"}\n{\"url\":\"http://a.test\"}\n"),
                }
            } else {
                Script::Exit {
                    code: 0,
                    log: "",
                    results: Some(SAMPLE),
                }
            }
        });
        let exec = executor(runner, &dir).await;
        let db = exec.db().clone();
        let target = db.add_target("a.test").await.unwrap();
        db.set_tool_enabled(target.id, true).await.unwrap();
        db.set_setting("scheduler.auto_secondary_scan", "true").await.unwrap();

        let outcome = exec.run_scan(ScanRequest::new("a.test")).await.unwrap();
        let probe_id = outcome.probe_job.expect("probe should have run");
        let probe = db.job(&probe_id).await.unwrap();
        assert_eq!(probe.kind, JobKind::Probe);
        assert_eq!(probe.status, JobStatus::Completed);
        assert_eq!(probe.inserted_count, 2);
    }

    #[tokio::test]
    async fn probe_is_skipped_above_new_findings_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(
            FakeRunner::new(|_, _| Script::Exit {
                code: 0,
                log: "",
                results: Some(SAMPLE),
            }),
            &dir,
        )
        .await;
        let db = exec.db().clone();
        let target = db.add_target("a.test").await.unwrap();
        db.set_tool_enabled(target.id, true).await.unwrap();
        db.set_setting("scheduler.auto_secondary_scan", "true").await.unwrap();
        db.set_setting("tool.max_new_findings", "2").await.unwrap();

        let outcome = exec.run_scan(ScanRequest::new("a.test")).await.unwrap();
        assert_eq!(outcome.report.inserted, 3);
        assert!(outcome.probe_job.is_none());
    }

    #[tokio::test]
    async fn import_validates_then_dedupes_like_a_scan() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(
            FakeRunner::new(|_, _| Script::Exit {
                code: 0,
                log: "",
                results: None,
            }),
            &dir,
        )
        .await;

        let bad = br#"[{"template-id": "x", "info": {"name": "X"}}]"#;
        assert!(matches!(
            exec.import_results(bad, "bad.json").await,
            Err(ScanError::Validation(_))
        ));

        let first = exec.import_results(SAMPLE.as_bytes(), "nuclei.json").await.unwrap();
        assert_eq!(first.kind, JobKind::Import);
        assert_eq!(first.report.inserted, 3);
        assert_eq!(first.new_findings.len(), 3);
        let second = exec.import_results(SAMPLE.as_bytes(), "nuclei.json").await.unwrap();
        assert_eq!(second.report.updated, 3);
        assert_eq!(exec.db().count_findings().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn out_of_scope_targets_are_rejected_before_a_job_exists() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExecutorConfig {
            scope_allowlist: vec!["*.corp.test".into()],
            ..ExecutorConfig::default()
        };
        let exec = executor_with(FakeRunner::new(|_, _| Script::BlockUntilCancelled), &dir, config).await;
        assert!(matches!(
            exec.spawn_scan(ScanRequest::new("evil.test")).await,
            Err(ScanError::Validation(_))
        ));
        assert!(exec.db().list_jobs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn artifact_errors_after_exit_fail_the_job() {
        let dir = tempfile::tempdir().unwrap();
        // the scans directory vanishes while the process runs
        let exec = executor(
            FakeRunner::new(|inv, _| {
                let output = inv
                    .args
                    .iter()
                    .position(|a| a == "-output")
                    .map(|i| PathBuf::from(&inv.args[i + 1]))
                    .unwrap();
                std::fs::remove_dir_all(output.parent().unwrap()).unwrap();
                Script::Exit {
                    code: 0,
                    log: "",
                    results: None,
                }
            }),
            &dir,
        )
        .await;

        let err = exec.run_scan(ScanRequest::new("a.test")).await.unwrap_err();
        assert!(matches!(err, ScanError::Artifact(_)));

        let jobs = exec.db().list_jobs(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[0].failure_kind.as_deref(), Some("storage"));
        assert!(jobs[0].failure_reason.is_some());
        assert!(!exec.is_running(&jobs[0].id));
        assert!(exec.active_targets().is_empty());
    }
}
