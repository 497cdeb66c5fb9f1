use std::collections::BTreeMap;
use std::fs;
use std::future::Future;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::ipc::{ClaimToken, WorkerMessage};
use crate::store::JobId;
use crate::worker::planner::{parse_make_conf, CommandSpec, OutputMode, Step};

/// How long output readers may keep going after their process ended.
const DRAIN_GRACE: Duration = Duration::from_secs(1);
/// Flush a pending log batch early once it grows past this.
const MAX_LOG_BATCH: usize = 16 * 1024;

/// Sends log text and build variables upstream on behalf of one claim.
#[derive(Debug, Clone)]
pub struct ClaimReporter {
    tx: mpsc::Sender<WorkerMessage>,
    claim: ClaimToken,
    job_id: JobId,
}

impl ClaimReporter {
    pub fn new(tx: mpsc::Sender<WorkerMessage>, claim: ClaimToken, job_id: JobId) -> Self {
        Self { tx, claim, job_id }
    }

    /// Raw process output.
    pub async fn append(&self, text: String) {
        if text.is_empty() {
            return;
        }
        let _ = self
            .tx
            .send(WorkerMessage::LogAppend {
                claim: self.claim,
                job_id: self.job_id.clone(),
                text,
            })
            .await;
    }

    /// A timestamped line written by the worker itself.
    pub async fn event(&self, message: &str) {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.append(format!("{} {}\n", stamp, message)).await;
    }

    pub async fn make_conf(&self, values: BTreeMap<String, String>) {
        let _ = self
            .tx
            .send(WorkerMessage::MakeConf {
                claim: self.claim,
                job_id: self.job_id.clone(),
                values,
            })
            .await;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// The claim was withdrawn; nothing should be reported.
    pub cancelled: bool,
}

#[derive(Debug)]
enum StepError {
    Exit(Option<i32>),
    Failed(String),
    Timeout,
    Cancelled,
}

/// Runs a stage's steps in order inside the job directory, streaming
/// output to the coordinator. The first failing step fails the stage.
#[derive(Debug, Clone)]
pub struct StageExecutor {
    flush_interval: Duration,
    timeout: Option<Duration>,
    make_conf_vars: Vec<String>,
}

impl StageExecutor {
    pub fn new(flush_interval: Duration) -> Self {
        Self {
            flush_interval,
            timeout: None,
            make_conf_vars: Vec::new(),
        }
    }

    /// Wall-clock limit for the whole stage.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_make_conf_vars(mut self, vars: Vec<String>) -> Self {
        self.make_conf_vars = vars;
        self
    }

    pub async fn run(
        &self,
        steps: &[Step],
        job_root: &Path,
        reporter: &ClaimReporter,
        cancel: &CancellationToken,
    ) -> StageOutcome {
        let deadline = self.timeout.map(|t| Instant::now() + t);

        for step in steps {
            let result = match step {
                Step::Run(spec) => self
                    .run_command(spec, job_root, reporter, deadline, cancel)
                    .await
                    .map(|captured| (spec, captured)),
                Step::CollapseSingleDirectory(dir) => {
                    match collapse_single_directory(&job_root.join(dir)) {
                        Ok(Some(name)) => {
                            reporter
                                .event(&format!("collapsed directory {}", name))
                                .await;
                            continue;
                        }
                        Ok(None) => continue,
                        Err(e) => Err(StepError::Failed(format!(
                            "could not collapse {}: {}",
                            dir.display(),
                            e
                        ))),
                    }
                }
                Step::Sleep(delay) => {
                    reporter
                        .event(&format!("waiting {} seconds", delay.as_secs()))
                        .await;
                    match guard(tokio::time::sleep(*delay), deadline, cancel).await {
                        Ok(()) => continue,
                        Err(e) => Err(e),
                    }
                }
                Step::AwaitAfi {
                    xclbin_dir,
                    poll_interval,
                } => match self
                    .await_afi(&job_root.join(xclbin_dir), *poll_interval, job_root, reporter, deadline, cancel)
                    .await
                {
                    Ok(()) => continue,
                    Err(e) => Err(e),
                },
            };

            match result {
                Ok((spec, Some(captured))) if spec.output == OutputMode::MakeConf => {
                    let values = parse_make_conf(&captured, &self.make_conf_vars);
                    reporter.event(&format!("make conf added {:?}", values)).await;
                    reporter.make_conf(values).await;
                }
                Ok(_) => {}
                Err(e) => return self.failed(e, reporter).await,
            }
        }

        StageOutcome {
            success: true,
            exit_code: Some(0),
            ..StageOutcome::default()
        }
    }

    async fn failed(&self, error: StepError, reporter: &ClaimReporter) -> StageOutcome {
        match error {
            StepError::Exit(code) => {
                match code {
                    Some(code) => reporter.event(&format!("command failed ({})", code)).await,
                    None => reporter.event("command killed by a signal").await,
                }
                StageOutcome {
                    exit_code: code,
                    ..StageOutcome::default()
                }
            }
            StepError::Failed(message) => {
                reporter.event(&message).await;
                StageOutcome::default()
            }
            StepError::Timeout => {
                let secs = self.timeout.map_or(0, |t| t.as_secs());
                reporter
                    .event(&format!("stage timed out after {} seconds", secs))
                    .await;
                StageOutcome {
                    timed_out: true,
                    ..StageOutcome::default()
                }
            }
            StepError::Cancelled => {
                reporter.event("stage cancelled").await;
                StageOutcome {
                    cancelled: true,
                    ..StageOutcome::default()
                }
            }
        }
    }

    /// Run one command, returning its stdout when its output mode captures it.
    async fn run_command(
        &self,
        spec: &CommandSpec,
        job_root: &Path,
        reporter: &ClaimReporter,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, StepError> {
        let Some(program) = spec.argv.first() else {
            return Err(StepError::Failed("empty command".to_string()));
        };
        reporter.event(&format!("$ {}", spec.display())).await;

        let cwd = job_root.join(&spec.cwd);
        if !cwd.is_dir() {
            return Err(StepError::Failed(format!(
                "working directory {} does not exist",
                spec.cwd.display()
            )));
        }

        let mut command = Command::new(program);
        command
            .args(&spec.argv[1..])
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StepError::Failed(format!("command {} not found", program)));
            }
            Err(e) => {
                return Err(StepError::Failed(format!(
                    "command {} could not start: {}",
                    program, e
                )));
            }
        };
        tracing::debug!(command = %spec.display(), cwd = %cwd.display(), "Spawned stage command");

        let (chunk_tx, chunk_rx) = mpsc::channel::<String>(256);
        let forwarder = tokio::spawn(forward_output(
            chunk_rx,
            reporter.clone(),
            self.flush_interval,
        ));

        let mut pumps: Vec<JoinHandle<()>> = Vec::new();
        let mut collector: Option<JoinHandle<String>> = None;
        if let Some(stdout) = child.stdout.take() {
            if spec.output == OutputMode::Log {
                pumps.push(tokio::spawn(pump_lines(stdout, chunk_tx.clone())));
            } else {
                collector = Some(tokio::spawn(collect(stdout)));
            }
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_lines(stderr, chunk_tx.clone())));
        }
        drop(chunk_tx);

        let waited = guard(child.wait(), deadline, cancel).await;
        if waited.is_err() {
            let _ = child.kill().await;
        }

        for mut pump in pumps {
            if tokio::time::timeout(DRAIN_GRACE, &mut pump).await.is_err() {
                pump.abort();
            }
        }
        let captured = match collector {
            Some(mut handle) => match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
                Ok(Ok(text)) => Some(text),
                Ok(Err(_)) => Some(String::new()),
                Err(_) => {
                    handle.abort();
                    Some(String::new())
                }
            },
            None => None,
        };
        let _ = forwarder.await;

        match waited? {
            Ok(status) if status.success() => Ok(captured),
            Ok(status) => Err(StepError::Exit(status.code())),
            Err(e) => Err(StepError::Failed(format!("waiting for {} failed: {}", program, e))),
        }
    }

    async fn await_afi(
        &self,
        xclbin_dir: &Path,
        poll_interval: Duration,
        job_root: &Path,
        reporter: &ClaimReporter,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let image_id = read_afi_id(xclbin_dir).map_err(StepError::Failed)?;
        reporter.event(&format!("AFI id {}", image_id)).await;

        let describe = CommandSpec::new([
            "aws",
            "ec2",
            "describe-fpga-images",
            "--fpga-image-ids",
            image_id.as_str(),
        ])
        .output(OutputMode::Capture);

        loop {
            let output = self
                .run_command(&describe, job_root, reporter, deadline, cancel)
                .await?
                .unwrap_or_default();
            let status = afi_state(&output).ok_or_else(|| {
                StepError::Failed("could not read AFI state from describe-fpga-images".to_string())
            })?;
            reporter.event(&format!("AFI status: {}", status)).await;
            match status.as_str() {
                "available" => return Ok(()),
                "failed" | "unavailable" => {
                    return Err(StepError::Failed(format!("AFI {} is {}", image_id, status)));
                }
                _ => {}
            }
            guard(tokio::time::sleep(poll_interval), deadline, cancel).await?;
        }
    }
}

/// Resolve `fut` unless the deadline passes or the claim is cancelled first.
async fn guard<F: Future>(
    fut: F,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Result<F::Output, StepError> {
    let expiry = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        out = fut => Ok(out),
        _ = expiry => Err(StepError::Timeout),
        _ = cancel.cancelled() => Err(StepError::Cancelled),
    }
}

async fn pump_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if tx
                    .send(String::from_utf8_lossy(&buf).into_owned())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

async fn collect<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

/// Batch output chunks into `LogAppend` messages every flush interval.
async fn forward_output(
    mut rx: mpsc::Receiver<String>,
    reporter: ClaimReporter,
    flush_interval: Duration,
) {
    let mut pending = String::new();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    pending.push_str(&chunk);
                    if pending.len() >= MAX_LOG_BATCH {
                        reporter.append(std::mem::take(&mut pending)).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    reporter.append(std::mem::take(&mut pending)).await;
                }
            }
        }
    }
    reporter.append(pending).await;
}

/// Returns the collapsed directory's name, or `None` when there was
/// nothing to do.
fn collapse_single_directory(dir: &Path) -> io::Result<Option<String>> {
    let entries: Vec<fs::DirEntry> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    let [only] = entries.as_slice() else {
        return Ok(None);
    };
    if !only.file_type()?.is_dir() {
        return Ok(None);
    }

    let name = only.file_name().to_string_lossy().into_owned();
    // Move aside first so a child with the same name cannot collide.
    let staging = dir.join(format!(".collapse-{}", name));
    fs::rename(only.path(), &staging)?;
    for entry in fs::read_dir(&staging)? {
        let entry = entry?;
        fs::rename(entry.path(), dir.join(entry.file_name()))?;
    }
    fs::remove_dir(&staging)?;
    Ok(Some(name))
}

fn read_afi_id(xclbin_dir: &Path) -> Result<String, String> {
    let mut candidates: Vec<_> = fs::read_dir(xclbin_dir)
        .map_err(|e| format!("cannot read {}: {}", xclbin_dir.display(), e))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with("afi_id.txt"))
        })
        .collect();
    candidates.sort();
    let path = candidates
        .first()
        .ok_or_else(|| "no AFI id file was produced".to_string())?;
    let text = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let value: serde_json::Value = serde_json::from_str(&text).map_err(|e| e.to_string())?;
    value["FpgaImageId"]
        .as_str()
        .map(String::from)
        .ok_or_else(|| format!("{} has no FpgaImageId", path.display()))
}

fn afi_state(describe_output: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(describe_output).ok()?;
    value["FpgaImages"][0]["State"]["Code"]
        .as_str()
        .map(String::from)
}
