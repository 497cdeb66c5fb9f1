//! Durable job records.
//!
//! Every job owns a directory `<instance>/jobs/<id>/` holding its record
//! (`info.json`), its append-only log (`log.txt`) and its inputs and
//! outputs. Records are rewritten through a temp file and `rename`, and the
//! in-memory copy only changes after the write succeeds, so a reader never
//! observes a state that is not on disk.
//!
//! Submitted files are copied into `<instance>/staging/` before the job
//! exists and renamed into place on creation; deleted jobs are renamed back
//! out and removed later. The store itself only ever renames trees, so
//! holding its lock never means waiting on a large copy or removal.
//!
//! The store is not internally synchronized. The scheduler owns the only
//! writable handle (behind an `RwLock`) and serializes every mutation.

pub mod files;
pub mod job;

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};

use crate::error::{PipelineError, Result};
use crate::pipeline::{Stage, Toolchain};

pub use files::{FileTree, StagedDir, ARCHIVE_NAME, CODE_DIR};
pub use job::{Job, JobId, JobState};

use files::{INFO_FILE, INFO_TMP_FILE, LOG_FILE};

const MAX_ID_ATTEMPTS: usize = 16;

/// Everything needed to create a job record. Validation and stage-sequence
/// resolution happen before this reaches the store.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub toolchain: Toolchain,
    pub config: BTreeMap<String, String>,
    pub stages: Vec<Stage>,
}

/// A job directory whose record could not be loaded.
#[derive(Debug, Clone)]
pub struct CorruptRecord {
    pub dir: PathBuf,
    pub error: String,
}

#[derive(Debug)]
pub struct JobStore {
    root: PathBuf,
    staging: PathBuf,
    jobs: HashMap<JobId, Job>,
    next_seq: u64,
    corrupt: Vec<CorruptRecord>,
}

impl JobStore {
    /// Open (or create) the store under `instance_dir` and load every job.
    /// Unreadable records are skipped and reported, never fatal.
    pub fn open(instance_dir: impl AsRef<Path>) -> Result<Self> {
        let root = instance_dir.as_ref().join("jobs");
        fs::create_dir_all(&root)?;
        // Leftovers are interrupted imports or deletions; none is a job.
        let staging = instance_dir.as_ref().join("staging");
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let mut jobs = HashMap::new();
        let mut corrupt = Vec::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            match load_job(&dir) {
                Ok(job) => {
                    jobs.insert(job.id.clone(), job);
                }
                Err(e) => {
                    tracing::error!(dir = %dir.display(), error = %e, "Unreadable job record");
                    corrupt.push(CorruptRecord {
                        dir,
                        error: e.to_string(),
                    });
                }
            }
        }

        let next_seq = jobs.values().map(|j| j.seq + 1).max().unwrap_or(0);
        tracing::info!(
            root = %root.display(),
            jobs = jobs.len(),
            corrupt = corrupt.len(),
            "Job store opened"
        );

        Ok(Self {
            root,
            staging,
            jobs,
            next_seq,
            corrupt,
        })
    }

    /// Where [`StagedDir`]s are created.
    pub fn staging_root(&self) -> &Path {
        &self.staging
    }

    pub fn corrupt_records(&self) -> &[CorruptRecord] {
        &self.corrupt
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Create a job in `queued` at stage 0 with a fresh id, renaming the
    /// staged files into place as its directory. On error the staged tree
    /// is still where it was and the caller discards it.
    pub fn create(&mut self, new: NewJob, files: &StagedDir) -> Result<JobId> {
        let (id, dir) = self.allocate_dir()?;
        fs::rename(files.path(), &dir)?;

        let state = if new.stages.is_empty() {
            JobState::Done
        } else {
            JobState::Queued
        };
        let job = Job {
            id: id.clone(),
            name: if new.name.trim().is_empty() {
                id.to_string()
            } else {
                new.name
            },
            toolchain: new.toolchain,
            config: new.config,
            stages: new.stages,
            current_stage_index: 0,
            state,
            started: Utc::now(),
            seq: self.next_seq,
            failure: None,
            make_conf: BTreeMap::new(),
            log: String::new(),
            file_root: dir.clone(),
        };

        let persisted = write_info(&dir, &job).and_then(|_| {
            fs::File::create(dir.join(LOG_FILE))?;
            Ok(())
        });
        if let Err(e) = persisted {
            let _ = fs::remove_file(dir.join(INFO_FILE));
            if let Err(undo) = fs::rename(&dir, files.path()) {
                tracing::error!(dir = %dir.display(), error = %undo, "Half-created job directory left in place");
            }
            return Err(e);
        }

        self.next_seq += 1;
        self.jobs.insert(id.clone(), job);
        Ok(id)
    }

    /// A fresh id whose directory does not exist yet. The store is the
    /// only creator of job directories, so the path stays free until the
    /// staged tree is renamed onto it.
    fn allocate_dir(&self) -> Result<(JobId, PathBuf)> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = JobId::generate();
            let dir = self.root.join(id.as_str());
            if self.jobs.contains_key(&id) {
                continue;
            }
            match fs::symlink_metadata(&dir) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((id, dir)),
                Ok(_) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(PipelineError::Internal(
            "could not allocate a unique job id".to_string(),
        ))
    }

    pub fn get(&self, id: &JobId) -> Result<&Job> {
        self.jobs
            .get(id)
            .ok_or_else(|| PipelineError::JobNotFound(id.to_string()))
    }

    /// All jobs in no particular order.
    pub fn list(&self) -> Vec<&Job> {
        self.jobs.values().collect()
    }

    /// Apply `mutate` to a copy of the job, persist the copy, then publish it.
    pub fn update<F>(&mut self, id: &JobId, mutate: F) -> Result<&Job>
    where
        F: FnOnce(&mut Job),
    {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| PipelineError::JobNotFound(id.to_string()))?;

        let log = std::mem::take(&mut job.log);
        let mut next = job.clone();
        mutate(&mut next);
        next.id = job.id.clone();

        if let Err(e) = write_info(&job.file_root, &next) {
            job.log = log;
            return Err(e);
        }
        next.log = log;
        *job = next;
        Ok(job)
    }

    pub fn set_state(&mut self, id: &JobId, state: JobState) -> Result<()> {
        self.update(id, |job| job.state = state)?;
        Ok(())
    }

    /// Compare-and-set on the job state. Fails with `CorruptState` when the
    /// job is not in `expected`, which is how a second claim for the same
    /// job is refused.
    pub fn transition(&mut self, id: &JobId, expected: JobState, next: JobState) -> Result<()> {
        let current = self.get(id)?.state;
        if current != expected {
            return Err(PipelineError::CorruptState {
                job_id: id.to_string(),
                detail: format!("expected state {}, found {}", expected, current),
            });
        }
        self.set_state(id, next)
    }

    /// `name` renames the job; any other key overrides a config value. The
    /// cached stage sequence is left as it was.
    pub fn set_config_field(&mut self, id: &JobId, key: &str, value: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "config key must not be empty".to_string(),
            ));
        }
        self.update(id, |job| {
            if key == "name" {
                job.name = value.to_string();
            } else {
                job.config.insert(key.to_string(), value.to_string());
            }
        })?;
        Ok(())
    }

    pub fn append_log(&mut self, id: &JobId, text: &str) -> Result<()> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| PipelineError::JobNotFound(id.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(job.file_root.join(LOG_FILE))?;
        file.write_all(text.as_bytes())?;
        job.log.push_str(text);
        Ok(())
    }

    /// Append a timestamped event line to the job log.
    pub fn log_event(&mut self, id: &JobId, message: &str) -> Result<()> {
        let line = format!(
            "{} {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            message
        );
        self.append_log(id, &line)
    }

    /// Remove a job. Its directory is moved into the staging area and
    /// returned; the caller discards it, off the scheduler task.
    pub fn delete(&mut self, id: &JobId) -> Result<StagedDir> {
        let job = self.get(id)?;
        let trash = StagedDir::reserve(&self.staging)?;
        match fs::rename(&job.file_root, trash.path()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.jobs.remove(id);
        Ok(trash)
    }

    pub fn list_files(&self, id: &JobId) -> Result<Vec<String>> {
        files::list_files(&self.get(id)?.file_root)
    }
}

fn load_job(dir: &Path) -> Result<Job> {
    let text = fs::read_to_string(dir.join(INFO_FILE))?;
    let mut job: Job = serde_json::from_str(&text)?;

    let dir_name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if job.id.as_str() != dir_name {
        return Err(PipelineError::CorruptState {
            job_id: job.id.to_string(),
            detail: format!("record stored under directory '{}'", dir_name),
        });
    }
    if job.current_stage_index > job.stages.len() {
        return Err(PipelineError::CorruptState {
            job_id: job.id.to_string(),
            detail: format!(
                "stage index {} beyond {} stages",
                job.current_stage_index,
                job.stages.len()
            ),
        });
    }

    job.log = match fs::read_to_string(dir.join(LOG_FILE)) {
        Ok(log) => log,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    job.file_root = dir.to_path_buf();
    Ok(job)
}

fn write_info(dir: &Path, job: &Job) -> Result<()> {
    let tmp = dir.join(INFO_TMP_FILE);
    fs::write(&tmp, serde_json::to_vec_pretty(job)?)?;
    fs::rename(&tmp, dir.join(INFO_FILE))?;
    Ok(())
}
