use std::collections::{BTreeMap, VecDeque};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::scheduler::job::{Job, JobId, JobStatus};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Per-status job counts reported alongside the status snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub queued: usize,
    pub dispatched: usize,
    pub done: u64,
    pub failed: u64,
}

/// Ordered in-memory job queue.
///
/// Jobs are kept in submission order keyed by their sequence number. Queued
/// jobs are dispatched FIFO; terminal jobs are retired from the active view
/// and only counted.
#[derive(Debug)]
pub struct JobQueue {
    jobs: BTreeMap<u64, Job>,
    pending: VecDeque<u64>,
    next_seq: u64,
    max_jobs: usize,
    done: u64,
    failed: u64,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: BTreeMap::new(),
            pending: VecDeque::new(),
            next_seq: 1,
            max_jobs,
            done: 0,
            failed: 0,
        }
    }

    /// Append a job. Returns false if the queue is at capacity.
    pub fn add_job(&mut self, job: Job) -> bool {
        self.add_batch(vec![job])
    }

    /// Append every job in order, or none of them if they do not all fit.
    pub fn add_batch(&mut self, jobs: Vec<Job>) -> bool {
        if self.jobs.len() + jobs.len() > self.max_jobs {
            return false;
        }
        for mut job in jobs {
            job.seq = self.next_seq;
            job.status = JobStatus::Queued;
            self.next_seq += 1;
            self.pending.push_back(job.seq);
            self.jobs.insert(job.seq, job);
        }
        true
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Take the oldest queued job and mark it dispatched.
    pub fn dispatch_next(&mut self) -> Option<Job> {
        while let Some(seq) = self.pending.pop_front() {
            if let Some(job) = self.jobs.get_mut(&seq) {
                if job.status == JobStatus::Queued {
                    job.status = JobStatus::Dispatched;
                    job.dispatched_at = Some(Utc::now());
                    return Some(job.clone());
                }
            }
        }
        None
    }

    /// Put a dispatched job back at the head of the queue.
    pub fn requeue(&mut self, seq: u64) -> bool {
        match self.jobs.get_mut(&seq) {
            Some(job) if job.status == JobStatus::Dispatched => {
                job.status = JobStatus::Queued;
                job.dispatched_at = None;
                self.pending.push_front(seq);
                true
            }
            _ => false,
        }
    }

    /// Record a worker result for the oldest dispatched job with this id.
    /// The job is retired from the queue and returned.
    pub fn complete(&mut self, id: &JobId, success: bool) -> Option<Job> {
        let seq = self
            .jobs
            .values()
            .find(|j| j.status == JobStatus::Dispatched && &j.id == id)
            .map(|j| j.seq)?;

        let mut job = self.jobs.remove(&seq)?;
        job.finished_at = Some(Utc::now());
        if success {
            job.status = JobStatus::Done;
            self.done += 1;
        } else {
            job.status = JobStatus::Failed;
            self.failed += 1;
        }
        Some(job)
    }

    pub fn get_job(&self, seq: u64) -> Option<&Job> {
        self.jobs.get(&seq)
    }

    /// Identifiers of queued and dispatched jobs, in submission order.
    pub fn active_ids(&self) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|j| j.status.is_active())
            .map(|j| j.id.clone())
            .collect()
    }

    pub fn counts(&self) -> JobCounts {
        let dispatched = self
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Dispatched)
            .count();
        JobCounts {
            queued: self.jobs.len() - dispatched,
            dispatched,
            done: self.done,
            failed: self.failed,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}
