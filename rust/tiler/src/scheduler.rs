// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parse scheduler.
//!
//! Bounds how many parse+tile jobs run at once. Excess submissions queue
//! in arrival order and each queued job runs exactly once when a slot
//! frees. A job's slot is reclaimed on success, failure and panic alike,
//! and the job's temporary input file is deleted regardless of outcome.

use crate::error::Result;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Maximum number of jobs running at once. The default reserves three
    /// cores (system, container runtime, main thread) like the original
    /// deployment did, but the bound is explicit and tunable.
    pub max_concurrent_jobs: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: num_cpus::get().saturating_sub(3).max(1),
        }
    }
}

/// Identity of a submitted job, echoed back in its completion event.
#[derive(Debug, Clone)]
pub struct JobMeta {
    pub model_id: String,
    pub name: String,
    /// Temporary input file, deleted once the job finished either way.
    pub temp_file: Option<PathBuf>,
}

/// Completion event of one job.
#[derive(Debug)]
pub enum JobEvent {
    Success { meta: JobMeta },
    Failure { meta: JobMeta, message: String },
}

/// A parse+tile job body. Runs on the blocking thread pool.
pub type TileJob = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct QueuedJob {
    meta: JobMeta,
    job: TileJob,
}

struct Inner {
    active: usize,
    queue: VecDeque<QueuedJob>,
}

/// Bounded-concurrency scheduler for tiling jobs.
pub struct ParseScheduler {
    max_jobs: usize,
    inner: Arc<Mutex<Inner>>,
    events: mpsc::UnboundedSender<JobEvent>,
}

impl ParseScheduler {
    /// Create a scheduler and the receiving end of its completion events.
    pub fn new(settings: SchedulerSettings) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            max_jobs: settings.max_concurrent_jobs.max(1),
            inner: Arc::new(Mutex::new(Inner {
                active: 0,
                queue: VecDeque::new(),
            })),
            events,
        };
        (scheduler, receiver)
    }

    /// Submit a job: runs immediately if a slot is free, queues otherwise.
    pub fn submit(&self, meta: JobMeta, job: TileJob) {
        let start_now = {
            let mut inner = self.inner.lock().expect("scheduler state poisoned");
            if inner.active < self.max_jobs {
                inner.active += 1;
                Some(job)
            } else {
                tracing::debug!(model = %meta.model_id, "All slots busy, job queued");
                inner.queue.push_back(QueuedJob { meta: meta.clone(), job });
                None
            }
        };
        if let Some(job) = start_now {
            launch(
                self.inner.clone(),
                self.events.clone(),
                self.max_jobs,
                QueuedJob { meta, job },
            );
        }
    }

    /// Number of currently running jobs.
    pub fn active_jobs(&self) -> usize {
        self.inner.lock().expect("scheduler state poisoned").active
    }

    /// Number of jobs waiting for a slot.
    pub fn queued_jobs(&self) -> usize {
        self.inner
            .lock()
            .expect("scheduler state poisoned")
            .queue
            .len()
    }
}

fn launch(
    inner: Arc<Mutex<Inner>>,
    events: mpsc::UnboundedSender<JobEvent>,
    max_jobs: usize,
    queued: QueuedJob,
) {
    let QueuedJob { meta, job } = queued;
    tokio::spawn(async move {
        tracing::debug!(model = %meta.model_id, name = %meta.name, "Job started");

        let outcome = tokio::task::spawn_blocking(job).await;
        let event = match outcome {
            Ok(Ok(())) => JobEvent::Success { meta: meta.clone() },
            Ok(Err(error)) => {
                tracing::error!(model = %meta.model_id, error = %error, "Job failed");
                JobEvent::Failure {
                    meta: meta.clone(),
                    message: error.to_string(),
                }
            }
            Err(join_error) => {
                tracing::error!(model = %meta.model_id, error = %join_error, "Job crashed");
                JobEvent::Failure {
                    meta: meta.clone(),
                    message: format!("job crashed: {join_error}"),
                }
            }
        };

        // Reclaim the slot before reporting, so observers that saw the
        // event also see the freed slot.
        let next = {
            let mut guard = inner.lock().expect("scheduler state poisoned");
            guard.active -= 1;
            if guard.active < max_jobs {
                let next = guard.queue.pop_front();
                if next.is_some() {
                    guard.active += 1;
                }
                next
            } else {
                None
            }
        };

        // The temporary input is no longer needed either way
        if let Some(path) = &meta.temp_file {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed job input"),
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "Failed to remove job input")
                }
            }
        }

        let _ = events.send(event);

        if let Some(queued) = next {
            launch(inner, events, max_jobs, queued);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn meta(id: usize) -> JobMeta {
        JobMeta {
            model_id: format!("model-{id}"),
            name: format!("job-{id}"),
            temp_file: None,
        }
    }

    async fn drain(receiver: &mut mpsc::UnboundedReceiver<JobEvent>, count: usize) -> Vec<JobEvent> {
        let mut events = Vec::with_capacity(count);
        for _ in 0..count {
            events.push(receiver.recv().await.expect("scheduler dropped"));
        }
        events
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queued_jobs_run_in_fifo_order() {
        let (scheduler, mut events) = ParseScheduler::new(SchedulerSettings {
            max_concurrent_jobs: 1,
        });

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4usize {
            let order = order.clone();
            scheduler.submit(
                meta(i),
                Box::new(move || {
                    order.lock().unwrap().push(i);
                    std::thread::sleep(Duration::from_millis(10));
                    Ok(())
                }),
            );
        }

        drain(&mut events, 4).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(scheduler.active_jobs(), 0);
        assert_eq!(scheduler.queued_jobs(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_never_exceeds_the_bound() {
        let (scheduler, mut events) = ParseScheduler::new(SchedulerSettings {
            max_concurrent_jobs: 2,
        });

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..6usize {
            let running = running.clone();
            let peak = peak.clone();
            scheduler.submit(
                meta(i),
                Box::new(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }

        assert!(scheduler.active_jobs() <= 2);

        drain(&mut events, 6).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.active_jobs(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failures_and_panics_reclaim_slots_and_inputs() {
        let (scheduler, mut events) = ParseScheduler::new(SchedulerSettings {
            max_concurrent_jobs: 1,
        });

        let temp = std::env::temp_dir().join(format!("tilestream-sched-{}", std::process::id()));
        std::fs::write(&temp, b"input").unwrap();

        let failing = JobMeta {
            temp_file: Some(temp.clone()),
            ..meta(0)
        };
        scheduler.submit(
            failing,
            Box::new(|| {
                Err(crate::Error::Output("boom".into()))
            }),
        );
        scheduler.submit(meta(1), Box::new(|| panic!("worker crashed")));
        scheduler.submit(meta(2), Box::new(|| Ok(())));

        let events = drain(&mut events, 3).await;
        assert!(matches!(&events[0], JobEvent::Failure { meta, message }
            if meta.model_id == "model-0" && message.contains("boom")));
        assert!(matches!(&events[1], JobEvent::Failure { meta, .. }
            if meta.model_id == "model-1"));
        assert!(matches!(&events[2], JobEvent::Success { meta }
            if meta.model_id == "model-2"));

        assert!(!temp.exists());
        assert_eq!(scheduler.active_jobs(), 0);
    }
}
