use chrono::{Timelike, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, instrument, warn};

type BoxedTask = Box<dyn Fn() -> Pin<Box<dyn Future<Output = Result<(), pipeline_core::Error>> + Send>> + Send + Sync>;

/// The three scheduling disciplines a named job can run under.
pub enum Discipline {
    /// Sleep `interval` after each completion, then run again. Never piles
    /// up: the next run is scheduled only once the previous has resolved.
    FixedInterval { interval: StdDuration },
    /// Run at the next multiple of `boundary_minutes`, plus `buffer` safety
    /// margin, recomputed fresh after each completion.
    WallClockBoundary { boundary_minutes: u32, buffer: StdDuration },
    /// Run once a day at `hh:mm` UTC.
    DailyUtc { hour: u32, minute: u32 },
}

/// A single named recurring job. `stop()` between runs is honoured
/// immediately; a `stop()` mid-run lets the in-flight run finish and then
/// skips scheduling the next one.
pub struct ScheduledJob {
    name: String,
    running: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    last_run: Arc<AtomicI64>,
    next_run: Arc<AtomicI64>,
    skipped: Arc<AtomicI64>,
    notify: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl ScheduledJob {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn last_run(&self) -> Option<chrono::DateTime<Utc>> {
        let ts = self.last_run.load(Ordering::SeqCst);
        if ts == 0 {
            None
        } else {
            chrono::DateTime::from_timestamp(ts, 0)
        }
    }

    /// The timestamp the currently-pending sleep is due to fire, or `None`
    /// once the job has stopped for good.
    pub fn next_run(&self) -> Option<chrono::DateTime<Utc>> {
        if self.stopped.load(Ordering::SeqCst) && !self.running.load(Ordering::SeqCst) {
            return None;
        }
        let ts = self.next_run.load(Ordering::SeqCst);
        if ts == 0 {
            None
        } else {
            chrono::DateTime::from_timestamp(ts, 0)
        }
    }

    pub fn skipped_count(&self) -> i64 {
        self.skipped.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

/// Spawns and owns every named job in the process. Each job runs on its own
/// task; errors inside a task are logged and never propagate to the
/// scheduler itself.
#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip(self, discipline, task), fields(job = name))]
    pub fn spawn(&mut self, name: impl Into<String>, discipline: Discipline, task: BoxedTask) {
        let name = name.into();
        let running = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));
        let last_run = Arc::new(AtomicI64::new(0));
        let next_run = Arc::new(AtomicI64::new(0));
        let skipped = Arc::new(AtomicI64::new(0));
        let notify = Arc::new(Notify::new());

        let job_name = name.clone();
        let running2 = running.clone();
        let stopped2 = stopped.clone();
        let last_run2 = last_run.clone();
        let next_run2 = next_run.clone();
        let skipped2 = skipped.clone();
        let notify2 = notify.clone();

        let handle = tokio::spawn(async move {
            loop {
                if stopped2.load(Ordering::SeqCst) {
                    return;
                }

                let wait = next_wait(&discipline);
                let wait_chrono = chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
                next_run2.store((Utc::now() + wait_chrono).timestamp(), Ordering::SeqCst);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = notify2.notified() => {
                        if stopped2.load(Ordering::SeqCst) {
                            return;
                        }
                    }
                }

                if stopped2.load(Ordering::SeqCst) {
                    return;
                }

                if running2.swap(true, Ordering::SeqCst) {
                    skipped2.fetch_add(1, Ordering::SeqCst);
                    warn!(job = %job_name, "previous run still in flight, skipping trigger");
                    continue;
                }

                if let Err(e) = task().await {
                    error!(job = %job_name, error = %e, "scheduled job failed");
                }

                last_run2.store(Utc::now().timestamp(), Ordering::SeqCst);
                running2.store(false, Ordering::SeqCst);

                if stopped2.load(Ordering::SeqCst) {
                    return;
                }
            }
        });

        self.jobs.push(ScheduledJob {
            name,
            running,
            stopped,
            last_run,
            next_run,
            skipped,
            notify,
            handle,
        });
    }

    pub fn stop_all(&self) {
        for job in &self.jobs {
            job.stop();
        }
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    /// Waits for every job's current run (if any) to finish, bounded by
    /// `timeout`. Used on graceful shutdown.
    pub async fn shutdown(self, timeout: StdDuration) {
        self.stop_all();
        let _ = tokio::time::timeout(timeout, async {
            for job in self.jobs {
                job.join().await;
            }
        })
        .await;
    }
}

fn next_wait(discipline: &Discipline) -> StdDuration {
    match discipline {
        Discipline::FixedInterval { interval } => *interval,
        Discipline::WallClockBoundary { boundary_minutes, buffer } => {
            let now = Utc::now();
            let minute = now.minute();
            let boundary = *boundary_minutes;
            let minutes_to_next = boundary - (minute % boundary);
            let next = now + chrono::Duration::minutes(minutes_to_next as i64);
            let next = next
                .with_second(0)
                .unwrap_or(next)
                .with_nanosecond(0)
                .unwrap_or(next);
            let wait = (next - now).to_std().unwrap_or(StdDuration::from_secs(1));
            wait + *buffer
        }
        Discipline::DailyUtc { hour, minute } => {
            let now = Utc::now();
            let mut target = now
                .date_naive()
                .and_hms_opt(*hour, *minute, 0)
                .expect("valid hh:mm")
                .and_utc();
            if target <= now {
                target += chrono::Duration::days(1);
            }
            (target - now).to_std().unwrap_or(StdDuration::from_secs(1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn fixed_interval_runs_more_than_once_and_stops() {
        let mut scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();

        scheduler.spawn(
            "test-job",
            Discipline::FixedInterval { interval: StdDuration::from_millis(10) },
            Box::new(move || {
                let count = count2.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        tokio::time::sleep(StdDuration::from_millis(60)).await;
        scheduler.shutdown(StdDuration::from_secs(1)).await;

        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn single_flight_skips_overlapping_trigger() {
        let mut scheduler = Scheduler::new();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let c2 = concurrent.clone();
        let m2 = max_concurrent.clone();

        scheduler.spawn(
            "slow-job",
            Discipline::FixedInterval { interval: StdDuration::from_millis(5) },
            Box::new(move || {
                let concurrent = c2.clone();
                let max_concurrent = m2.clone();
                Box::pin(async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_concurrent.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(StdDuration::from_millis(40)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        scheduler.shutdown(StdDuration::from_secs(1)).await;

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn next_run_is_populated_and_clears_after_stop() {
        let mut scheduler = Scheduler::new();
        scheduler.spawn(
            "next-run-job",
            Discipline::FixedInterval { interval: StdDuration::from_secs(30) },
            Box::new(|| Box::pin(async { Ok(()) })),
        );

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        let next = scheduler.jobs()[0].next_run();
        assert!(next.is_some());
        assert!(next.unwrap() > Utc::now());

        scheduler.shutdown(StdDuration::from_secs(1)).await;
    }
}
