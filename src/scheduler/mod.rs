/**
 * Scheduler
 *
 * Periodic janitor. Each job carries a short and a long interval; a job
 * reporting leftover work is re-armed on the short one. Every cycle the
 * driver runs the due jobs, then sleeps until the nearest deadline,
 * capped so config changes and clock oddities cannot park it forever.
 */

pub mod jobs;

use std::time::Duration;
use tokio::time::Instant;

pub use jobs::{JobContext, JobKind};

const SHORT_INTERVAL: Duration = Duration::from_secs(60);
const LONG_INTERVAL: Duration = Duration::from_secs(600);
/// Upper bound on one driver sleep.
const MAX_SLEEP: Duration = Duration::from_secs(1200);

struct ScheduledJob {
    kind: JobKind,
    short_interval: Duration,
    long_interval: Duration,
    next_on: Instant,
}

impl ScheduledJob {
    /// Re-arm from the job's outcome: short when a full batch ran and
    /// more work likely remains, long on a clean pass or a failure.
    fn rearm(&mut self, outcome: Result<bool, crate::error::ApiError>) {
        let interval = match outcome {
            Ok(true) => self.short_interval,
            Ok(false) => self.long_interval,
            Err(e) => {
                tracing::error!(job = self.kind.name(), "[Scheduler] Job failed: {e}");
                self.long_interval
            }
        };
        self.next_on = Instant::now() + interval;
    }
}

/// Time until the nearest deadline, capped at `MAX_SLEEP`.
fn next_sleep(jobs: &[ScheduledJob]) -> Duration {
    let now = Instant::now();
    jobs.iter()
        .map(|job| job.next_on.saturating_duration_since(now))
        .min()
        .unwrap_or(MAX_SLEEP)
        .min(MAX_SLEEP)
}

pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
    ctx: JobContext,
}

impl Scheduler {
    /// Build the standard job set, all due immediately.
    pub fn new(ctx: JobContext) -> Self {
        let now = Instant::now();
        let jobs = [JobKind::FileCleanup, JobKind::PostCleanup, JobKind::PendingEmail]
            .into_iter()
            .map(|kind| ScheduledJob {
                kind,
                short_interval: SHORT_INTERVAL,
                long_interval: LONG_INTERVAL,
                next_on: now,
            })
            .collect();
        Self { jobs, ctx }
    }

    /// Drive the jobs forever.
    pub async fn run(mut self) {
        tracing::info!("[Scheduler] Started");
        loop {
            let sleep = self.cycle().await;
            tokio::time::sleep(sleep).await;
        }
    }

    /// Run every due job once, re-arm it from its boolean hint, and
    /// return how long to sleep until the next deadline.
    async fn cycle(&mut self) -> Duration {
        let now = Instant::now();
        for job in &mut self.jobs {
            if job.next_on > now {
                continue;
            }
            let outcome = job.kind.run(&self.ctx).await;
            job.rearm(outcome);
        }
        next_sleep(&self.jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use pretty_assertions::assert_eq;

    fn job(kind: JobKind, next_on: Instant) -> ScheduledJob {
        ScheduledJob {
            kind,
            short_interval: SHORT_INTERVAL,
            long_interval: LONG_INTERVAL,
            next_on,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_follows_outcome_hint() {
        let mut scheduled = job(JobKind::FileCleanup, Instant::now());

        scheduled.rearm(Ok(true));
        assert_eq!(scheduled.next_on - Instant::now(), SHORT_INTERVAL);

        scheduled.rearm(Ok(false));
        assert_eq!(scheduled.next_on - Instant::now(), LONG_INTERVAL);

        scheduled.rearm(Err(ApiError::internal("db unavailable")));
        assert_eq!(scheduled.next_on - Instant::now(), LONG_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_targets_nearest_deadline() {
        let now = Instant::now();
        let jobs = vec![
            job(JobKind::FileCleanup, now + Duration::from_secs(90)),
            job(JobKind::PostCleanup, now + Duration::from_secs(300)),
        ];
        assert_eq!(next_sleep(&jobs), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_capped() {
        let far = vec![job(
            JobKind::PendingEmail,
            Instant::now() + Duration::from_secs(10_000),
        )];
        assert_eq!(next_sleep(&far), MAX_SLEEP);
        assert_eq!(next_sleep(&[]), MAX_SLEEP);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_deadline_saturates_to_zero() {
        let now = Instant::now();
        tokio::time::advance(Duration::from_secs(5)).await;
        let jobs = vec![job(JobKind::PostCleanup, now)];
        assert_eq!(next_sleep(&jobs), Duration::ZERO);
    }
}
