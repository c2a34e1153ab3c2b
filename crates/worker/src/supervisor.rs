use anyhow::Result;
use compressd_core::pipeline::{process_job, PipelineContext};
use compressd_core::{Broker, Config};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, Duration, Instant};
use tracing::{error, info, warn};

/// Limits in-flight jobs to `parallel_limit`, the same permit-acquire-then-run
/// shape the teacher's `JobExecutor` uses for its own concurrency cap.
struct JobExecutor {
    semaphore: Arc<Semaphore>,
}

impl JobExecutor {
    fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        }
    }
}

/// Token-refill gate capping claims to `rate_per_sec` per second: one permit
/// refills every `1/rate_per_sec`, up to a bucket of `rate_per_sec` permits,
/// so the worker can't burst-claim more than its concurrency cap even when
/// every slot is free at once.
struct ClaimRateLimiter {
    rate_per_sec: u32,
    state: Mutex<(f64, Instant)>,
}

impl ClaimRateLimiter {
    fn new(rate_per_sec: u32) -> Self {
        let rate_per_sec = rate_per_sec.max(1);
        Self {
            rate_per_sec,
            state: Mutex::new((rate_per_sec as f64, Instant::now())),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut guard = self.state.lock().await;
                let (tokens, last) = &mut *guard;
                let now = Instant::now();
                let elapsed = now.duration_since(*last).as_secs_f64();
                *tokens = (*tokens + elapsed * self.rate_per_sec as f64).min(self.rate_per_sec as f64);
                *last = now;

                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - *tokens) / self.rate_per_sec as f64))
                }
            };
            match wait {
                None => return,
                Some(d) => sleep(d).await,
            }
        }
    }
}

/// Claims jobs from the broker and runs them with bounded concurrency,
/// until `shutdown` fires. A stalled claim block just means the queue was
/// empty; any other broker error triggers the restart-with-backoff path one
/// level up in `run_supervised`.
async fn run_worker_loop(
    worker_id: &str,
    ctx: Arc<PipelineContext>,
    executor: Arc<JobExecutor>,
    rate_limiter: Arc<ClaimRateLimiter>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let mut in_flight = Vec::new();

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = rate_limiter.acquire() => {
                let claimed = ctx.broker.claim_next(worker_id, 2_000).await;
                match claimed {
                    Ok(Some(mut job)) => {
                        let ctx = Arc::clone(&ctx);
                        let semaphore = Arc::clone(&executor.semaphore);
                        let handle = tokio::spawn(async move {
                            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                            info!(job_id = %job.id, "claimed job");
                            if let Err(e) = process_job(&mut job, ctx).await {
                                warn!(job_id = %job.id, error = %e, "job failed");
                            } else {
                                info!(job_id = %job.id, "job completed");
                            }
                        });
                        in_flight.push(handle);
                        in_flight.retain(|h: &tokio::task::JoinHandle<()>| !h.is_finished());
                    }
                    Ok(None) => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }

    info!(count = in_flight.len(), "draining in-flight jobs before shutdown");
    let drain = async {
        for handle in in_flight {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        warn!("graceful drain exceeded 30s, exiting with jobs still in flight");
    }

    Ok(())
}

/// Wraps `run_worker_loop` with exponential restart backoff on broker
/// connection loss: bounded linear retries while starting up, then unbounded
/// backoff capped at 60s once the worker has successfully run at least once.
pub async fn run_supervised(
    worker_id: String,
    config: Config,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    const MAX_STARTUP_ATTEMPTS: u32 = 10;
    let mut started_once = false;
    let mut backoff_exp: u32 = 0;
    let mut startup_attempts: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let broker = match Broker::connect(
            &config.redis_url(),
            Duration::from_secs(config.stall_window_secs),
            config.max_attempts,
        )
        .await
        {
            Ok(b) => b,
            Err(e) => {
                if !started_once {
                    startup_attempts += 1;
                    if startup_attempts > MAX_STARTUP_ATTEMPTS {
                        return Err(e);
                    }
                    error!(attempt = startup_attempts, error = %e, "broker connection failed during startup");
                    sleep(Duration::from_secs(5)).await;
                    continue;
                }
                let delay = Duration::from_secs((5u64 << backoff_exp.min(4)).min(60));
                error!(error = %e, delay_secs = delay.as_secs(), "broker connection lost, restarting after backoff");
                backoff_exp += 1;
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown_fired(&shutdown) => return Ok(()),
                }
                continue;
            }
        };

        started_once = true;
        backoff_exp = 0;

        let ctx = Arc::new(PipelineContext::new(&config, broker)?);
        let executor = Arc::new(JobExecutor::new(config.parallel_limit));
        let rate_limiter = Arc::new(ClaimRateLimiter::new(config.parallel_limit as u32));

        match run_worker_loop(&worker_id, ctx, executor, rate_limiter, shutdown.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                error!(error = %e, "worker loop exited with error, restarting");
                let delay = Duration::from_secs((5u64 << backoff_exp.min(4)).min(60));
                backoff_exp += 1;
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown_fired(&shutdown) => return Ok(()),
                }
            }
        }
    }
}

async fn shutdown_fired(rx: &tokio::sync::watch::Receiver<bool>) {
    let mut rx = rx.clone();
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn job_executor_limits_concurrency() {
        let executor = JobExecutor::new(2);
        assert_eq!(executor.semaphore.available_permits(), 2);
        let _p1 = executor.semaphore.clone().acquire_owned().await.unwrap();
        let _p2 = executor.semaphore.clone().acquire_owned().await.unwrap();
        assert_eq!(executor.semaphore.available_permits(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn claim_rate_limiter_bursts_up_to_capacity_then_throttles() {
        let limiter = ClaimRateLimiter::new(2);

        // Bucket starts full: two immediate acquires, no sleep required.
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(Instant::now(), start);

        // Third acquire within the same second must wait for a refill.
        limiter.acquire().await;
        assert!(Instant::now() > start);
    }
}
