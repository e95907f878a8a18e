//! Agent pool: per-type concurrent slot limits with a priority waiter queue.
//!
//! Slot tracking is in-memory; `acquire` blocks on a oneshot wakeup when the
//! type is saturated, ordered by `(priority, queued_at)`. `release` hands the
//! slot to the head waiter directly (no decrement/increment pair), so a freed
//! slot cannot be stolen by a late arrival.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::settings::PoolSettings;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no slot available for {agent_type} within {timeout_s}s (active: {active}/{limit}, queue: {queued})")]
    PoolFull {
        agent_type: String,
        timeout_s: u64,
        active: usize,
        limit: usize,
        queued: usize,
    },
}

/// Waiter ordering priority. Lower value wakes first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Foreground = 0,
    Background = 10,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Foreground => "foreground",
            TaskPriority::Background => "background",
        }
    }
}

/// A tracked running job, for metrics and stuck detection.
#[derive(Clone, Debug)]
pub struct ActiveJob {
    pub job_name: String,
    pub agent_type: String,
    pub task_id: String,
    pub thread_id: String,
    pub started_at: Instant,
    pub timeout_seconds: u64,
}

struct Waiter {
    priority: TaskPriority,
    queued_at: Instant,
    agent_type: String,
    wake: Option<oneshot::Sender<()>>,
    id: u64,
}

#[derive(Default)]
struct PoolState {
    active: HashMap<String, usize>,
    waiters: HashMap<String, Vec<Waiter>>,
    active_jobs: HashMap<String, ActiveJob>,
    next_waiter_id: u64,
}

static SLOTS_ACTIVE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!("agent_slots_active", "Active agent slots by type", &["agent_type"])
        .expect("register agent_slots_active")
});
static SLOTS_LIMIT: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!("agent_slots_limit", "Maximum agent slots by type", &["agent_type"])
        .expect("register agent_slots_limit")
});
static QUEUE_DEPTH: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "agent_queue_depth",
        "Tasks waiting for an agent slot by type",
        &["agent_type"]
    )
    .expect("register agent_queue_depth")
});
static JOB_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "agent_job_duration_seconds",
        "Duration of agent jobs",
        &["agent_type", "status"],
        vec![60.0, 120.0, 300.0, 600.0, 900.0, 1200.0, 1800.0, 2700.0, 3600.0]
    )
    .expect("register agent_job_duration_seconds")
});
static JOBS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("agent_jobs_total", "Total agent jobs created", &["agent_type"])
        .expect("register agent_jobs_total")
});
static QUEUE_WAIT: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "agent_queue_wait_seconds",
        "Time spent waiting in the agent queue",
        &["agent_type"],
        vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    )
    .expect("register agent_queue_wait_seconds")
});

pub struct AgentPool {
    limits: HashMap<String, usize>,
    state: Mutex<PoolState>,
    default_wait_timeout: Duration,
    stuck_multiplier: f64,
}

impl AgentPool {
    pub fn new(settings: &PoolSettings) -> Self {
        let limits = HashMap::from([
            ("aider".to_string(), settings.max_concurrent_aider),
            ("openhands".to_string(), settings.max_concurrent_openhands),
            ("claude".to_string(), settings.max_concurrent_claude),
            ("junie".to_string(), settings.max_concurrent_junie),
        ]);
        for (agent_type, limit) in &limits {
            SLOTS_LIMIT.with_label_values(&[agent_type]).set(*limit as f64);
        }
        Self {
            limits,
            state: Mutex::new(PoolState::default()),
            default_wait_timeout: Duration::from_secs(settings.pool_wait_timeout_s),
            stuck_multiplier: settings.stuck_job_timeout_multiplier,
        }
    }

    fn limit(&self, agent_type: &str) -> usize {
        self.limits.get(agent_type).copied().unwrap_or(1)
    }

    pub fn can_start(&self, agent_type: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active.get(agent_type).copied().unwrap_or(0) < self.limit(agent_type)
    }

    /// Acquires a slot, waiting until one frees or the timeout expires.
    ///
    /// Foreground waiters wake before background regardless of arrival order;
    /// within a priority the queue is FIFO. On timeout the waiter is removed
    /// from the list before `PoolFull` is raised.
    pub async fn acquire(
        &self,
        agent_type: &str,
        priority: TaskPriority,
        timeout: Option<Duration>,
    ) -> Result<(), PoolError> {
        let timeout = timeout.unwrap_or(self.default_wait_timeout);
        let limit = self.limit(agent_type);

        let (rx, waiter_id) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let active = state.active.entry(agent_type.to_string()).or_insert(0);
            if *active < limit {
                *active += 1;
                SLOTS_ACTIVE
                    .with_label_values(&[agent_type])
                    .set(*active as f64);
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            state.next_waiter_id += 1;
            let id = state.next_waiter_id;
            let waiters = state.waiters.entry(agent_type.to_string()).or_default();
            waiters.push(Waiter {
                priority,
                queued_at: Instant::now(),
                agent_type: agent_type.to_string(),
                wake: Some(tx),
                id,
            });
            waiters.sort_by_key(|w| (w.priority, w.queued_at));
            QUEUE_DEPTH
                .with_label_values(&[agent_type])
                .set(waiters.len() as f64);
            info!(
                agent_type,
                queued = waiters.len(),
                priority = priority.as_str(),
                "waiting for agent slot"
            );
            (rx, id)
        };

        let queued_at = Instant::now();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                // The releaser transferred the slot; the count stays put.
                QUEUE_WAIT
                    .with_label_values(&[agent_type])
                    .observe(queued_at.elapsed().as_secs_f64());
                Ok(())
            }
            _ => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(waiters) = state.waiters.get_mut(agent_type) {
                    waiters.retain(|w| w.id != waiter_id);
                    QUEUE_DEPTH
                        .with_label_values(&[agent_type])
                        .set(waiters.len() as f64);
                }
                let active = state.active.get(agent_type).copied().unwrap_or(0);
                let queued = state.waiters.get(agent_type).map(Vec::len).unwrap_or(0);
                Err(PoolError::PoolFull {
                    agent_type: agent_type.to_string(),
                    timeout_s: timeout.as_secs(),
                    active,
                    limit,
                    queued,
                })
            }
        }
    }

    /// Releases a slot: the head waiter gets it directly, otherwise the count
    /// decrements.
    pub fn release(&self, agent_type: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        // Pop waiters until one is still listening; a timed-out waiter may
        // linger briefly between its timeout and its removal.
        loop {
            let Some(mut waiter) = state
                .waiters
                .get_mut(agent_type)
                .and_then(|w| (!w.is_empty()).then(|| w.remove(0)))
            else {
                let active = state.active.entry(agent_type.to_string()).or_insert(0);
                *active = active.saturating_sub(1);
                SLOTS_ACTIVE
                    .with_label_values(&[agent_type])
                    .set(*active as f64);
                return;
            };
            QUEUE_DEPTH
                .with_label_values(&[agent_type])
                .set(state.waiters.get(agent_type).map(Vec::len).unwrap_or(0) as f64);
            if let Some(tx) = waiter.wake.take() {
                if tx.send(()).is_ok() {
                    info!(
                        agent_type = %waiter.agent_type,
                        priority = waiter.priority.as_str(),
                        "slot transferred to waiter"
                    );
                    return;
                }
            }
        }
    }

    // ── Job tracking ────────────────────────────────────────────────────

    pub fn mark_started(
        &self,
        job_name: &str,
        agent_type: &str,
        task_id: &str,
        thread_id: &str,
        timeout_seconds: u64,
    ) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active_jobs.insert(
            job_name.to_string(),
            ActiveJob {
                job_name: job_name.to_string(),
                agent_type: agent_type.to_string(),
                task_id: task_id.to_string(),
                thread_id: thread_id.to_string(),
                started_at: Instant::now(),
                timeout_seconds,
            },
        );
        JOBS_TOTAL.with_label_values(&[agent_type]).inc();
        info!(job = job_name, agent_type, "job started");
    }

    /// Marks a job completed; returns its agent type so the caller can release
    /// the slot.
    pub fn mark_completed(&self, job_name: &str, status: &str) -> Option<String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let job = state.active_jobs.remove(job_name)?;
        let duration = job.started_at.elapsed();
        JOB_DURATION
            .with_label_values(&[&job.agent_type, status])
            .observe(duration.as_secs_f64());
        info!(
            job = job_name,
            agent_type = %job.agent_type,
            duration_s = duration.as_secs(),
            status,
            "job completed"
        );
        Some(job.agent_type)
    }

    /// Jobs whose runtime exceeds `timeout × stuck_multiplier`.
    pub fn stuck_jobs(&self) -> Vec<ActiveJob> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let stuck: Vec<ActiveJob> = state
            .active_jobs
            .values()
            .filter(|j| {
                j.started_at.elapsed().as_secs_f64()
                    > j.timeout_seconds as f64 * self.stuck_multiplier
            })
            .cloned()
            .collect();
        if !stuck.is_empty() {
            warn!(count = stuck.len(), "stuck jobs detected");
        }
        stuck
    }

    /// Background watchdog: logs stuck jobs and marks them failed so their
    /// slots free up. One per process.
    pub fn spawn_stuck_watchdog(self: &std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                for job in pool.stuck_jobs() {
                    warn!(
                        job = %job.job_name,
                        agent_type = %job.agent_type,
                        running_s = job.started_at.elapsed().as_secs(),
                        timeout_s = job.timeout_seconds,
                        "reaping stuck job"
                    );
                    if let Some(agent_type) = pool.mark_completed(&job.job_name, "stuck") {
                        pool.release(&agent_type);
                    }
                }
            }
        })
    }

    pub fn active_count(&self, agent_type: &str) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active
            .get(agent_type)
            .copied()
            .unwrap_or(0)
    }

    pub fn queue_depth(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .waiters
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Snapshot for health/debug endpoints.
    pub fn status_summary(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        serde_json::json!({
            "limits": self.limits,
            "active": state.active,
            "queue_depth": state
                .waiters
                .iter()
                .filter(|(_, w)| !w.is_empty())
                .map(|(k, w)| (k.clone(), w.len()))
                .collect::<HashMap<String, usize>>(),
            "active_jobs": state
                .active_jobs
                .values()
                .map(|j| {
                    serde_json::json!({
                        "job_name": j.job_name,
                        "agent_type": j.agent_type,
                        "running_seconds": j.started_at.elapsed().as_secs(),
                        "timeout_seconds": j.timeout_seconds,
                    })
                })
                .collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pool(claude_limit: usize) -> AgentPool {
        AgentPool::new(&PoolSettings {
            max_concurrent_aider: 2,
            max_concurrent_openhands: 1,
            max_concurrent_claude: claude_limit,
            max_concurrent_junie: 1,
            pool_wait_timeout_s: 600,
            stuck_job_timeout_multiplier: 1.5,
            agent_timeout_aider_s: 1800,
            agent_timeout_openhands_s: 2700,
            agent_timeout_claude_s: 1800,
            agent_timeout_junie_s: 1800,
        })
    }

    #[tokio::test]
    async fn acquire_within_limit_is_immediate() {
        let pool = pool(2);
        pool.acquire("claude", TaskPriority::Foreground, None)
            .await
            .unwrap();
        pool.acquire("claude", TaskPriority::Foreground, None)
            .await
            .unwrap();
        assert_eq!(pool.active_count("claude"), 2);
        assert!(!pool.can_start("claude"));
    }

    #[tokio::test]
    async fn zero_timeout_raises_pool_full_and_cleans_waiters() {
        let pool = pool(1);
        pool.acquire("claude", TaskPriority::Foreground, None)
            .await
            .unwrap();
        let err = pool
            .acquire(
                "claude",
                TaskPriority::Background,
                Some(Duration::from_millis(0)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::PoolFull { .. }));
        assert_eq!(pool.queue_depth(), 0, "waiter list unchanged on exit");
    }

    #[tokio::test]
    async fn release_transfers_slot_to_foreground_first() {
        let pool = Arc::new(pool(1));
        pool.acquire("claude", TaskPriority::Background, None)
            .await
            .unwrap();

        // Queue a background waiter first, then a foreground one.
        let bg_pool = Arc::clone(&pool);
        let bg = tokio::spawn(async move {
            bg_pool
                .acquire("claude", TaskPriority::Background, Some(Duration::from_secs(5)))
                .await
                .map(|_| Instant::now())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fg_pool = Arc::clone(&pool);
        let fg = tokio::spawn(async move {
            fg_pool
                .acquire("claude", TaskPriority::Foreground, Some(Duration::from_secs(5)))
                .await
                .map(|_| Instant::now())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.release("claude");
        let fg_at = fg.await.unwrap().unwrap();
        pool.release("claude");
        let bg_at = bg.await.unwrap().unwrap();
        assert!(fg_at < bg_at, "foreground woke before background");
        assert_eq!(pool.active_count("claude"), 1, "slot transfers keep the count");
    }

    #[tokio::test]
    async fn release_without_waiters_decrements() {
        let pool = pool(1);
        pool.acquire("claude", TaskPriority::Foreground, None)
            .await
            .unwrap();
        pool.release("claude");
        assert_eq!(pool.active_count("claude"), 0);
        assert!(pool.can_start("claude"));
    }

    #[tokio::test]
    async fn stuck_detection_uses_multiplier() {
        let pool = pool(1);
        pool.mark_started("job-1", "claude", "task-1", "thread-1", 0);
        // timeout 0 × multiplier 1.5 = 0: immediately stuck.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stuck = pool.stuck_jobs();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].job_name, "job-1");

        assert_eq!(pool.mark_completed("job-1", "succeeded").as_deref(), Some("claude"));
        assert!(pool.stuck_jobs().is_empty());
        assert!(pool.mark_completed("job-1", "succeeded").is_none());
    }
}
