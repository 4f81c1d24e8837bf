//! Periodic heartbeat worker.
//!
//! One long-lived task serializes all heartbeats to the central service.
//! Intervals are jittered below the server-supplied timeout so the agent
//! always beats again with headroom; failures back off geometrically and a
//! success snaps the backoff to its initial value. `force_heartbeat` is
//! level-triggered: any number of forces during one cycle collapse into a
//! single extra heartbeat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use ingot_client::HeartbeatApi;

/// If we could wait at most N seconds between heartbeats we instead wait
/// `r * N`, with r drawn uniformly from this range.
pub const MIN_JITTER_MULTIPLIER: f64 = 0.3;
pub const MAX_JITTER_MULTIPLIER: f64 = 0.6;

/// Error backoff bounds; the effective wait is a jittered portion of the
/// current delay.
pub const INITIAL_DELAY: f64 = 1.0;
pub const MAX_DELAY: f64 = 300.0;
pub const BACKOFF_FACTOR: f64 = 2.7;

/// Backoff arithmetic, separated from the loop so it can be tested without
/// clocks.
#[derive(Debug)]
struct HeartbeatState {
    error_delay: f64,
}

impl HeartbeatState {
    fn new() -> Self {
        Self {
            error_delay: INITIAL_DELAY,
        }
    }

    /// A success resets the backoff; the next interval is a jittered slice
    /// of the server's heartbeat timeout.
    fn interval_after_success(&mut self, heartbeat_timeout: f64, jitter: f64) -> f64 {
        self.error_delay = INITIAL_DELAY;
        heartbeat_timeout * jitter
    }

    /// A failure grows the backoff toward the ceiling; the next interval is
    /// a jittered slice of the grown delay.
    fn interval_after_failure(&mut self, jitter: f64) -> f64 {
        self.error_delay = (self.error_delay * BACKOFF_FACTOR).min(MAX_DELAY);
        self.error_delay * jitter
    }
}

fn sample_jitter() -> f64 {
    rand::thread_rng().gen_range(MIN_JITTER_MULTIPLIER..MAX_JITTER_MULTIPLIER)
}

/// Handle to the background heartbeat task.
pub struct Heartbeater {
    stop_tx: watch::Sender<bool>,
    force_flag: Arc<AtomicBool>,
    force_wake: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeater {
    /// Spawn the worker. The first heartbeat goes out immediately.
    pub fn start(
        api: Arc<dyn HeartbeatApi>,
        node_uuid: String,
        agent_url: String,
        heartbeat_timeout: f64,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let force_flag = Arc::new(AtomicBool::new(false));
        let force_wake = Arc::new(Notify::new());
        let handle = tokio::spawn(run_loop(
            api,
            node_uuid,
            agent_url,
            heartbeat_timeout,
            stop_rx,
            force_flag.clone(),
            force_wake.clone(),
        ));
        Self {
            stop_tx,
            force_flag,
            force_wake,
            handle: Some(handle),
        }
    }

    /// Wake the worker and heartbeat now.
    pub fn force_heartbeat(&self) {
        self.force_flag.store(true, Ordering::SeqCst);
        self.force_wake.notify_one();
    }

    /// Stop at the next wait point; an in-flight heartbeat finishes first.
    /// Safe to call more than once.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            info!("stopping heartbeater");
            let _ = self.stop_tx.send(true);
            let _ = handle.await;
        }
    }
}

async fn run_loop(
    api: Arc<dyn HeartbeatApi>,
    node_uuid: String,
    agent_url: String,
    heartbeat_timeout: f64,
    mut stop_rx: watch::Receiver<bool>,
    force_flag: Arc<AtomicBool>,
    force_wake: Arc<Notify>,
) {
    info!(node = %node_uuid, "starting heartbeater");
    let mut state = HeartbeatState::new();
    // the first heartbeat happens immediately
    let mut deadline = Instant::now();

    loop {
        // Wait phase: the deadline, a force, or stop. A stale wakeup (force
        // already serviced by an earlier cycle) goes back to waiting.
        loop {
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = force_wake.notified() => {
                    if force_flag.swap(false, Ordering::SeqCst) {
                        debug!("forced heartbeat");
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        // Whatever woke us, this heartbeat services any pending force.
        force_flag.store(false, Ordering::SeqCst);

        let next_seconds = match api.heartbeat(&node_uuid, &agent_url).await {
            Ok(server_deadline) => {
                info!(node = %node_uuid, deadline = server_deadline, "heartbeat successful");
                state.interval_after_success(heartbeat_timeout, sample_jitter())
            }
            Err(err) => {
                error!(node = %node_uuid, error = %err, "error sending heartbeat");
                state.interval_after_failure(sample_jitter())
            }
        };
        deadline = Instant::now() + Duration::from_secs_f64(next_seconds);
        info!(interval = next_seconds, "sleeping before next heartbeat");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use ingot_client::ApiError;

    #[derive(Default)]
    struct ScriptedApi {
        calls: AtomicUsize,
        fail: bool,
    }

    impl ScriptedApi {
        fn count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HeartbeatApi for ScriptedApi {
        async fn heartbeat(&self, _node_uuid: &str, _agent_url: &str) -> Result<f64, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ApiError::Heartbeat("invalid status code: 503".to_string()))
            } else {
                Ok(300.0)
            }
        }
    }

    #[test]
    fn test_success_resets_backoff_and_bounds_interval() {
        let mut state = HeartbeatState::new();
        state.error_delay = 200.0;

        let interval = state.interval_after_success(300.0, 0.3);
        assert_eq!(state.error_delay, INITIAL_DELAY);
        assert_eq!(interval, 90.0);

        // interval stays inside [0.3, 0.6] * heartbeat_timeout
        let low = state.interval_after_success(300.0, MIN_JITTER_MULTIPLIER);
        let high = state.interval_after_success(300.0, MAX_JITTER_MULTIPLIER);
        assert!(low >= 0.3 * 300.0 - f64::EPSILON);
        assert!(high <= 0.6 * 300.0 + f64::EPSILON);
    }

    #[test]
    fn test_failures_grow_geometrically_to_the_ceiling() {
        let mut state = HeartbeatState::new();

        state.interval_after_failure(0.5);
        assert_eq!(state.error_delay, 2.7);
        state.interval_after_failure(0.5);
        assert!((state.error_delay - 7.29).abs() < 1e-9);

        for _ in 0..10 {
            state.interval_after_failure(0.5);
        }
        assert_eq!(state.error_delay, MAX_DELAY);

        // and a success snaps it back
        state.interval_after_success(300.0, 0.5);
        assert_eq!(state.error_delay, INITIAL_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_heartbeat_is_immediate_and_stop_is_idempotent() {
        let api = Arc::new(ScriptedApi::default());
        let mut heartbeater = Heartbeater::start(
            api.clone(),
            "deadbeef".to_string(),
            "http://192.0.2.1:9999".to_string(),
            300.0,
        );

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(api.count(), 1);

        // one jittered interval (at most 180s) later the next beat lands
        tokio::time::sleep(Duration::from_secs(181)).await;
        assert!(api.count() >= 2);

        heartbeater.stop().await;
        let after_stop = api.count();
        heartbeater.stop().await;
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(api.count(), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forces_collapse_into_one_extra_heartbeat() {
        let api = Arc::new(ScriptedApi::default());
        // absurd timeout so the loop would otherwise sleep for days
        let mut heartbeater = Heartbeater::start(
            api.clone(),
            "deadbeef".to_string(),
            "http://192.0.2.1:9999".to_string(),
            1_000_000.0,
        );

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(api.count(), 1);

        heartbeater.force_heartbeat();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(api.count(), 2);

        // several forces during one cycle produce a single extra beat
        heartbeater.force_heartbeat();
        heartbeater.force_heartbeat();
        heartbeater.force_heartbeat();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(api.count(), 3);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(api.count(), 3);

        heartbeater.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_heartbeat_failures() {
        let api = Arc::new(ScriptedApi {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let mut heartbeater = Heartbeater::start(
            api.clone(),
            "deadbeef".to_string(),
            "http://192.0.2.1:9999".to_string(),
            300.0,
        );

        // failure intervals are error_delay * jitter with error_delay capped
        // at 300: after a minute of virtual time several attempts have
        // failed and the loop is still running
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(api.count() >= 3);

        heartbeater.stop().await;
    }
}
