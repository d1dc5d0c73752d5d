//! Shared render engine pool.
//!
//! Holds at most one [`EngineInstance`]. The engine is launched on first
//! use, reused while healthy, and torn down once it has been idle longer
//! than the idle TTL with no lease outstanding. Concurrent acquirers during a
//! launch join the single in-flight launch.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{EngineInstance, RenderBackend};
use crate::utils::singleflight::{FlightOutcome, InFlight};
use crate::{Error, Result};

type Launch = InFlight<Arc<EngineInstance>>;

/// Resource pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Tear the engine down after this long without an acquire.
    pub idle_ttl: Duration,
    /// How often the reaper checks for an idle engine.
    pub reap_interval: Duration,
    /// How long a stopping engine may take to exit.
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

enum Slot {
    Empty,
    Launching(Arc<Launch>),
    Ready(Arc<EngineInstance>),
}

struct PoolState {
    slot: Slot,
    last_used: Instant,
    leases: usize,
}

#[derive(Default)]
struct Counters {
    acquires: AtomicU64,
    launches: AtomicU64,
    launch_failures: AtomicU64,
    recycles: AtomicU64,
}

/// Pool state as reported by health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Empty,
    Launching,
    Ready,
}

/// Snapshot of pool state and counters.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub status: PoolStatus,
    pub engine_id: Option<u64>,
    pub endpoint: Option<String>,
    /// Process id, when the engine is a child process.
    pub engine_pid: Option<u32>,
    pub engine_uptime_secs: Option<u64>,
    pub leases: usize,
    pub idle_secs: u64,
    pub acquires: u64,
    pub launches: u64,
    pub launch_failures: u64,
    pub recycles: u64,
}

enum Role {
    Ready(Arc<EngineInstance>),
    Follower(Arc<Launch>),
    Leader(Arc<Launch>),
}

/// Why an engine was retired.
#[derive(Debug, Clone, Copy)]
enum Retire {
    Dead,
    Idle,
}

/// Owner of the shared render engine.
pub struct ResourcePool {
    backend: Arc<dyn RenderBackend>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    counters: Counters,
}

impl ResourcePool {
    pub fn new(backend: Arc<dyn RenderBackend>, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            backend,
            config,
            state: Mutex::new(PoolState {
                slot: Slot::Empty,
                last_used: Instant::now(),
                leases: 0,
            }),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get a lease on the shared engine, launching it if needed.
    ///
    /// A dead engine, or one idle past the TTL with no lease outstanding, is
    /// retired first and a fresh one is launched.
    pub async fn acquire(self: &Arc<Self>) -> Result<EngineLease> {
        self.counters.acquires.fetch_add(1, Ordering::Relaxed);

        loop {
            let (role, retired) = self.claim();
            if let Some(engine) = retired {
                self.retire_in_background(engine);
            }

            match role {
                Role::Ready(engine) => {
                    return Ok(EngineLease {
                        pool: self.clone(),
                        engine,
                    });
                }
                Role::Follower(launch) => {
                    debug!(flight = launch.id(), "Joining in-flight engine launch");
                    match launch.wait().await {
                        FlightOutcome::Done(_) | FlightOutcome::Abandoned => continue,
                        FlightOutcome::Failed(message) => return Err(Error::Render(message)),
                    }
                }
                Role::Leader(launch) => return self.lead(launch).await,
            }
        }
    }

    fn claim(&self) -> (Role, Option<Arc<EngineInstance>>) {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let retired = self.retire_locked(state, now);

        let role = match &state.slot {
            Slot::Ready(engine) => {
                let engine = engine.clone();
                state.leases += 1;
                state.last_used = now;
                Role::Ready(engine)
            }
            Slot::Launching(launch) => Role::Follower(launch.clone()),
            Slot::Empty => {
                let launch = InFlight::new();
                state.slot = Slot::Launching(launch.clone());
                Role::Leader(launch)
            }
        };

        (role, retired)
    }

    /// Take the engine out of the slot if it is dead, or idle with no leases.
    fn retire_locked(&self, state: &mut PoolState, now: Instant) -> Option<Arc<EngineInstance>> {
        let Slot::Ready(engine) = &state.slot else {
            return None;
        };

        let reason = if !engine.is_alive() {
            Retire::Dead
        } else if state.leases == 0
            && now.saturating_duration_since(state.last_used) >= self.config.idle_ttl
        {
            Retire::Idle
        } else {
            return None;
        };

        let Slot::Ready(engine) = std::mem::replace(&mut state.slot, Slot::Empty) else {
            return None;
        };
        self.counters.recycles.fetch_add(1, Ordering::Relaxed);
        match reason {
            Retire::Dead => warn!(engine = engine.id(), "Render engine died, discarding"),
            Retire::Idle => info!(engine = engine.id(), "Recycling idle render engine"),
        }
        Some(engine)
    }

    fn retire_in_background(&self, engine: Arc<EngineInstance>) {
        let grace = self.config.shutdown_grace;
        tokio::spawn(async move {
            engine.shutdown(grace).await;
        });
    }

    async fn lead(self: &Arc<Self>, launch: Arc<Launch>) -> Result<EngineLease> {
        let mut guard = LaunchGuard {
            pool: self,
            launch: launch.clone(),
            armed: true,
        };

        info!(backend = self.backend.name(), "Launching render engine");
        let result = self.backend.launch().await;
        guard.armed = false;

        let mut state = self.state.lock();
        let owns_slot = matches!(&state.slot, Slot::Launching(current) if Arc::ptr_eq(current, &launch));

        match result {
            Ok(engine) => {
                let engine = Arc::new(engine);
                self.counters.launches.fetch_add(1, Ordering::Relaxed);
                if owns_slot {
                    state.slot = Slot::Ready(engine.clone());
                }
                state.leases += 1;
                state.last_used = Instant::now();
                drop(state);

                info!(engine = engine.id(), endpoint = ?engine.endpoint(), "Render engine ready");
                launch.finish(FlightOutcome::Done(engine.clone()));
                Ok(EngineLease {
                    pool: self.clone(),
                    engine,
                })
            }
            Err(e) => {
                self.counters.launch_failures.fetch_add(1, Ordering::Relaxed);
                if owns_slot {
                    state.slot = Slot::Empty;
                }
                drop(state);

                error!(error = %e, "Render engine failed to launch");
                let message = match &e {
                    Error::Render(message) => message.clone(),
                    other => other.to_string(),
                };
                launch.finish(FlightOutcome::Failed(message));
                Err(e)
            }
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.leases = state.leases.saturating_sub(1);
        state.last_used = Instant::now();
    }

    /// Retire the engine if it is idle past the TTL or dead.
    ///
    /// Returns `true` when an engine was torn down.
    pub async fn reap_idle(&self) -> bool {
        let retired = {
            let mut state = self.state.lock();
            self.retire_locked(&mut state, Instant::now())
        };

        match retired {
            Some(engine) => {
                engine.shutdown(self.config.shutdown_grace).await;
                true
            }
            None => false,
        }
    }

    /// Start the periodic idle reaper.
    pub fn start_reaper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        let interval = self.config.reap_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Engine reaper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if pool.reap_idle().await {
                            debug!("Reaper retired the render engine");
                        }
                    }
                }
            }
        })
    }

    /// Stop the engine regardless of leases. Used at process shutdown.
    pub async fn shutdown(&self) {
        let engine = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut state.slot, Slot::Empty) {
                Slot::Ready(engine) => Some(engine),
                other => {
                    state.slot = other;
                    None
                }
            }
        };

        if let Some(engine) = engine {
            info!(engine = engine.id(), "Shutting down render engine");
            engine.shutdown(self.config.shutdown_grace).await;
        }
    }

    pub fn status(&self) -> PoolStatus {
        match self.state.lock().slot {
            Slot::Empty => PoolStatus::Empty,
            Slot::Launching(_) => PoolStatus::Launching,
            Slot::Ready(_) => PoolStatus::Ready,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let engine = match &state.slot {
            Slot::Ready(engine) => Some(engine.clone()),
            Slot::Empty | Slot::Launching(_) => None,
        };
        let status = match &state.slot {
            Slot::Empty => PoolStatus::Empty,
            Slot::Launching(_) => PoolStatus::Launching,
            Slot::Ready(_) => PoolStatus::Ready,
        };

        PoolStats {
            status,
            engine_id: engine.as_ref().map(|engine| engine.id()),
            endpoint: engine
                .as_ref()
                .and_then(|engine| engine.endpoint().map(str::to_string)),
            engine_pid: engine.as_ref().and_then(|engine| engine.pid()),
            engine_uptime_secs: engine.as_ref().map(|engine| {
                (chrono::Utc::now() - engine.launched_at())
                    .num_seconds()
                    .max(0) as u64
            }),
            leases: state.leases,
            idle_secs: if state.leases == 0 {
                state.last_used.elapsed().as_secs()
            } else {
                0
            },
            acquires: self.counters.acquires.load(Ordering::Relaxed),
            launches: self.counters.launches.load(Ordering::Relaxed),
            launch_failures: self.counters.launch_failures.load(Ordering::Relaxed),
            recycles: self.counters.recycles.load(Ordering::Relaxed),
        }
    }
}

/// Clears the launching slot and wakes joiners if the leader is dropped
/// mid-launch.
struct LaunchGuard<'a> {
    pool: &'a ResourcePool,
    launch: Arc<Launch>,
    armed: bool,
}

impl Drop for LaunchGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        {
            let mut state = self.pool.state.lock();
            if matches!(&state.slot, Slot::Launching(current) if Arc::ptr_eq(current, &self.launch))
            {
                state.slot = Slot::Empty;
            }
        }
        warn!("Render engine launch abandoned");
        self.launch.finish(FlightOutcome::Abandoned);
    }
}

/// A lease on the shared engine. Dropping it resets the idle clock.
pub struct EngineLease {
    pool: Arc<ResourcePool>,
    engine: Arc<EngineInstance>,
}

impl EngineLease {
    pub fn engine(&self) -> &Arc<EngineInstance> {
        &self.engine
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        self.pool.release();
    }
}
