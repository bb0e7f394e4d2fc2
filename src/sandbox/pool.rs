//! Pre-warmed sandbox pool.
//!
//! Keeps a target number of sandboxes hot so task startup never waits on
//! container boot. One mutex guards only ready/active membership;
//! provisioning and command execution always run outside it. Replenishment
//! is detached: a failed background provision is logged and the pool level
//! converges back to capacity on later acquires and releases.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::{Provisioner, Sandbox};
use crate::errors::SandboxError;

/// Pool occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub ready: usize,
    pub active: usize,
    pub capacity: usize,
}

struct PoolState {
    ready: VecDeque<Arc<Sandbox>>,
    active: HashMap<String, Arc<Sandbox>>,
    shutdown: bool,
}

/// Shared pool of isolated sandboxes.
pub struct SandboxPool {
    provisioner: Arc<Provisioner>,
    capacity: usize,
    acquire_timeout: Duration,
    state: Mutex<PoolState>,
    ready_notify: Notify,
}

impl SandboxPool {
    /// Build the pool and pre-warm it to capacity. Individual provisioning
    /// failures degrade the initial level; they never fail construction.
    pub async fn new(
        provisioner: Provisioner,
        capacity: usize,
        acquire_timeout: Duration,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            provisioner: Arc::new(provisioner),
            capacity,
            acquire_timeout,
            state: Mutex::new(PoolState {
                ready: VecDeque::new(),
                active: HashMap::new(),
                shutdown: false,
            }),
            ready_notify: Notify::new(),
        });

        let warmups =
            futures::future::join_all((0..capacity).map(|_| pool.provisioner.provision())).await;
        {
            let mut state = pool.state.lock().await;
            for result in warmups {
                match result {
                    Ok(sandbox) => state.ready.push_back(Arc::new(sandbox)),
                    Err(e) => warn!(error = %e, "pre-warm provisioning failed"),
                }
            }
            info!(ready = state.ready.len(), capacity, "sandbox pool warmed");
        }
        pool
    }

    /// Take a sandbox out of the pool. Waits up to the acquire timeout for
    /// a ready sandbox, then falls back to provisioning one on demand.
    pub async fn acquire(self: &Arc<Self>) -> Result<Arc<Sandbox>, SandboxError> {
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                if state.shutdown {
                    return Err(SandboxError::Provisioning {
                        reason: "pool is shut down".to_string(),
                    });
                }
                if let Some(sandbox) = state.ready.pop_front() {
                    state
                        .active
                        .insert(sandbox.id().to_string(), Arc::clone(&sandbox));
                    debug!(
                        sandbox = %sandbox.id(),
                        remaining = state.ready.len(),
                        "sandbox acquired"
                    );
                    drop(state);
                    self.spawn_replenish();
                    return Ok(sandbox);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.acquire_on_demand().await;
            }
            let _ = tokio::time::timeout(remaining, self.ready_notify.notified()).await;
            if Instant::now() >= deadline {
                // One last non-blocking look before provisioning on demand.
                let mut state = self.state.lock().await;
                if let Some(sandbox) = state.ready.pop_front() {
                    state
                        .active
                        .insert(sandbox.id().to_string(), Arc::clone(&sandbox));
                    drop(state);
                    self.spawn_replenish();
                    return Ok(sandbox);
                }
                drop(state);
                return self.acquire_on_demand().await;
            }
        }
    }

    async fn acquire_on_demand(self: &Arc<Self>) -> Result<Arc<Sandbox>, SandboxError> {
        debug!("pool empty, provisioning on demand");
        let sandbox = Arc::new(self.provisioner.provision().await?);
        let mut state = self.state.lock().await;
        if state.shutdown {
            drop(state);
            sandbox.destroy().await;
            return Err(SandboxError::Provisioning {
                reason: "pool is shut down".to_string(),
            });
        }
        state
            .active
            .insert(sandbox.id().to_string(), Arc::clone(&sandbox));
        drop(state);
        self.spawn_replenish();
        Ok(sandbox)
    }

    /// Return a sandbox. The default path destroys it (no state leaks
    /// between tasks); `reuse` resets the workspace and requeues it.
    /// Releasing an unknown handle is a logged no-op.
    pub async fn release(self: &Arc<Self>, sandbox: Arc<Sandbox>, reuse: bool) {
        let known = {
            let mut state = self.state.lock().await;
            state.active.remove(sandbox.id()).is_some()
        };
        if !known {
            warn!(sandbox = %sandbox.id(), "released a handle the pool does not track");
        }

        if reuse && sandbox.is_alive() {
            match sandbox.reset().await {
                Ok(()) => {
                    let mut state = self.state.lock().await;
                    if !state.shutdown {
                        state.ready.push_back(sandbox);
                        drop(state);
                        self.ready_notify.notify_one();
                        return;
                    }
                }
                Err(e) => {
                    warn!(sandbox = %sandbox.id(), error = %e, "reset failed, destroying instead");
                }
            }
        }

        sandbox.destroy().await;
        self.spawn_replenish();
    }

    /// Background refill toward capacity. Fire-and-forget.
    fn spawn_replenish(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            {
                let state = pool.state.lock().await;
                if state.shutdown || state.ready.len() >= pool.capacity {
                    return;
                }
            }
            match pool.provisioner.provision().await {
                Ok(sandbox) => {
                    let sandbox = Arc::new(sandbox);
                    let mut state = pool.state.lock().await;
                    if state.shutdown {
                        drop(state);
                        sandbox.destroy().await;
                    } else {
                        state.ready.push_back(sandbox);
                        drop(state);
                        pool.ready_notify.notify_one();
                    }
                }
                Err(e) => warn!(error = %e, "background replenish failed"),
            }
        });
    }

    /// Destroy every ready and active sandbox. Idempotent.
    pub async fn shutdown(self: &Arc<Self>) {
        let drained = {
            let mut state = self.state.lock().await;
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let mut drained: Vec<Arc<Sandbox>> = state.ready.drain(..).collect();
            drained.extend(state.active.drain().map(|(_, s)| s));
            drained
        };
        info!(count = drained.len(), "shutting down sandbox pool");
        for sandbox in drained {
            sandbox.destroy().await;
        }
        self.ready_notify.notify_waiters();
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            ready: state.ready.len(),
            active: state.active.len(),
            capacity: self.capacity,
        }
    }
}
