//! Resource limiter
//!
//! Turns a `SandboxConfig` into bounds the VM itself enforces on a store:
//! - linear memory and table growth go through `GuestLimiter`
//! - the optional instruction budget is wasmtime fuel
//! - wall-clock time is enforced by epoch interruption, driven by `EpochTicker`
//!
//! Nothing here relies on the guest cooperating.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};
use wasmtime::{Engine, ResourceLimiter, Store};

use super::config::SandboxConfig;
use super::context::GuestState;
use crate::error::{Resource, Result, SandboxError};

/// Budget overrun recorded at the allocation boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Violation {
    pub resource: Resource,
    pub requested: u64,
    pub limit: u64,
}

impl From<Violation> for SandboxError {
    fn from(v: Violation) -> Self {
        SandboxError::ResourceExceeded {
            resource: v.resource,
            requested: v.requested,
            limit: v.limit,
        }
    }
}

/// Limits derived from a configuration, applied once to a fresh store
#[derive(Debug, Clone)]
pub(crate) struct ResourceLimits {
    memory_bytes: u64,
    table_elements: usize,
    fuel: Option<u64>,
}

impl ResourceLimits {
    pub(crate) fn from_config(config: &SandboxConfig) -> Self {
        Self {
            memory_bytes: config.memory_limit_bytes(),
            table_elements: config.max_table_elements(),
            fuel: config.fuel_limit(),
        }
    }

    /// Limiter to be stored in the guest state
    pub(crate) fn limiter(&self) -> GuestLimiter {
        GuestLimiter::new(self.memory_bytes, self.table_elements)
    }

    pub(crate) fn fuel(&self) -> Option<u64> {
        self.fuel
    }

    /// Attach the limits to a store before any guest instruction runs
    ///
    /// Consumes the limits so a store is configured exactly once.
    pub(crate) fn apply(self, store: &mut Store<GuestState>) -> Result<()> {
        store.limiter(|state| &mut state.limiter as &mut dyn ResourceLimiter);

        if let Some(fuel) = self.fuel {
            store.set_fuel(fuel).map_err(|e| {
                SandboxError::Configuration(format!("failed to set fuel budget: {}", e))
            })?;
        }

        // Yield back to the executor on every epoch tick so the deadline can win
        store.set_epoch_deadline(1);
        store.epoch_deadline_async_yield_and_update(1);

        debug!(
            "Applied limits: memory={} bytes, table_elements={}, fuel={:?}",
            self.memory_bytes, self.table_elements, self.fuel
        );
        Ok(())
    }
}

/// Per-store limiter enforcing the memory and table ceilings
#[derive(Debug)]
pub(crate) struct GuestLimiter {
    memory_limit: u64,
    table_limit: usize,
    /// Bytes of linear memory currently granted (all memories)
    allocated: u64,
    peak: u64,
    /// Last approved growth and the peak before it, until the grow settles
    pending: Option<(u64, u64)>,
    violation: Option<Violation>,
}

impl GuestLimiter {
    pub(crate) fn new(memory_limit: u64, table_limit: usize) -> Self {
        Self {
            memory_limit,
            table_limit,
            allocated: 0,
            peak: 0,
            pending: None,
            violation: None,
        }
    }

    /// First budget overrun seen by this limiter, if any
    pub(crate) fn violation(&self) -> Option<Violation> {
        self.violation
    }

    /// Largest amount of linear memory granted at once
    pub(crate) fn peak_memory_bytes(&self) -> u64 {
        self.peak
    }

    fn reject(&mut self, violation: Violation) -> anyhow::Error {
        warn!(
            "Guest exceeded {} budget: requested {}, limit {}",
            violation.resource, violation.requested, violation.limit
        );
        if self.violation.is_none() {
            self.violation = Some(violation);
        }
        anyhow::Error::new(SandboxError::from(violation))
    }
}

impl ResourceLimiter for GuestLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        let growth = desired.saturating_sub(current) as u64;
        let requested = self.allocated.saturating_add(growth);

        if requested > self.memory_limit {
            return Err(self.reject(Violation {
                resource: Resource::Memory,
                requested,
                limit: self.memory_limit,
            }));
        }

        self.pending = Some((growth, self.peak));
        self.allocated = requested;
        self.peak = self.peak.max(requested);
        Ok(true)
    }

    /// Approved growth rejected later (declared maximum, host allocation)
    fn memory_grow_failed(&mut self, error: anyhow::Error) -> wasmtime::Result<()> {
        if let Some((growth, peak)) = self.pending.take() {
            self.allocated = self.allocated.saturating_sub(growth);
            self.peak = peak;
        }
        debug!("Guest memory growth failed: {:#}", error);
        Ok(())
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.table_limit {
            return Err(self.reject(Violation {
                resource: Resource::TableElements,
                requested: desired as u64,
                limit: self.table_limit as u64,
            }));
        }
        Ok(true)
    }

    fn table_grow_failed(&mut self, error: anyhow::Error) -> wasmtime::Result<()> {
        // Table checks hold no running total, so nothing to roll back
        debug!("Guest table growth failed: {:#}", error);
        Ok(())
    }

    fn instances(&self) -> usize {
        1
    }
}

/// Epoch tick for a given timeout: a tenth of it, between 1 ms and 10 ms
pub(crate) fn epoch_tick_for(timeout_ms: u64) -> Duration {
    Duration::from_millis((timeout_ms / 10).clamp(1, 10))
}

/// Background thread advancing the engine epoch while one run is active
///
/// Stops when dropped.
pub(crate) struct EpochTicker {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl EpochTicker {
    pub(crate) fn start(engine: &Engine, tick: Duration) -> Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let engine = engine.clone();

        let handle = thread::Builder::new()
            .name("agentbox-epoch".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(tick) {
                    Err(RecvTimeoutError::Timeout) => engine.increment_epoch(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| SandboxError::host_io("failed to spawn epoch ticker", e))?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
