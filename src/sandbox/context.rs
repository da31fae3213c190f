//! Execution context management
//!
//! One execution context hosts exactly one run of guest code: a fresh
//! wasmtime store (linear memory, tables, fuel, epoch deadline), a fresh WASI
//! context wired by the I/O policy, and an optional private workspace
//! directory. Everything is reclaimed at teardown.

use std::io;

use tempfile::TempDir;
use tracing::{debug, info, warn};
use wasmtime::{Engine, Store, Trap};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

use super::config::SandboxConfig;
use super::io::IoChannels;
use super::limiter::{GuestLimiter, ResourceLimits, Violation};
use super::workspace::VirtualFs;
use crate::error::{Resource, Result, SandboxError};
use crate::runner::GuestRunner;

/// Guest path under which the workspace directory is preopened
pub const WORKSPACE_GUEST_DIR: &str = ".";

/// Host-side state owned by a store
pub(crate) struct GuestState {
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) limiter: GuestLimiter,
}

/// Lifecycle of an execution context
///
/// `Created -> Running -> {Completed | TimedOut | Faulted | Cancelled} -> TornDown`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    Created,
    Running,
    Completed,
    TimedOut,
    Faulted,
    Cancelled,
    TornDown,
}

impl ContextStatus {
    /// Whether the run has stopped (successfully or not)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContextStatus::Completed
                | ContextStatus::TimedOut
                | ContextStatus::Faulted
                | ContextStatus::Cancelled
                | ContextStatus::TornDown
        )
    }

    pub fn can_transition_to(&self, next: ContextStatus) -> bool {
        use ContextStatus::*;
        match (self, next) {
            (TornDown, _) => false,
            (_, TornDown) => true,
            (Created, Running) => true,
            (Running, Completed | TimedOut | Faulted | Cancelled) => true,
            _ => false,
        }
    }
}

/// An isolated, time- and memory-bounded run of guest code
pub struct ExecutionContext {
    id: u64,
    status: ContextStatus,
    store: Option<Store<GuestState>>,
    io: Option<IoChannels>,
    workspace_dir: Option<TempDir>,
    fuel_budget: Option<u64>,
}

impl ExecutionContext {
    /// Build a context with limits applied and I/O installed
    pub(crate) fn create(
        id: u64,
        engine: &Engine,
        runner: &GuestRunner,
        config: &SandboxConfig,
        code: &str,
        workspace: &VirtualFs,
    ) -> Result<Self> {
        let limits = ResourceLimits::from_config(config);
        let fuel_budget = limits.fuel();

        let mut builder = WasiCtxBuilder::new();
        builder.arg(runner.name());
        for arg in runner.args() {
            builder.arg(arg);
        }
        for (key, value) in runner.env() {
            builder.env(key, value);
        }

        // Streams are wired before the store exists, so nothing can leak
        let io = IoChannels::install(
            config.io_policy(),
            code,
            config.output_limit_bytes(),
            &mut builder,
        );

        let workspace_dir = if workspace.is_empty() && !config.workspace_writable() {
            None
        } else {
            let dir = tempfile::Builder::new()
                .prefix("agentbox-ctx-")
                .tempdir()
                .map_err(|e| SandboxError::host_io("failed to create workspace directory", e))?;
            workspace.materialize(dir.path())?;

            let (dir_perms, file_perms) = if config.workspace_writable() {
                (DirPerms::all(), FilePerms::all())
            } else {
                (DirPerms::READ, FilePerms::READ)
            };
            builder
                .preopened_dir(dir.path(), WORKSPACE_GUEST_DIR, dir_perms, file_perms)
                .map_err(|e| {
                    SandboxError::host_io(
                        "failed to preopen workspace directory",
                        io::Error::other(e.to_string()),
                    )
                })?;
            Some(dir)
        };

        let state = GuestState {
            wasi: builder.build_p1(),
            limiter: limits.limiter(),
        };
        let mut store = Store::new(engine, state);
        limits.apply(&mut store)?;

        debug!(
            "Created execution context {} (policy={:?}, workspace={})",
            id,
            io.policy(),
            workspace_dir.is_some()
        );

        Ok(Self {
            id,
            status: ContextStatus::Created,
            store: Some(store),
            io: Some(io),
            workspace_dir,
            fuel_budget,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> ContextStatus {
        self.status
    }

    /// Instantiate the runner and call its `_start` export
    pub(crate) async fn execute(&mut self, runner: &GuestRunner) -> Result<()> {
        self.transition(ContextStatus::Running);

        let id = self.id;
        let store = self.store.as_mut().ok_or_else(|| {
            SandboxError::GuestExecution(format!("execution context {} is already torn down", id))
        })?;

        let result = match call_start(store, runner).await {
            Ok(()) => match self.overrun() {
                Some(violation) => Err(violation.into()),
                None => Ok(()),
            },
            Err(e) => self.classify(e),
        };

        match result {
            Ok(()) => self.transition(ContextStatus::Completed),
            Err(_) => self.transition(ContextStatus::Faulted),
        }
        result
    }

    /// Map a wasmtime error to the sandbox taxonomy
    fn classify(&self, err: anyhow::Error) -> Result<()> {
        if let Some(violation) = self.overrun() {
            return Err(violation.into());
        }

        if let Some(exit) = err.downcast_ref::<I32Exit>() {
            return match exit.0 {
                0 => Ok(()),
                code => Err(SandboxError::GuestExecution(format!(
                    "guest exited with status {}",
                    code
                ))),
            };
        }

        if let (Some(Trap::OutOfFuel), Some(budget)) =
            (err.downcast_ref::<Trap>(), self.fuel_budget)
        {
            return Err(SandboxError::ResourceExceeded {
                resource: Resource::Fuel,
                requested: budget.saturating_add(1),
                limit: budget,
            });
        }

        Err(SandboxError::GuestExecution(format!("{:#}", err)))
    }

    /// First budget overrun seen by the limiter or the output capture
    fn overrun(&self) -> Option<Violation> {
        self.store
            .as_ref()
            .and_then(|store| store.data().limiter.violation())
            .or_else(|| self.io.as_ref().and_then(IoChannels::overflow))
    }

    pub(crate) fn mark_timed_out(&mut self) {
        self.transition(ContextStatus::TimedOut);
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.transition(ContextStatus::Cancelled);
    }

    /// Largest linear memory size granted during the run
    pub fn peak_memory_bytes(&self) -> u64 {
        self.store
            .as_ref()
            .map(|store| store.data().limiter.peak_memory_bytes())
            .unwrap_or(0)
    }

    /// Fuel used so far, when metering is enabled
    pub fn fuel_consumed(&self) -> Option<u64> {
        let budget = self.fuel_budget?;
        let remaining = self.store.as_ref()?.get_fuel().ok()?;
        Some(budget.saturating_sub(remaining))
    }

    /// Drain captured output; empty for inherited I/O or when already taken
    pub(crate) fn take_output(&mut self) -> String {
        self.io.take().map(IoChannels::drain).unwrap_or_default()
    }

    /// Release the store, pipes and workspace directory
    ///
    /// Safe to call more than once.
    pub fn teardown(&mut self) {
        if self.status == ContextStatus::TornDown {
            return;
        }

        self.store = None;
        self.io = None;
        if let Some(dir) = self.workspace_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("Failed to remove workspace directory {:?}: {}", path, e);
            }
        }

        let previous = self.status;
        self.transition(ContextStatus::TornDown);
        info!(
            "Tore down execution context {} (was {:?})",
            self.id, previous
        );
    }

    fn transition(&mut self, next: ContextStatus) {
        if self.status.can_transition_to(next) {
            debug!(
                "Execution context {}: {:?} -> {:?}",
                self.id, self.status, next
            );
            self.status = next;
        } else {
            warn!(
                "Ignoring illegal transition of execution context {}: {:?} -> {:?}",
                self.id, self.status, next
            );
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn call_start(store: &mut Store<GuestState>, runner: &GuestRunner) -> wasmtime::Result<()> {
    let instance = runner.instantiate(&mut *store).await?;
    let start = instance.get_typed_func::<(), ()>(&mut *store, "_start")?;
    start.call_async(&mut *store, ()).await
}
