//! Sandbox module - Isolated execution of untrusted code
//!
//! This module owns the whole life of a run:
//! - Configuration and validation of limits
//! - A fresh execution context per run (store, WASI context, workspace)
//! - Limit enforcement (memory, tables, fuel, wall-clock deadline)
//! - Captured or inherited standard streams
//!
//! The sandbox module does NOT:
//! - Compile or interpret guest languages (the guest runner does)
//! - Keep any guest state between runs

pub mod config;
pub mod context;
pub mod io;
pub(crate) mod limiter;
pub mod workspace;

// Re-exports for convenience
pub use config::{load_config, SandboxConfig, DEFAULT_CONFIG};
pub use context::{ContextStatus, ExecutionContext, WORKSPACE_GUEST_DIR};
pub use io::IoPolicy;
pub use workspace::VirtualFs;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};
use wasmtime::Engine;

use crate::error::{Result, SandboxError};
use crate::runner::{CodeRunner, GuestRunner, RunOutcome, RunnerSpec};
use limiter::{epoch_tick_for, EpochTicker};

/// How the race inside one run ended
enum Finish {
    Exited(Result<()>),
    TimedOut,
    Cancelled,
}

/// Sandbox hosting one guest runner under fixed limits
pub struct Sandbox {
    config: SandboxConfig,
    engine: Engine,
    runner: GuestRunner,
    workspace: VirtualFs,
    /// Serializes runs so contexts never overlap
    run_lock: Mutex<()>,
    next_context_id: AtomicU64,
}

impl Sandbox {
    /// Create a sandbox; `None` selects `DEFAULT_CONFIG`
    pub fn new(runner: RunnerSpec, config: Option<SandboxConfig>) -> Result<Self> {
        let config = config.unwrap_or(DEFAULT_CONFIG);
        config.validate()?;

        let engine = build_engine(&config)?;
        let runner = GuestRunner::load(&engine, &runner)?;

        info!(
            "Sandbox ready: runner={}, memory_limit_mb={}, timeout_ms={}, io_policy={:?}, fuel_limit={:?}",
            runner.name(),
            config.memory_limit_mb(),
            config.timeout_ms(),
            config.io_policy(),
            config.fuel_limit()
        );

        Ok(Self {
            config,
            engine,
            runner,
            workspace: VirtualFs::new(),
            run_lock: Mutex::new(()),
            next_context_id: AtomicU64::new(0),
        })
    }

    /// Create a sandbox with `DEFAULT_CONFIG`
    pub fn with_defaults(runner: RunnerSpec) -> Result<Self> {
        Self::new(runner, None)
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Files copied into every new execution context
    pub fn workspace(&self) -> &VirtualFs {
        &self.workspace
    }

    /// SHA-256 of the guest runner module
    pub fn runner_digest(&self) -> &str {
        self.runner.digest()
    }

    /// Run `code` in a fresh execution context
    pub async fn run(&self, code: &str) -> Result<RunOutcome> {
        self.run_until(code, std::future::pending()).await
    }

    /// Run `code`, stopping early when `cancel` completes
    pub async fn run_until<F>(&self, code: &str, cancel: F) -> Result<RunOutcome>
    where
        F: Future<Output = ()>,
    {
        let _guard = self.run_lock.lock().await;
        let context_id = self.next_context_id.fetch_add(1, Ordering::Relaxed);

        let mut context = ExecutionContext::create(
            context_id,
            &self.engine,
            &self.runner,
            &self.config,
            code,
            &self.workspace,
        )?;

        let limit_ms = self.config.timeout_ms();
        let _ticker = EpochTicker::start(&self.engine, epoch_tick_for(limit_ms))?;
        let started = Instant::now();

        // Whichever finishes first wins; the other futures are dropped
        let finish = tokio::select! {
            biased;
            result = context.execute(&self.runner) => Finish::Exited(result),
            _ = tokio::time::sleep(Duration::from_millis(limit_ms)) => Finish::TimedOut,
            _ = cancel => Finish::Cancelled,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match finish {
            Finish::Exited(Ok(())) => Ok(RunOutcome {
                context_id,
                output: context.take_output(),
                elapsed_ms,
                peak_memory_bytes: context.peak_memory_bytes(),
                fuel_consumed: context.fuel_consumed(),
            }),
            Finish::Exited(Err(e)) => {
                warn!("Execution context {} failed: {}", context_id, e);
                Err(e)
            }
            Finish::TimedOut => {
                context.mark_timed_out();
                warn!(
                    "Execution context {} timed out after {}ms (limit {}ms)",
                    context_id, elapsed_ms, limit_ms
                );
                Err(SandboxError::Timeout {
                    limit_ms,
                    elapsed_ms,
                })
            }
            Finish::Cancelled => {
                context.mark_cancelled();
                warn!("Execution context {} cancelled", context_id);
                Err(SandboxError::Cancelled)
            }
        };

        context.teardown();
        result
    }

    /// Blocking variant of `run` for callers without an async runtime
    ///
    /// Panics if called from within an async execution context.
    pub fn run_blocking(&self, code: &str) -> Result<RunOutcome> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SandboxError::host_io("failed to start runtime", e))?;
        runtime.block_on(self.run(code))
    }
}

#[async_trait]
impl CodeRunner for Sandbox {
    async fn run_code(&self, code: &str) -> Result<RunOutcome> {
        self.run(code).await
    }
}

fn build_engine(config: &SandboxConfig) -> Result<Engine> {
    let mut engine_config = wasmtime::Config::new();
    engine_config
        .async_support(true)
        .epoch_interruption(true)
        .consume_fuel(config.fuel_limit().is_some());

    Engine::new(&engine_config)
        .map_err(|e| SandboxError::Configuration(format!("failed to create engine: {:#}", e)))
}
