//! AgentBox - WebAssembly sandbox for untrusted code
//!
//! Runs caller-supplied code through a WASI guest runner inside a wasmtime
//! store with a memory ceiling, a wall-clock deadline, an optional
//! instruction budget and a captured or inherited I/O policy.
//!
//! ```no_run
//! use agentbox::{IoPolicy, RunnerSpec, Sandbox, SandboxConfig};
//!
//! # async fn demo() -> agentbox::Result<()> {
//! let config = SandboxConfig::new(64, 2_000).with_io_policy(IoPolicy::Captured);
//! let sandbox = Sandbox::new(RunnerSpec::from_file("runner.wasm"), Some(config))?;
//! let outcome = sandbox.run("print('Hello')").await?;
//! println!("{}", outcome.output);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod runner;
pub mod sandbox;

pub use error::{Resource, Result, SandboxError};
pub use runner::{CodeRunner, RunOutcome, RunnerSource, RunnerSpec};
pub use sandbox::{
    load_config, ContextStatus, ExecutionContext, IoPolicy, Sandbox, SandboxConfig, VirtualFs,
    DEFAULT_CONFIG,
};
