//! Runner module - Guest runner abstraction layer
//!
//! This module describes the guest runner the sandbox hosts:
//! - `RunnerSpec`: where the runner module comes from, plus its argv and environment
//! - `GuestRunner`: the runner compiled and pre-linked against a sandbox engine
//! - `CodeRunner`: the trait embedding applications program against
//!
//! The runner module does NOT:
//! - Enforce limits (that's the execution context's job)
//! - Interpret guest-language source
//! - Decide where output goes

pub mod guest;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SandboxError};

pub(crate) use guest::GuestRunner;

/// Location of the runner's WebAssembly module
#[derive(Debug, Clone)]
pub enum RunnerSource {
    /// Module bytes (binary WebAssembly or WAT text)
    Bytes(Vec<u8>),
    /// Path to a `.wasm` or `.wat` file
    File(PathBuf),
}

/// Guest runner specification
///
/// The runner must be a WASI preview1 command exporting `_start`. It receives
/// the code on stdin.
#[derive(Debug, Clone)]
pub struct RunnerSpec {
    /// Module source
    pub source: RunnerSource,
    /// Program name passed as argv[0]
    pub name: String,
    /// Extra arguments
    pub args: Vec<String>,
    /// Environment variables visible to the guest
    pub env: Vec<(String, String)>,
}

impl RunnerSpec {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            source: RunnerSource::Bytes(bytes.into()),
            name: "runner".to_string(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "runner".to_string());
        Self {
            source: RunnerSource::File(path.to_path_buf()),
            name,
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_env(
        mut self,
        env: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.env = env.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    /// Read the module bytes
    pub fn read_module(&self) -> Result<Vec<u8>> {
        match &self.source {
            RunnerSource::Bytes(bytes) => Ok(bytes.clone()),
            RunnerSource::File(path) => fs::read(path).map_err(|e| {
                SandboxError::host_io(format!("failed to read runner module {:?}", path), e)
            }),
        }
    }
}

/// Outcome of one completed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Id of the execution context that produced this outcome
    pub context_id: u64,
    /// Captured stdout+stderr; empty when output was inherited
    pub output: String,
    /// Wall-clock time of the run in milliseconds
    pub elapsed_ms: u64,
    /// Largest guest linear memory size in bytes
    pub peak_memory_bytes: u64,
    /// Fuel used, when an instruction budget is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fuel_consumed: Option<u64>,
}

impl RunOutcome {
    pub fn into_output(self) -> String {
        self.output
    }
}

/// Something that runs untrusted code and reports its outcome
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run_code(&self, code: &str) -> Result<RunOutcome>;
}
