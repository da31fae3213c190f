//! I/O policy for guest standard streams
//!
//! Decides per run whether guest stdout/stderr go straight to the host's
//! streams or into an in-memory buffer owned by the execution context.
//! Stdin always carries the guest code.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use wasmtime_wasi::pipe::MemoryInputPipe;
use wasmtime_wasi::{
    HostOutputStream, StdoutStream, StreamError, StreamResult, Subscribe, WasiCtxBuilder,
};

use super::limiter::Violation;
use crate::error::{Resource, SandboxError};

/// Largest single write the capture stream accepts at once
const WRITE_CHUNK: usize = 64 * 1024;

/// Routing of guest stdout/stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoPolicy {
    /// Guest streams are the host process streams; run output is empty
    #[default]
    Inherited,
    /// Guest streams go to a buffer returned as run output
    Captured,
}

/// Bounded buffer behind both captured guest streams
///
/// A write that would take the buffer past its limit is refused as a whole
/// and traps the guest; the overrun is recorded for the execution context.
#[derive(Clone)]
pub(crate) struct CaptureBuffer {
    state: Arc<Mutex<CaptureState>>,
}

struct CaptureState {
    bytes: Vec<u8>,
    limit: usize,
    overflow: Option<Violation>,
}

impl CaptureBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(CaptureState {
                bytes: Vec::new(),
                limit,
                overflow: None,
            })),
        }
    }

    pub(crate) fn contents(&self) -> Vec<u8> {
        self.lock().bytes.clone()
    }

    /// First refused write, if any
    pub(crate) fn overflow(&self) -> Option<Violation> {
        self.lock().overflow
    }

    fn append(&self, bytes: &[u8]) -> Result<(), Violation> {
        let mut state = self.lock();
        let requested = state.bytes.len().saturating_add(bytes.len());
        if requested > state.limit {
            let violation = Violation {
                resource: Resource::Output,
                requested: requested as u64,
                limit: state.limit as u64,
            };
            warn!(
                "Guest exceeded output budget: requested {}, limit {}",
                requested, state.limit
            );
            state.overflow.get_or_insert(violation);
            return Err(violation);
        }
        state.bytes.extend_from_slice(bytes);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StdoutStream for CaptureBuffer {
    fn stream(&self) -> Box<dyn HostOutputStream> {
        Box::new(self.clone())
    }

    fn isatty(&self) -> bool {
        false
    }
}

#[async_trait]
impl Subscribe for CaptureBuffer {
    async fn ready(&mut self) {}
}

impl HostOutputStream for CaptureBuffer {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        self.append(&bytes)
            .map_err(|v| StreamError::Trap(anyhow::Error::new(SandboxError::from(v))))
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(WRITE_CHUNK)
    }
}

/// Stream wiring of one execution context
///
/// The policy is fixed when the channels are installed and cannot change
/// for the rest of the run.
pub(crate) struct IoChannels {
    policy: IoPolicy,
    captured: Option<CaptureBuffer>,
}

impl IoChannels {
    /// Wire guest stdio into a WASI builder before any guest code exists
    pub(crate) fn install(
        policy: IoPolicy,
        code: &str,
        output_limit_bytes: usize,
        builder: &mut WasiCtxBuilder,
    ) -> Self {
        builder.stdin(MemoryInputPipe::new(code.as_bytes().to_vec()));

        let captured = match policy {
            IoPolicy::Inherited => {
                builder.inherit_stdout().inherit_stderr();
                None
            }
            IoPolicy::Captured => {
                // One shared buffer keeps stdout and stderr in write order
                let buffer = CaptureBuffer::new(output_limit_bytes);
                builder.stdout(buffer.clone()).stderr(buffer.clone());
                Some(buffer)
            }
        };

        debug!(
            "Installed {:?} I/O policy ({} bytes of code on stdin)",
            policy,
            code.len()
        );

        Self { policy, captured }
    }

    pub(crate) fn policy(&self) -> IoPolicy {
        self.policy
    }

    /// Output budget overrun, when capturing
    pub(crate) fn overflow(&self) -> Option<Violation> {
        self.captured.as_ref().and_then(CaptureBuffer::overflow)
    }

    /// Everything the guest wrote, or an empty string when inherited
    pub(crate) fn drain(self) -> String {
        match self.captured {
            Some(buffer) => String::from_utf8_lossy(&buffer.contents()).into_owned(),
            None => String::new(),
        }
    }
}
