//! Guest runner loading
//!
//! Compiles the runner module once per sandbox, checks it is a WASI command
//! and pre-links WASI preview1 so every run only has to instantiate.

use std::io;

use sha2::{Digest, Sha256};
use tracing::info;
use wasmtime::{Engine, ExternType, Instance, InstancePre, Linker, Module, Store};
use wasmtime_wasi::preview1;

use super::RunnerSpec;
use crate::error::{Result, SandboxError};
use crate::sandbox::context::GuestState;

/// Runner compiled against one engine
pub(crate) struct GuestRunner {
    pre: InstancePre<GuestState>,
    name: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    digest: String,
}

impl GuestRunner {
    pub(crate) fn load(engine: &Engine, spec: &RunnerSpec) -> Result<Self> {
        let bytes = spec.read_module()?;
        let digest = format!("{:x}", Sha256::digest(&bytes));

        let module = Module::new(engine, &bytes)
            .map_err(|e| SandboxError::GuestLoad(format!("{:#}", e)))?;

        match module.get_export("_start") {
            Some(ExternType::Func(ty)) if ty.params().len() == 0 && ty.results().len() == 0 => {}
            Some(_) => {
                return Err(SandboxError::GuestLoad(
                    "`_start` export must be a function without parameters or results".into(),
                ))
            }
            None => {
                return Err(SandboxError::GuestLoad(
                    "runner module does not export `_start`".into(),
                ))
            }
        }

        let mut linker: Linker<GuestState> = Linker::new(engine);
        preview1::add_to_linker_async(&mut linker, |state: &mut GuestState| &mut state.wasi)
            .map_err(|e| {
                SandboxError::host_io(
                    "failed to link WASI preview1",
                    io::Error::other(e.to_string()),
                )
            })?;

        let pre = linker
            .instantiate_pre(&module)
            .map_err(|e| SandboxError::GuestLoad(format!("{:#}", e)))?;

        info!(
            "Loaded guest runner '{}' ({} bytes, sha256={})",
            spec.name,
            bytes.len(),
            digest
        );

        Ok(Self {
            pre,
            name: spec.name.clone(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            digest,
        })
    }

    pub(crate) async fn instantiate(&self, store: &mut Store<GuestState>) -> wasmtime::Result<Instance> {
        self.pre.instantiate_async(store).await
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn args(&self) -> &[String] {
        &self.args
    }

    pub(crate) fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// SHA-256 of the module bytes, hex encoded
    pub(crate) fn digest(&self) -> &str {
        &self.digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn async_engine() -> Engine {
        let mut config = wasmtime::Config::new();
        config.async_support(true);
        Engine::new(&config).unwrap()
    }

    #[test]
    fn test_load_minimal_command() {
        let engine = async_engine();
        let spec = RunnerSpec::from_bytes(r#"(module (func (export "_start")))"#)
            .with_name("noop")
            .with_args(["--fast"]);

        let runner = GuestRunner::load(&engine, &spec).unwrap();
        assert_eq!(runner.name(), "noop");
        assert_eq!(runner.args(), ["--fast".to_string()]);
        assert_eq!(runner.digest().len(), 64);
    }

    #[test]
    fn test_digest_is_stable() {
        let engine = async_engine();
        let spec = RunnerSpec::from_bytes(r#"(module (func (export "_start")))"#);
        let a = GuestRunner::load(&engine, &spec).unwrap();
        let b = GuestRunner::load(&engine, &spec).unwrap();
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_rejects_invalid_module() {
        let engine = async_engine();
        let spec = RunnerSpec::from_bytes(b"not webassembly".to_vec());
        assert!(matches!(
            GuestRunner::load(&engine, &spec),
            Err(SandboxError::GuestLoad(_))
        ));
    }

    #[test]
    fn test_rejects_missing_start() {
        let engine = async_engine();
        let spec = RunnerSpec::from_bytes(r#"(module (func (export "main")))"#);
        let err = GuestRunner::load(&engine, &spec).err().unwrap();
        assert!(err.to_string().contains("_start"));
    }

    #[test]
    fn test_rejects_start_with_params() {
        let engine = async_engine();
        let spec = RunnerSpec::from_bytes(r#"(module (func (export "_start") (param i32)))"#);
        assert!(matches!(
            GuestRunner::load(&engine, &spec),
            Err(SandboxError::GuestLoad(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_imports() {
        let engine = async_engine();
        let spec = RunnerSpec::from_bytes(
            r#"(module
                (import "env" "open_socket" (func))
                (func (export "_start")))"#,
        );
        assert!(matches!(
            GuestRunner::load(&engine, &spec),
            Err(SandboxError::GuestLoad(_))
        ));
    }
}
