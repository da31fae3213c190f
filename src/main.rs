use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{error, info};

use agentbox::{load_config, RunnerSpec, Sandbox};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("agentbox=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();

    let runner_path = std::env::var("AGENTBOX_RUNNER")
        .map(PathBuf::from)
        .context("AGENTBOX_RUNNER must point to a WASI runner module")?;

    let config = match std::env::var("AGENTBOX_CONFIG") {
        Ok(path) => {
            let config = load_config(&path)
                .with_context(|| format!("Failed to load sandbox config from {}", path))?;
            info!("Loaded sandbox config from {}", path);
            Some(config)
        }
        Err(_) => None,
    };
    let json = std::env::var("AGENTBOX_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let code = read_code()?;

    let sandbox = Sandbox::new(RunnerSpec::from_file(&runner_path), config)
        .with_context(|| format!("Failed to create sandbox for {:?}", runner_path))?;

    match sandbox.run(&code).await {
        Ok(outcome) => {
            info!(
                "Run {} finished in {}ms (peak memory {} bytes)",
                outcome.context_id, outcome.elapsed_ms, outcome.peak_memory_bytes
            );
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print!("{}", outcome.output);
            }
            Ok(())
        }
        Err(e) => {
            error!("Run failed: {:#}", anyhow::Error::new(e));
            std::process::exit(1);
        }
    }
}

/// Code comes from the file named by the first argument, or from stdin
fn read_code() -> Result<String> {
    match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read code from {}", path)),
        None => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("Failed to read code from stdin")?;
            Ok(code)
        }
    }
}
