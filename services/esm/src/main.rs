//! consul-esm daemon entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use esm_catalog::{Catalog, HttpCatalog};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use consul_esm::{Agent, Config};

/// Any fatal error (config, compatibility, registration conflict,
/// unhandled run error) exits with this code.
const EXIT_CODE_ERROR: u8 = 10;

#[derive(Parser)]
#[command(name = "consul-esm", version)]
#[command(about = "External service monitor: health checks for services without a local agent")]
struct Cli {
    /// A JSON config file. Can be specified multiple times; later files
    /// override earlier ones.
    #[arg(long = "config-file", value_name = "PATH")]
    config_file: Vec<PathBuf>,

    /// A directory scanned for *.json config files. Can be specified
    /// multiple times.
    #[arg(long = "config-dir", value_name = "PATH")]
    config_dir: Vec<PathBuf>,
}

/// The daemon's historical flag surface uses single-dash long options
/// (`-config-file PATH`, `-v`, `-version`). clap reads a single dash as
/// a bundle of short flags, so rewrite those spellings to the
/// double-dash forms before parsing; both spellings work.
fn normalize_cli_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .enumerate()
        .map(|(i, arg)| {
            if i == 0 {
                return arg;
            }
            match arg.as_str() {
                "-config-file" | "-config-dir" | "-version" => format!("-{arg}"),
                "-v" => "--version".to_string(),
                _ if arg.starts_with("-config-file=") || arg.starts_with("-config-dir=") => {
                    format!("-{arg}")
                }
                _ => arg,
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_from(normalize_cli_args(std::env::args()));
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("consul-esm: {e:#}");
            ExitCode::from(EXIT_CODE_ERROR)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::build(&cli.config_file, &cli.config_dir)?;
    init_logging(&config)?;

    let catalog: Arc<dyn Catalog> = Arc::new(
        HttpCatalog::new(&config.http_addr)
            .with_context(|| format!("building catalog client for {}", config.http_addr))?,
    );

    if !config.log_json {
        println!("Consul ESM running!");
        println!("             Partition: {:?}", config.partition);
        println!("               Service: {:?}", config.service);
        println!("           Service Tag: {:?}", config.tag);
        println!("Node Reconnect Timeout: {:?}", config.node_reconnect_timeout);
        println!("   Disable coordinates: {}", config.disable_coordinate_updates);
        if !config.telemetry.statsd_addr.is_empty() {
            println!("        Statsd address: {:?}", config.telemetry.statsd_addr);
            println!("        Metrics prefix: {:?}", config.telemetry.metrics_prefix);
        }
        println!();
        println!("Log data will now stream in as it occurs:");
        println!();
    }

    let agent = Agent::new(config, catalog).context("creating agent")?;
    info!(service_id = %agent.service_id(), "starting");

    // Compatibility is only verified at startup; servers joining later
    // with older versions can still cause inconsistent check updates.
    consul_esm::compat::verify_compatibility(agent.catalog(), agent.config())
        .await
        .context("verifying catalog compatibility")?;

    spawn_signal_handler(agent.clone());

    agent.run().await.context("agent run failed")?;
    info!("clean exit");
    Ok(())
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("invalid log_level {:?}", config.log_level))?;

    let stdout_layer = if config.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let file_layer = match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
    Ok(())
}

fn spawn_signal_handler(agent: Agent) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("installing SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("caught signal, shutting down");
        agent.shutdown();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn single_dash_flags_parse() {
        let cli = Cli::try_parse_from(normalize_cli_args(args(&[
            "consul-esm",
            "-config-file",
            "one.json",
            "-config-file=two.json",
            "-config-dir",
            "conf.d",
        ])))
        .expect("parse");
        assert_eq!(
            cli.config_file,
            vec![PathBuf::from("one.json"), PathBuf::from("two.json")]
        );
        assert_eq!(cli.config_dir, vec![PathBuf::from("conf.d")]);
    }

    #[test]
    fn double_dash_flags_still_parse() {
        let cli = Cli::try_parse_from(normalize_cli_args(args(&[
            "consul-esm",
            "--config-file",
            "one.json",
        ])))
        .expect("parse");
        assert_eq!(cli.config_file, vec![PathBuf::from("one.json")]);
    }

    #[test]
    fn version_spellings_rewrite() {
        assert_eq!(
            normalize_cli_args(args(&["consul-esm", "-v"])),
            args(&["consul-esm", "--version"])
        );
        assert_eq!(
            normalize_cli_args(args(&["consul-esm", "-version"])),
            args(&["consul-esm", "--version"])
        );
    }

    #[test]
    fn flag_values_are_left_alone() {
        assert_eq!(
            normalize_cli_args(args(&["consul-esm", "-config-file", "-v.json"])),
            args(&["consul-esm", "--config-file", "-v.json"])
        );
    }
}
