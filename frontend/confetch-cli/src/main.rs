mod cli;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use confetch_core::provider::remote::RemoteProvider;
use confetch_core::{logging, EnvProvider, FileProvider, FlatMap, Provider, Scope};

fn build_provider(cli: &cli::Cli) -> anyhow::Result<Box<dyn Provider>> {
    if let Some(token) = cli.token.as_deref().filter(|t| !t.is_empty()) {
        let scope = Scope::new(
            cli.project.clone().unwrap_or_default(),
            cli.environment.clone().unwrap_or_default(),
        );
        let mut remote =
            RemoteProvider::new(token, scope).context("failed to build remote provider")?;
        if let Some(url) = &cli.api_url {
            remote = remote.api_url(url.clone());
        }
        return Ok(Box::new(remote));
    }

    if let Some(path) = cli.fallback.as_deref().filter(|p| !p.is_empty()) {
        return Ok(Box::new(FileProvider::new(path)));
    }

    // Last resort for local development.
    Ok(Box::new(EnvProvider::with_prefix("CONFETCH_")))
}

fn print_values(values: &FlatMap) -> anyhow::Result<()> {
    let ordered: BTreeMap<&String, &String> = values.iter().collect();
    let body = serde_json::to_string_pretty(&ordered)?;
    println!("{body}");
    Ok(())
}

async fn run_fetch(provider: Box<dyn Provider>) -> anyhow::Result<()> {
    let values = provider.fetch().await?;
    print_values(&values)
}

async fn run_snapshot(provider: Box<dyn Provider>, cli: &cli::Cli) -> anyhow::Result<()> {
    let Some(path) = cli.fallback.as_deref().filter(|p| !p.is_empty()) else {
        bail!("snapshot requires --fallback (or CONFETCH_FALLBACK_PATH)");
    };
    let values = provider.fetch().await?;
    confetch_core::write_fallback_file(PathBuf::from(path), &values)?;
    println!("wrote {} keys to {path}", values.len());
    Ok(())
}

async fn run_watch(provider: Box<dyn Provider>, interval: u64) -> anyhow::Result<()> {
    let interval = Duration::from_secs(interval.max(1));
    let mut previous = provider.fetch().await?;
    println!("watching {} keys ({} source)", previous.len(), provider.name());

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("stopping");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let current = match provider.fetch().await {
            Ok(values) => values,
            Err(err) => {
                tracing::warn!(error = %err, "poll failed");
                continue;
            }
        };

        for (key, value) in &current {
            match previous.get(key) {
                None => println!("+ {key}={value}"),
                Some(old) if old != value => println!("~ {key}: {old} -> {value}"),
                Some(_) => {}
            }
        }
        for key in previous.keys() {
            if !current.contains_key(key) {
                println!("- {key}");
            }
        }
        previous = current;
    }
}

async fn run_check(provider: Box<dyn Provider>) -> anyhow::Result<()> {
    match provider.fetch().await {
        Ok(values) => {
            println!("ok: {} ({} keys)", provider.name(), values.len());
            Ok(())
        }
        Err(err) => bail!("source check failed for {}: {err}", provider.name()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing(tracing::Level::WARN);
    let cli = cli::Cli::parse_args();
    let provider = build_provider(&cli)?;

    match cli.command.clone() {
        cli::Command::Fetch => run_fetch(provider).await,
        cli::Command::Snapshot => run_snapshot(provider, &cli).await,
        cli::Command::Watch { interval } => run_watch(provider, interval).await,
        cli::Command::Check => run_check(provider).await,
    }
}
