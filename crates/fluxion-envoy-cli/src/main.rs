// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

mod args;
mod config;

use anyhow::{Context, Result};
use args::{Cli, Commands, PollArgs, PowerState, StorageArgs};
use clap::Parser;
use config::CliConfig;
use fluxion_envoy::{DpelSettings, EnvoyReader, JsonFileTokenStore};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref())?;
    let store = Arc::new(JsonFileTokenStore::new(&config.token_file));
    info!(
        "🚀 Starting envoy-reader for {} (token file {})",
        config.envoy.host,
        store.path().display()
    );

    let mut reader = EnvoyReader::new(config.envoy, store).context("Failed to create Envoy reader")?;

    let shutdown = Arc::new(Notify::new());
    tokio::spawn(wait_for_ctrl_c(Arc::clone(&shutdown)));

    match cli.command {
        Commands::Poll(args) => poll(&mut reader, &args, shutdown).await,
        Commands::Stream => stream(&mut reader, shutdown).await,
        Commands::Serial => {
            let serial = reader.full_serial_number().await?;
            println!("{}", serial.as_deref().unwrap_or("unknown"));
            Ok(())
        }
        Commands::Metrics => list_metrics(&mut reader).await,
        Commands::Power { state } => {
            reader.authenticate().await?;
            reader
                .set_production_power(matches!(state, PowerState::On))
                .await?;
            println!("Production power set");
            Ok(())
        }
        Commands::DpelEnable {
            limit_watts,
            slew_rate,
            export_limit,
        } => {
            reader.authenticate().await?;
            reader
                .enable_dpel(DpelSettings {
                    limit_watts,
                    slew_rate,
                    export_limit,
                })
                .await?;
            println!("DPEL enabled at {limit_watts} W");
            Ok(())
        }
        Commands::DpelDisable => {
            reader.authenticate().await?;
            reader.disable_dpel().await?;
            println!("DPEL disabled");
            Ok(())
        }
        Commands::GridProfiles => {
            reader.authenticate().await?;
            let profiles = reader.grid_profiles().await?;
            println!("{}", serde_json::to_string_pretty(&profiles)?);
            Ok(())
        }
        Commands::SetGridProfile { profile_id } => {
            reader.authenticate().await?;
            reader.set_grid_profile(&profile_id).await?;
            println!("Grid profile {profile_id} accepted");
            Ok(())
        }
        Commands::UploadGridProfile { file } => {
            reader.authenticate().await?;
            reader
                .upload_grid_profile(&file)
                .await
                .with_context(|| format!("Failed to upload {}", file.display()))?;
            println!("Grid profile package uploaded");
            Ok(())
        }
        Commands::Storage(args) => storage(&mut reader, args).await,
    }
}

async fn wait_for_ctrl_c(shutdown: Arc<Notify>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received");
            // wake current waiters and leave a permit for a loop between waits
            shutdown.notify_waiters();
            shutdown.notify_one();
        }
        Err(e) => error!("Failed to listen for Ctrl+C: {e}"),
    }
}

fn print_values(values: &BTreeMap<String, Value>) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(values)?);
    Ok(())
}

fn selected_values(reader: &EnvoyReader, metrics: &[String]) -> BTreeMap<String, Value> {
    if metrics.is_empty() {
        return reader.all_values();
    }
    metrics
        .iter()
        .map(|name| (name.clone(), reader.get(name)))
        .collect()
}

async fn list_metrics(reader: &mut EnvoyReader) -> Result<()> {
    reader
        .refresh_with_timeout()
        .await
        .context("Initial refresh failed")?;
    let Some(profile) = reader.profile() else {
        anyhow::bail!("Envoy model is unknown after refresh");
    };
    println!("# {}", profile.kind().alias());
    for name in profile.metric_names() {
        println!("{name}");
    }
    Ok(())
}

async fn poll(reader: &mut EnvoyReader, args: &PollArgs, shutdown: Arc<Notify>) -> Result<()> {
    let interval_secs = args.interval.unwrap_or(reader.config().scan_interval_secs).max(1);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    let mut realtime_started = false;

    loop {
        tokio::select! {
            () = shutdown.notified() => {
                info!("Shutting down");
                return Ok(());
            }
            _ = interval.tick() => {
                match reader.refresh_with_timeout().await {
                    Ok(()) => print_values(&selected_values(reader, &args.metrics))?,
                    Err(e) if args.once => return Err(e).context("Refresh failed"),
                    Err(e) => {
                        warn!("Refresh failed: {e}");
                        continue;
                    }
                }

                if args.once {
                    return Ok(());
                }

                if reader.config().enable_realtime_updates && !realtime_started {
                    realtime_started = true;
                    spawn_realtime(reader, Arc::clone(&shutdown));
                }
            }
        }
    }
}

fn spawn_realtime(reader: &EnvoyReader, shutdown: Arc<Notify>) {
    let realtime = match reader.realtime_loop(shutdown) {
        Ok(realtime) => realtime,
        Err(e) => {
            warn!("Realtime updates unavailable: {e}");
            return;
        }
    };
    tokio::spawn(async move {
        let result = realtime
            .run(|update| {
                println!("{}", serde_json::to_string(&update)?);
                Ok(())
            })
            .await;
        if let Err(e) = result {
            error!("Realtime loop stopped: {e}");
        }
    });
}

async fn stream(reader: &mut EnvoyReader, shutdown: Arc<Notify>) -> Result<()> {
    reader
        .refresh_with_timeout()
        .await
        .context("Initial refresh failed")?;
    let realtime = reader.realtime_loop(shutdown)?;
    realtime
        .run(|update| {
            println!("{}", serde_json::to_string(&update)?);
            Ok(())
        })
        .await?;
    Ok(())
}

async fn storage(reader: &mut EnvoyReader, args: StorageArgs) -> Result<()> {
    reader.authenticate().await?;
    let mut changed = false;

    if let Some(mode) = args.mode {
        reader.set_storage_mode(mode.into()).await?;
        changed = true;
    }
    if let Some(percent) = args.reserved_soc {
        reader.set_reserved_soc(percent).await?;
        changed = true;
    }
    if let Some(percent) = args.very_low_soc {
        reader.set_very_low_soc(percent).await?;
        changed = true;
    }
    if let Some(enabled) = args.charge_from_grid {
        reader.set_charge_from_grid(enabled).await?;
        changed = true;
    }

    if changed {
        println!("Storage settings updated");
    } else {
        warn!("No storage setting given, nothing to do");
    }
    Ok(())
}
