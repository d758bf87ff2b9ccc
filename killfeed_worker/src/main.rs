use clap::Parser;
use killfeed_core::models::{ServerId, TenantId};
use killfeed_core::store::Metric;
use killfeed_core::{IngestionScheduler, KillfeedConfig};
use killfeed_worker::cli::{Cli, Commands};
use killfeed_worker::dev_backends::{
    build_state, load_profiles, load_records, save_profiles, save_records,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[tokio::main]
#[tracing::instrument(level = "info")]
async fn main() -> anyhow::Result<()> {
    killfeed_core::o11y::init_global_from_env()?;
    let cli = Cli::parse();
    let config = KillfeedConfig::from_env()?;

    let cmd = cli.command.unwrap_or(Commands::Run {
        profiles: PathBuf::from("profiles.json"),
        once: false,
        save_state: None,
        records: None,
    });

    match cmd {
        Commands::Run {
            profiles,
            once,
            save_state,
            records,
        } => {
            let poll_interval = config.poll_interval;
            let state = build_state(config, load_profiles(&profiles).await?).await?;
            if let Some(path) = &records {
                load_records(path, &state.store).await?;
            }
            let cancel = CancellationToken::new();

            if once {
                let report = state.pipeline.run_all(&cancel).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let scheduler = IngestionScheduler::new(state.pipeline.clone(), poll_interval)?;
                let shutdown = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("shutdown requested");
                    }
                    shutdown.cancel();
                });
                scheduler.run_loop(cancel).await?;
            }

            if let Some(path) = save_state {
                save_profiles(&path, state.directory.as_ref()).await?;
                tracing::info!(path = %path.display(), "profiles saved");
            }
            if let Some(path) = records {
                save_records(&path, &state.store).await?;
                tracing::info!(path = %path.display(), "records saved");
            }
        }
        Commands::CheckConnection { profiles } => {
            let profiles = load_profiles(&profiles).await?;
            let state = build_state(config, profiles.clone()).await?;
            let mut failed = 0usize;
            for profile in profiles {
                let scoped = state
                    .isolation
                    .enter(profile.tenant_id, profile.server_id.clone())
                    .await?;
                let check = state.connector.test_connection(&scoped, &profile).await;
                scoped.exit();
                if !check.success {
                    failed += 1;
                }
                println!(
                    "{}/{}: {}",
                    profile.tenant_id, profile.server_id, check.message
                );
            }
            if failed > 0 {
                anyhow::bail!("{failed} server(s) unreachable");
            }
        }
        Commands::Leaderboard {
            profiles,
            tenant_id,
            server_id,
            metric,
            limit,
            records,
        } => {
            let metric: Metric = metric.parse()?;
            let state = build_state(config, load_profiles(&profiles).await?).await?;
            if let Some(path) = &records {
                load_records(path, &state.store).await?;
            }
            let tenant_id = TenantId(tenant_id);
            let server_id = ServerId::from(server_id);
            let summary = state
                .pipeline
                .run_profile(tenant_id, server_id.clone(), &CancellationToken::new())
                .await;
            if !summary.successful {
                tracing::warn!(error = ?summary.error_message, "ingestion did not complete");
            }

            let scoped = state.isolation.enter(tenant_id, server_id).await?;
            let Some(profile) = scoped.profile().cloned() else {
                anyhow::bail!("no server profile registered for {tenant_id}/{}", scoped.server_id());
            };
            let view = state
                .leaderboard
                .leaderboard(&scoped, &profile, metric, limit)
                .await?;
            scoped.exit();
            if let Some(path) = records {
                save_records(&path, &state.store).await?;
            }
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::Config => {
            let mut cfg = serde_json::to_value(&config)?;
            cfg["log_format"] = std::env::var("KILLFEED_LOG_FORMAT")
                .unwrap_or_else(|_| "json".to_string())
                .into();
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
    }

    Ok(())
}
