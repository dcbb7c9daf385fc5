//! Tenancy Operator - propagates role templates into Kubernetes RBAC

use std::sync::Arc;

use clap::Parser;
use kube::Client;

use tenancy_common::leader_election::{LeaderElector, LEADER_LEASE_NAME};
use tenancy_common::telemetry::init_logging;
use tenancy_operator::config::{Cli, Commands, ControllerArgs};
use tenancy_operator::controller_runner::run_controllers;
use tenancy_operator::startup::{
    crd_manifests, ensure_crds_installed, ensure_default_role_templates,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    init_logging(cli.controller.log_format)?;

    match cli.command {
        Some(Commands::Controller) | None => run(cli.controller).await,
    }
}

async fn run(args: ControllerArgs) -> anyhow::Result<()> {
    args.validate()?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;
    if args.skip_default_roles {
        tracing::info!("skipping default role templates");
    } else {
        ensure_default_role_templates(&client).await?;
    }

    if !args.leader_election_enabled() {
        tracing::warn!("leader election disabled, running controllers unconditionally");
        run_controllers(client, &args).await;
        return Ok(());
    }

    let elector = Arc::new(LeaderElector::new(
        client.clone(),
        LEADER_LEASE_NAME,
        &args.lease_namespace,
        &args.identity(),
    ));
    let mut guard = Arc::clone(&elector).acquire().await;

    let outcome = tokio::select! {
        _ = run_controllers(client, &args) => Ok(()),
        _ = guard.lost() => Err(anyhow::anyhow!("leadership lost")),
    };

    match outcome {
        Ok(()) => {
            tracing::info!("tenancy operator shutting down");
            if elector.is_leader() {
                if let Err(e) = guard.release_leadership().await {
                    tracing::warn!(error = %e, "failed to release leader lease");
                }
            }
            Ok(())
        }
        Err(e) => {
            tracing::error!("leadership lost, exiting so another replica can take over");
            Err(e)
        }
    }
}
