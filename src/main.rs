use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleetsim::cli::{
    format_fleet_status, format_group_detail, format_group_list, format_scaling_response,
    format_simulation_report, format_traffic_audit, format_validation_report,
    format_validation_result, load_manifest, run_simulation, traffic_audit,
    validate_manifest_file, validate_security_group_local, Cli, Commands, ControlPlaneClient,
    ServeArgs,
};
use fleetsim::config::{expand_path, Manifest};
use fleetsim::fleet::{
    spawn_reconciler, FleetController, MonotonicClock, ReconcilerConfig, SimulationConfig,
};
use fleetsim::server::{create_router, AppState};
use fleetsim::store::{default_state_path, StateStore};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let manifest_path = cli
        .manifest
        .as_ref()
        .map(|p| expand_path(&p.to_string_lossy()));

    match cli.command {
        Commands::Serve(args) => {
            let manifest = load_manifest(manifest_path.as_deref())?;
            serve(manifest, args).await?;
        }
        Commands::Simulate(args) => {
            if !(0.0..=1.0).contains(&args.failure_rate) {
                bail!("--failure-rate must be between 0 and 1");
            }
            let manifest = load_manifest(manifest_path.as_deref())?;
            let config = SimulationConfig {
                cycles: args.cycles,
                failure_probability: args.failure_rate,
                seed: args.seed,
                ..Default::default()
            };
            let reports = run_simulation(&manifest, args.group.as_deref(), config)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    println!("{}", format_simulation_report(report));
                }
            }
        }
        Commands::Status(args) => {
            let client = ControlPlaneClient::new(&args.remote.url);
            match args.group {
                Some(name) => print!("{}", format_group_detail(&client.get_group(&name).await?)),
                None => {
                    let status = client.status().await?;
                    println!("{}", format_fleet_status(&status.stats));
                    print!("{}", format_group_list(&client.list_groups().await?));
                }
            }
        }
        Commands::Scale(args) => {
            let client = ControlPlaneClient::new(&args.remote.url);
            let request = args.direction.to_request(args.capacity);
            let response = client.scale(&args.group, &request).await?;
            print!("{}", format_scaling_response(&args.group, &response));
        }
        Commands::ValidateSg(args) => {
            let report = match args.url {
                Some(url) => {
                    ControlPlaneClient::new(url)
                        .validate_security_group(args.group_type)
                        .await?
                }
                None => {
                    let manifest = load_manifest(manifest_path.as_deref())?;
                    validate_security_group_local(&manifest, args.group_type)?
                }
            };
            print!("{}", format_validation_report(&report));
            if !report.is_correctly_configured {
                std::process::exit(2);
            }
        }
        Commands::CheckTraffic(args) => {
            let manifest = load_manifest(manifest_path.as_deref())?;
            let audits = traffic_audit(&manifest)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&audits)?);
            } else {
                print!("{}", format_traffic_audit(&audits));
            }
        }
        Commands::Validate(args) => {
            let path = expand_path(&args.file.to_string_lossy());
            let result = validate_manifest_file(&path);
            print!("{}", format_validation_result(&result, &path.display().to_string()));
            if !result.valid {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn serve(manifest: Manifest, args: ServeArgs) -> Result<()> {
    if let Some(ref env_file) = args.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
    }

    let store = if args.no_state {
        None
    } else {
        let path = args
            .state_file
            .as_ref()
            .map(|p| expand_path(&p.to_string_lossy()))
            .unwrap_or_else(default_state_path);
        Some(StateStore::new(path))
    };

    let clock = MonotonicClock::shared();
    let saved = match (&store, args.fresh) {
        (Some(store), false) => store.load()?,
        _ => None,
    };
    let controller = match saved {
        Some(snapshot) => FleetController::restore(&snapshot, clock)?,
        None => FleetController::from_manifest(&manifest, clock)?,
    };
    let started = controller.start_all()?;
    info!("Started {} group(s)", started);

    let controller = Arc::new(controller);

    let mut reconciler_config = ReconcilerConfig::from_spec(&manifest.reconciler);
    if let Some(tick) = args.tick_secs {
        reconciler_config.tick = std::time::Duration::from_secs(tick.max(1));
    }
    let mut state = AppState::new(controller.clone());
    if let Some(store) = store {
        info!("Persisting state to {}", store.path().display());
        reconciler_config = reconciler_config.with_store(store.clone());
        state = state.with_store(store);
    }
    let shutdown_tx = spawn_reconciler(controller, reconciler_config);

    let addr = format!("{}:{}", args.bind_addr, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("fleetsim listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /health                          - Health check");
    info!("  GET  /v1/status                       - Fleet status");
    info!("  GET  /v1/groups[/{{name}}]              - Group status");
    info!("  POST /v1/groups/{{name}}/scale          - Manual scaling");
    info!("  POST /v1/security-groups/validate     - Security group validation");
    info!("  POST /v1/security-groups/{{id}}/authorize - Traffic audit");

    let app = create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    // The reconciler saves a final snapshot before it exits
    let _ = shutdown_tx.send(());
    shutdown_tx.closed().await;
    Ok(())
}
