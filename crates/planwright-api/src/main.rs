//! Planwright CLI and REST API entry point.
//!
//! Binary name: `pwr`
//!
//! Parses CLI arguments, initializes the database and the engine, then
//! dispatches to the appropriate command handler or starts the REST API
//! server.

mod cli;
mod http;
mod state;

use std::time::Duration;

use clap::Parser;
use planwright_observe::tracing_setup::{
    LogFormat, TracingOptions, directive_for_verbosity, init_tracing, shutdown_tracing,
};

use cli::plan::PlanCommand;
use cli::{Cli, Commands, LogFormatArg};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions {
        default_directive: directive_for_verbosity(cli.verbose, cli.quiet).to_string(),
        format: match cli.log_format {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        },
        enable_otel: cli.otel,
    };
    init_tracing(&options).map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Validation is a pure parse and needs no database.
    if let Commands::Plan {
        command: PlanCommand::Validate { file },
    } = &cli.command
    {
        return cli::plan::handle_validate(file, cli.json).await;
    }

    let state = AppState::init().await?;
    let json = cli.json;

    let result = match cli.command {
        Commands::Plan { command } => cli::plan::handle_plan_command(command, &state, json).await,
        Commands::Run {
            plan_id,
            input,
            wait,
            timeout,
        } => {
            cli::execution::handle_run(
                &plan_id,
                input.as_deref(),
                wait,
                Duration::from_secs(timeout),
                &state,
                json,
            )
            .await
        }
        Commands::Status { id } => cli::execution::handle_status(&id, &state, json).await,
        Commands::Nodes { id } => cli::execution::handle_nodes(&id, &state, json).await,
        Commands::Notify {
            correlation_id,
            payload,
            error,
        } => cli::signal::handle_notify(&correlation_id, payload.as_deref(), error, &state, json).await,
        Commands::Interrupt {
            id,
            kind,
            node,
            reason,
        } => cli::signal::handle_interrupt(&id, &kind, node.as_deref(), reason, &state, json).await,
        Commands::Serve { port, host } => serve(&state, host, port).await,
    };

    // Let continuations triggered by this command run before exiting.
    state.shutdown().await;
    result
}

async fn serve(state: &AppState, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| state.config.server.host.clone());
    let port = port.unwrap_or(state.config.server.port);

    // Pick up waits whose payloads arrived while no engine was running.
    match state.strategy().sweep_ready_waits(state.config.engine.max_concurrent_jobs as u32).await {
        Ok(0) => {}
        Ok(resumed) => tracing::info!(resumed, "resumed ready waits on startup"),
        Err(e) => tracing::warn!(error = %e, "startup sweep failed"),
    }

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!(
        "  {} Planwright API listening on {}",
        console::style("⚡").bold(),
        console::style(format!("http://{addr}")).cyan()
    );
    println!(
        "  {} {}",
        console::style("Data directory").dim(),
        state.data_dir.display()
    );
    println!("  {}", console::style("Press Ctrl+C to stop").dim());

    let router = http::router::build_router(state.clone());

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    println!("\n  Server stopped.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
