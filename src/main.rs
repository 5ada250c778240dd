use anyhow::{anyhow, Context};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use dotenvy::dotenv;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;

use ticketportal::core::config::AppConfig;
use ticketportal::core::shared::state::AppState;
use ticketportal::core::shared::utils::{create_conn, run_migrations};
use ticketportal::email::{EmailQueue, Mailer};
use ticketportal::tickets::api::configure_tickets_routes;
use ticketportal::tickets::pg_store::PgStore;
use ticketportal::tickets::remote::HttpRemoteClient;

const USAGE: &str = "\
Usage: ticketportal <command>

Commands:
  serve             Run the portal API and the scheduled jobs
  reconcile         Run one reconciliation pass against the remote system
  import-worklogs   Import remote worklogs into linked tickets
  --help            Show this message

Configuration is read from portal.toml (or $PORTAL_CONFIG) and PORTAL_* variables.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Serve,
    Reconcile,
    ImportWorklogs,
}

fn parse_command(args: &[String]) -> Option<Command> {
    match args.get(1).map(String::as_str) {
        None | Some("serve") => Some(Command::Serve),
        Some("reconcile") => Some(Command::Reconcile),
        Some("import-worklogs") => Some(Command::ImportWorklogs),
        _ => None,
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let command = match parse_command(&args) {
        Some(command) => command,
        None => {
            if !matches!(args.get(1).map(String::as_str), Some("--help" | "-h")) {
                eprintln!("Unknown command: {}\n", args[1..].join(" "));
                eprintln!("{USAGE}");
                std::process::exit(2);
            }
            println!("{USAGE}");
            return;
        }
    };

    if let Err(e) = run(command).await {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    let config = AppConfig::load().context("loading configuration")?;
    config.validate().context("invalid configuration")?;
    info!("Configuration loaded: {config:?}");

    let pool = create_conn(&config.database_url).context("connecting to the database")?;
    run_migrations(&pool).map_err(|e| anyhow!("running migrations: {e}"))?;

    let store = Arc::new(PgStore::new(pool));
    let remote = Arc::new(HttpRemoteClient::new(&config.remote).context("building remote client")?);
    let mailer = build_mailer(&config)?;
    let email = Arc::new(EmailQueue::spawn(Arc::clone(&mailer)));
    let state = Arc::new(AppState::new(
        config,
        store,
        remote,
        mailer,
        Arc::clone(&email),
    ));

    let result = match command {
        Command::Reconcile => {
            let report = state.reconciliation_job().run().await;
            println!("{report}");
            for change in &report.changes {
                println!("  {change}");
            }
            Ok(())
        }
        Command::ImportWorklogs => {
            let report = state.worklog_importer().run().await;
            println!("{report}");
            Ok(())
        }
        Command::Serve => serve(Arc::clone(&state)).await,
    };

    email.shutdown().await;
    result
}

#[cfg(feature = "mail")]
fn build_mailer(config: &AppConfig) -> anyhow::Result<Arc<dyn Mailer>> {
    let mailer = ticketportal::email::smtp::SmtpMailer::new(&config.email)
        .context("building SMTP transport")?;
    Ok(Arc::new(mailer))
}

#[cfg(not(feature = "mail"))]
fn build_mailer(_config: &AppConfig) -> anyhow::Result<Arc<dyn Mailer>> {
    warn!("Built without the mail feature, outgoing email is only recorded in memory");
    Ok(Arc::new(ticketportal::email::RecordingMailer::new()))
}

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let db_ok = state.store.user(0).is_ok();
    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(serde_json::json!({
            "status": if db_ok { "healthy" } else { "degraded" },
            "service": "ticketportal",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    #[cfg(feature = "tasks")]
    let scheduler = ticketportal::tasks::start_portal_jobs(Arc::clone(&state))
        .await
        .context("scheduling background jobs")?;
    #[cfg(not(feature = "tasks"))]
    warn!("Built without the tasks feature, background jobs are disabled");

    let addr: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port)
        .parse()
        .context("invalid server address")?;

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(configure_tickets_routes())
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    #[cfg(feature = "tasks")]
    scheduler.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command(&args(&["portal"])), Some(Command::Serve));
        assert_eq!(parse_command(&args(&["portal", "reconcile"])), Some(Command::Reconcile));
        assert_eq!(
            parse_command(&args(&["portal", "import-worklogs"])),
            Some(Command::ImportWorklogs)
        );
        assert_eq!(parse_command(&args(&["portal", "--help"])), None);
        assert_eq!(parse_command(&args(&["portal", "sync"])), None);
    }
}
