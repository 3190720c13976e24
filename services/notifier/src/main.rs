use std::path::PathBuf;
use std::sync::Arc;

use clap::{Arg, Command};
use notifier::api::HttpNotificationApi;
use notifier::config::{self, DEFAULT_CONFIG_PATH};
use notifier::control_api::{AppState, build_router};
use notifier::controller::{ControllerConfig, ControllerDeps, NotificationController};
use notifier::desktop::notifier_for;
use notifier::transport::{TransportConfig, TransportManager};
use notifier::ui_events::NotifierUiEvent;
use notifier::ui_log::UiLogger;
use tokio::sync::broadcast;
use tracing::{error, info};

const LOG_BUFFER_ENTRIES: usize = 500;

#[tokio::main]
async fn main() {
    let matches = Command::new("HealthSync Notifier")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Realtime notification client for HealthSync")
        .arg(
            Arg::new("config")
                .help("Path to the TOML config file")
                .short('c')
                .long("config")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("log_level")
                .help("Log filter, overrides RUST_LOG (e.g. info, notifier=debug)")
                .long("log-level"),
        )
        .get_matches();

    let filter = match matches.get_one::<String>("log_level") {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(version = env!("CARGO_PKG_VERSION"), "notifier starting");

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        info!("rustls crypto provider already installed");
    }

    // -------------------------------------------------------------------------
    // 1. Load config
    // -------------------------------------------------------------------------
    let config_path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let cfg = config::load_config_from_path(&config_path).unwrap_or_else(|e| {
        eprintln!("FATAL: failed to load config: {e}");
        std::process::exit(1);
    });
    let realtime_url = cfg.server.realtime_url().unwrap_or_else(|e| {
        eprintln!("FATAL: {e}");
        std::process::exit(1);
    });

    // -------------------------------------------------------------------------
    // 2. Collaborators
    // -------------------------------------------------------------------------
    let api = HttpNotificationApi::new(
        &cfg.server.base_url,
        &cfg.server.profile_path,
        cfg.token.clone(),
        cfg.server.request_timeout,
    )
    .unwrap_or_else(|e| {
        eprintln!("FATAL: failed to build HTTP client: {e}");
        std::process::exit(1);
    });
    let api = Arc::new(api);

    let transport = Arc::new(TransportManager::new(TransportConfig {
        url: realtime_url,
        token: cfg.token.clone(),
        destination: cfg.realtime.destination.clone(),
        reconnect_base_delay: cfg.realtime.reconnect_base_delay,
        max_reconnect_attempts: cfg.realtime.max_reconnect_attempts,
        send_connection_test: cfg.realtime.send_connection_test,
    }));

    let (ui_tx, _) = broadcast::channel::<NotifierUiEvent>(256);
    let logger = UiLogger::new(ui_tx.clone(), LOG_BUFFER_ENTRIES);

    // -------------------------------------------------------------------------
    // 3. Controller
    // -------------------------------------------------------------------------
    let controller = NotificationController::spawn(
        ControllerDeps {
            api: api.clone(),
            identity: api,
            transport: Arc::clone(&transport),
            desktop: notifier_for(cfg.desktop),
            ui_tx: ui_tx.clone(),
            logger: logger.clone(),
        },
        ControllerConfig {
            default_role: cfg.session.default_role,
            refresh_interval: cfg.session.refresh_interval,
        },
    );

    // -------------------------------------------------------------------------
    // 4. Control API
    // -------------------------------------------------------------------------
    let state = Arc::new(AppState {
        controller: controller.clone(),
        transport,
        ui_tx,
        logger,
    });
    let listener = tokio::net::TcpListener::bind(&cfg.control_api.bind)
        .await
        .unwrap_or_else(|e| {
            eprintln!("FATAL: cannot bind control API on {}: {e}", cfg.control_api.bind);
            std::process::exit(1);
        });
    info!(bind = %cfg.control_api.bind, "control API listening");

    let server = axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await;
    if let Err(e) = server {
        error!(error = %e, "control API failed");
    }

    if let Err(e) = controller.dispose().await {
        error!(error = %e, "controller did not shut down cleanly");
    }
    info!("notifier stopped");
}
