use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use llanogas::api::{self, AppState};
use llanogas::cases::CaseWorkflow;
use llanogas::config::AppConfig;
use llanogas::mail::{GmailMailbox, MailSync, spawn_sync_loop};
use llanogas::notify::{NotificationDispatcher, SmtpMailSender};
use llanogas::store::{Database, LibSqlBackend};

/// How long shutdown waits for a mail sync tick in flight.
const SYNC_SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = AppConfig::from_env().context("invalid configuration")?;

    // ── Logging ─────────────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = config.log_dir.as_ref().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "llanogas.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            fmt::layer().with_target(false).with_ansi(false).with_writer(writer),
            guard,
        )
    });
    let (file_layer, _log_guard) = match file_layer {
        Some((layer, guard)) => (Some(layer), Some(guard)),
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "LLANOGAS starting");

    // ── Database ────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Notifications ───────────────────────────────────────────────────
    let mut notifier = NotificationDispatcher::new(Arc::clone(&db));
    match config.smtp.clone() {
        Some(smtp) => {
            info!(host = %smtp.host, "Notification mail enabled");
            notifier = notifier.with_mailer(Arc::new(SmtpMailSender::new(smtp)));
        }
        None => info!("SMTP_HOST not set; notifications are in-app only"),
    }

    let workflow = CaseWorkflow::new(Arc::clone(&db), notifier.clone());

    // ── Mail sync ───────────────────────────────────────────────────────
    let mut sync_loop = None;
    let sync = match config.gmail.clone() {
        Some(gmail) => {
            let sync = Arc::new(MailSync::new(
                Arc::new(GmailMailbox::new(gmail)),
                Arc::clone(&db),
                notifier.clone(),
                config.sync.clone(),
            ));
            sync_loop = Some(spawn_sync_loop(Arc::clone(&sync)));
            Some(sync)
        }
        None => {
            info!("Gmail credentials not set; mail sync disabled");
            None
        }
    };

    // ── HTTP API ────────────────────────────────────────────────────────
    let app = api::router(AppState {
        workflow,
        db: Arc::clone(&db),
        sync,
    })
    .layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(port = config.http_port, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("HTTP server failed")?;

    // The loop exits at once when idle, or after the tick in flight.
    if let Some((handle, shutdown)) = sync_loop {
        shutdown.notify_one();
        match tokio::time::timeout(SYNC_SHUTDOWN_GRACE, handle).await {
            Ok(Ok(())) => info!("Mail sync stopped"),
            Ok(Err(e)) => warn!(error = %e, "Mail sync task ended abnormally"),
            Err(_) => warn!(
                grace_secs = SYNC_SHUTDOWN_GRACE.as_secs(),
                "Mail sync tick still running at shutdown; abandoning it"
            ),
        }
    }
    info!("LLANOGAS stopped");
    Ok(())
}
