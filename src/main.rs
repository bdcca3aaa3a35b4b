use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use lead_qualifier::approvals::approval_routes;
use lead_qualifier::channels::{
    EmailConfig, EmailNotifier, EmailTransport, HotLeadNotifier, LeadTransport, LogNotifier,
};
use lead_qualifier::config::AppConfig;
use lead_qualifier::leads::{ConversationEngine, LeadProcessor, LlmOutcomeClassifier, ScoringEngine};
use lead_qualifier::llm::{LlmConfig, LlmProvider, create_provider, provider_chain};
use lead_qualifier::prompts::seed_default_prompts;
use lead_qualifier::scheduler::{parse_schedule, spawn_cold_sweep, spawn_poller};
use lead_qualifier::store::{LeadStore, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let app = AppConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(app.log_dir.as_deref());

    eprintln!("Lead qualifier v{}", env!("CARGO_PKG_VERSION"));

    // ── Database ────────────────────────────────────────────────────
    let store = Arc::new(
        LibSqlBackend::new_local(&app.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", app.db_path.display()))?,
    );
    let seeded = seed_default_prompts(store.as_ref()).await?;
    let system = store.load_system_config().await?;
    eprintln!("   Database: {} ({seeded} prompts seeded)", app.db_path.display());

    // ── Language models ─────────────────────────────────────────────
    let chain = provider_chain(&app, &system)?;
    eprintln!(
        "   Generation: {} then {} ({} configured)",
        system.primary_provider,
        system.fallback_provider,
        chain.len()
    );
    let llm: Arc<dyn LlmProvider> = Arc::new(chain);
    let classifier_llm = create_provider(&LlmConfig::from_app(&app, app.classifier_provider))
        .context("The outcome classifier's provider must be configured")?;
    eprintln!("   Classifier: {}", app.classifier_provider);
    let classifier = Arc::new(LlmOutcomeClassifier::new(classifier_llm, store.clone()));
    let engine = ConversationEngine::new(llm, store.clone(), classifier);

    // ── Mailbox ─────────────────────────────────────────────────────
    let email = EmailConfig::from_env().context("EMAIL_IMAP_HOST is not set; a lead mailbox is required")?;
    eprintln!("   Email: IMAP {} / SMTP {}", email.imap_host, email.smtp_host);
    let transport: Arc<dyn LeadTransport> = Arc::new(EmailTransport::new(email));

    let notifier: Arc<dyn HotLeadNotifier> = match &app.sales_team_email {
        Some(to) => {
            eprintln!("   Hot leads: email to {to}");
            Arc::new(EmailNotifier::new(Arc::clone(&transport), to.clone()))
        }
        None => {
            eprintln!("   Hot leads: log only (SALES_TEAM_EMAIL not set)");
            Arc::new(LogNotifier)
        }
    };

    let processor = Arc::new(LeadProcessor::new(
        store.clone(),
        engine,
        ScoringEngine::new(app.scoring.clone()),
        notifier,
        Arc::clone(&transport),
    ));

    // ── Background tasks ────────────────────────────────────────────
    let interval = Duration::from_secs(u64::from(system.polling_interval_minutes) * 60);
    let (poller, poller_stop) = spawn_poller(Arc::clone(&processor), transport, interval);

    let schedule = parse_schedule(&app.cold_sweep_cron)?;
    let (sweeper, sweep_stop) = spawn_cold_sweep(Arc::clone(&processor), schedule);
    eprintln!(
        "   Polling every {} min, cold sweep '{}'",
        system.polling_interval_minutes, app.cold_sweep_cron
    );

    // ── Approval API ────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", app.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", app.http_port))?;
    eprintln!("   Approval API: http://0.0.0.0:{}/api/pending\n", app.http_port);
    tracing::info!(port = app.http_port, "Approval API started");

    axum::serve(listener, approval_routes(processor))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    poller_stop.store(true, Ordering::Relaxed);
    sweep_stop.store(true, Ordering::Relaxed);
    poller.abort();
    sweeper.abort();
    Ok(())
}

/// Console logging, plus a daily-rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lead-qualifier.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}
