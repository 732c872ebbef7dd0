use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use relay_agent::agent::{
    AgentDeps, AgentStats, CommandExecutor, ConversationMemory, Dispatcher, ExecutorConfig,
    IdentityGate, SessionRegistry, TriggerPolicy,
};
use relay_agent::channels::{
    ChatDbReader, CursorFile, IMessageSender, TelegramBot, spawn_imessage_poller, spawn_telegram_channel,
};
use relay_agent::config::AgentConfig;
use relay_agent::error::ConfigError;
use relay_agent::files::{AttachmentStager, MacScreenCapture, archive_stale_outbox};
use relay_agent::identity::IdentityResolver;
use relay_agent::interpreter::ClaudeCli;
use relay_agent::safety::DeletionGuard;
use relay_agent::store::{LibSqlBackend, MemoryStore};
use relay_agent::tools::ShellRunner;

#[tokio::main]
async fn main() -> relay_agent::error::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(AgentConfig::default_path);
    let config = AgentConfig::load(&config_path).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  config: {}", config_path.display());
        std::process::exit(1);
    });

    // Console plus a daily-rotated file; the guard flushes the file writer on exit.
    std::fs::create_dir_all(config.log_dir()).map_err(ConfigError::Io)?;
    let file_appender = tracing_appender::rolling::daily(config.log_dir(), "agent.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    eprintln!("🤖 Relay Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Config: {}", config_path.display());
    eprintln!("   Data: {}", config.data_dir.display());
    eprintln!("   Interpreter: {}", config.interpreter_program);

    // ── Memory store ─────────────────────────────────────────────────────
    let db_path = config.memory_db_path();
    let store: Arc<dyn MemoryStore> = Arc::new(
        LibSqlBackend::new_local(&db_path).await.unwrap_or_else(|e| {
            eprintln!("Error: Failed to open database at {}: {e}", db_path.display());
            std::process::exit(1);
        }),
    );
    eprintln!("   Memory: {}", db_path.display());

    // ── Shared agent components ──────────────────────────────────────────
    let interpreter = Arc::new(
        ClaudeCli::new(config.interpreter_program.clone())
            .with_working_dir(config.workspace_dir.clone()),
    );
    let stats = Arc::new(AgentStats::new());
    let shell = ShellRunner::new()
        .with_working_dir(config.workspace_dir.clone())
        .with_timeout(config.shell_timeout());
    let executor = CommandExecutor::new(
        interpreter.clone(),
        shell,
        DeletionGuard::default_rules(),
        Arc::clone(&stats),
        ExecutorConfig {
            interpreter_timeout: config.interpreter_timeout(),
            max_response_length: config.max_response_length,
            allowed_tools: config.allowed_tools.clone(),
        },
    );
    let memory = ConversationMemory::new(Arc::clone(&store), interpreter, config.summary_timeout());

    let deps = Arc::new(AgentDeps {
        resolver: IdentityResolver::new(config.sender_identity_map.clone()),
        gate: IdentityGate::new(),
        sessions: SessionRegistry::new(),
        stats,
        executor,
        memory,
        stager: AttachmentStager::new(
            config.inbox_dir(),
            config.max_file_size_mb,
            config.max_image_size_mb,
        ),
        screen: Arc::new(MacScreenCapture::new(config.outbox_dir())),
    });

    // ── Maintenance ──────────────────────────────────────────────────────
    let outbox_max_age = Duration::from_secs(config.outbox_max_age_hours * 3600);
    run_maintenance(&deps, &config, outbox_max_age).await;
    let _maintenance_handle = spawn_maintenance_ticker(
        Arc::clone(&deps),
        config.maintenance_interval(),
        config.outbox_dir(),
        outbox_max_age,
    );

    // ── Channels ─────────────────────────────────────────────────────────
    let mut shutdown_flags = Vec::new();
    let mut handles = Vec::new();

    if config.store_poll_enabled() {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&deps),
            TriggerPolicy::Prefix(config.trigger_prefix.clone()),
            Arc::new(IMessageSender::new()),
        ));
        let reader = ChatDbReader::new(config.chat_db_path.clone(), config.allowed_handles.clone());
        let (handle, shutdown) = spawn_imessage_poller(
            reader,
            CursorFile::new(config.cursor_path()),
            dispatcher,
            config.poll_interval(),
        );
        eprintln!(
            "   iMessage: {} handle(s), trigger {:?}, every {}s",
            config.allowed_handles.len(),
            config.trigger_prefix,
            config.poll_interval_secs
        );
        handles.push(handle);
        shutdown_flags.push(shutdown);
    } else {
        eprintln!("   iMessage: disabled");
    }

    if let Some(token) = config.telegram_bot_token.clone() {
        let bot = Arc::new(TelegramBot::new(
            token,
            config.allowed_telegram_ids.clone(),
            config.inbox_dir(),
        )?);
        if config.allowed_telegram_ids.is_empty() {
            tracing::warn!("Telegram enabled with an empty allowlist; all senders will be ignored");
        }
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&deps),
            TriggerPolicy::AlwaysOn(config.trigger_prefix.clone()),
            bot.clone(),
        ));
        let (handle, shutdown) = spawn_telegram_channel(bot, dispatcher);
        eprintln!("   Telegram: {} allowed user(s)", config.allowed_telegram_ids.len());
        handles.push(handle);
        shutdown_flags.push(shutdown);
    } else {
        eprintln!("   Telegram: disabled");
    }

    eprintln!("   Press Ctrl+C to stop.\n");

    wait_for_shutdown().await;
    tracing::info!("Shutdown signal received");

    for flag in &shutdown_flags {
        flag.store(true, std::sync::atomic::Ordering::Relaxed);
    }
    for handle in handles {
        handle.abort();
    }

    Ok(())
}

async fn run_maintenance(deps: &AgentDeps, config: &AgentConfig, outbox_max_age: Duration) {
    let report = deps.memory.run_daily_maintenance().await;
    if report.summarized_days > 0 || report.failed_days > 0 {
        tracing::info!(
            summarized = report.summarized_days,
            archived = report.archived_turns,
            failed = report.failed_days,
            "Startup memory maintenance finished"
        );
    }
    match archive_stale_outbox(&config.outbox_dir(), outbox_max_age).await {
        Ok(0) => {}
        Ok(moved) => tracing::info!(moved, "Archived stale outbox files"),
        Err(e) => tracing::warn!("Outbox cleanup failed: {e}"),
    }
}

/// Hourly rollover so a long-running daemon still compacts yesterday.
fn spawn_maintenance_ticker(
    deps: Arc<AgentDeps>,
    interval: Duration,
    outbox_dir: PathBuf,
    outbox_max_age: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let report = deps.memory.run_daily_maintenance().await;
            if report.summarized_days > 0 {
                tracing::info!(
                    summarized = report.summarized_days,
                    archived = report.archived_turns,
                    "Memory rollover finished"
                );
            }
            if let Err(e) = archive_stale_outbox(&outbox_dir, outbox_max_age).await {
                tracing::warn!("Outbox cleanup failed: {e}");
            }
        }
    })
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
