use std::sync::Arc;

use anyhow::Context;
use axum::http::Method;
use clap::{Parser, Subcommand};
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use parley_domain::config::ConfigFile;
use parley_domain::registry::ConfigRegistry;
use parley_gateway::api;
use parley_gateway::auth::AuthService;
use parley_gateway::hub::Hub;
use parley_gateway::runtime::approval::ApprovalCoordinator;
use parley_gateway::runtime::cancel::CancelMap;
use parley_gateway::runtime::turn_lock::TurnLockMap;
use parley_gateway::settings::Settings;
use parley_gateway::state::{AppState, ToolHost};
use parley_providers::{ClientPool, OpenAiCompatClient};
use parley_store::ConversationStore;

#[derive(Parser)]
#[command(name = "parley", about = "Multi-agent conversation gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway server (default).
    Serve,
    /// Domains-file tooling.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Parse and validate the domains file without starting the server.
    Validate,
    /// Print the loaded definitions.
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            run_server().await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let settings = Settings::from_env();
            let file = ConfigFile::load(&settings.domains_file)?;
            match ConfigRegistry::from_file(&file) {
                Ok(registry) => {
                    let snapshot = registry.snapshot();
                    println!(
                        "ok: {} domains, {} agents, {} tools (hash {})",
                        snapshot.domain_count(),
                        snapshot.agent_count(),
                        snapshot.tool_count(),
                        snapshot.hash(),
                    );
                    Ok(())
                }
                Err(e) => {
                    eprintln!("invalid: {e}");
                    std::process::exit(1);
                }
            }
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let settings = Settings::from_env();
            let file = ConfigFile::load(&settings.domains_file)?;
            println!("{}", toml::to_string_pretty(&file)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("parley {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the server path. `LOG_LEVEL` (or the
/// standard `RUST_LOG`) controls the filter.
fn init_tracing() {
    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info,parley_gateway=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).json().init();
}

async fn run_server() -> anyhow::Result<()> {
    tracing::info!("parley starting");

    // ── Settings ─────────────────────────────────────────────────────
    let settings = Arc::new(Settings::from_env());
    let warnings = settings
        .validate()
        .map_err(|e| anyhow::anyhow!("settings: {e}"))?;
    for warning in warnings {
        tracing::warn!("settings: {warning}");
    }

    // ── Metrics recorder ─────────────────────────────────────────────
    let prometheus = parley_gateway::metrics::install().context("installing metrics recorder")?;
    tracing::info!("metrics recorder ready");

    // ── Config registry ──────────────────────────────────────────────
    let registry = if settings.domains_file.exists() {
        let file = ConfigFile::load(&settings.domains_file)
            .context("loading domains file")?;
        Arc::new(ConfigRegistry::from_file(&file).map_err(|e| anyhow::anyhow!("{e}"))?)
    } else {
        tracing::warn!(
            path = %settings.domains_file.display(),
            "domains file missing — starting with an empty config; POST /v1/config/reload after creating it"
        );
        Arc::new(ConfigRegistry::new())
    };
    {
        let snapshot = registry.snapshot();
        tracing::info!(
            hash = %snapshot.hash(),
            domains = snapshot.domain_count(),
            agents = snapshot.agent_count(),
            tools = snapshot.tool_count(),
            "config registry ready"
        );
    }

    // ── Conversation store ───────────────────────────────────────────
    let store = Arc::new(
        ConversationStore::open(&settings.database_path).context("opening conversation store")?,
    );

    // ── LLM client pool ──────────────────────────────────────────────
    let pool = Arc::new(ClientPool::new(
        settings.llm_model_default.clone(),
        settings.llm_max_in_flight,
    ));
    {
        let mut model_ids: Vec<String> = registry
            .snapshot()
            .list_domains()
            .iter()
            .flat_map(|d| registry.snapshot().list_agents_for_domain(&d.id))
            .map(|a| a.model_id.clone())
            .collect();
        model_ids.push(settings.llm_model_default.clone());
        model_ids.sort();
        model_ids.dedup();
        for model_id in model_ids {
            let client = OpenAiCompatClient::new(
                format!("openai_compat/{model_id}"),
                &settings.llm_base_url,
                settings.llm_api_key.clone(),
                model_id.clone(),
                settings.llm_idle_timeout,
            )
            .map_err(|e| anyhow::anyhow!("building LLM client: {e}"))?;
            pool.register(model_id, Arc::new(client));
        }
    }
    tracing::info!(base_url = %settings.llm_base_url, "LLM client pool ready");

    // ── Tool host ────────────────────────────────────────────────────
    std::fs::create_dir_all(&settings.workspace_root)
        .with_context(|| format!("creating workspace {}", settings.workspace_root.display()))?;
    let tools = Arc::new(ToolHost::build(
        &registry.snapshot(),
        &settings.workspace_root,
    ));

    // ── Turn machinery ───────────────────────────────────────────────
    let approvals = Arc::new(ApprovalCoordinator::new(
        store.clone(),
        settings.approval_timeout,
    ));
    let cancel_map = Arc::new(CancelMap::new());
    let turn_locks = Arc::new(TurnLockMap::new());
    tracing::info!(
        approval_timeout_ms = settings.approval_timeout.as_millis() as u64,
        "turn machinery ready"
    );

    // ── Session hub ──────────────────────────────────────────────────
    let hub = Arc::new(Hub::new(
        settings.session_outbound_queue,
        settings.max_connections_per_identity,
    ));

    // ── Auth ─────────────────────────────────────────────────────────
    let auth = Arc::new(AuthService::from_settings(&settings).map_err(|e| anyhow::anyhow!("{e}"))?);

    let state = AppState {
        settings: settings.clone(),
        registry,
        tools,
        store,
        pool,
        approvals: approvals.clone(),
        cancel_map,
        turn_locks: turn_locks.clone(),
        hub,
        auth,
        prometheus,
    };

    // ── Background sweepers ──────────────────────────────────────────
    {
        let approvals = approvals.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
            loop {
                interval.tick().await;
                approvals.sweep_expired();
            }
        });
    }
    {
        let turn_locks = turn_locks.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                turn_locks.prune_idle();
            }
        });
    }

    // ── HTTP stack ───────────────────────────────────────────────────
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ]);

    let max_concurrent = std::env::var("PARLEY_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);

    // Optional per-IP rate limiting.
    let governor_layer = std::env::var("PARLEY_RATE_LIMIT_RPS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(|rps| {
            use tower_governor::governor::GovernorConfigBuilder;
            use tower_governor::GovernorLayer;

            let burst = std::env::var("PARLEY_RATE_LIMIT_BURST")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(32);
            let config = GovernorConfigBuilder::default()
                .per_second(rps)
                .burst_size(burst)
                .finish()
                .expect("PARLEY_RATE_LIMIT_RPS and burst must be > 0");
            tracing::info!(rps, burst, "per-IP rate limiting enabled");
            GovernorLayer {
                config: Arc::new(config),
            }
        });

    let router = api::router(state.clone())
        .layer(cors)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent));
    let app = if let Some(governor) = governor_layer {
        router.layer(governor).with_state(state)
    } else {
        router.with_state(state)
    };

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "parley listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
