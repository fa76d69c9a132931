//! HealOps agents binary: bus worker, headless task producer, and the
//! administrative cleanup command.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use healops_agents::adapters::github::GithubAdapter;
use healops_agents::adapters::linear::{LinearAdapter, OauthTokens};
use healops_agents::adapters::slack::SlackAdapter;
use healops_agents::adapters::{ChatHost, RepoHost, TicketHost};
use healops_agents::agent_loop::AgentLoopDeps;
use healops_agents::analysis::{LlmTitleGenerator, RootCauseAnalyzer};
use healops_agents::config::EngineConfig;
use healops_agents::llm::ChatClient;
use healops_agents::worker::{IncidentWorker, SharedDepsFactory};
use pipeline::bus::{IncidentTask, InProcessBus, MessageBus, TaskEnvelope, Topic};
use pipeline::config::PipelineConfig;
use pipeline::knowledge::{HashEmbedder, HttpEmbedder, KnowledgeRetriever};
use pipeline::ledger::{InMemoryLedger, ResolutionRequests};
use pipeline::memory::{FailsafeMemory, InMemoryMemoryStore};
use pipeline::reducer::LogReducer;
use pipeline::storage::memory::InMemoryStore;
use pipeline::storage::postgres::PostgresStore;
use pipeline::storage::{IncidentStore, LogStore};

#[derive(Parser)]
#[command(name = "healops-agents", about = "Autonomous incident-resolution workers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bus worker: consume the incident topic.
    Worker {
        /// Partitions per topic for the in-process bus.
        #[arg(long, default_value_t = 4)]
        partitions: usize,
    },
    /// Publish a process_log_entry task (headless producer).
    ProduceLog {
        /// Log id to enqueue.
        #[arg(long)]
        log_id: i64,
    },
    /// Delete all incidents and logs for a service. Dry-run by default.
    Cleanup {
        /// Service name to purge.
        #[arg(long)]
        service: String,
        /// Actually delete; without this flag only counts are reported.
        #[arg(long)]
        confirm: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

struct Runtime {
    store: Arc<InMemoryStore>,
    bus: Arc<InProcessBus>,
    worker: Arc<IncidentWorker>,
}

/// Wire the full worker stack. Storage is the in-memory backend here; the
/// Postgres backend slots into the same seams via `PostgresStore`.
fn build_runtime(partitions: usize) -> Result<Runtime> {
    let engine_config = EngineConfig::default();
    let pipeline_config = PipelineConfig::default();

    let store = Arc::new(InMemoryStore::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let bus = Arc::new(InProcessBus::with_partitions(partitions));
    let requests = Arc::new(ResolutionRequests::new(ledger, bus.clone()));

    let primary_llm = Arc::new(
        ChatClient::new(
            engine_config.primary_llm.clone(),
            engine_config.http_llm_timeout,
            engine_config.llm_call_timeout,
            engine_config.llm_max_retries,
        )
        .context("building primary LLM client")?,
    );
    let small_llm = Arc::new(
        ChatClient::new(
            engine_config.small_llm.clone(),
            engine_config.http_llm_timeout,
            engine_config.llm_call_timeout,
            engine_config.llm_max_retries,
        )
        .context("building small LLM client")?
        .with_sampling(0.1, 600),
    );

    let repo: Option<Arc<dyn RepoHost>> = match std::env::var("GITHUB_TOKEN") {
        Ok(token) if !token.is_empty() => Some(Arc::new(
            GithubAdapter::new(&token, engine_config.http_github_timeout)
                .context("building github adapter")?,
        )),
        _ => {
            warn!("GITHUB_TOKEN unset, repo operations disabled");
            None
        }
    };

    let linear: Option<Arc<LinearAdapter>> = match (
        std::env::var("LINEAR_ACCESS_TOKEN"),
        std::env::var("LINEAR_REFRESH_TOKEN"),
    ) {
        (Ok(access), Ok(refresh)) if !access.is_empty() => Some(Arc::new(
            LinearAdapter::new(
                OauthTokens {
                    access_token: access,
                    refresh_token: refresh,
                    expires_at: chrono::Utc::now() + chrono::Duration::minutes(30),
                },
                &std::env::var("LINEAR_CLIENT_ID").unwrap_or_default(),
                &std::env::var("LINEAR_CLIENT_SECRET").unwrap_or_default(),
                engine_config.http_llm_timeout,
            )
            .context("building linear adapter")?,
        )),
        _ => {
            warn!("LINEAR_ACCESS_TOKEN unset, ticketing disabled");
            None
        }
    };

    let chat: Option<Arc<dyn ChatHost>> = match std::env::var("SLACK_BOT_TOKEN") {
        Ok(token) if !token.is_empty() => Some(Arc::new(
            SlackAdapter::new(&token, engine_config.http_llm_timeout)
                .context("building slack adapter")?,
        )),
        _ => {
            warn!("SLACK_BOT_TOKEN unset, chat notifications disabled");
            None
        }
    };

    let memory = Arc::new(FailsafeMemory::new(Arc::new(InMemoryMemoryStore::new())));
    let embedder: Arc<dyn pipeline::knowledge::Embedder> =
        match std::env::var("HEALOPS_EMBEDDINGS_URL") {
            Ok(url) if !url.is_empty() => Arc::new(
                HttpEmbedder::new(
                    &url,
                    &std::env::var("HEALOPS_EMBEDDINGS_API_KEY").unwrap_or_default(),
                    &std::env::var("HEALOPS_EMBEDDINGS_MODEL")
                        .unwrap_or_else(|_| "text-embedding-3-small".into()),
                    engine_config.http_llm_timeout,
                )
                .context("building embeddings client")?,
            ),
            _ => Arc::new(HashEmbedder::new()),
        };
    let knowledge = Arc::new(KnowledgeRetriever::new(embedder));

    let reducer = Arc::new(LogReducer::new(
        store.clone(),
        store.clone(),
        store.clone(),
        requests.clone(),
        Arc::new(LlmTitleGenerator::new(small_llm.clone())),
        linear
            .clone()
            .map(|l| l as Arc<dyn pipeline::reducer::TicketCreator>),
        Some(Arc::new(healops_agents::adapters::describe::EnhancedDescriber)),
        pipeline_config,
    ));

    let analyzer = Arc::new(
        RootCauseAnalyzer::new(primary_llm.clone()).with_cheap_model(small_llm.clone()),
    );

    let factory_primary = primary_llm.clone();
    let factory_small = small_llm.clone();
    let factory_repo = repo.clone();
    let factory_memory = memory.clone();
    let factory_knowledge = knowledge.clone();
    let factory_artifacts: Arc<InMemoryStore> = store.clone();
    let factory_config = engine_config.clone();
    let loop_factory = Arc::new(SharedDepsFactory {
        build_deps: Box::new(move || AgentLoopDeps {
            llm: factory_primary.clone(),
            small_llm: factory_small.clone(),
            repo: factory_repo.clone(),
            memory: factory_memory.clone(),
            knowledge: factory_knowledge.clone(),
            artifacts: Some(factory_artifacts.clone()),
            config: factory_config.clone(),
        }),
    });

    let worker = Arc::new(IncidentWorker {
        reducer,
        requests,
        incidents: store.clone() as Arc<dyn IncidentStore>,
        logs: store.clone() as Arc<dyn LogStore>,
        analyzer,
        loop_factory,
        repo,
        tickets: linear.map(|l| l as Arc<dyn TicketHost>),
        chat,
        chat_channel: std::env::var("HEALOPS_CHAT_CHANNEL").ok(),
        active_jobs: tokio::sync::Mutex::new(0),
    });

    Ok(Runtime { store, bus, worker })
}

async fn run_worker(partitions: usize) -> Result<()> {
    let runtime = build_runtime(partitions)?;
    info!(partitions, "starting incident worker");
    let handles = runtime
        .bus
        .start_consumer(Topic::Incidents, runtime.worker.clone())
        .await;
    info!(consumers = handles.len(), "consumers started, waiting for tasks");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });
    shutdown.cancelled().await;

    // Let in-flight jobs settle before tearing consumers down.
    while *runtime.worker.active_jobs.lock().await > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
    for handle in handles {
        handle.abort();
    }
    info!("worker stopped");
    Ok(())
}

async fn produce_log(log_id: i64) -> Result<()> {
    let runtime = build_runtime(1)?;
    // The in-process bus lives and dies with this process, so the headless
    // producer also drains what it enqueues.
    let _handles = runtime
        .bus
        .start_consumer(Topic::Incidents, runtime.worker.clone())
        .await;
    let published = runtime
        .bus
        .publish(
            Topic::Incidents,
            &log_id.to_string(),
            TaskEnvelope::incident(IncidentTask::ProcessLogEntry { log_id }),
        )
        .await;
    if !published {
        anyhow::bail!("failed to publish task for log {log_id}");
    }
    info!(log_id, "log processing task published");
    // Give the consumer a moment to process before exiting.
    loop {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        if *runtime.worker.active_jobs.lock().await == 0 {
            break;
        }
    }
    Ok(())
}

/// Cleanup order matters: email logs first, then incidents, then logs, so
/// a partial failure never leaves incidents pointing at deleted logs.
async fn run_cleanup<S>(store: &S, service: &str, confirm: bool) -> Result<()>
where
    S: LogStore + IncidentStore,
{
    let incidents = store.count_incidents_for_service(service).await?;
    let logs = store.count_logs_for_service(service).await?;
    info!(service, incidents, logs, "cleanup scope");

    if !confirm {
        info!("dry run: nothing deleted (pass --confirm to delete)");
        return Ok(());
    }

    let email_logs_deleted = store.delete_email_logs_for_service(service).await?;
    let incidents_deleted = store.delete_incidents_for_service(service).await?;
    let logs_deleted = store.delete_logs_for_service(service).await?;
    info!(
        service,
        email_logs_deleted, incidents_deleted, logs_deleted, "cleanup committed"
    );
    Ok(())
}

async fn cleanup(service: &str, confirm: bool) -> Result<()> {
    match std::env::var("DATABASE_URL") {
        Ok(url) if !url.is_empty() => {
            let store = PostgresStore::connect(&url)
                .await
                .context("connecting to database")?;
            run_cleanup(&store, service, confirm).await
        }
        _ => {
            warn!("DATABASE_URL unset, running cleanup against the in-process store");
            let runtime = build_runtime(1)?;
            run_cleanup(runtime.store.as_ref(), service, confirm).await
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Worker { partitions } => run_worker(partitions).await,
        Command::ProduceLog { log_id } => produce_log(log_id).await,
        Command::Cleanup { service, confirm } => cleanup(&service, confirm).await,
    }
}
