use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use beebo_backend::config::AppConfig;
use beebo_backend::llm::{LlmClient, OpenAiClient};
use beebo_backend::memory::Summarizer;
use beebo_backend::notify::LoggingDispatcher;
use beebo_backend::plan::{LlmPlanGenerator, PlanService};
use beebo_backend::scheduler::JobScheduler;
use beebo_backend::server;
use beebo_backend::session::SessionManager;
use beebo_backend::store::ChatStore;
use beebo_backend::tools::{BackendToolRunner, ToolCoordinator};
use beebo_backend::transport::{ConnectionManager, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,beebo_backend=debug")),
        )
        .init();

    tracing::info!("Beebo backend starting...");

    let config = AppConfig::load();
    let store = Arc::new(ChatStore::new(&config.database_path)?);
    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(&config.llm));

    let plans = Arc::new(PlanService::new(Arc::clone(&store)));
    let summarizer = Arc::new(Summarizer::new(Arc::clone(&llm), Arc::clone(&store)));
    let generator = Arc::new(LlmPlanGenerator::new(Arc::clone(&llm)));
    let runner = Arc::new(BackendToolRunner::new(
        Arc::clone(&store),
        Arc::clone(&plans),
        generator,
        Arc::clone(&summarizer),
    ));

    let (coordinator, timeout_rx) =
        ToolCoordinator::new(Duration::from_secs(config.tool_call_timeout_secs));
    let scheduler = Arc::new(JobScheduler::new());
    let connections = Arc::new(ConnectionManager::new());

    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&store),
        Arc::clone(&connections) as Arc<dyn Transport>,
        llm,
        runner,
        coordinator,
        scheduler,
        summarizer,
        plans,
        Arc::new(LoggingDispatcher::new(store)),
        Duration::from_secs(config.summary_delay_mins * 60),
        Duration::from_secs(config.check_in_delay_mins * 60),
    ));

    server::serve(&config.bind_addr, sessions, connections, timeout_rx).await
}
