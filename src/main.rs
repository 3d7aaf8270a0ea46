use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use flowcore::config::ServerConfig;
use flowcore::limits::{MemorySubscriptions, RateLimitConfig, RateLimiter};
use flowcore::llm::ProviderRegistry;
use flowcore::realtime::protocol::OpenAccess;
use flowcore::realtime::server::{self, AppState};
use flowcore::realtime::CollabServer;
use flowcore::store::MemoryStore;

#[derive(Parser)]
#[command(name = "flowcore")]
#[command(author, version, about = "Workflow automation runtime core", long_about = None)]
struct Cli {
    /// Path to a YAML server configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collaboration and execution server
    Serve {
        /// Bind address, overriding config and environment
        #[arg(short, long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut config = ServerConfig::load(cli.config.as_deref());

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            flowcore::logger::init(&config.log_path, config.level_filter());

            let registry = Arc::new(ProviderRegistry::with_defaults());
            registry.initialize_all().await;
            log::info!("providers registered: {:?}", registry.ids());

            let store = Arc::new(MemoryStore::new());
            let limiter = Arc::new(RateLimiter::new(store.clone(), RateLimitConfig::from_env()));
            let collab = CollabServer::new(store, Arc::new(OpenAccess));

            let state = AppState {
                collab,
                limiter,
                subscriptions: Arc::new(MemorySubscriptions::new()),
            };

            if let Err(err) = server::run(state, &config.bind).await {
                log::error!("server terminated: {}", err);
                std::process::exit(1);
            }
        }
    }
}
