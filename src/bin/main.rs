use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use reply_router::config::{ReplyStrategy, Settings, load_settings};
use reply_router::domain::FulfillmentResponse;
use reply_router::http::{AppState, OrderCaller, app_router, serve};
use reply_router::worker::{RandomDecision, spawn_fulfillment_worker};
use reply_router::{
    EphemeralDispatcher, MemoryBroker, ReplyRouter, RouterResult, Transport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Order service answering HTTP orders through correlated request/reply
#[derive(Parser)]
#[command(name = "reply-router")]
#[command(version)]
#[command(about = "Order service answering HTTP orders through correlated request/reply")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the order service (the default when no command is given)
    Serve(ServeArgs),
    /// Print the effective configuration as TOML
    ShowConfig {
        /// Configuration file (default: $XDG_CONFIG_HOME/reply-router/reply-router.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Default)]
struct ServeArgs {
    /// Configuration file (default: $XDG_CONFIG_HOME/reply-router/reply-router.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 127.0.0.1:8080
    #[arg(long)]
    bind: Option<String>,

    /// How long an order waits for the fulfillment decision
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Seed for the in-process worker's decisions
    #[arg(long)]
    seed: Option<u64>,

    /// Do not start the in-process fulfillment worker
    #[arg(long)]
    no_worker: bool,
}

impl ServeArgs {
    fn settings(&self) -> RouterResult<Settings> {
        let mut settings = load_settings(self.config.as_deref())?;

        if let Some(bind) = &self.bind {
            settings.bind = bind.clone();
        }
        if let Some(timeout_ms) = self.timeout_ms {
            settings.call_timeout_ms = timeout_ms;
        }
        if let Some(seed) = self.seed {
            settings.worker.seed = Some(seed);
        }
        if self.no_worker {
            settings.worker.enabled = false;
        }

        settings.validate()?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::ShowConfig { config }) => show_config(config),
        Some(Commands::Serve(args)) => run(args).await,
        None => run(ServeArgs::default()).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn show_config(config: Option<PathBuf>) -> RouterResult<()> {
    let text = load_settings(config.as_deref())?.to_toml_string()?;
    print!("{}", text);
    Ok(())
}

async fn run(args: ServeArgs) -> RouterResult<()> {
    let settings = args.settings()?;
    let call_timeout = settings.call_timeout()?;

    let broker = Arc::new(MemoryBroker::new());
    broker.declare_queue(&settings.request_queue)?;

    let worker = if settings.worker.enabled {
        let requests = broker.consume(&settings.request_queue).await?;
        Some(spawn_fulfillment_worker(
            Arc::clone(&broker),
            requests,
            Arc::new(RandomDecision::new(settings.worker.seed)),
        ))
    } else {
        warn!(
            target: "reply_router::main",
            "Fulfillment worker disabled; orders on {} will time out",
            settings.request_queue
        );
        None
    };

    let router = match settings.reply_strategy {
        ReplyStrategy::Shared => Some(
            ReplyRouter::<_, FulfillmentResponse>::start(
                Arc::clone(&broker),
                settings.request_queue.clone(),
            )
            .await?,
        ),
        ReplyStrategy::PerCall => None,
    };

    let caller: OrderCaller = match &router {
        Some(router) => Arc::new(router.dispatcher().clone()),
        None => Arc::new(EphemeralDispatcher::<_, FulfillmentResponse>::new(
            Arc::clone(&broker),
            settings.request_queue.clone(),
        )),
    };

    let listener = TcpListener::bind(&settings.bind).await?;
    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_ctrl_c(shutdown.clone()));

    info!(
        target: "reply_router::main",
        "Serving orders with {:?} replies and a {:?} call timeout",
        settings.reply_strategy,
        call_timeout.as_duration()
    );
    serve(
        listener,
        app_router(AppState::new(caller, call_timeout, shutdown.clone())),
        shutdown,
    )
    .await?;

    if let Some(router) = router {
        let exit = router.shutdown().await;
        info!(target: "reply_router::main", "Reply consumer stopped: {:?}", exit);
    }
    if let Some(worker) = worker {
        worker.shutdown().await;
    }
    broker.shutdown();
    info!(target: "reply_router::main", "Order service stopped");
    Ok(())
}

async fn wait_for_ctrl_c(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!(target: "reply_router::main", "Interrupt received, shutting down");
            shutdown.cancel();
        }
        Err(e) => {
            warn!(target: "reply_router::main", "Cannot listen for ctrl-c: {}", e);
        }
    }
}
