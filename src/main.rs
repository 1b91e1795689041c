//! Forager - 网页研究 Agent
//!
//! 入口：加载配置、初始化日志，运行单任务 Agent（run）或深度研究（research）。Ctrl+C 在下一个步边界停止。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use forager::agent::{ActionModel, Agent, AgentEvent, LlmDoneValidator};
use forager::cache::ResultCache;
use forager::config::{load_config, AppConfig};
use forager::core::SessionSupervisor;
use forager::environment::{EnvironmentFactory, HttpEnvironmentFactory};
use forager::llm::{create_llm_from_config, CallRateLimiter, LlmClient};
use forager::research::{AgentRunner, ResearchOrchestrator};

/// Forager - autonomous web research agent
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single agent task
    Run {
        task: String,

        /// Step budget (defaults to agent.max_steps)
        #[arg(long)]
        max_steps: Option<usize>,

        /// Print agent events as JSON lines
        #[arg(long)]
        events: bool,

        /// Open this URL before the first step
        #[arg(long)]
        start_url: Option<String>,

        /// Extra hints shown to the model every step
        #[arg(long)]
        hints: Option<String>,
    },
    /// Run a multi-round deep research session
    Research {
        task: String,

        /// Planning rounds (defaults to research.max_search_iterations)
        #[arg(long)]
        iterations: Option<usize>,

        /// Queries per round (defaults to research.max_query_num)
        #[arg(long)]
        queries: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    forager::observability::init(&cli.log_level);

    let mut config = load_config(cli.config.clone()).context("Failed to load configuration")?;
    match &cli.command {
        Commands::Run { max_steps, .. } => {
            if let Some(n) = max_steps {
                config.agent.max_steps = *n;
            }
        }
        Commands::Research { iterations, queries, .. } => {
            if let Some(n) = iterations {
                config.research.max_search_iterations = *n;
            }
            if let Some(n) = queries {
                config.research.max_query_num = *n;
            }
        }
    }
    config.validate().context("Invalid configuration")?;

    let supervisor = SessionSupervisor::new();
    let on_ctrl_c = supervisor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("stop requested, finishing at the next step boundary");
            on_ctrl_c.cancel();
        }
    });

    let limiter = CallRateLimiter::shared(
        config.llm.rate_limit.max_calls,
        Duration::from_secs(config.llm.rate_limit.period_secs),
    );
    let llm = create_llm_from_config(&config.llm, limiter);
    tracing::info!(model = llm.model_name(), "llm ready");
    let env_factory: Arc<dyn EnvironmentFactory> = Arc::new(HttpEnvironmentFactory::new(config.environment.http()));

    match cli.command {
        Commands::Run {
            task,
            events,
            start_url,
            hints,
            ..
        } => {
            let options = RunOptions { events, start_url, hints };
            run_task(&config, llm, env_factory, &supervisor, &task, options).await
        }
        Commands::Research { task, .. } => run_research(&config, llm, env_factory, supervisor, &task).await,
    }
}

struct RunOptions {
    events: bool,
    start_url: Option<String>,
    hints: Option<String>,
}

async fn run_task(
    config: &AppConfig,
    llm: Arc<dyn LlmClient>,
    env_factory: Arc<dyn EnvironmentFactory>,
    supervisor: &SessionSupervisor,
    task: &str,
    options: RunOptions,
) -> anyhow::Result<()> {
    let env = env_factory.create().context("Failed to create environment")?;
    let mut agent = Agent::new(task, llm.clone(), env)
        .with_settings(config.agent.settings())
        .with_cancel_token(supervisor.child_token());
    if config.agent.validate_output {
        agent = agent.with_done_validator(Arc::new(LlmDoneValidator::new(llm)));
    }
    if let Some(url) = options.start_url {
        let mut params = serde_json::Map::new();
        params.insert("url".to_string(), serde_json::Value::String(url));
        agent = agent.with_initial_actions(vec![ActionModel::new("go_to_url", params)]);
    }
    if let Some(hints) = options.hints {
        agent = agent.with_add_infos(hints);
    }

    let printer = if options.events {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<AgentEvent>();
        agent = agent.with_event_tx(tx);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{}", line);
                }
            }
        }))
    } else {
        None
    };

    let history = agent.run(config.agent.max_steps).await;
    drop(agent);
    if let Some(handle) = printer {
        let _ = handle.await;
    }

    if let Some(outcome) = &history.outcome {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    }
    match history.final_result() {
        Some(result) => println!("{}", result),
        None => println!("(no result)"),
    }
    Ok(())
}

async fn run_research(
    config: &AppConfig,
    llm: Arc<dyn LlmClient>,
    env_factory: Arc<dyn EnvironmentFactory>,
    supervisor: SessionSupervisor,
    task: &str,
) -> anyhow::Result<()> {
    let ttl = Duration::from_secs(config.research.cache.ttl_secs);
    let cache = match &config.research.cache.path {
        Some(path) => ResultCache::open(path.clone(), ttl).await.context("Failed to open result cache")?,
        None => ResultCache::in_memory(ttl),
    };
    let mut runner = AgentRunner::new(llm.clone(), env_factory).with_settings(config.agent.settings());
    if config.agent.validate_output {
        runner = runner.with_done_validator(Arc::new(LlmDoneValidator::new(llm.clone())));
    }
    let orchestrator = ResearchOrchestrator::new(llm, Arc::new(runner), Arc::new(cache), config.research.settings())
        .with_supervisor(supervisor);

    let outcome = orchestrator.research(task).await;
    for error in outcome.errors() {
        eprintln!("warning: {}", error);
    }
    if let Some(path) = &outcome.report_path {
        eprintln!("report saved to {}", path.display());
    }
    match &outcome.report {
        Some(report) => println!("{}", report),
        None => {
            for finding in outcome.findings() {
                println!("## {}\n\n{}\n", finding.query, finding.content);
            }
        }
    }
    Ok(())
}
