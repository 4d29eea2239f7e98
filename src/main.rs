use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mail_maestro::config::TriageConfig;
use mail_maestro::ingest::context_from_rfc822;
use mail_maestro::llm::{LlmConfig, create_provider};
use mail_maestro::scheduler::IcsDirectoryBackend;
use mail_maestro::store::{Database, LibSqlBackend};
use mail_maestro::{Orchestrator, server};

#[derive(Parser)]
#[command(name = "mail-maestro")]
#[command(version, about = "Email triage: classify, delegate, schedule", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a file of email contexts (JSON array or one object per line)
    Run {
        /// Input file
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Process raw RFC 822 messages (.eml files)
    Ingest {
        /// Message files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Serve the HTTP API
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        #[arg(short, long, default_value_t = 8080, env = "MAILMAESTRO_PORT")]
        port: u16,
    },
}

/// Console logging, plus daily files when `MAILMAESTRO_LOG_DIR` is set.
fn init_logging() -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let Ok(log_dir) = std::env::var("MAILMAESTRO_LOG_DIR") else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {log_dir}"))?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "mail-maestro.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();
    Ok(Some(guard))
}

async fn build_orchestrator(config: TriageConfig) -> anyhow::Result<Orchestrator> {
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    let backend = Arc::new(IcsDirectoryBackend::new(config.ics_dir.clone()));

    let orchestrator = Orchestrator::new(db, backend, config);
    match LlmConfig::from_env() {
        Some(llm_config) => Ok(orchestrator.with_llm(create_provider(&llm_config))),
        None => {
            tracing::info!("OPENAI_API_KEY not set, using rule-based classification only");
            Ok(orchestrator)
        }
    }
}

/// Read a JSON array, or newline-delimited JSON objects.
fn read_contexts(path: &Path) -> anyhow::Result<Vec<serde_json::Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    if text.trim_start().starts_with('[') {
        return serde_json::from_str(&text)
            .with_context(|| format!("{} is not a JSON array", path.display()));
    }

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid JSON", path.display(), n + 1))
        })
        .collect()
}

fn print_results(results: Vec<Result<mail_maestro::EmailOutcome, mail_maestro::Error>>) -> usize {
    let mut failures = 0;
    for result in results {
        match result {
            Ok(outcome) => match serde_json::to_string(&outcome) {
                Ok(line) => println!("{line}"),
                Err(e) => eprintln!("failed to serialize outcome for {}: {e}", outcome.email_id),
            },
            Err(e) => {
                failures += 1;
                eprintln!("error: {e}");
            }
        }
    }
    failures
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging()?;
    let config = TriageConfig::from_env()?;

    match cli.command {
        Commands::Run { input } => {
            let contexts = read_contexts(&input)?;
            let orchestrator = build_orchestrator(config).await?;
            let failures = print_results(orchestrator.process_batch(contexts).await);
            if failures > 0 {
                anyhow::bail!("{failures} email(s) failed");
            }
        }
        Commands::Ingest { files } => {
            let env = config.deployment_env.clone();
            let orchestrator = build_orchestrator(config).await?;
            let mut results = Vec::with_capacity(files.len());
            for file in files {
                let raw = std::fs::read(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                let now = chrono::Local::now().fixed_offset();
                let result: Result<_, mail_maestro::Error> =
                    match context_from_rfc822(&raw, now, &env) {
                        Ok(context) => orchestrator.process(context).await.map_err(Into::into),
                        Err(e) => Err(e.into()),
                    };
                results.push(result);
            }
            let failures = print_results(results);
            if failures > 0 {
                anyhow::bail!("{failures} message(s) failed");
            }
        }
        Commands::Serve { host, port } => {
            let orchestrator = Arc::new(build_orchestrator(config).await?);
            let app = server::routes(orchestrator);

            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            tracing::info!(%addr, "HTTP API listening");
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
