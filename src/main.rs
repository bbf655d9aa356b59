use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use qa_jobs::agent::{GeminiAgent, GeminiConfig};
use qa_jobs::api::{AppState, job_routes};
use qa_jobs::config::{JobSourceKind, PipelineConfig, QueueBackend};
use qa_jobs::jobs::{JobEvents, JobService, RetryPolicy};
use qa_jobs::queue::{InMemoryTaskQueue, LibSqlTaskQueue, TaskQueue};
use qa_jobs::store::{LibSqlBackend, Store};
use qa_jobs::trace::TraceRecorder;
use qa_jobs::worker::{
    Dispatcher, DispatcherConfig, JobSource, PollSource, QueueSource, StaleJobReaper, WorkerGroup,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env().context("invalid configuration")?;

    // stderr + daily rolling file
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("cannot create log dir {}", config.log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "qa-jobs.log");
    let (non_blocking, _log_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    eprintln!("📨 QA Jobs v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Role: {:?}", config.role);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Job source: {:?}", config.job_source);

    // ── Database ─────────────────────────────────────────────────────────
    let events = JobEvents::new();
    let store: Arc<dyn Store> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?
            .with_events(events.clone()),
    );

    // ── Queue ────────────────────────────────────────────────────────────
    let queue: Option<Arc<dyn TaskQueue>> = match config.job_source {
        JobSourceKind::Poll => None,
        JobSourceKind::Queue => Some(match config.queue_backend {
            QueueBackend::LibSql => Arc::new(
                LibSqlTaskQueue::new_local(&config.queue_path, config.queue_visibility)
                    .await
                    .with_context(|| {
                        format!("failed to open queue at {}", config.queue_path.display())
                    })?,
            ),
            QueueBackend::Memory => {
                if !config.role.runs_api() || !config.role.runs_workers() {
                    warn!("In-memory queue is process-local; API and workers must share a process");
                }
                Arc::new(InMemoryTaskQueue::new(config.queue_visibility))
            }
        }),
    };

    let traces = Arc::new(TraceRecorder::new(config.trace_capacity));

    // ── Workers ──────────────────────────────────────────────────────────
    let workers = if config.role.runs_workers() {
        let Some(api_key) = config.gemini_api_key.clone() else {
            bail!("GEMINI_API_KEY must be set when this process runs workers");
        };
        let agent = Arc::new(GeminiAgent::new(GeminiConfig::new(api_key))?);

        let source: Arc<dyn JobSource> = match queue {
            Some(ref queue) => Arc::new(QueueSource::new(Arc::clone(queue), config.poll_interval)),
            None => Arc::new(PollSource::new(Arc::clone(&store), config.poll_interval)),
        };

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            agent,
            source,
            Arc::clone(&traces),
            DispatcherConfig {
                job_timeout: config.job_timeout,
                history_pairs: config.history_pairs,
                retry: RetryPolicy::default(),
            },
        ));

        let reaper = StaleJobReaper::new(
            Arc::clone(&dispatcher),
            config.stale_after(),
            config.reap_interval(),
        );
        eprintln!("   Workers: {}", config.max_jobs);
        Some(WorkerGroup::spawn(config.max_jobs, dispatcher).with_reaper(reaper))
    } else {
        None
    };

    // ── HTTP API ─────────────────────────────────────────────────────────
    let server = if config.role.runs_api() {
        let service = Arc::new(JobService::new(
            Arc::clone(&store),
            queue.clone(),
            config.max_retries,
        ));
        let app = job_routes(AppState {
            service,
            traces: Arc::clone(&traces),
            events: events.clone(),
        });

        let port = config.http_port;
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
            .await
            .with_context(|| format!("failed to bind port {port}"))?;
        eprintln!("   API: http://0.0.0.0:{}/api/jobs", port);
        eprintln!("   Job WS: ws://0.0.0.0:{}/ws/jobs", port);
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "HTTP server stopped");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutdown requested");

    if let Some(server) = server {
        server.abort();
    }
    if let Some(workers) = workers {
        workers.shutdown_and_join().await;
    }

    info!("Goodbye");
    Ok(())
}
