mod analysis;
mod anthropic;
mod api;
mod common;
mod dispatch;
mod error;
mod health;
mod http_client;
mod logs;
mod metrics;
mod model;
mod security;
mod slack;
mod store;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use anthropic::{AnthropicClient, CompletionClient};
use api::AppState;
use common::rate_limit::RateLimiter;
use dispatch::{ContextStore, Dispatcher};
use health::{AnthropicProbe, HealthChecker, HealthProbe, SlackProbe, WarehouseProbe};
use logs::LogBuffer;
use metrics::Metrics;
use model::arg::Args;
use model::config::Config;
use security::{HttpScreener, QueryScreener};
use slack::{ChatPoster, EventDeduper, MessageSplitter, SignatureVerifier, SlackApiClient, SlackState};
use store::PersistenceWriter;
use worker::{WorkerDeps, WorkerPool};

/// 后台清理周期
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Slack 重试事件的去重窗口
const DEDUPE_TTL: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("启动失败: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    // .env 只补充未设置的环境变量
    match args.env_file.as_deref() {
        Some(path) => {
            dotenvy::from_path(path).with_context(|| format!("加载 env 文件失败: {}", path))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let mut config = Config::from_env()?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let report = model::validation::validate(&config);
    if args.check_config {
        println!("{}", report.summary());
        std::process::exit(if report.is_valid() { 0 } else { 1 });
    }

    let log_buffer = LogBuffer::new(config.log_buffer_size);
    logs::init_tracing(&config.log_level, config.log_format, &log_buffer);

    for warning in &report.warnings {
        tracing::warn!("配置提示: {}", warning);
    }
    if !report.is_valid() {
        anyhow::bail!("{}", report.summary());
    }

    let config = Arc::new(config);
    let signing_secret = config
        .slack_signing_secret
        .clone()
        .context("SLACK_SIGNING_SECRET 未配置")?;

    let metrics = Arc::new(Metrics::new().context("注册 Prometheus 指标失败")?);

    let ai: Arc<dyn CompletionClient> = Arc::new(AnthropicClient::new(&config)?);
    let chat: Arc<dyn ChatPoster> = Arc::new(SlackApiClient::new(&config)?);

    let warehouse = store::open_warehouse(&config)?;
    let writer = warehouse.clone().map(|warehouse| {
        Arc::new(PersistenceWriter::spawn(
            warehouse,
            config.queue_capacity * 4,
            metrics.persistence_dropped(),
        ))
    });

    let context = Arc::new(ContextStore::new(
        config.context_max_turns,
        Duration::from_secs(config.context_ttl_secs),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        ai.clone(),
        context.clone(),
        config.general_chat_enabled,
    ));
    let rate_limiter = Arc::new(RateLimiter::per_minute(config.rate_limit_per_minute));
    let screener = HttpScreener::from_config(&config)?
        .map(|screener| Arc::new(screener) as Arc<dyn QueryScreener>);

    let pool = Arc::new(WorkerPool::spawn(
        WorkerDeps {
            dispatcher,
            chat: chat.clone(),
            splitter: MessageSplitter::default(),
            rate_limiter: rate_limiter.clone(),
            metrics: metrics.clone(),
            writer: writer.clone(),
            screener: screener.clone(),
        },
        config.worker_count,
        config.queue_capacity,
    ));

    let probes: Vec<Arc<dyn HealthProbe>> = vec![
        Arc::new(AnthropicProbe(ai.clone())),
        Arc::new(SlackProbe(chat)),
        Arc::new(WarehouseProbe(warehouse)),
    ];
    let health = Arc::new(HealthChecker::new(
        probes,
        Duration::from_secs(config.health_check_timeout_secs),
    ));

    let deduper = Arc::new(EventDeduper::new(DEDUPE_TTL));
    let cleanup = spawn_cleanup(
        context.clone(),
        rate_limiter.clone(),
        deduper.clone(),
        metrics.clone(),
    );

    let state = AppState {
        config: config.clone(),
        ai,
        context,
        metrics,
        health,
        logs: log_buffer,
        pool: pool.clone(),
        rate_limiter,
        writer: writer.clone(),
    };
    let slack_state = SlackState {
        verifier: SignatureVerifier::new(
            signing_secret,
            Duration::from_secs(config.signature_tolerance_secs),
        ),
        deduper,
        pool: pool.clone(),
    };
    let app = api::create_router(state, slack_state);

    let addr = config.bind_addr();
    tracing::info!("启动 HTTP 服务器: {}", addr);
    tracing::info!(
        model = %config.anthropic_model,
        warehouse = config.warehouse_backend.as_str(),
        workers = config.worker_count,
        security_screening = screener.is_some(),
        "服务配置"
    );
    tracing::info!("可用端点:");
    tracing::info!("  POST /slack/events");
    tracing::info!("  POST /slack/commands");
    tracing::info!("  GET  /health, /health/ping, /metrics, /metrics.json");
    tracing::info!("  GET  /config, /logs");
    tracing::info!("  POST /test/code-generation, /test/code-analysis");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定地址失败: {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP 服务器异常退出")?;

    tracing::info!("HTTP 服务器已停止，等待后台任务完成");
    cleanup.abort();
    pool.shutdown().await;
    if let Some(writer) = writer {
        writer.shutdown().await;
        tracing::info!(
            backend = writer.backend(),
            dropped = writer.dropped_count(),
            failed = writer.failed_count(),
            "持久化已停止"
        );
    }
    tracing::info!("服务已退出");
    Ok(())
}

/// 周期性清理过期上下文、限流记录与事件去重记录
fn spawn_cleanup(
    context: Arc<ContextStore>,
    rate_limiter: Arc<RateLimiter>,
    deduper: Arc<EventDeduper>,
    metrics: Arc<Metrics>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            let removed = context.cleanup_expired();
            rate_limiter.cleanup_expired();
            let events = deduper.cleanup_expired();
            metrics.set_active_conversations(context.active_count());
            if removed > 0 {
                tracing::debug!(removed, "已清理过期对话上下文");
            }
            if events > 0 {
                tracing::debug!(events, "已清理过期事件记录");
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("监听 Ctrl-C 失败: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("监听 SIGTERM 失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("收到退出信号，开始优雅关闭");
}
