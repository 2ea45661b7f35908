use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

// 引入内部模块
use tandem_agent::store::{LocalFileRunStore, MemoryCache, PgRunStore, RedisStateCache, RunStore, StateCache};
use tandem_agent::StatePersistence;
use tandem_core::{Clock, Settings};
use tandem_storage::{db::init_db, ClickHouseClient, RedisService, RunRepository};
use tandem_transaction::participants::{ClickHouseStore, PgStore, RedisStore};
use tandem_transaction::{KeyRange, StoreRef, TransactionCoordinator};

// =========================================================================
// 1. 日志配置 (输出到控制台 + 文件)
// =========================================================================
fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // 1. 文件输出器：每天生成一个新的日志文件 (logs/tandem.2025-xx-xx.log)
    let file_appender = tracing_appender::rolling::daily("logs", "tandem.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // 2. 控制台层 (Console Layer)
    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true) // 保留 tandem::txlog 等事件来源
        .with_thread_ids(true)
        .compact(); // 紧凑模式

    // 3. 文件层 (File Layer)
    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false) // 文件里不要颜色代码
        .with_file(true)
        .with_line_number(true);

    // 4. 注册全局订阅者
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard // 必须返回 guard，否则日志线程会立即销毁
}

// =========================================================================
// 2. 后台任务
// =========================================================================

/// 定期上报事务计数器
async fn report_metrics(coordinator: Arc<TransactionCoordinator>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        let m = coordinator.metrics().snapshot();
        info!(
            target: "tandem::metrics",
            attempted = m.transactions_attempted,
            committed = m.successful_commits,
            rolled_back = m.successful_rollbacks,
            failed_rollbacks = m.failed_rollbacks,
            partial_commits = m.partial_commits,
            deadlocks_prevented = m.deadlocks_prevented,
            consistency_violations = m.consistency_violations,
            active = coordinator.active_transactions(),
            "📊 transaction metrics"
        );
    }
}

/// 定期对账：比较 PostgreSQL 与 ClickHouse 上一周期写入的记录数
async fn run_audit(
    coordinator: Arc<TransactionCoordinator>,
    pg: PgStore,
    clickhouse: ClickHouseStore,
    table: String,
    key_column: String,
    interval: Duration,
) -> anyhow::Result<()> {
    let pg_counter = pg.counter(&table, &key_column)?;
    let ch_counter = clickhouse.counter(&table, &key_column)?;
    let validator = coordinator.consistency_validator();
    let window = chrono::Duration::from_std(interval).context("Audit interval out of range")?;

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // 第一次 tick 立即返回，跳过
    loop {
        ticker.tick().await;
        let to = Clock::now();
        validator
            .validate(&pg_counter, &ch_counter, &KeyRange::new(to - window, to))
            .await;
    }
}

// =========================================================================
// 3. 主入口 (Main Entry)
// =========================================================================
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A. 加载配置与日志 (.env 在 Settings::load 中读取)
    let _log_guard = init_logging(); // 初始化日志，_guard 不能丢

    info!("Starting Tandem Engine ⚡️");
    let settings = Settings::load().context("Failed to load configuration")?;

    // B. 初始化数据库连接
    let pool = if settings.database.url.is_empty() {
        None
    } else {
        Some(init_db(&settings.database).await?)
    };

    // C. 初始化缓存
    let redis = if settings.redis.url.is_empty() {
        None
    } else {
        let service = RedisService::new(&settings.redis.url)?;
        // 缓存只是可丢弃的副本，连不上也继续启动
        match service.ping().await {
            Ok(()) => info!("✅ Redis connected"),
            Err(e) => warn!("Redis is not reachable yet, checkpoints fall back to durable storage: {:#}", e),
        }
        Some(service)
    };

    let clickhouse = if settings.clickhouse.url.is_empty() {
        None
    } else {
        let client = ClickHouseClient::new(&settings.clickhouse)?;
        client.ping().await.context("ClickHouse is not reachable")?;
        info!("✅ ClickHouse connected");
        Some(client)
    };

    // D. 组装持久化引擎
    let cache: Arc<dyn StateCache> = match &redis {
        Some(service) => Arc::new(RedisStateCache::new(service.clone())),
        None => {
            warn!("REDIS_URL not set, using in-process cache");
            Arc::new(MemoryCache::new())
        }
    };
    let run_store: Arc<dyn RunStore> = match (&settings.persistence.local_dir, &pool) {
        (Some(dir), _) => {
            info!("📁 Using local run store at {}", dir);
            Arc::new(LocalFileRunStore::new(dir)?)
        }
        (None, Some(pool)) => Arc::new(PgRunStore::new(RunRepository::new(pool.clone()))),
        (None, None) => anyhow::bail!("No durable run store configured"),
    };
    // 服务层接入前，引擎实例由主流程持有到停机
    let _persistence = Arc::new(StatePersistence::new(cache, run_store, &settings.persistence));
    info!("📦 State persistence initialized.");

    // E. 组装事务协调器与参与者
    let coordinator = Arc::new(TransactionCoordinator::new(&settings.transaction));
    let pg_store = pool.clone().map(PgStore::new);
    let ch_store = clickhouse.map(ClickHouseStore::new);

    let mut participants: Vec<StoreRef> = Vec::new();
    if let Some(store) = &pg_store {
        participants.push(Arc::new(store.clone()));
    }
    if let Some(store) = &ch_store {
        participants.push(Arc::new(store.clone()));
    }
    if let Some(service) = &redis {
        participants.push(Arc::new(RedisStore::new(service.clone())));
    }

    // 空事务走一遍完整的 prepare / commit，确认所有参与者可用
    if !participants.is_empty() {
        match coordinator
            .run_in_transaction(&participants, |_sessions| Box::pin(async move { Ok(()) }))
            .await
        {
            Ok(()) => info!(participants = participants.len(), "✅ Transaction coordinator ready"),
            Err(e) => warn!(reason = %e.reason_code(), "Warm-up transaction failed: {}", e),
        }
    }

    // F. 启动后台任务
    tokio::spawn(report_metrics(coordinator.clone()));
    match (&settings.transaction.audit_table, pg_store, ch_store) {
        (Some(table), Some(pg), Some(ch)) => {
            let audit = run_audit(
                coordinator.clone(),
                pg,
                ch,
                table.clone(),
                settings.transaction.audit_key_column.clone(),
                Duration::from_secs(settings.transaction.audit_interval_secs),
            );
            tokio::spawn(async move {
                if let Err(e) = audit.await {
                    error!("Consistency audit stopped: {:#}", e);
                }
            });
        }
        (Some(table), _, _) => warn!(table = %table, "Audit needs both PostgreSQL and ClickHouse, skipped"),
        _ => {}
    }

    // G. 等待退出信号，实现优雅停机
    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    warn!("🛑 Ctrl+C received! Shutting down gracefully...");

    let active = coordinator.active_transactions();
    if active > 0 {
        warn!(active, "Shutting down with transactions still in flight");
    }
    if let Some(pool) = pool {
        pool.close().await;
    }

    info!("👋 Tandem Engine Shutdown Complete.");
    Ok(())
}
