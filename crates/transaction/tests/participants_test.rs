mod common;

use anyhow::{Context, Result};
use common::{CallLog, MockStore};
use std::sync::{Arc, Mutex};
use tandem_core::{ClickHouseSettings, SessionStatus, StoreKind, TransactionId, TransactionState};
use tandem_storage::redis::CacheOp;
use tandem_storage::{ClickHouseClient, RedisService};
use tandem_transaction::participants::{ClickHouseSession, ClickHouseStore, RedisSession, RedisStore};
use tandem_transaction::{ParticipantStore, StoreRef, TransactionCoordinator, TransactionErrorKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// =========================================================================
// 1. 本地 ClickHouse HTTP 桩
// =========================================================================

/// 最小的 ClickHouse HTTP 接口：`SELECT 1` 返回 1，
/// 以 `reject` 开头的语句返回 500，其余语句成功并被记录
struct ClickHouseStub {
    url: String,
    received: Arc<Mutex<Vec<String>>>,
}

impl ClickHouseStub {
    async fn start(reject: &'static str) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}", listener.local_addr()?);
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = received.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let log = log.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, reject, log).await;
                });
            }
        });
        Ok(Self { url, received })
    }

    fn store(&self) -> Result<ClickHouseStore> {
        let settings = ClickHouseSettings {
            url: self.url.clone(),
            ..ClickHouseSettings::default()
        };
        Ok(ClickHouseStore::new(ClickHouseClient::new(&settings)?))
    }

    /// 成功写入的语句 (不含探活)
    fn applied(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

async fn serve(mut socket: TcpStream, reject: &str, log: Arc<Mutex<Vec<String>>>) -> Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let sql = String::from_utf8_lossy(&buf[header_end..]).to_string();
    let (status, body) = if sql.starts_with(reject) {
        ("500 Internal Server Error", "Code: 60. DB::Exception: Table does not exist")
    } else if sql == "SELECT 1" {
        ("200 OK", "1\n")
    } else {
        log.lock().unwrap().push(sql);
        ("200 OK", "")
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await?;
    Ok(())
}

fn stores_with(clickhouse: ClickHouseStore, calls: &Arc<CallLog>) -> Vec<StoreRef> {
    vec![
        MockStore::new(StoreKind::Relational, calls.clone()),
        Arc::new(clickhouse),
    ]
}

// =========================================================================
// 2. 缓冲与回滚
// =========================================================================

#[tokio::test]
async fn test_clickhouse_session_discards_buffer_on_rollback() -> Result<()> {
    // 端口上没有服务也无妨：写入只进缓冲，回滚不访问网络
    let settings = ClickHouseSettings {
        url: "http://127.0.0.1:9".to_string(),
        ..ClickHouseSettings::default()
    };
    let store = ClickHouseStore::new(ClickHouseClient::new(&settings)?);
    let xid = TransactionId::from("txn_ch_buffer");

    let mut session = store.open_session(&xid).await?;
    let ch = session
        .as_any_mut()
        .downcast_mut::<ClickHouseSession>()
        .context("expected a clickhouse session")?;
    ch.execute("INSERT INTO events VALUES (1)");
    ch.insert_rows("events", &[serde_json::json!({ "id": 2 }), serde_json::json!({ "id": 3 })])?;
    ch.insert_rows::<serde_json::Value>("events", &[])?;
    assert!(ch.insert_rows("events; DROP TABLE x", &[serde_json::json!({})]).is_err());
    assert_eq!(ch.pending_statements(), 2);

    session.rollback(&xid).await?;
    assert_eq!(session.status(), SessionStatus::RolledBack);
    let ch = session
        .as_any_mut()
        .downcast_mut::<ClickHouseSession>()
        .context("expected a clickhouse session")?;
    assert_eq!(ch.pending_statements(), 0);
    Ok(())
}

#[tokio::test]
async fn test_redis_session_discards_buffer_on_rollback() -> Result<()> {
    // 连接池惰性建立，缓冲与回滚不需要真实 Redis
    let store = RedisStore::new(RedisService::new("redis://127.0.0.1:6399")?);
    let xid = TransactionId::from("txn_redis_buffer");

    let mut session = store.open_session(&xid).await?;
    let redis = session
        .as_any_mut()
        .downcast_mut::<RedisSession>()
        .context("expected a redis session")?;
    redis.set("agent_state:r1", "v1", Some(60));
    redis.delete("agent_state:r0");
    assert_eq!(
        redis.pending_ops(),
        &[
            CacheOp::Set {
                key: "agent_state:r1".to_string(),
                value: b"v1".to_vec(),
                ttl_secs: Some(60),
            },
            CacheOp::Delete {
                key: "agent_state:r0".to_string(),
            },
        ]
    );

    session.rollback(&xid).await?;
    assert_eq!(session.status(), SessionStatus::RolledBack);
    let redis = session
        .as_any_mut()
        .downcast_mut::<RedisSession>()
        .context("expected a redis session")?;
    assert!(redis.pending_ops().is_empty());
    Ok(())
}

// =========================================================================
// 3. 通过协调器提交到 ClickHouse
// =========================================================================

#[tokio::test]
async fn test_clickhouse_commit_sends_statements_in_order() -> Result<()> {
    let stub = ClickHouseStub::start("NEVER").await?;
    let coordinator = TransactionCoordinator::with_ceiling(10);
    let calls = Arc::new(CallLog::default());
    let stores = stores_with(stub.store()?, &calls);

    coordinator
        .run_in_transaction(&stores, |sessions| {
            Box::pin(async move {
                let ch = sessions
                    .downcast_mut::<ClickHouseSession>()
                    .context("no clickhouse session")?;
                ch.execute("INSERT INTO a VALUES (1)");
                ch.execute("INSERT INTO b VALUES (2)");
                Ok::<_, anyhow::Error>(())
            })
        })
        .await?;

    assert_eq!(stub.applied(), vec!["INSERT INTO a VALUES (1)", "INSERT INTO b VALUES (2)"]);
    assert_eq!(calls.count(StoreKind::Relational, "commit"), 1);
    assert_eq!(coordinator.metrics().snapshot().successful_commits, 1);
    Ok(())
}

#[tokio::test]
async fn test_clickhouse_failure_after_applied_statement_is_partial() -> Result<()> {
    // === 场景描述 ===
    // 第一条 INSERT 已写入 ClickHouse，第二条返回 500
    // 预期：CommitFailed (需要对账)，而不是可重试的干净回滚
    let stub = ClickHouseStub::start("INSERT INTO b").await?;
    let coordinator = TransactionCoordinator::with_ceiling(10);
    let calls = Arc::new(CallLog::default());
    let stores = stores_with(stub.store()?, &calls);
    let xid = TransactionId::from("txn_ch_partial");

    let err = coordinator
        .run_in_transaction_with_id(xid.clone(), &stores, |sessions| {
            Box::pin(async move {
                let ch = sessions
                    .downcast_mut::<ClickHouseSession>()
                    .context("no clickhouse session")?;
                ch.execute("INSERT INTO a VALUES (1)");
                ch.execute("INSERT INTO b VALUES (2)");
                Ok::<_, anyhow::Error>(())
            })
        })
        .await
        .expect_err("second statement must fail");

    assert_eq!(err.kind, TransactionErrorKind::CommitFailed);
    assert!(!err.is_retryable());
    assert_eq!(err.committed, vec![StoreKind::Columnar]);
    assert_eq!(stub.applied(), vec!["INSERT INTO a VALUES (1)"]);

    // relational 排在 columnar 之后，没有提交，被回滚
    assert_eq!(calls.count(StoreKind::Relational, "commit"), 0);
    assert_eq!(calls.count(StoreKind::Relational, "rollback"), 1);
    assert_eq!(coordinator.log().latest_state(&xid), Some(TransactionState::CommittedPartial));
    let metrics = coordinator.metrics().snapshot();
    assert_eq!(metrics.partial_commits, 1);
    assert_eq!(metrics.successful_rollbacks, 0);
    Ok(())
}

#[tokio::test]
async fn test_clickhouse_failure_on_first_statement_rolls_back_cleanly() -> Result<()> {
    let stub = ClickHouseStub::start("INSERT INTO a").await?;
    let coordinator = TransactionCoordinator::with_ceiling(10);
    let calls = Arc::new(CallLog::default());
    let stores = stores_with(stub.store()?, &calls);
    let xid = TransactionId::from("txn_ch_aborted");

    let err = coordinator
        .run_in_transaction_with_id(xid.clone(), &stores, |sessions| {
            Box::pin(async move {
                let ch = sessions
                    .downcast_mut::<ClickHouseSession>()
                    .context("no clickhouse session")?;
                ch.execute("INSERT INTO a VALUES (1)");
                ch.execute("INSERT INTO b VALUES (2)");
                Ok::<_, anyhow::Error>(())
            })
        })
        .await
        .expect_err("first statement must fail");

    assert_eq!(err.kind, TransactionErrorKind::CommitAborted);
    assert!(err.is_retryable());
    assert!(err.committed.is_empty());
    assert!(stub.applied().is_empty());
    assert_eq!(calls.count(StoreKind::Relational, "rollback"), 1);
    assert_eq!(coordinator.log().latest_state(&xid), Some(TransactionState::RolledBack));
    Ok(())
}
