use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use tandem_agent::persistence::{result_key, state_key, thread_context_key};
use tandem_agent::store::{LocalFileRunStore, MemoryCache, MemoryRunStore, StateCache};
use tandem_agent::{AgentRunState, StatePersistence, StateSnapshot};
use tandem_core::PersistenceSettings;

/// 组装引擎：内存缓存 + 内存持久层，返回两者句柄便于注入故障
fn engine() -> (StatePersistence, Arc<MemoryCache>, Arc<MemoryRunStore>) {
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(MemoryRunStore::new());
    let persistence = StatePersistence::new(cache.clone(), store.clone(), &PersistenceSettings::default());
    (persistence, cache, store)
}

fn sample_state() -> AgentRunState {
    let mut state = AgentRunState::new("x");
    state.advance("triage");
    state.with_metadata("tickets", json!(["T-1", "T-2"]))
}

#[tokio::test]
async fn test_save_then_load_returns_equal_state() -> Result<()> {
    let (persistence, cache, _store) = engine();
    let state = sample_state();

    let outcome = persistence.save_agent_state("r1", "t1", "u1", &state).await;
    assert!(outcome.success);
    assert!(outcome.snapshot_id.starts_with("snap_"));

    // 缓存里是当前格式的快照，TTL 为默认 1 小时
    assert!(cache.ttl_of(&state_key("r1")).is_some_and(|t| t > 3500 && t <= 3600));
    assert_eq!(persistence.load_agent_state("r1").await, Some(state));
    Ok(())
}

#[tokio::test]
async fn test_save_and_load_with_cache_down() -> Result<()> {
    // === 场景描述 ===
    // 缓存完全不可用：写入仍以持久层为准成功，读取走持久层回源
    let (persistence, cache, _store) = engine();
    cache.set_available(false);
    let state = sample_state();

    let outcome = persistence.save_agent_state("r1", "t1", "u1", &state).await;
    assert!(outcome.success, "cache failure must not fail the checkpoint");
    assert_eq!(persistence.load_agent_state("r1").await, Some(state));
    Ok(())
}

#[tokio::test]
async fn test_eviction_reads_durable_copy_and_repopulates_cache() -> Result<()> {
    // === 场景描述 ===
    // 保存 {step:1, request:"x"} -> 模拟缓存淘汰 -> 读取
    // 预期：返回持久层副本，缓存被回填为同样的内容
    let (persistence, cache, _store) = engine();
    let mut state = AgentRunState::new("x");
    state.step_count = 1;

    assert!(persistence.save_agent_state("r1", "t1", "u1", &state).await.success);
    assert!(cache.evict(&state_key("r1")));

    let loaded = persistence.load_agent_state("r1").await;
    assert_eq!(loaded, Some(state.clone()));

    let bytes = cache.get(&state_key("r1")).await?.expect("cache repopulated");
    assert_eq!(StateSnapshot::decode(&bytes)?.state, state);
    Ok(())
}

#[tokio::test]
async fn test_cache_outage_between_saves_never_returns_older_state() -> Result<()> {
    // === 场景描述 ===
    // step 1 正常保存 -> 缓存宕机 -> step 2 只落盘 -> 缓存恢复 -> 读取
    // 预期：缓存里残留的 step 1 不能遮住刚保存的 step 2
    let (persistence, cache, _store) = engine();
    let mut state = AgentRunState::new("x");
    state.advance("triage");
    assert!(persistence.save_agent_state("r1", "t1", "u1", &state).await.success);

    cache.set_available(false);
    state.advance("data_analysis");
    assert!(persistence.save_agent_state("r1", "t1", "u1", &state).await.success);
    cache.set_available(true);

    let loaded = persistence.load_agent_state("r1").await.expect("state saved");
    assert_eq!(loaded.step_count, 2);

    // 回源后缓存被覆盖为最新值，之后走缓存也一致
    let bytes = cache.get(&state_key("r1")).await?.expect("cache repopulated");
    assert_eq!(StateSnapshot::decode(&bytes)?.state, state);
    assert_eq!(persistence.load_agent_state("r1").await, Some(state));
    Ok(())
}

#[tokio::test]
async fn test_sub_agent_result_cache_outage_never_returns_older_result() -> Result<()> {
    let (persistence, cache, _store) = engine();
    assert!(persistence.save_sub_agent_result("r1", "triage", json!({ "v": 1 })).await);

    cache.set_available(false);
    assert!(persistence.save_sub_agent_result("r1", "triage", json!({ "v": 2 })).await);
    cache.set_available(true);

    let result = persistence.load_sub_agent_result("r1", "triage").await;
    assert_eq!(result.map(|r| r.payload), Some(json!({ "v": 2 })));
    Ok(())
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let (persistence, _cache, store) = engine();
    assert_eq!(persistence.load_agent_state("missing").await, None);

    // 持久层报错同样只返回 None
    store.set_fail_reads(true);
    assert_eq!(persistence.load_agent_state("missing").await, None);
}

#[tokio::test]
async fn test_durable_failure_reports_lost_checkpoint() -> Result<()> {
    let (persistence, cache, store) = engine();
    let first = sample_state();
    assert!(persistence.save_agent_state("r1", "t1", "u1", &first).await.success);

    store.set_fail_writes(true);
    let mut second = first.clone();
    second.advance("data_analysis");
    let outcome = persistence.save_agent_state("r1", "t1", "u1", &second).await;
    assert!(!outcome.success);

    // 没落盘的状态不会进入缓存，读到的是上一次成功的 checkpoint
    let bytes = cache.get(&state_key("r1")).await?.expect("previous checkpoint cached");
    assert_eq!(StateSnapshot::decode(&bytes)?.state, first);
    assert_eq!(persistence.load_agent_state("r1").await, Some(first));
    Ok(())
}

#[tokio::test]
async fn test_sub_agent_result_overwrites_and_reads_through() -> Result<()> {
    let (persistence, cache, _store) = engine();

    assert!(persistence.save_sub_agent_result("r1", "triage", json!({ "priority": "low" })).await);
    assert!(persistence.save_sub_agent_result("r1", "triage", json!({ "priority": "high" })).await);

    let result = persistence
        .load_sub_agent_result("r1", "triage")
        .await
        .expect("result saved");
    assert_eq!(result.payload, json!({ "priority": "high" }));

    // 淘汰后回源持久层并回填
    cache.evict(&result_key("r1", "triage"));
    let reloaded = persistence.load_sub_agent_result("r1", "triage").await;
    assert_eq!(reloaded.map(|r| r.payload), Some(json!({ "priority": "high" })));
    assert!(cache.get(&result_key("r1", "triage")).await?.is_some());

    assert!(persistence.load_sub_agent_result("r1", "unknown").await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_sub_agent_result_durable_failure() {
    let (persistence, _cache, store) = engine();
    store.set_fail_writes(true);
    assert!(!persistence.save_sub_agent_result("r1", "triage", json!({})).await);
    assert!(persistence.load_sub_agent_result("r1", "triage").await.is_none());
}

#[tokio::test]
async fn test_thread_context_summarizes_result_categories() -> Result<()> {
    let (persistence, cache, _store) = engine();
    assert!(persistence.get_thread_context("t1").await.is_none());

    persistence.save_agent_state("r1", "t1", "u1", &sample_state()).await;
    persistence.save_sub_agent_result("r1", "triage", json!({})).await;
    persistence.save_sub_agent_result("r1", "data_analysis", json!({})).await;

    let ctx = persistence.get_thread_context("t1").await.expect("context cached");
    assert_eq!(ctx.run_id, "r1");
    assert_eq!(ctx.user_id, "u1");
    assert_eq!(ctx.last_step, 1);
    assert_eq!(
        ctx.result_categories.iter().map(String::as_str).collect::<Vec<_>>(),
        vec!["data_analysis", "triage"]
    );

    // TTL 为状态 TTL 的 24 倍
    let ttl = cache.ttl_of(&thread_context_key("t1")).expect("ttl set");
    assert!(ttl > 3600 * 23 && ttl <= 3600 * 24);

    // 同一线程开始新的运行时，类别重新累计
    persistence.save_agent_state("r2", "t1", "u1", &AgentRunState::new("y")).await;
    let ctx = persistence.get_thread_context("t1").await.expect("context cached");
    assert_eq!(ctx.run_id, "r2");
    assert!(ctx.result_categories.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_results_saved_before_first_checkpoint_reach_thread_context() -> Result<()> {
    let (persistence, _cache, _store) = engine();

    // 运行还没有任何 checkpoint 时先产出了结果
    assert!(persistence.save_sub_agent_result("r1", "triage", json!({})).await);
    assert!(persistence.get_thread_context("t1").await.is_none());

    persistence.save_agent_state("r1", "t1", "u1", &sample_state()).await;
    let ctx = persistence.get_thread_context("t1").await.expect("context cached");
    assert_eq!(ctx.run_id, "r1");
    assert!(ctx.result_categories.contains("triage"));

    persistence.save_sub_agent_result("r1", "report", json!({})).await;
    let ctx = persistence.get_thread_context("t1").await.expect("context cached");
    assert_eq!(
        ctx.result_categories.iter().map(String::as_str).collect::<Vec<_>>(),
        vec!["report", "triage"]
    );
    Ok(())
}

#[tokio::test]
async fn test_resume_point_skips_completed_phases() -> Result<()> {
    let (persistence, _cache, _store) = engine();
    let pipeline = ["triage", "data_analysis", "optimization"];

    let mut state = AgentRunState::new("optimize the fleet");
    state.advance("triage");
    state.advance("data_analysis");
    persistence.save_agent_state("r1", "t1", "u1", &state).await;
    persistence.save_sub_agent_result("r1", "triage", json!({ "ok": true })).await;

    let resume = persistence.resume_point("r1", &pipeline).await;
    assert_eq!(resume.state, Some(state));
    assert_eq!(resume.completed.len(), 1);
    assert_eq!(resume.completed[0].agent_name, "triage");
    assert_eq!(resume.pending, vec!["data_analysis", "optimization"]);
    assert_eq!(resume.next_phase(), Some("data_analysis"));
    assert!(!resume.is_finished());
    Ok(())
}

#[tokio::test]
async fn test_resume_point_falls_back_to_cache() -> Result<()> {
    let (persistence, _cache, store) = engine();
    persistence.save_sub_agent_result("r1", "triage", json!({})).await;

    store.set_fail_reads(true);
    let resume = persistence.resume_point("r1", &["triage", "report"]).await;
    assert_eq!(resume.completed.len(), 1);
    assert_eq!(resume.pending, vec!["report"]);
    Ok(())
}

#[tokio::test]
async fn test_legacy_snapshot_is_migrated_on_load() -> Result<()> {
    let (persistence, cache, store) = engine();
    store.insert_raw_state(
        "r-old",
        json!({ "step": 4, "request": "legacy run", "phase": "report", "notes": "kept" }),
    );

    let state = persistence.load_agent_state("r-old").await.expect("migrated");
    assert_eq!(state.step_count, 4);
    assert_eq!(state.user_request.as_deref(), Some("legacy run"));
    assert_eq!(state.metadata.get("notes"), Some(&json!("kept")));

    // 回填的缓存已经是当前格式
    let bytes = cache.get(&state_key("r-old")).await?.expect("cache repopulated");
    let cached: serde_json::Value = serde_json::from_slice(&bytes)?;
    assert_eq!(cached["format_version"], 2);
    Ok(())
}

#[tokio::test]
async fn test_newer_snapshot_version_is_not_loaded() {
    let (persistence, cache, store) = engine();
    store.insert_raw_state("r-new", json!({ "format_version": 99, "state": {} }));

    assert_eq!(persistence.load_agent_state("r-new").await, None);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_invalidate_cached_state_forces_durable_read() -> Result<()> {
    let (persistence, cache, _store) = engine();
    persistence.save_agent_state("r1", "", "u1", &sample_state()).await;

    assert!(persistence.invalidate_cached_state("r1").await);
    assert!(cache.get(&state_key("r1")).await?.is_none());
    assert!(persistence.load_agent_state("r1").await.is_some());
    Ok(())
}

#[tokio::test]
async fn test_local_file_store_backs_the_engine() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(LocalFileRunStore::new(dir.path())?);
    let persistence = StatePersistence::new(cache.clone(), store, &PersistenceSettings::default());

    let state = sample_state();
    assert!(persistence.save_agent_state("r1", "t1", "u1", &state).await.success);
    assert!(persistence.save_sub_agent_result("r1", "triage", json!({ "n": 1 })).await);

    // 缓存清空 (模拟进程重启)，状态从文件恢复
    cache.clear();
    assert_eq!(persistence.load_agent_state("r1").await, Some(state));
    let resume = persistence.resume_point("r1", &["triage", "report"]).await;
    assert_eq!(resume.pending, vec!["report"]);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_runs_do_not_interfere() -> Result<()> {
    let (persistence, _cache, _store) = engine();
    let persistence = Arc::new(persistence);

    let tasks = (0..8).map(|i| {
        let persistence = persistence.clone();
        tokio::spawn(async move {
            let run_id = format!("run-{}", i);
            let mut state = AgentRunState::new(format!("request {}", i));
            for _ in 0..=i {
                state.advance("work");
            }
            let ok = persistence.save_agent_state(&run_id, "", "u1", &state).await.success;
            (run_id, state, ok)
        })
    });

    for joined in futures::future::join_all(tasks).await {
        let (run_id, state, ok) = joined?;
        assert!(ok);
        assert_eq!(persistence.load_agent_state(&run_id).await, Some(state));
    }
    Ok(())
}
