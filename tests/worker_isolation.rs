//! Worker pool behavior through the engine: backpressure, per-provider
//! isolation, cancellation liveness, and pool integrity accounting.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{env_key, Behavior, MockAdapter};

use ai_gateway_rust::{
    cancel_pair, ChatRequest, ErrorKind, GatewayEngine, Message, ProviderConfig, RequestContext,
};

fn tiny_pool_config(key_var: &str) -> ProviderConfig {
    ProviderConfig::new("openai")
        .with_concurrency(1)
        .with_queue_depth(1)
        .with_network_timeout(Duration::from_secs(5))
        .with_max_retries(0)
        .with_key(env_key(key_var))
}

#[tokio::test]
async fn test_backpressure_rejects_overflow_with_queue_full() {
    let adapter = Arc::new(
        MockAdapter::new("openai").with_default(Behavior::Hang(
            Duration::from_millis(100),
            "slow ok".into(),
        )),
    );

    let engine = Arc::new(
        GatewayEngine::builder()
            .with_provider(tiny_pool_config("GW_TEST_BP_KEY"), adapter)
            .build()
            .unwrap(),
    );

    // Two requests occupy the worker and the single queue slot; the
    // third can only fail once its submission deadline passes.
    let e1 = engine.clone();
    let first = tokio::spawn(async move {
        e1.handle(ChatRequest::chat("gpt-4o", vec![Message::user("one")]))
            .await
    });
    let e2 = engine.clone();
    let second = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        e2.handle(ChatRequest::chat("gpt-4o", vec![Message::user("two")]))
            .await
    });
    let e3 = engine.clone();
    let third = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        e3.handle_with_context(
            ChatRequest::chat("gpt-4o", vec![Message::user("three")]),
            RequestContext::new().with_timeout(Duration::from_millis(50)),
        )
        .await
    });

    let r1 = first.await.unwrap();
    let r2 = second.await.unwrap();
    let r3 = third.await.unwrap();

    assert!(r1.is_ok());
    assert!(r2.is_ok());
    let err = r3.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProviderUnavailable);
    assert!(err
        .attempts
        .first()
        .and_then(|a| a.message.as_deref())
        .map(|m| m.contains("queue_full"))
        .unwrap_or(false));
}

#[tokio::test]
async fn test_saturated_provider_does_not_affect_sibling() {
    // Provider A: one worker, blocked for a long time.
    let blocked = Arc::new(MockAdapter::new("blocked").with_default(Behavior::Hang(
        Duration::from_secs(30),
        "never".into(),
    )));
    // Provider B: healthy.
    let healthy = Arc::new(MockAdapter::new("healthy"));

    let engine = Arc::new(
        GatewayEngine::builder()
            .with_provider(
                ProviderConfig::new("blocked")
                    .with_concurrency(1)
                    .with_queue_depth(1)
                    .with_network_timeout(Duration::from_secs(60))
                    .with_key(env_key("GW_TEST_ISO_KEY_A")),
                blocked,
            )
            .with_provider(
                ProviderConfig::new("healthy")
                    .with_concurrency(2)
                    .with_network_timeout(Duration::from_secs(2))
                    .with_key(env_key("GW_TEST_ISO_KEY_B")),
                healthy.clone(),
            )
            .build()
            .unwrap(),
    );

    // Saturate provider A (fire and forget).
    let ea = engine.clone();
    tokio::spawn(async move {
        let _ = ea
            .handle(
                ChatRequest::chat("slow-model", vec![Message::user("block")])
                    .with_provider("blocked"),
            )
            .await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Provider B keeps serving promptly while A is wedged.
    let started = std::time::Instant::now();
    for i in 0..10 {
        let resp = engine
            .handle(
                ChatRequest::chat("fast-model", vec![Message::user(format!("req {}", i))])
                    .with_provider("healthy"),
            )
            .await
            .unwrap();
        assert_eq!(resp.first_content(), Some("ok"));
    }
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "sibling provider slowed down by a saturated pool: {:?}",
        started.elapsed()
    );
    assert_eq!(healthy.executes(), 10);
}

#[tokio::test]
async fn test_cancellation_is_prompt_for_queued_job() {
    let adapter = Arc::new(MockAdapter::new("openai").with_default(Behavior::Hang(
        Duration::from_secs(30),
        "never".into(),
    )));

    let engine = Arc::new(
        GatewayEngine::builder()
            .with_provider(tiny_pool_config("GW_TEST_CANCEL_KEY"), adapter)
            .build()
            .unwrap(),
    );

    // Occupy the single worker.
    let ea = engine.clone();
    tokio::spawn(async move {
        let _ = ea
            .handle(ChatRequest::chat("gpt-4o", vec![Message::user("block")]))
            .await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Second request sits in the queue behind the blocked worker.
    let (handle, token) = cancel_pair();
    let eb = engine.clone();
    let waiting = tokio::spawn(async move {
        eb.handle_with_context(
            ChatRequest::chat("gpt-4o", vec![Message::user("queued")]),
            RequestContext::new().with_cancel(token),
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let canceled_at = std::time::Instant::now();
    handle.cancel();
    let err = waiting.await.unwrap().unwrap_err();

    assert_eq!(err.kind, ErrorKind::Canceled);
    assert!(
        canceled_at.elapsed() < Duration::from_millis(50),
        "cancellation took {:?}, expected prompt return independent of worker runtime",
        canceled_at.elapsed()
    );
}

#[tokio::test]
async fn test_pool_counters_balance_after_mixed_outcomes() {
    let adapter = Arc::new(MockAdapter::new("openai"));
    adapter.push(Behavior::Reply("one".into()));
    adapter.push(Behavior::Status(500, "boom".into()));
    adapter.push(Behavior::Reply("three".into()));

    let engine = GatewayEngine::builder()
        .with_provider(
            ProviderConfig::new("openai")
                .with_concurrency(2)
                .with_network_timeout(Duration::from_millis(500))
                .with_max_retries(0)
                .with_key(env_key("GW_TEST_POOLINT_KEY")),
            adapter,
        )
        .build()
        .unwrap();

    let _ = engine
        .handle(ChatRequest::chat("gpt-4o", vec![Message::user("a")]))
        .await;
    let _ = engine
        .handle(ChatRequest::chat("gpt-4o", vec![Message::user("b")]))
        .await;
    let _ = engine
        .handle(ChatRequest::chat("gpt-4o", vec![Message::user("c")]))
        .await;

    // Canceled request as well: every path must release what it acquired.
    let (handle, token) = cancel_pair();
    handle.cancel();
    let _ = engine
        .handle_with_context(
            ChatRequest::chat("gpt-4o", vec![Message::user("d")]),
            RequestContext::new().with_cancel(token),
        )
        .await;

    let stats = engine.pool_stats();
    assert_eq!(stats.sinks_acquired, stats.sinks_released);
    assert_eq!(stats.buffers_acquired, stats.buffers_released);
    assert_eq!(stats.scratch_acquired, stats.scratch_released);
    assert!(stats.sinks_acquired >= 3);
}
