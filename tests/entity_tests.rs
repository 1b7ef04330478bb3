//! Durable entities: keyed single-writer state, at-least-once signals with
//! exactly-once application, and orchestration calls.

mod common;

use common::{start, wait_completed};
use taskloom::providers::{Provider, WorkItem};
use taskloom::runtime::{EntityContext, EntityRegistry, OrchestrationRegistry};
use taskloom::{EntityId, OrchestrationContext};

fn counter_entities() -> EntityRegistry {
    EntityRegistry::builder()
        .register("counter", |ctx: EntityContext, input: String| async move {
            let mut value: i64 = ctx.get_state()?.unwrap_or(0);
            match ctx.operation().as_str() {
                "add" => {
                    value += input.parse::<i64>().map_err(|e| e.to_string())?;
                    ctx.set_state(&value)?;
                    Ok(None)
                }
                "subtract" => {
                    value -= input.parse::<i64>().map_err(|e| e.to_string())?;
                    ctx.set_state(&value)?;
                    Ok(None)
                }
                "get" => Ok(Some(value.to_string())),
                "reset" => {
                    ctx.set_state(&0i64)?;
                    Ok(None)
                }
                other => Err(format!("unknown operation: {other}")),
            }
        })
        .build()
}

#[tokio::test]
async fn client_signals_mutate_entity_state() {
    let (rt, client) = start(
        common::in_memory(),
        common::no_activities(),
        OrchestrationRegistry::builder().build(),
        counter_entities(),
    )
    .await;
    let id = EntityId::new("counter", "client-side");
    client.signal_entity(&id, "add", "10").await.unwrap();
    client.signal_entity(&id, "add", "5").await.unwrap();
    client.signal_entity(&id, "subtract", "3").await.unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        if let Ok(Some(12)) = client.get_entity_state_typed::<i64>(&id).await {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "entity never reached 12");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    rt.shutdown().await;
}

#[tokio::test]
async fn orchestration_signals_then_calls_the_counter() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("CounterWorkflow", |ctx: OrchestrationContext, key: String| async move {
            let id = EntityId::new("counter", key.clone());
            ctx.signal_entity(&id, "add", "10");
            ctx.signal_entity(&id, "add", "5");
            ctx.signal_entity(&id, "subtract", "3");
            let value = ctx.call_entity(&id, "get", "").into_entity_call().await?;
            Ok(format!("Counter '{key}' final value: {value}"))
        })
        .build();

    let (rt, client) = start(
        common::in_memory(),
        common::no_activities(),
        orchestrations,
        counter_entities(),
    )
    .await;
    client.schedule_named("counter-wf", "CounterWorkflow", "wf-key").await.unwrap();
    assert_eq!(
        wait_completed(&client, "counter-wf").await,
        "Counter 'wf-key' final value: 12"
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn redelivered_signal_with_same_sequence_applies_once() {
    let provider = common::in_memory();
    let (rt, client) = start(
        provider.clone(),
        common::no_activities(),
        OrchestrationRegistry::builder().build(),
        counter_entities(),
    )
    .await;
    let id = EntityId::new("counter", "dedupe");

    // Simulate at-least-once delivery: the same operation, same sequence
    // number, enqueued twice.
    let signal = WorkItem::EntityInvoke {
        entity: id.clone(),
        seq: 1,
        operation: "add".into(),
        input: "10".into(),
        caller: None,
    };
    provider.enqueue_entity_work(signal.clone()).await.unwrap();
    provider.enqueue_entity_work(signal).await.unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while client.get_entity_state_typed::<i64>(&id).await.unwrap().is_none() {
        assert!(std::time::Instant::now() < deadline, "entity never materialized");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    // Settle long enough for the duplicate to be (not) applied.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(client.get_entity_state_typed::<i64>(&id).await.unwrap(), Some(10));
    rt.shutdown().await;
}

#[tokio::test]
async fn operations_on_different_keys_are_independent() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("TwoCounters", |ctx: OrchestrationContext, _input: String| async move {
            let a = EntityId::new("counter", "a");
            let b = EntityId::new("counter", "b");
            ctx.signal_entity(&a, "add", "1");
            ctx.signal_entity(&b, "add", "100");
            let va = ctx.call_entity(&a, "get", "").into_entity_call().await?;
            let vb = ctx.call_entity(&b, "get", "").into_entity_call().await?;
            Ok(format!("{va},{vb}"))
        })
        .build();

    let (rt, client) = start(
        common::in_memory(),
        common::no_activities(),
        orchestrations,
        counter_entities(),
    )
    .await;
    client.schedule_named("two-counters", "TwoCounters", "").await.unwrap();
    assert_eq!(wait_completed(&client, "two-counters").await, "1,100");
    rt.shutdown().await;
}

#[tokio::test]
async fn entity_call_error_is_catchable() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("BadOp", |ctx: OrchestrationContext, _input: String| async move {
            let id = EntityId::new("counter", "bad-op");
            match ctx.call_entity(&id, "explode", "").into_entity_call().await {
                Ok(_) => Err("expected the operation to fail".to_string()),
                Err(e) => Ok(format!("caught: {e}")),
            }
        })
        .build();

    let (rt, client) = start(
        common::in_memory(),
        common::no_activities(),
        orchestrations,
        counter_entities(),
    )
    .await;
    client.schedule_named("bad-op", "BadOp", "").await.unwrap();
    assert_eq!(
        wait_completed(&client, "bad-op").await,
        "caught: unknown operation: explode"
    );
    rt.shutdown().await;
}
