//! Continue-as-new: unbounded iteration with bounded history.

mod common;

use common::{no_entities, start, wait_completed};
use taskloom::runtime::{ActivityRegistry, OrchestrationRegistry};
use taskloom::{ActivityContext, OrchestrationContext};

fn counting_registry() -> (ActivityRegistry, OrchestrationRegistry) {
    let activities = ActivityRegistry::builder()
        .register("Tick", |_ctx: ActivityContext, input: String| async move { Ok(input) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("EternalCounter", |ctx: OrchestrationContext, input: String| async move {
            let n: u64 = input.parse().map_err(|e| format!("bad input: {e}"))?;
            ctx.schedule_activity("Tick", n.to_string()).into_activity().await?;
            if n < 5 {
                ctx.continue_as_new((n + 1).to_string());
                return Ok(String::new());
            }
            Ok(n.to_string())
        })
        .build();
    (activities, orchestrations)
}

#[tokio::test]
async fn continuation_chain_reaches_final_iteration() {
    let (activities, orchestrations) = counting_registry();
    let (rt, client) = start(common::in_memory(), activities, orchestrations, no_entities()).await;
    client.schedule_named("eternal-1", "EternalCounter", "0").await.unwrap();
    assert_eq!(wait_completed(&client, "eternal-1").await, "5");
    assert_eq!(client.list_executions("eternal-1").await, vec![1, 2, 3, 4, 5, 6]);
    rt.shutdown().await;
}

#[tokio::test]
async fn per_execution_history_stays_constant_across_continuations() {
    let (activities, orchestrations) = counting_registry();
    let (rt, client) = start(common::in_memory(), activities, orchestrations, no_entities()).await;
    client.schedule_named("eternal-2", "EternalCounter", "0").await.unwrap();
    wait_completed(&client, "eternal-2").await;

    // Each continued execution carries the same fixed event count instead of
    // accumulating the whole chain's past: that is the bounding guarantee.
    let mut continued_lengths = Vec::new();
    for execution_id in client.list_executions("eternal-2").await {
        let history = client.read_execution_history("eternal-2", execution_id).await;
        assert!(
            history.len() < 12,
            "execution {execution_id} history grew to {} events",
            history.len()
        );
        let continued = history
            .iter()
            .any(|e| matches!(e, taskloom::Event::OrchestrationContinuedAsNew { .. }));
        if continued {
            continued_lengths.push(history.len());
        }
    }
    assert!(continued_lengths.len() >= 5);
    assert!(
        continued_lengths.windows(2).all(|w| w[0] == w[1]),
        "continued executions should all have the same history length, got {continued_lengths:?}"
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn external_event_raised_mid_chain_reaches_the_live_execution() {
    let activities = ActivityRegistry::builder().build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("RestartThenWait", |ctx: OrchestrationContext, input: String| async move {
            if input == "fresh" {
                ctx.continue_as_new("waiting");
                return Ok(String::new());
            }
            let approval = ctx.schedule_wait("approval").into_event().await;
            Ok(format!("approved:{approval}"))
        })
        .build();

    let (rt, client) = start(common::in_memory(), activities, orchestrations, no_entities()).await;
    client.schedule_named("can-evt", "RestartThenWait", "fresh").await.unwrap();
    // Give the chain a moment to restart, then signal the live execution.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    client.raise_event("can-evt", "approval", "yes").await.unwrap();
    assert_eq!(wait_completed(&client, "can-evt").await, "approved:yes");
    rt.shutdown().await;
}
