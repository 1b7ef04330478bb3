//! External events: buffered until the wait point, matched by name, FIFO
//! across same-named waits.

mod common;

use common::{no_entities, start, wait_completed};
use taskloom::runtime::{ActivityRegistry, OrchestrationRegistry};
use taskloom::{ActivityContext, OrchestrationContext};

#[tokio::test]
async fn approval_after_the_wait_point_resumes_the_instance() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Approval", |ctx: OrchestrationContext, _input: String| async move {
            let decision = ctx.schedule_wait("approved").into_event().await;
            Ok(format!("decision:{decision}"))
        })
        .build();

    let (rt, client) = start(common::in_memory(), common::no_activities(), orchestrations, no_entities()).await;
    client.schedule_named("approval-1", "Approval", "").await.unwrap();
    // Let it reach the wait point first.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    client.raise_event("approval-1", "approved", "granted").await.unwrap();
    assert_eq!(wait_completed(&client, "approval-1").await, "decision:granted");
    rt.shutdown().await;
}

#[tokio::test]
async fn event_raised_before_the_wait_point_is_buffered_and_seen_once() {
    // The orchestration grinds through slow activities before subscribing;
    // the event arrives long before the wait point executes.
    let activities = ActivityRegistry::builder()
        .register("SlowStep", |_ctx: ActivityContext, input: String| async move {
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            Ok(input)
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("LateSubscriber", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("SlowStep", "warmup").into_activity().await?;
            let payload = ctx.schedule_wait("go").into_event().await;
            Ok(format!("saw:{payload}"))
        })
        .build();

    let (rt, client) = start(common::in_memory(), activities, orchestrations, no_entities()).await;
    client.schedule_named("buffered-1", "LateSubscriber", "").await.unwrap();
    client.raise_event("buffered-1", "go", "early-bird").await.unwrap();
    assert_eq!(wait_completed(&client, "buffered-1").await, "saw:early-bird");
    rt.shutdown().await;
}

#[tokio::test]
async fn same_named_waits_drain_arrivals_in_fifo_order() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("TwoApprovals", |ctx: OrchestrationContext, _input: String| async move {
            let first = ctx.schedule_wait("approval").into_event().await;
            let second = ctx.schedule_wait("approval").into_event().await;
            Ok(format!("{first},{second}"))
        })
        .build();

    let (rt, client) = start(common::in_memory(), common::no_activities(), orchestrations, no_entities()).await;
    client.schedule_named("fifo-1", "TwoApprovals", "").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    client.raise_event("fifo-1", "approval", "alice").await.unwrap();
    client.raise_event("fifo-1", "approval", "bob").await.unwrap();
    assert_eq!(wait_completed(&client, "fifo-1").await, "alice,bob");
    rt.shutdown().await;
}

#[tokio::test]
async fn events_with_different_names_route_to_their_own_waits() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("TwoChannels", |ctx: OrchestrationContext, _input: String| async move {
            let yes = ctx.schedule_wait("yes-votes").into_event().await;
            let no = ctx.schedule_wait("no-votes").into_event().await;
            Ok(format!("yes={yes} no={no}"))
        })
        .build();

    let (rt, client) = start(common::in_memory(), common::no_activities(), orchestrations, no_entities()).await;
    client.schedule_named("channels-1", "TwoChannels", "").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    // Arrives out of order relative to the waits; names disambiguate.
    client.raise_event("channels-1", "no-votes", "2").await.unwrap();
    client.raise_event("channels-1", "yes-votes", "5").await.unwrap();
    assert_eq!(wait_completed(&client, "channels-1").await, "yes=5 no=2");
    rt.shutdown().await;
}
