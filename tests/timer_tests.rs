//! Durable timers, and timeout modeled as a race between the awaited work
//! and an engine-managed timer.

mod common;

use common::{no_entities, start, wait_completed};
use taskloom::runtime::{ActivityRegistry, OrchestrationRegistry};
use taskloom::{ActivityContext, DurableOutput, OrchestrationContext};

#[tokio::test]
async fn timer_fires_and_the_instance_resumes() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Nap", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_timer(50).into_timer().await;
            Ok("woke".to_string())
        })
        .build();

    let (rt, client) = start(common::in_memory(), common::no_activities(), orchestrations, no_entities()).await;
    let started = std::time::Instant::now();
    client.schedule_named("nap-1", "Nap", "").await.unwrap();
    assert_eq!(wait_completed(&client, "nap-1").await, "woke");
    assert!(started.elapsed() >= std::time::Duration::from_millis(50));
    rt.shutdown().await;
}

#[tokio::test]
async fn timeout_race_times_out_when_no_event_arrives() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("WaitWithTimeout", |ctx: OrchestrationContext, _input: String| async move {
            let approval = ctx.schedule_wait("approval");
            let timeout = ctx.schedule_timer(80);
            match ctx.select2(approval, timeout).await {
                (0, DurableOutput::External(data)) => Ok(format!("approved:{data}")),
                (1, DurableOutput::Timer) => Ok("timed-out".to_string()),
                other => Err(format!("unexpected winner: {other:?}")),
            }
        })
        .build();

    let (rt, client) = start(common::in_memory(), common::no_activities(), orchestrations, no_entities()).await;
    client.schedule_named("race-timeout", "WaitWithTimeout", "").await.unwrap();
    assert_eq!(wait_completed(&client, "race-timeout").await, "timed-out");
    rt.shutdown().await;
}

#[tokio::test]
async fn timeout_race_prefers_the_event_when_it_arrives_first() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("WaitWithTimeout", |ctx: OrchestrationContext, _input: String| async move {
            let approval = ctx.schedule_wait("approval");
            let timeout = ctx.schedule_timer(5_000);
            match ctx.select2(approval, timeout).await {
                (0, DurableOutput::External(data)) => Ok(format!("approved:{data}")),
                (1, DurableOutput::Timer) => Ok("timed-out".to_string()),
                other => Err(format!("unexpected winner: {other:?}")),
            }
        })
        .build();

    let (rt, client) = start(common::in_memory(), common::no_activities(), orchestrations, no_entities()).await;
    client.schedule_named("race-approve", "WaitWithTimeout", "").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    client.raise_event("race-approve", "approval", "ok").await.unwrap();
    assert_eq!(wait_completed(&client, "race-approve").await, "approved:ok");
    rt.shutdown().await;
}

#[tokio::test]
async fn monitor_polls_on_a_timer_until_the_condition_holds() {
    // The polling/monitor shape: check, sleep, check again.
    let counter = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
    let probe_counter = counter.clone();
    let activities = ActivityRegistry::builder()
        .register("Probe", move |_ctx: ActivityContext, _input: String| {
            let counter = probe_counter.clone();
            async move {
                let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                Ok(if n >= 3 { "ready".to_string() } else { "pending".to_string() })
            }
        })
        .build();

    let orchestrations = OrchestrationRegistry::builder()
        .register("Monitor", |ctx: OrchestrationContext, _input: String| async move {
            let mut polls = 0u32;
            loop {
                let state = ctx.schedule_activity("Probe", "").into_activity().await?;
                polls += 1;
                if state == "ready" {
                    return Ok(format!("ready after {polls} polls"));
                }
                if polls > 10 {
                    return Err("gave up".to_string());
                }
                ctx.schedule_timer(20).into_timer().await;
            }
        })
        .build();

    let (rt, client) = start(common::in_memory(), activities, orchestrations, no_entities()).await;
    client.schedule_named("monitor-1", "Monitor", "").await.unwrap();
    assert_eq!(wait_completed(&client, "monitor-1").await, "ready after 3 polls");
    rt.shutdown().await;
}
