//! The filesystem provider: same engine semantics, durable across runtime
//! restarts, including the in-process timer service path.

mod common;

use std::sync::Arc;

use common::{no_entities, wait_completed};
use taskloom::client::{Client, OrchestrationStatus};
use taskloom::providers::fs::FsProvider;
use taskloom::providers::Provider;
use taskloom::runtime::{ActivityRegistry, EntityRegistry, OrchestrationRegistry, Runtime};
use taskloom::{ActivityContext, EntityId, OrchestrationContext};

fn hello_registry() -> (ActivityRegistry, OrchestrationRegistry) {
    let activities = ActivityRegistry::builder()
        .register("Hello", |_ctx: ActivityContext, input: String| async move {
            Ok(format!("Hello, {input}!"))
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("HelloChain", |ctx: OrchestrationContext, input: String| async move {
            let first = ctx.schedule_activity("Hello", input).into_activity().await?;
            ctx.schedule_activity("Hello", first).into_activity().await
        })
        .build();
    (activities, orchestrations)
}

#[tokio::test]
async fn hello_chain_completes_on_the_filesystem_provider() {
    let dir = tempfile::tempdir().unwrap();
    let provider: Arc<dyn Provider> = Arc::new(FsProvider::new(dir.path(), true));
    let (activities, orchestrations) = hello_registry();
    let rt = Runtime::start_with_store(provider.clone(), activities, orchestrations, no_entities()).await;
    let client = Client::new(provider);

    client.schedule_named("fs-hello-1", "HelloChain", "Rust").await.unwrap();
    assert_eq!(wait_completed(&client, "fs-hello-1").await, "Hello, Hello, Rust!!");
    rt.shutdown().await;
}

#[tokio::test]
async fn state_survives_a_runtime_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let provider: Arc<dyn Provider> = Arc::new(FsProvider::new(dir.path(), true));
        let (activities, orchestrations) = hello_registry();
        let rt = Runtime::start_with_store(provider.clone(), activities, orchestrations, no_entities()).await;
        let client = Client::new(provider);
        client.schedule_named("fs-restart-1", "HelloChain", "durable").await.unwrap();
        wait_completed(&client, "fs-restart-1").await;
        rt.shutdown().await;
    }

    // A fresh runtime over the same directory sees the finished instance.
    let provider: Arc<dyn Provider> = Arc::new(FsProvider::new(dir.path(), false));
    let (activities, orchestrations) = hello_registry();
    let rt = Runtime::start_with_store(provider.clone(), activities, orchestrations, no_entities()).await;
    let client = Client::new(provider);
    assert_eq!(
        client.get_status("fs-restart-1").await.status,
        OrchestrationStatus::Completed {
            output: "Hello, Hello, durable!!".into()
        }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn timers_fire_through_the_in_process_timer_service() {
    let dir = tempfile::tempdir().unwrap();
    let provider: Arc<dyn Provider> = Arc::new(FsProvider::new(dir.path(), true));
    let orchestrations = OrchestrationRegistry::builder()
        .register("FsNap", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_timer(40).into_timer().await;
            Ok("fs-woke".to_string())
        })
        .build();
    let rt = Runtime::start_with_store(
        provider.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        no_entities(),
    )
    .await;
    let client = Client::new(provider);

    client.schedule_named("fs-nap-1", "FsNap", "").await.unwrap();
    assert_eq!(wait_completed(&client, "fs-nap-1").await, "fs-woke");
    rt.shutdown().await;
}

#[tokio::test]
async fn entity_state_is_durable_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let entities = EntityRegistry::builder()
        .register("tally", |ctx, input: String| async move {
            let mut value: i64 = ctx.get_state()?.unwrap_or(0);
            value += input.parse::<i64>().map_err(|e| e.to_string())?;
            ctx.set_state(&value)?;
            Ok(Some(value.to_string()))
        })
        .build();

    {
        let provider: Arc<dyn Provider> = Arc::new(FsProvider::new(dir.path(), true));
        let rt = Runtime::start_with_store(
            provider.clone(),
            ActivityRegistry::builder().build(),
            OrchestrationRegistry::builder().build(),
            entities,
        )
        .await;
        let client = Client::new(provider);
        let id = EntityId::new("tally", "day-1");
        client.signal_entity(&id, "bump", "7").await.unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while client.get_entity_state_typed::<i64>(&id).await.unwrap() != Some(7) {
            assert!(std::time::Instant::now() < deadline, "entity never reached 7");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        rt.shutdown().await;
    }

    // Re-open cold: the record is on disk.
    let provider: Arc<dyn Provider> = Arc::new(FsProvider::new(dir.path(), false));
    let client = Client::new(provider);
    assert_eq!(
        client
            .get_entity_state_typed::<i64>(&EntityId::new("tally", "day-1"))
            .await
            .unwrap(),
        Some(7)
    );
}
