#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use taskloom::client::{Client, InstanceStatus, OrchestrationStatus};
use taskloom::providers::in_memory::InMemoryProvider;
use taskloom::providers::Provider;
use taskloom::runtime::{ActivityRegistry, EntityRegistry, OrchestrationRegistry, Runtime};

pub fn in_memory() -> Arc<dyn Provider> {
    Arc::new(InMemoryProvider::new())
}

pub fn no_activities() -> ActivityRegistry {
    ActivityRegistry::builder().build()
}

pub fn no_entities() -> EntityRegistry {
    EntityRegistry::builder().build()
}

pub async fn start(
    provider: Arc<dyn Provider>,
    activities: ActivityRegistry,
    orchestrations: OrchestrationRegistry,
    entities: EntityRegistry,
) -> (Arc<Runtime>, Client) {
    let runtime = Runtime::start_with_store(provider.clone(), activities, orchestrations, entities).await;
    (runtime, Client::new(provider))
}

pub async fn wait_completed(client: &Client, instance: &str) -> String {
    match wait_terminal(client, instance).await.status {
        OrchestrationStatus::Completed { output } => output,
        other => panic!("expected Completed, got {other:?}"),
    }
}

pub async fn wait_failed(client: &Client, instance: &str) -> String {
    match wait_terminal(client, instance).await.status {
        OrchestrationStatus::Failed { error } => error,
        other => panic!("expected Failed, got {other:?}"),
    }
}

pub async fn wait_terminal(client: &Client, instance: &str) -> InstanceStatus {
    client
        .wait_for_completion(instance, Duration::from_secs(10))
        .await
        .expect("instance did not reach a terminal status in time")
}
