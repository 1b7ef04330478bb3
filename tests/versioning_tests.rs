//! The versioning gate: instances run the code version they were pinned to
//! at creation, no matter what else the worker has registered since.

mod common;

use common::{no_entities, start, wait_completed, wait_failed};
use taskloom::client::OrchestrationStatus;
use taskloom::providers::Provider;
use taskloom::runtime::{ActivityRegistry, OrchestrationRegistry, VersionPolicy};
use taskloom::{ActivityContext, Event, OrchestrationContext};

fn step_activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("V1Step", |_ctx: ActivityContext, _input: String| async move {
            Ok("v1".to_string())
        })
        .register("V2Step", |_ctx: ActivityContext, _input: String| async move {
            Ok("v2".to_string())
        })
        .build()
}

/// Two registered versions with different step sets.
fn versioned_orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register_versioned("Pipeline", "1.0.0", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("V1Step", "").into_activity().await
        })
        .register_versioned("Pipeline", "2.0.0", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("V1Step", "").into_activity().await?;
            ctx.schedule_activity("V2Step", "").into_activity().await
        })
        .build()
}

#[tokio::test]
async fn latest_policy_picks_newest_for_new_instances() {
    let (rt, client) = start(
        common::in_memory(),
        step_activities(),
        versioned_orchestrations(),
        no_entities(),
    )
    .await;
    client.schedule_named("ver-latest", "Pipeline", "").await.unwrap();
    assert_eq!(wait_completed(&client, "ver-latest").await, "v2");
    rt.shutdown().await;
}

#[tokio::test]
async fn pinned_instance_never_runs_newer_version_steps() {
    let provider = common::in_memory();
    let (rt, client) = start(
        provider.clone(),
        step_activities(),
        versioned_orchestrations(),
        no_entities(),
    )
    .await;
    client
        .schedule_versioned("ver-pinned", "Pipeline", "1.0.0", "")
        .await
        .unwrap();
    assert_eq!(wait_completed(&client, "ver-pinned").await, "v1");

    let history = provider.read("ver-pinned").await;
    assert!(history.iter().any(
        |e| matches!(e, Event::OrchestrationStarted { version, .. } if version == "1.0.0")
    ));
    assert!(
        !history
            .iter()
            .any(|e| matches!(e, Event::ActivityScheduled { name, .. } if name == "V2Step")),
        "a 1.0.0 instance must never schedule 2.0.0-only steps"
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn exact_start_policy_pins_new_instances_to_an_older_version() {
    let orchestrations = versioned_orchestrations();
    orchestrations.set_version_policy("Pipeline", VersionPolicy::Exact(semver::Version::new(1, 0, 0)));
    let (rt, client) = start(common::in_memory(), step_activities(), orchestrations, no_entities()).await;
    client.schedule_named("ver-policy", "Pipeline", "").await.unwrap();
    assert_eq!(wait_completed(&client, "ver-policy").await, "v1");
    rt.shutdown().await;
}

#[tokio::test]
async fn branching_on_the_injected_version_tag() {
    let orchestrations = OrchestrationRegistry::builder()
        .register_versioned("Gated", "1.0.0", |ctx: OrchestrationContext, _input: String| async move {
            if ctx.version().major >= 2 {
                ctx.schedule_activity("V2Step", "").into_activity().await
            } else {
                ctx.schedule_activity("V1Step", "").into_activity().await
            }
        })
        .register_versioned("Gated", "2.0.0", |ctx: OrchestrationContext, _input: String| async move {
            if ctx.version().major >= 2 {
                ctx.schedule_activity("V2Step", "").into_activity().await
            } else {
                ctx.schedule_activity("V1Step", "").into_activity().await
            }
        })
        .build();

    let (rt, client) = start(common::in_memory(), step_activities(), orchestrations, no_entities()).await;
    client.schedule_versioned("gated-old", "Gated", "1.0.0", "").await.unwrap();
    client.schedule_versioned("gated-new", "Gated", "2.0.0", "").await.unwrap();
    assert_eq!(wait_completed(&client, "gated-old").await, "v1");
    assert_eq!(wait_completed(&client, "gated-new").await, "v2");
    rt.shutdown().await;
}

#[tokio::test]
async fn instance_pinned_to_an_unregistered_version_fails() {
    let (rt, client) = start(
        common::in_memory(),
        step_activities(),
        versioned_orchestrations(),
        no_entities(),
    )
    .await;
    client
        .schedule_versioned("ver-missing", "Pipeline", "9.0.0", "")
        .await
        .unwrap();
    let error = wait_failed(&client, "ver-missing").await;
    assert_eq!(error, "unregistered:Pipeline@9.0.0");
    rt.shutdown().await;
}

#[tokio::test]
async fn continue_as_new_with_explicit_version_switches_code_paths() {
    let orchestrations = OrchestrationRegistry::builder()
        .register_versioned("Upgrader", "1.0.0", |ctx: OrchestrationContext, input: String| async move {
            if input == "upgrade" {
                ctx.continue_as_new_versioned("2.0.0", "upgraded");
                return Ok(String::new());
            }
            Ok("still-v1".to_string())
        })
        .register_versioned("Upgrader", "2.0.0", |ctx: OrchestrationContext, input: String| async move {
            Ok(format!("v2:{input}:{}", ctx.version()))
        })
        .set_policy("Upgrader", VersionPolicy::Exact(semver::Version::new(1, 0, 0)))
        .build();

    let (rt, client) = start(common::in_memory(), step_activities(), orchestrations, no_entities()).await;
    client.schedule_named("upgrader-1", "Upgrader", "upgrade").await.unwrap();
    assert_eq!(wait_completed(&client, "upgrader-1").await, "v2:upgraded:2.0.0");
    rt.shutdown().await;
}

#[tokio::test]
async fn status_surfaces_terminal_output() {
    let (rt, client) = start(
        common::in_memory(),
        step_activities(),
        versioned_orchestrations(),
        no_entities(),
    )
    .await;
    client.schedule_named("ver-status", "Pipeline", "").await.unwrap();
    wait_completed(&client, "ver-status").await;
    let status = client.get_status("ver-status").await;
    assert_eq!(
        status.status,
        OrchestrationStatus::Completed { output: "v2".into() }
    );
    rt.shutdown().await;
}
