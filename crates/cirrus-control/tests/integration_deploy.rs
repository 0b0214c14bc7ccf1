//! Integration tests for deployment scenarios.

mod common;

use std::time::Duration;

use bytes::Bytes;
use cirrus_build::{unpack, DeployStage, ExtractLimits, MockBuildService, SynthesisConfig, Synthesizer};
use cirrus_control::{
    ControlError, DeployRequest, DeploymentStatus, FunctionStatus, MockRuntime, OwnerId,
    RollbackPath,
};
use common::fixtures::{handler_archive, ArchiveBuilder, NO_HANDLER, ONE_HANDLER, TWO_HANDLERS};
use common::{test_config, TestPlane};

#[tokio::test]
async fn init_deploy_update_and_roll_back() {
    let t = TestPlane::new();
    let function = t.function("echo").await;
    assert_eq!(function.status, FunctionStatus::Init);

    // First deployment
    let v1 = t.deploy(&function, handler_archive()).await.unwrap();
    assert_eq!(v1.version, 1);
    assert!(v1.was_first_deployment);

    let current = t.plane.get_function(&function.id).await.unwrap();
    assert_eq!(current.status, FunctionStatus::Active);
    assert_eq!(current.active_deployment_id.as_ref(), Some(&v1.deployment_id));

    // Update
    let v2 = t.deploy(&function, handler_archive()).await.unwrap();
    assert_eq!(v2.version, 2);
    assert!(!v2.was_first_deployment);
    assert_eq!(t.version(&function, 1).await.status, DeploymentStatus::Disabled);
    assert_eq!(t.active(&function).await.unwrap().version, 2);

    // Roll back to v1; its image is still present
    let builds = t.builder.build_count();
    let rolled = t.rollback(&function, 1).await.unwrap();
    assert_eq!(rolled.version, 1);
    assert_eq!(rolled.path, RollbackPath::Fast);
    assert_eq!(t.builder.build_count(), builds);

    let v1_row = t.version(&function, 1).await;
    assert!(v1_row.is_active);
    assert_eq!(v1_row.status, DeploymentStatus::Active);
    assert_eq!(t.version(&function, 2).await.status, DeploymentStatus::Disabled);

    let current = t.plane.get_function(&function.id).await.unwrap();
    assert_eq!(current.active_deployment_id.as_ref(), Some(&v1.deployment_id));

    let deployments = t.plane.list_deployments(&function.id).await.unwrap();
    let versions: Vec<u32> = deployments.iter().map(|d| d.version).collect();
    assert_eq!(versions, vec![1, 2]);
    assert_eq!(deployments.iter().filter(|d| d.is_active).count(), 1);
}

#[tokio::test]
async fn concurrent_deploys_get_distinct_versions() {
    let t = TestPlane::with(
        MockBuildService::with_delay(Duration::from_millis(20)),
        MockRuntime::new(),
        test_config(),
    );
    let function = t.function("busy").await;

    let deploys = (0..6).map(|_| t.deploy(&function, handler_archive()));
    let outcomes = futures::future::join_all(deploys).await;

    let mut versions: Vec<u32> = outcomes
        .into_iter()
        .map(|o| o.expect("deploy failed").version)
        .collect();
    versions.sort_unstable();
    assert_eq!(versions, (1..=6).collect::<Vec<u32>>());

    let deployments = t.plane.list_deployments(&function.id).await.unwrap();
    assert_eq!(deployments.len(), 6);
    assert_eq!(deployments.iter().filter(|d| d.is_active).count(), 1);

    let current = t.plane.get_function(&function.id).await.unwrap();
    assert_eq!(current.status, FunctionStatus::Active);
}

#[tokio::test]
async fn synthesis_failure_keeps_previous_version_serving() {
    let t = TestPlane::new();
    let function = t.function("echo").await;
    t.deploy(&function, handler_archive()).await.unwrap();

    let err = t
        .deploy(&function, ArchiveBuilder::crate_with_lib(NO_HANDLER).tar_zst())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::Deploy {
            stage: DeployStage::Synthesis,
            ..
        }
    ));

    let failed = t.version(&function, 2).await;
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert!(failed.error.is_some());

    let current = t.plane.get_function(&function.id).await.unwrap();
    assert_eq!(current.status, FunctionStatus::Failed);
    assert_eq!(t.active(&function).await.unwrap().version, 1);

    // Failed versions consume their number
    let retry = t.deploy(&function, handler_archive()).await.unwrap();
    assert_eq!(retry.version, 3);
}

#[tokio::test]
async fn ambiguous_handlers_are_reported() {
    let t = TestPlane::new();
    let function = t.function("twins").await;

    let err = t
        .deploy(&function, ArchiveBuilder::crate_with_lib(TWO_HANDLERS).tar_zst())
        .await
        .unwrap_err();

    match err {
        ControlError::Deploy { stage, source } => {
            assert_eq!(stage, DeployStage::Synthesis);
            let message = source.to_string();
            assert!(message.contains("First"));
            assert!(message.contains("Second"));
        }
        other => panic!("expected Deploy, got {other:?}"),
    }
    assert!(t.active(&function).await.is_none());
}

#[tokio::test]
async fn build_failure_removes_partial_image() {
    let t = TestPlane::new();
    let function = t.function("echo").await;
    t.builder.set_failing(true);

    let err = t.deploy(&function, handler_archive()).await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::Deploy {
            stage: DeployStage::Build,
            ..
        }
    ));

    let failed = t.version(&function, 1).await;
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert!(!t.builder.contains(&failed.image_tag));
    assert_eq!(t.builder.prune_count(), 0);
}

#[tokio::test]
async fn upload_failure_keeps_previous_version_serving() {
    let t = TestPlane::new();
    let function = t.function("echo").await;
    let v1 = t.deploy(&function, handler_archive()).await.unwrap();

    t.objects.set_failing_puts(true);
    let err = t.deploy(&function, handler_archive()).await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::Deploy {
            stage: DeployStage::Upload,
            ..
        }
    ));

    assert_eq!(t.version(&function, 2).await.status, DeploymentStatus::Failed);
    let current = t.plane.get_function(&function.id).await.unwrap();
    assert_eq!(current.status, FunctionStatus::Failed);
    assert_eq!(current.active_deployment_id.as_ref(), Some(&v1.deployment_id));
    assert_eq!(t.active(&function).await.unwrap().version, 1);
    assert!(t.leftover_workspaces().is_empty());
}

#[tokio::test]
async fn workspaces_are_removed_on_every_outcome() {
    let t = TestPlane::new();
    let function = t.function("echo").await;

    t.deploy(&function, handler_archive()).await.unwrap();
    assert!(t.leftover_workspaces().is_empty());

    t.deploy(&function, ArchiveBuilder::crate_with_lib(NO_HANDLER).tar_zst())
        .await
        .unwrap_err();
    assert!(t.leftover_workspaces().is_empty());

    t.deploy(&function, Bytes::from_static(b"definitely not an archive"))
        .await
        .unwrap_err();
    assert!(t.leftover_workspaces().is_empty());

    t.builder.set_failing(true);
    t.deploy(&function, handler_archive()).await.unwrap_err();
    assert!(t.leftover_workspaces().is_empty());
}

#[tokio::test]
async fn garbage_archive_fails_extraction() {
    let t = TestPlane::new();
    let function = t.function("echo").await;

    let err = t
        .deploy(&function, Bytes::from_static(b"definitely not an archive"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::Deploy {
            stage: DeployStage::Extraction,
            ..
        }
    ));
    assert_eq!(t.builder.build_count(), 0);
}

#[tokio::test]
async fn empty_archive_is_rejected_before_reserving() {
    let t = TestPlane::new();
    let function = t.function("echo").await;

    let err = t.deploy(&function, Bytes::new()).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert!(t.plane.list_deployments(&function.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn other_owners_cannot_deploy() {
    let t = TestPlane::new();
    let function = t.function("echo").await;

    let err = t
        .plane
        .deploy(DeployRequest {
            owner_id: OwnerId::new("intruder"),
            function_id: function.id.clone(),
            archive: handler_archive(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFound(_)));
}

#[tokio::test]
async fn duplicate_and_invalid_names_are_rejected() {
    let t = TestPlane::new();
    t.function("echo").await;

    let err = t.plane.initialize(t.owner.clone(), "echo").await.unwrap_err();
    assert_eq!(err.status_code(), 409);

    let err = t.plane.initialize(t.owner.clone(), "Bad_Name").await.unwrap_err();
    assert_eq!(err.status_code(), 400);

    t.plane
        .initialize(OwnerId::new("someone-else"), "echo")
        .await
        .expect("names are unique per owner");
}

#[tokio::test]
async fn stored_archive_is_synthesized_and_stable() {
    let t = TestPlane::new();
    let function = t.function("echo").await;
    t.deploy(&function, ArchiveBuilder::crate_with_lib(ONE_HANDLER).tar().into())
        .await
        .unwrap();

    let v1 = t.version(&function, 1).await;
    let stored = t.archives.get(&v1.archive_key).await.unwrap();

    let dir = tempfile::TempDir::new().unwrap();
    unpack(stored, dir.path(), ExtractLimits::default())
        .await
        .unwrap();

    let bootstrap = std::fs::read_to_string(dir.path().join("src/bin/cirrus-bootstrap.rs")).unwrap();
    assert!(bootstrap.contains("::echo_fn::Echo"));

    let manifest: toml::Table =
        toml::from_str(&std::fs::read_to_string(dir.path().join("Cargo.toml")).unwrap()).unwrap();
    assert!(manifest.get("dev-dependencies").is_none());
    assert!(manifest.get("bin").is_some());

    // Synthesizing the stored tree again changes nothing
    let again = Synthesizer::new(SynthesisConfig::default())
        .synthesize(dir.path())
        .await
        .unwrap();
    assert!(!again.manifest_changed);
    let rerendered =
        std::fs::read_to_string(dir.path().join("src/bin/cirrus-bootstrap.rs")).unwrap();
    assert_eq!(bootstrap, rerendered);
}
