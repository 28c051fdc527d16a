//! 构建流程测试（基于内存模拟器）

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vsb_builder::*;
use vsb_driver::simulator::Simulator;
use vsb_driver::{
    CancellationToken, ConnectConfig, Driver, DriverError, ObjectType, PowerState,
    VirtualMachine, VmProperty, WaitOptions,
};

fn config(vm_name: &str) -> BuilderConfig {
    BuilderConfig {
        vcenter_server: Simulator::ENDPOINT.to_string(),
        username: "root".to_string(),
        password: "jetbrains".to_string(),
        template: "basic".to_string(),
        host: "esxi-1".to_string(),
        vm_name: vm_name.to_string(),
        task_timeout: 60,
        poll_interval_ms: 10,
        ..Default::default()
    }
}

async fn build(sim: &Simulator, config: BuilderConfig) -> BuildOutcome {
    Builder::new(config)
        .unwrap()
        .with_connector(Arc::new(sim.clone()))
        .run()
        .await
}

async fn connect(sim: &Simulator) -> Driver {
    let config = ConnectConfig::new(Simulator::ENDPOINT, "root", "jetbrains");
    Driver::with_backend(Arc::new(sim.session()), &config)
        .await
        .unwrap()
}

async fn built_vm(sim: &Simulator, outcome: &BuildOutcome) -> VirtualMachine {
    let artifact = outcome.result.as_ref().unwrap();
    connect(sim).await.vm(artifact.id().clone())
}

async fn chain_len(vm: &VirtualMachine) -> usize {
    vm.info(&[VmProperty::LayoutExDisk])
        .await
        .unwrap()
        .disk_chain_len()
        .unwrap()
}

/// 记录调用参数的客户机钩子
#[derive(Default)]
struct RecordingHook {
    calls: Mutex<Vec<GuestEndpoint>>,
    fail: bool,
}

#[async_trait]
impl GuestHook for RecordingHook {
    async fn provision(&self, guest: &GuestEndpoint) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(guest.clone());
        if self.fail {
            anyhow::bail!("provisioner exited with status 1");
        }
        Ok(())
    }
}

// ============================================
// 克隆
// ============================================

#[tokio::test]
async fn test_full_clone() {
    let sim = Simulator::standard();
    let outcome = build(&sim, config("full-1")).await;

    assert!(outcome.is_success(), "{:?}", outcome.failure());
    let artifacts = outcome.artifacts();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].name(), "full-1");
    assert_eq!(artifacts[0].builder_id(), BUILDER_ID);

    let vm = built_vm(&sim, &outcome).await;
    assert_eq!(chain_len(&vm).await, 1);
    assert_eq!(vm.name().await.unwrap(), "full-1");
    assert_eq!(sim.active_sessions(), 1);

    assert_eq!(outcome.report.final_stage, Stage::Done);
    assert!(outcome.report.passed);
    assert_eq!(
        outcome.report.step(Stage::Snapshotting).map(|s| s.status),
        Some(StepStatus::Skipped)
    );
    assert_eq!(outcome.report.artifact.as_ref(), Some(&artifacts[0]));
}

#[tokio::test]
async fn test_linked_clone_shares_parent_disks() {
    let sim = Simulator::standard();
    let outcome = build(
        &sim,
        BuilderConfig {
            linked_clone: true,
            ..config("linked-1")
        },
    )
    .await;

    let vm = built_vm(&sim, &outcome).await;
    assert_eq!(chain_len(&vm).await, 2);
    assert!(!sim.invocations().contains(&"CreateSnapshot_Task".to_string()));
}

#[tokio::test]
async fn test_linked_clone_creates_base_snapshot() {
    let sim = Simulator::standard();
    let outcome = build(
        &sim,
        BuilderConfig {
            template: "ubuntu-host4".to_string(),
            host: "esxi-4".to_string(),
            datastore: "datastore4a".to_string(),
            linked_clone: true,
            ..config("linked-2")
        },
    )
    .await;

    let vm = built_vm(&sim, &outcome).await;
    assert!(chain_len(&vm).await >= 2);

    let source = connect(&sim)
        .await
        .inventory("")
        .await
        .unwrap()
        .find_vm("ubuntu-host4")
        .await
        .unwrap();
    let info = source.info(&[VmProperty::Snapshot]).await.unwrap();
    let snapshot = info.snapshot.unwrap();
    assert!(snapshot
        .root_snapshot_list
        .iter()
        .any(|s| s.name == LINKED_CLONE_SNAPSHOT));
}

#[tokio::test]
async fn test_snapshot_after_full_clone() {
    let sim = Simulator::standard();
    let outcome = build(
        &sim,
        BuilderConfig {
            create_snapshot: true,
            ..config("snap-1")
        },
    )
    .await;

    let vm = built_vm(&sim, &outcome).await;
    assert_eq!(chain_len(&vm).await, 2);
    assert!(vm.current_snapshot().await.unwrap().is_some());
    assert_eq!(
        outcome.report.step(Stage::Snapshotting).map(|s| s.status),
        Some(StepStatus::Success)
    );
}

#[tokio::test]
async fn test_linked_clone_with_snapshot() {
    let sim = Simulator::standard();
    let outcome = build(
        &sim,
        BuilderConfig {
            linked_clone: true,
            create_snapshot: true,
            ..config("snap-2")
        },
    )
    .await;

    let vm = built_vm(&sim, &outcome).await;
    assert_eq!(chain_len(&vm).await, 3);
}

// ============================================
// 放置位置
// ============================================

#[tokio::test]
async fn test_folder_and_pool_paths() {
    let sim = Simulator::standard();
    let outcome = build(
        &sim,
        BuilderConfig {
            folder: "folder1/folder2".to_string(),
            resource_pool: "pool1/pool2".to_string(),
            ..config("placed-1")
        },
    )
    .await;

    let vm = built_vm(&sim, &outcome).await;
    let driver = vm.driver().clone();
    let info = vm
        .info(&[VmProperty::Parent, VmProperty::ResourcePool])
        .await
        .unwrap();

    let folder = driver.folder(info.parent.unwrap());
    assert_eq!(folder.path().await.unwrap(), "folder1/folder2");

    let pool = driver.resource_pool(info.resource_pool.unwrap());
    assert_eq!(pool.path().await.unwrap(), "pool1/pool2");
}

#[tokio::test]
async fn test_existing_folder_is_reused() {
    let sim = Simulator::standard();
    build(
        &sim,
        BuilderConfig {
            folder: "builds".to_string(),
            ..config("reuse-1")
        },
    )
    .await
    .into_result()
    .unwrap();
    build(
        &sim,
        BuilderConfig {
            folder: "builds".to_string(),
            ..config("reuse-2")
        },
    )
    .await
    .into_result()
    .unwrap();

    let creates = sim
        .invocations()
        .iter()
        .filter(|m| *m == "CreateFolder")
        .count();
    assert_eq!(creates, 1);
}

#[tokio::test]
async fn test_host_with_several_datastores_fails_before_clone() {
    let sim = Simulator::standard();
    let before = sim.vm_count();

    let outcome = build(
        &sim,
        BuilderConfig {
            host: "esxi-4".to_string(),
            ..config("ambiguous-1")
        },
    )
    .await;

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.stage, Stage::Cloning);
    assert!(matches!(
        failure.error,
        BuildError::Clone(CloneError::AmbiguousDatastore { count: 2, .. })
    ));
    assert!(matches!(failure.cleanup, Cleanup::NotNeeded));
    assert_eq!(sim.vm_count(), before);
    assert!(!sim.invocations().contains(&"CloneVM_Task".to_string()));
    assert!(outcome.artifacts().is_empty());
}

#[tokio::test]
async fn test_clone_spanning_datastores_is_removed() {
    let sim = Simulator::standard();
    let outcome = build(
        &sim,
        BuilderConfig {
            host: "esxi-2".to_string(),
            datastore: "datastore2".to_string(),
            linked_clone: true,
            ..config("spans-1")
        },
    )
    .await;

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.stage, Stage::Cloning);
    assert!(matches!(
        failure.error,
        BuildError::Clone(CloneError::SpansDatastores { count: 2, .. })
    ));
    let Cleanup::Destroyed(vm) = &failure.cleanup else {
        panic!("unexpected cleanup: {:?}", failure.cleanup);
    };
    assert!(!sim.exists(vm));
    assert!(sim.vms_named("spans-1").is_empty());
    assert!(outcome.artifacts().is_empty());
}

#[tokio::test]
async fn test_clone_spanning_datastores_reports_failed_removal() {
    let sim = Simulator::standard();
    sim.fail_next("Destroy_Task", "datastore is read-only");

    let outcome = build(
        &sim,
        BuilderConfig {
            host: "esxi-2".to_string(),
            datastore: "datastore2".to_string(),
            linked_clone: true,
            ..config("spans-2")
        },
    )
    .await;

    let failure = outcome.failure().unwrap();
    assert!(matches!(
        failure.error,
        BuildError::Clone(CloneError::SpansDatastores { count: 2, .. })
    ));
    let Cleanup::Failed { vm, error } = &failure.cleanup else {
        panic!("unexpected cleanup: {:?}", failure.cleanup);
    };
    assert!(error.to_string().contains("datastore is read-only"));
    assert!(sim.exists(vm));
    assert_eq!(sim.vms_named("spans-2"), vec![vm.clone()]);
    assert!(outcome.artifacts().is_empty());
}

#[tokio::test]
async fn test_failed_clone_task_needs_no_cleanup() {
    let sim = Simulator::standard();
    sim.fail_next("CloneVM_Task", "insufficient disk space");

    let outcome = build(&sim, config("noclone-1")).await;

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.stage, Stage::Cloning);
    assert!(matches!(
        failure.error,
        BuildError::Clone(CloneError::Driver(DriverError::Task { .. }))
    ));
    assert!(failure.to_string().contains("insufficient disk space"));
    assert!(matches!(failure.cleanup, Cleanup::NotNeeded));
    assert!(sim.vms_named("noclone-1").is_empty());
    assert!(outcome.artifacts().is_empty());
    assert!(!sim.invocations().contains(&"Destroy_Task".to_string()));
}

#[tokio::test]
async fn test_placement_without_host_follows_source() {
    let sim = Simulator::standard();
    let outcome = build(
        &sim,
        BuilderConfig {
            host: String::new(),
            resource_pool: "pool1".to_string(),
            ..config("nohost-1")
        },
    )
    .await;

    assert!(outcome.is_success(), "{:?}", outcome.failure());
    let vm = built_vm(&sim, &outcome).await;
    let driver = vm.driver().clone();
    let info = vm
        .info(&[VmProperty::RuntimeHost, VmProperty::ResourcePool])
        .await
        .unwrap();
    assert_eq!(
        driver.host(info.host.unwrap()).name().await.unwrap(),
        "esxi-1"
    );
    let pool = driver.resource_pool(info.resource_pool.unwrap());
    assert_eq!(pool.path().await.unwrap(), "pool1");
}

// ============================================
// 硬件与模板
// ============================================

#[tokio::test]
async fn test_hardware_values_applied() {
    let sim = Simulator::standard();
    let outcome = build(
        &sim,
        BuilderConfig {
            cpus: Some(2),
            cpu_reservation: Some(1000),
            cpu_limit: Some(1500),
            ram: Some(2048),
            ram_reservation: Some(1024),
            ..config("hw-1")
        },
    )
    .await;

    let vm = built_vm(&sim, &outcome).await;
    let config = vm.info(&[VmProperty::Config]).await.unwrap().config.unwrap();
    assert_eq!(config.hardware.num_cpu, 2);
    assert_eq!(config.hardware.memory_mb, 2048);
    assert_eq!(config.cpu_allocation.reservation, Some(1000));
    assert_eq!(config.cpu_allocation.limit, Some(1500));
    assert_eq!(config.memory_allocation.reservation, Some(1024));
}

#[tokio::test]
async fn test_reserve_all_memory() {
    let sim = Simulator::standard();
    let outcome = build(
        &sim,
        BuilderConfig {
            ram: Some(4096),
            ram_reserve_all: true,
            ..config("hw-2")
        },
    )
    .await;

    let vm = built_vm(&sim, &outcome).await;
    let config = vm.info(&[VmProperty::Config]).await.unwrap().config.unwrap();
    assert!(config.memory_reservation_locked_to_max);
}

#[tokio::test]
async fn test_convert_to_template() {
    let sim = Simulator::standard();
    let outcome = build(
        &sim,
        BuilderConfig {
            convert_to_template: true,
            ..config("tpl-1")
        },
    )
    .await;

    let vm = built_vm(&sim, &outcome).await;
    assert!(vm.is_template().await.unwrap());
    let err = vm.power_on().await.err().unwrap();
    assert!(matches!(err, DriverError::InvalidState(_)));
}

// ============================================
// 失败与清理
// ============================================

#[tokio::test]
async fn test_hardware_failure_removes_vm() {
    let sim = Simulator::standard();
    sim.fail_next("ReconfigVM_Task", "insufficient resources");

    let outcome = build(
        &sim,
        BuilderConfig {
            cpus: Some(64),
            ..config("broken-1")
        },
    )
    .await;

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.stage, Stage::ConfiguringHardware);
    assert!(matches!(failure.error, BuildError::Configuration(_)));
    assert!(failure.to_string().contains("insufficient resources"));

    let Cleanup::Destroyed(vm) = &failure.cleanup else {
        panic!("unexpected cleanup: {:?}", failure.cleanup);
    };
    assert!(!sim.exists(vm));
    assert!(sim.vms_named("broken-1").is_empty());
    assert!(outcome.artifacts().is_empty());

    assert_eq!(outcome.report.final_stage, Stage::Failed);
    assert!(!outcome.report.passed);
    assert!(outcome.report.step(Stage::Snapshotting).is_none());
    assert_eq!(sim.active_sessions(), 0);
}

#[tokio::test]
async fn test_cleanup_failure_keeps_original_error() {
    let sim = Simulator::standard();
    sim.fail_next("ReconfigVM_Task", "insufficient resources");
    sim.fail_next("Destroy_Task", "datastore is read-only");

    let outcome = build(
        &sim,
        BuilderConfig {
            cpus: Some(64),
            ..config("stuck-1")
        },
    )
    .await;

    let failure = outcome.failure().unwrap();
    assert!(matches!(failure.error, BuildError::Configuration(_)));
    assert!(failure.error.to_string().contains("insufficient resources"));
    assert!(!failure.cleanup.is_clean());
    let Cleanup::Failed { vm, error } = &failure.cleanup else {
        panic!("unexpected cleanup: {:?}", failure.cleanup);
    };
    assert!(error.to_string().contains("datastore is read-only"));
    assert!(sim.exists(vm));
}

#[tokio::test]
async fn test_missing_source_vm() {
    let sim = Simulator::standard();
    let outcome = build(
        &sim,
        BuilderConfig {
            template: "missing".to_string(),
            ..config("orphan-1")
        },
    )
    .await;

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.stage, Stage::Resolving);
    assert!(matches!(failure.error, BuildError::Resolution(_)));
    assert!(matches!(failure.cleanup, Cleanup::NotNeeded));
    assert_eq!(
        outcome.report.step(Stage::Connecting).map(|s| s.status),
        Some(StepStatus::Success)
    );
}

#[tokio::test]
async fn test_bad_credentials() {
    let sim = Simulator::standard();
    let outcome = build(
        &sim,
        BuilderConfig {
            password: "wrong".to_string(),
            ..config("denied-1")
        },
    )
    .await;

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.stage, Stage::Connecting);
    assert!(matches!(failure.error, BuildError::Connection(_)));
    assert_eq!(outcome.report.steps_executed, 1);
}

#[test]
fn test_invalid_config_rejected() {
    let err = Builder::new(BuilderConfig::default()).err().unwrap();
    assert!(matches!(err, ConfigError::Missing(_)));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_triggers_cleanup() {
    let sim = Simulator::standard();
    sim.hang_next("ReconfigVM_Task");

    let outcome = build(
        &sim,
        BuilderConfig {
            cpus: Some(4),
            task_timeout: 30,
            poll_interval_ms: 1000,
            ..config("slow-1")
        },
    )
    .await;

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.stage, Stage::ConfiguringHardware);
    assert!(failure.error.is_timeout());
    assert!(matches!(failure.cleanup, Cleanup::Destroyed(_)));
    assert!(sim.vms_named("slow-1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_triggers_cleanup() {
    let sim = Simulator::standard();
    sim.hang_next("CreateSnapshot_Task");

    let token = CancellationToken::new();
    let builder = Builder::new(BuilderConfig {
        create_snapshot: true,
        task_timeout: 600,
        poll_interval_ms: 1000,
        ..config("cancel-1")
    })
    .unwrap()
    .with_connector(Arc::new(sim.clone()))
    .with_cancellation(token.clone());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();
    });

    let outcome = builder.run().await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.stage, Stage::Snapshotting);
    assert!(failure.error.is_cancelled());
    assert!(matches!(failure.cleanup, Cleanup::Destroyed(_)));
    assert!(sim.vms_named("cancel-1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_clone_finishing_after_cancel_is_removed() {
    let sim = Simulator::standard();
    sim.uncancelable_next("CloneVM_Task");

    let token = CancellationToken::new();
    let builder = Builder::new(BuilderConfig {
        poll_interval_ms: 1000,
        ..config("late-1")
    })
    .unwrap()
    .with_connector(Arc::new(sim.clone()))
    .with_cancellation(token.clone());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        token.cancel();
    });

    let outcome = builder.run().await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.stage, Stage::Cloning);
    assert!(failure.error.is_cancelled());
    let Cleanup::Destroyed(vm) = &failure.cleanup else {
        panic!("unexpected cleanup: {:?}", failure.cleanup);
    };
    assert!(!sim.exists(vm));
    assert!(sim.vms_named("late-1").is_empty());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let sim = Simulator::standard();
    let builder = Builder::new(config("early-1"))
        .unwrap()
        .with_connector(Arc::new(sim.clone()));
    builder.cancellation_token().cancel();

    let outcome = builder.run().await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.stage, Stage::Connecting);
    assert!(failure.error.is_cancelled());
    assert!(matches!(failure.cleanup, Cleanup::NotNeeded));
    assert_eq!(sim.active_sessions(), 0);
}

// ============================================
// 并发
// ============================================

#[tokio::test]
async fn test_concurrent_builds_with_own_sessions() {
    let sim = Simulator::standard();
    let (first, second) = tokio::join!(
        build(&sim, config("para-1")),
        build(
            &sim,
            BuilderConfig {
                linked_clone: true,
                ..config("para-2")
            }
        )
    );

    assert!(first.is_success(), "{:?}", first.failure());
    assert!(second.is_success(), "{:?}", second.failure());
    assert_ne!(first.artifacts()[0].id(), second.artifacts()[0].id());
    assert_eq!(sim.active_sessions(), 0);
}

#[tokio::test]
async fn test_concurrent_builds_keep_shared_session() {
    let sim = Simulator::standard();
    let driver = connect(&sim).await;
    let shared = Arc::new(SharedConnector::new(driver.clone()));

    let first = Builder::new(config("shared-1"))
        .unwrap()
        .with_connector(shared.clone());
    let second = Builder::new(BuilderConfig {
        create_snapshot: true,
        ..config("shared-2")
    })
    .unwrap()
    .with_connector(shared);

    let (a, b) = tokio::join!(first.run(), second.run());
    assert!(a.is_success(), "{:?}", a.failure());
    assert!(b.is_success(), "{:?}", b.failure());
    assert_eq!(sim.active_sessions(), 1);

    let inventory = driver.inventory("").await.unwrap();
    inventory.find_vm("shared-1").await.unwrap();
    inventory.find_vm("shared-2").await.unwrap();

    driver.logout().await.unwrap();
    assert_eq!(sim.active_sessions(), 0);
}

// ============================================
// 客户机
// ============================================

#[tokio::test]
async fn test_guest_hook_receives_ip() {
    let sim = Simulator::standard();
    let hook = Arc::new(RecordingHook::default());

    let outcome = Builder::new(BuilderConfig {
        ssh_username: "root".to_string(),
        ssh_password: "secret".to_string(),
        convert_to_template: true,
        ..config("guest-1")
    })
    .unwrap()
    .with_connector(Arc::new(sim.clone()))
    .with_guest_hook(hook.clone())
    .run()
    .await;

    assert!(outcome.is_success(), "{:?}", outcome.failure());
    let calls = hook.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].ip.starts_with("10.0.0."));
    assert_eq!(calls[0].username, "root");
    assert_eq!(calls[0].password, "secret");

    let vm = built_vm(&sim, &outcome).await;
    assert_eq!(&calls[0].vm, vm.reference());
    assert!(vm.is_template().await.unwrap());
    assert_eq!(
        outcome.report.step(Stage::AwaitingGuest).map(|s| s.status),
        Some(StepStatus::Success)
    );
}

#[tokio::test]
async fn test_guest_hook_failure_removes_running_vm() {
    let sim = Simulator::standard();
    let hook = Arc::new(RecordingHook {
        fail: true,
        ..Default::default()
    });

    let outcome = Builder::new(BuilderConfig {
        ssh_username: "root".to_string(),
        ..config("guest-2")
    })
    .unwrap()
    .with_connector(Arc::new(sim.clone()))
    .with_guest_hook(hook)
    .run()
    .await;

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.stage, Stage::AwaitingGuest);
    assert!(matches!(failure.error, BuildError::GuestHook(_)));
    assert!(failure.to_string().contains("provisioner exited"));
    assert!(matches!(failure.cleanup, Cleanup::Destroyed(_)));
    assert!(sim.vms_named("guest-2").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_guest_ip_timeout() {
    let sim = Simulator::standard();
    sim.set_guest_tools(false);

    let outcome = build(
        &sim,
        BuilderConfig {
            ssh_username: "root".to_string(),
            ip_wait_timeout: 120,
            poll_interval_ms: 1000,
            ..config("noip-1")
        },
    )
    .await;

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.stage, Stage::AwaitingGuest);
    assert!(failure.error.is_timeout());
    assert!(matches!(failure.cleanup, Cleanup::Destroyed(_)));
}

// ============================================
// 产物
// ============================================

#[tokio::test]
async fn test_artifact_destroy() {
    let sim = Simulator::standard();
    let outcome = build(&sim, config("gone-1")).await;
    let artifact = outcome.into_result().unwrap();

    let driver = connect(&sim).await;
    let vm = driver.vm(artifact.id().clone());
    vm.power_on()
        .await
        .unwrap()
        .wait(&WaitOptions::new(Duration::from_secs(60)).with_poll_interval(Duration::from_millis(10)))
        .await
        .unwrap();
    assert_eq!(vm.power_state().await.unwrap(), PowerState::PoweredOn);

    artifact
        .destroy(&driver, &WaitOptions::new(Duration::from_secs(60)))
        .await
        .unwrap();
    assert!(!sim.exists(artifact.id()));
    assert_eq!(artifact.id().kind, ObjectType::VirtualMachine);
}
