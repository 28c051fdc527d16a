//! 清单路径解析测试

use std::sync::Arc;

use vsb_driver::simulator::Simulator;
use vsb_driver::*;

async fn connect(sim: &Simulator) -> Driver {
    let config = ConnectConfig::new(Simulator::ENDPOINT, "root", "jetbrains");
    Driver::with_backend(Arc::new(sim.session()), &config)
        .await
        .unwrap()
}

async fn inventory(sim: &Simulator) -> Inventory {
    connect(sim).await.inventory("").await.unwrap()
}

fn create_calls(sim: &Simulator, method: &str) -> usize {
    sim.invocations().iter().filter(|m| *m == method).count()
}

#[tokio::test]
async fn test_connect_rejects_bad_password() {
    let sim = Simulator::standard();
    let config = ConnectConfig::new(Simulator::ENDPOINT, "root", "wrong");
    let err = Driver::with_backend(Arc::new(sim.session()), &config)
        .await
        .err()
        .unwrap();

    assert!(matches!(
        err,
        DriverError::Connection {
            source: ConnectionFailure::AuthenticationRejected(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_connect_unreachable() {
    let sim = Simulator::standard();
    sim.set_reachable(false);
    let config = ConnectConfig::new(Simulator::ENDPOINT, "root", "jetbrains");
    let err = Driver::with_backend(Arc::new(sim.session()), &config)
        .await
        .err()
        .unwrap();

    assert!(matches!(
        err,
        DriverError::Connection {
            source: ConnectionFailure::Unreachable(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_logout_releases_session() {
    let sim = Simulator::standard();
    let driver = connect(&sim).await;
    assert_eq!(sim.active_sessions(), 1);

    driver.logout().await.unwrap();
    assert_eq!(sim.active_sessions(), 0);
    assert!(driver.inventory("").await.is_err());
}

#[tokio::test]
async fn test_datacenter_resolution() {
    let sim = Simulator::standard();
    let driver = connect(&sim).await;

    let inventory = driver.inventory("").await.unwrap();
    assert_eq!(inventory.datacenter().name(), "dc1");
    assert!(driver.inventory("dc1").await.is_ok());

    sim.add_datacenter("dc2");
    let err = driver.inventory("").await.err().unwrap();
    assert!(matches!(
        err,
        DriverError::Resolution(ResolutionError::Ambiguous { count: 2, .. })
    ));
    assert!(driver.inventory("dc2").await.is_ok());
}

#[tokio::test]
async fn test_resolve_folder_creates_missing_segments() {
    let sim = Simulator::standard();
    let inventory = inventory(&sim).await;

    let folder = inventory.resolve_folder("folder1/folder2").await.unwrap();
    assert_eq!(folder.path().await.unwrap(), "folder1/folder2");
    assert_eq!(folder.name().await.unwrap(), "folder2");
    assert_eq!(create_calls(&sim, "CreateFolder"), 2);

    // 再次解析不会重复创建
    let again = inventory.resolve_folder("/folder1//folder2/").await.unwrap();
    assert_eq!(again.reference(), folder.reference());
    assert_eq!(create_calls(&sim, "CreateFolder"), 2);
}

#[tokio::test]
async fn test_resolve_folder_root() {
    let sim = Simulator::standard();
    let inventory = inventory(&sim).await;

    let root = inventory.resolve_folder("").await.unwrap();
    assert_eq!(root.reference(), inventory.vm_folder().reference());
    assert_eq!(root.path().await.unwrap(), "");
}

#[tokio::test]
async fn test_resolve_folder_survives_creation_race() {
    let sim = Simulator::standard();
    let inventory = inventory(&sim).await;

    sim.race_next_create("folder1");
    let folder = inventory.resolve_folder("folder1/folder2").await.unwrap();
    assert_eq!(folder.path().await.unwrap(), "folder1/folder2");

    let siblings: Vec<_> = inventory
        .vm_folder()
        .children()
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.name == "folder1")
        .collect();
    assert_eq!(siblings.len(), 1);
}

#[tokio::test]
async fn test_find_folder_does_not_create() {
    let sim = Simulator::standard();
    let inventory = inventory(&sim).await;

    let err = inventory.find_folder("missing").await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::Resolution(ResolutionError::NotFound { kind: ObjectType::Folder, .. })
    ));
    assert_eq!(create_calls(&sim, "CreateFolder"), 0);
}

#[tokio::test]
async fn test_resolve_resource_pool() {
    let sim = Simulator::standard();
    let inventory = inventory(&sim).await;
    let host = inventory.resolve_host("esxi-1").await.unwrap();

    let root = inventory.resolve_resource_pool(Some(&host), "").await.unwrap();
    assert_eq!(root.path().await.unwrap(), "");

    let pool = inventory
        .resolve_resource_pool(Some(&host), "pool1/pool2")
        .await
        .unwrap();
    assert_eq!(pool.path().await.unwrap(), "pool1/pool2");
    assert_eq!(create_calls(&sim, "CreateResourcePool"), 2);

    let again = inventory
        .resolve_resource_pool(Some(&host), "pool1/pool2")
        .await
        .unwrap();
    assert_eq!(again.reference(), pool.reference());
    assert_eq!(create_calls(&sim, "CreateResourcePool"), 2);
}

#[tokio::test]
async fn test_resolve_resource_pool_race() {
    let sim = Simulator::standard();
    let inventory = inventory(&sim).await;
    let host = inventory.resolve_host("esxi-2").await.unwrap();

    sim.race_next_create("pool1");
    let pool = inventory
        .resolve_resource_pool(Some(&host), "pool1")
        .await
        .unwrap();
    assert_eq!(pool.path().await.unwrap(), "pool1");

    let root = inventory.resolve_resource_pool(Some(&host), "").await.unwrap();
    let children = root.children().await.unwrap();
    assert_eq!(children.iter().filter(|c| c.name == "pool1").count(), 1);
}

#[tokio::test]
async fn test_resolve_resource_pool_without_host() {
    let sim = Simulator::standard();
    let inventory = inventory(&sim).await;

    let err = inventory.resolve_resource_pool(None, "").await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::Resolution(ResolutionError::Ambiguous {
            kind: ObjectType::ComputeResource,
            count: 3,
            ..
        })
    ));
    assert_eq!(create_calls(&sim, "CreateResourcePool"), 0);

    let single = Simulator::new("root", "jetbrains");
    let dc = single.add_datacenter("dc1");
    single.add_host(&dc, "esxi-1", &["datastore1"]);
    let inventory = connect(&single).await.inventory("").await.unwrap();
    let host = inventory.resolve_host("").await.unwrap();

    let implicit = inventory.resolve_resource_pool(None, "").await.unwrap();
    let explicit = inventory.resolve_resource_pool(Some(&host), "").await.unwrap();
    assert_eq!(implicit.reference(), explicit.reference());
}

#[tokio::test]
async fn test_resolve_host() {
    let sim = Simulator::standard();
    let inventory = inventory(&sim).await;

    let by_name = inventory.resolve_host("esxi-1").await.unwrap();
    let by_path = inventory.resolve_host("esxi-1/esxi-1").await.unwrap();
    assert_eq!(by_name.reference(), by_path.reference());
    assert_eq!(by_name.name().await.unwrap(), "esxi-1");

    let err = inventory.resolve_host("").await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::Resolution(ResolutionError::Ambiguous { count: 3, .. })
    ));

    let err = inventory.resolve_host("esxi-9").await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::Resolution(ResolutionError::NotFound { kind: ObjectType::HostSystem, .. })
    ));
}

#[tokio::test]
async fn test_resolve_datastore() {
    let sim = Simulator::standard();
    let inventory = inventory(&sim).await;

    let explicit = inventory.resolve_datastore("datastore4b", None).await.unwrap();
    assert_eq!(explicit.name().await.unwrap(), "datastore4b");

    let esxi1 = inventory.resolve_host("esxi-1").await.unwrap();
    let hinted = inventory.resolve_datastore("", Some(&esxi1)).await.unwrap();
    assert_eq!(hinted.name().await.unwrap(), "datastore1");

    let esxi4 = inventory.resolve_host("esxi-4").await.unwrap();
    let err = inventory.resolve_datastore("", Some(&esxi4)).await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::Resolution(ResolutionError::Ambiguous { kind: ObjectType::Datastore, count: 2, .. })
    ));
}

#[tokio::test]
async fn test_resolve_network() {
    let sim = Simulator::standard();
    let inventory = inventory(&sim).await;

    let network = inventory.resolve_network("VM Network").await.unwrap();
    assert_eq!(network.name().await.unwrap(), "VM Network");
    assert!(inventory.resolve_network("missing").await.is_err());
}

#[tokio::test]
async fn test_find_vm() {
    let sim = Simulator::standard();
    let inventory = inventory(&sim).await;

    let basic = inventory.find_vm("basic").await.unwrap();
    assert_eq!(basic.name().await.unwrap(), "basic");

    // 同名虚拟机放进子文件夹后，按名称查找产生歧义，按路径查找仍唯一
    let folder = inventory.resolve_folder("folder1").await.unwrap();
    let dc = inventory.datacenter().reference().clone();
    let esxi1 = inventory.resolve_host("esxi-1").await.unwrap();
    let datastore1 = sim.datastore(&dc, "datastore1");
    sim.add_vm(folder.reference(), "basic", esxi1.reference(), &datastore1);

    let err = inventory.find_vm("basic").await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::Resolution(ResolutionError::Ambiguous { count: 2, .. })
    ));

    let nested = inventory.find_vm("folder1/basic").await.unwrap();
    assert_ne!(nested.reference(), basic.reference());
}
