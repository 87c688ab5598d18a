use steward::backup::Page;
use steward::cluster::MemoryCluster;
use steward::error::ErrorKind;
use steward::test_utils::datastore::MemoryDatastore;
use steward::test_utils::node::spawn_test_node;
use steward_telemetry::tracing::init_test_tracing;

const ARTIFACTS: &[&str] = &[
    "backup-a-20230101-000000-000Z.zip",
    "backup-a-20230102-000000-000Z.zip",
    "backup-a-20221231-000000-000Z.zip",
];

#[tokio::test(flavor = "multi_thread")]
async fn backups_are_listed_newest_first() {
    init_test_tracing();

    let dir = tempfile::tempdir().unwrap();
    for name in ARTIFACTS {
        std::fs::write(dir.path().join(name), b"archive").unwrap();
    }
    let cluster = MemoryCluster::new();
    let test_node = spawn_test_node(&cluster, "node-1", dir.path(), MemoryDatastore::new());

    let page = test_node.node.find_all(Page::default()).await.unwrap();
    let names: Vec<&str> = page.items.iter().map(|record| record.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "backup-a-20230102-000000-000Z.zip",
            "backup-a-20230101-000000-000Z.zip",
            "backup-a-20221231-000000-000Z.zip",
        ]
    );

    let latest = test_node.node.get_latest().await.unwrap().unwrap();
    assert_eq!(latest.name, "backup-a-20230102-000000-000Z.zip");

    let found = test_node
        .node
        .find_by_name("backup-a-20221231-000000-000Z.zip")
        .await
        .unwrap();
    assert!(found.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_names_are_rejected_without_touching_files() {
    init_test_tracing();

    let root = tempfile::tempdir().unwrap();
    let backups = root.path().join("backups");
    std::fs::create_dir(&backups).unwrap();
    std::fs::write(root.path().join("secret.txt"), b"keep").unwrap();
    for name in ARTIFACTS {
        std::fs::write(backups.join(name), b"archive").unwrap();
    }
    let cluster = MemoryCluster::new();
    let test_node = spawn_test_node(&cluster, "node-1", &backups, MemoryDatastore::new());

    for name in ["../secret.txt", "backup-a-20230101-000000-000Z.zip/..", ""] {
        let err = test_node.node.delete(name).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidBackupName, "{name}");
    }
    assert!(root.path().join("secret.txt").exists());
    assert_eq!(
        test_node.node.find_all(Page::all()).await.unwrap().total,
        3
    );

    test_node
        .node
        .delete("backup-a-20230101-000000-000Z.zip")
        .await
        .unwrap();
    assert_eq!(
        test_node.node.find_all(Page::all()).await.unwrap().total,
        2
    );
}
