//! End-to-end scenarios for tables on object-store disks
//!
//! Object counts are read straight from the in-memory bucket.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tierstore_client::{Connector, FlakyStore, MemoryStore, ObjectStore};
use tierstore_common::Config;
use tierstore_common::config::{CacheConfig, DiskConfig, PolicyConfig};
use tierstore_storage::{
    Block, ColumnDef, ColumnType, FixedFreeSpace, Predicate, Query, SkipIndexDef, Storage,
    TableSchema, TableSettings, Value,
};

const PREFIX: &str = "data/";
const FILES_OVERHEAD: usize = 1;
const FILES_OVERHEAD_PER_COLUMN: usize = 2;
const FILES_OVERHEAD_PER_PART_WIDE: usize = 15;
const FILES_OVERHEAD_PER_PART_COMPACT: usize = 11;

fn schema() -> TableSchema {
    TableSchema::new(
        vec![
            ColumnDef::new("dt", ColumnType::Date),
            ColumnDef::new("id", ColumnType::Int64),
            ColumnDef::new("data", ColumnType::String),
        ],
        &["dt", "id"],
    )
    .partition_by("dt")
    .skip_index(SkipIndexDef::minmax("min_max", "id", 3))
}

/// `n` rows with ids `start..start + n`
fn rows(date: &str, start: i64, n: i64) -> Block {
    let mut block = Block::new(&["dt", "id", "data"]);
    for id in start..start + n {
        block.push(vec![Value::from(date), Value::Int64(id), Value::String(format!("data{id}"))]);
    }
    block
}

struct Env {
    dir: TempDir,
    connector: Connector,
    bucket: Arc<MemoryStore>,
    config: Config,
}

impl Env {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let bucket = Arc::new(MemoryStore::new("bucket"));
        let connector = Connector::new();
        connector.register("memory://bucket", Arc::clone(&bucket) as Arc<dyn ObjectStore>);

        let mut config = Config::default();
        config.storage.metadata_path = dir.path().join("meta");
        config.storage.disks.push(DiskConfig::object_store(
            "s3",
            "memory://bucket",
            dir.path().join("s3_metadata"),
        ));
        config.storage.disks.push(DiskConfig::local("hdd", dir.path().join("hdd")));
        config.storage.policies.push(PolicyConfig::new("default", &["s3"]));
        config.storage.policies.push(PolicyConfig::new("tiered", &["s3", "hdd"]));
        config.merge_tree.old_parts_lifetime_secs = 0;
        config.merge_tree.orphan_dir_min_age_secs = 0;
        Self {
            dir,
            connector,
            bucket,
            config,
        }
    }

    async fn open(&self) -> Storage {
        Storage::open(&self.config, self.connector.clone()).await.unwrap()
    }

    fn objects(&self) -> usize {
        self.bucket.object_count(PREFIX)
    }
}

#[tokio::test]
async fn test_insert_and_merge_converge() {
    let env = Env::new();
    let storage = env.open().await;
    assert_eq!(env.objects(), 0);

    let table = storage
        .create_table("t", schema(), TableSettings::default())
        .await
        .unwrap();
    assert_eq!(env.objects(), FILES_OVERHEAD);

    table.insert(&rows("2020-01-03", 0, 4096)).await.unwrap();
    assert_eq!(env.objects(), FILES_OVERHEAD + FILES_OVERHEAD_PER_PART_WIDE);
    table.insert(&rows("2020-01-04", 0, 4096)).await.unwrap();
    assert_eq!(env.objects(), FILES_OVERHEAD + 2 * FILES_OVERHEAD_PER_PART_WIDE);
    table.insert(&rows("2020-01-03", 4096, 4096)).await.unwrap();
    assert_eq!(env.objects(), FILES_OVERHEAD + 3 * FILES_OVERHEAD_PER_PART_WIDE);

    let merged = table
        .optimize(Some(&Value::from("2020-01-03")), false)
        .await
        .unwrap();
    assert_eq!(merged, vec!["20200103_1_3_1"]);
    assert_eq!(table.parts().len(), 2);
    assert_eq!(env.objects(), FILES_OVERHEAD + 2 * FILES_OVERHEAD_PER_PART_WIDE);
    assert_eq!(table.count(), 3 * 4096);
    assert!(table.check().await.unwrap());
}

#[tokio::test]
async fn test_compact_part_file_count() {
    let env = Env::new();
    let storage = env.open().await;
    let table = storage
        .create_table(
            "t",
            schema(),
            TableSettings::default().min_rows_for_wide_part(10_000),
        )
        .await
        .unwrap();
    table.insert(&rows("2020-01-03", 0, 4096)).await.unwrap();
    assert_eq!(env.objects(), FILES_OVERHEAD + FILES_OVERHEAD_PER_PART_COMPACT);

    let selected = table
        .select(&Query::select(&["id"]).filter(Predicate::equals("id", 42i64)))
        .await
        .unwrap();
    assert_eq!(selected, vec![vec![Value::Int64(42)]]);
}

#[tokio::test]
async fn test_alter_column_counts() {
    let env = Env::new();
    let storage = env.open().await;
    let table = storage
        .create_table("t", schema(), TableSettings::default())
        .await
        .unwrap();
    table.insert(&rows("2020-01-03", -2047, 4096)).await.unwrap();
    let base = FILES_OVERHEAD + FILES_OVERHEAD_PER_PART_WIDE;

    table
        .add_column(ColumnDef::new("col1", ColumnType::UInt64).with_default(Value::UInt64(1)))
        .await
        .unwrap();
    assert_eq!(env.objects(), base);
    table.optimize(None, true).await.unwrap();
    assert_eq!(env.objects(), base + FILES_OVERHEAD_PER_COLUMN);
    assert_eq!(table.sum("col1", None).await.unwrap(), 4096);
    assert_eq!(
        table
            .sum("col1", Some(Predicate::greater_than("id", 0i64)))
            .await
            .unwrap(),
        2048
    );

    // A reader keeps the pre-mutation version alive
    let snapshot = table.parts();
    table.modify_column("col1", ColumnType::String).await.unwrap();
    assert_eq!(
        env.objects(),
        base + 2 * FILES_OVERHEAD_PER_COLUMN + 1
    );
    drop(snapshot);
    storage.reclaim_now().await;
    assert_eq!(env.objects(), base + FILES_OVERHEAD_PER_COLUMN + 1);
    let distinct = table.distinct("col1").await.unwrap();
    assert_eq!(distinct, BTreeSet::from([Value::from("1")]));

    table.drop_column("col1").await.unwrap();
    assert_eq!(env.objects(), base + 2);
    assert_eq!(table.mutations().await.unwrap().len(), 2);
    assert_eq!(table.sum("id", None).await.unwrap(), 2048);

    // Mutations survive a restart
    drop(table);
    drop(storage);
    let storage = env.open().await;
    let table = storage.table("t").unwrap();
    assert!(table.parts()[0].column("col1").is_none());
    assert_eq!(table.count(), 4096);
    assert!(table.check().await.unwrap());
}

#[tokio::test]
async fn test_attach_detach_keeps_objects() {
    let env = Env::new();
    let storage = env.open().await;
    let table = storage
        .create_table("t", schema(), TableSettings::default())
        .await
        .unwrap();
    table.insert(&rows("2020-01-03", 0, 4096)).await.unwrap();
    table.insert(&rows("2020-01-04", 0, 4096)).await.unwrap();
    let full = FILES_OVERHEAD + 2 * FILES_OVERHEAD_PER_PART_WIDE;
    let a = Value::from("2020-01-03");

    table.detach_partition(&a).await.unwrap();
    assert_eq!(env.objects(), full);
    assert_eq!(table.count(), 4096);
    table.attach_partition(&a).await.unwrap();
    assert_eq!(env.objects(), full);
    assert_eq!(table.count(), 2 * 4096);

    table.detach_partition(&a).await.unwrap();
    assert_eq!(table.drop_detached_partition(&a).await.unwrap(), 1);
    assert_eq!(env.objects(), FILES_OVERHEAD + FILES_OVERHEAD_PER_PART_WIDE);

    drop(table);
    storage.rename_table("t", "renamed").await.unwrap();
    assert_eq!(env.objects(), FILES_OVERHEAD + FILES_OVERHEAD_PER_PART_WIDE);
    storage.detach_table("renamed").await.unwrap();
    assert_eq!(env.objects(), FILES_OVERHEAD + FILES_OVERHEAD_PER_PART_WIDE);
    let table = storage.attach_table("renamed").await.unwrap();
    assert_eq!(table.count(), 4096);
    table.truncate().await.unwrap();
    assert_eq!(env.objects(), FILES_OVERHEAD);
}

#[tokio::test]
async fn test_move_partition_to_disk_and_back() {
    let env = Env::new();
    let storage = env.open().await;
    let table = storage
        .create_table("t", schema(), TableSettings::with_policy("tiered"))
        .await
        .unwrap();
    table.insert(&rows("2020-01-03", 0, 4096)).await.unwrap();
    table.insert(&rows("2020-01-04", 0, 4096)).await.unwrap();
    let sum = table.sum("id", None).await.unwrap();
    assert_eq!(env.objects(), FILES_OVERHEAD + 2 * FILES_OVERHEAD_PER_PART_WIDE);

    let a = Value::from("2020-01-03");
    assert_eq!(table.move_partition_to_disk(&a, "hdd").await.unwrap(), 1);
    assert_eq!(env.objects(), FILES_OVERHEAD + FILES_OVERHEAD_PER_PART_WIDE);
    assert!(table.parts().iter().any(|p| p.disk == "hdd"));
    assert_eq!(table.sum("id", None).await.unwrap(), sum);

    assert_eq!(table.move_partition_to_disk(&a, "s3").await.unwrap(), 1);
    assert_eq!(env.objects(), FILES_OVERHEAD + 2 * FILES_OVERHEAD_PER_PART_WIDE);
    assert!(table.parts().iter().all(|p| p.disk == "s3"));
    assert_eq!(table.sum("id", None).await.unwrap(), sum);
}

#[tokio::test]
async fn test_move_and_replace_between_tables() {
    let env = Env::new();
    let storage = env.open().await;
    let src = storage
        .create_table("src", schema(), TableSettings::default())
        .await
        .unwrap();
    for date in ["2020-01-03", "2020-01-04"] {
        src.insert(&rows(date, 0, 4096)).await.unwrap();
        src.insert(&rows(date, 4096, 4096)).await.unwrap();
    }
    let parts = 4 * FILES_OVERHEAD_PER_PART_WIDE;
    assert_eq!(env.objects(), FILES_OVERHEAD + parts);

    let dst = storage
        .create_table("dst", schema(), TableSettings::default())
        .await
        .unwrap();
    assert_eq!(env.objects(), 2 * FILES_OVERHEAD + parts);
    let a = Value::from("2020-01-03");
    let b = Value::from("2020-01-04");
    dst.insert(&rows("2020-01-03", 0, 10)).await.unwrap();
    dst.insert(&rows("2020-01-03", 10, 10)).await.unwrap();
    assert_eq!(
        env.objects(),
        2 * FILES_OVERHEAD + parts + 2 * FILES_OVERHEAD_PER_PART_WIDE
    );

    // Hard links share objects; the replaced parts go away
    assert_eq!(dst.replace_partition_from(&a, &src).await.unwrap(), 2);
    assert_eq!(env.objects(), 2 * FILES_OVERHEAD + parts);
    assert_eq!(dst.count(), 2 * 4096);

    assert_eq!(src.move_partition_to_table(&b, &dst).await.unwrap(), 2);
    assert_eq!(env.objects(), 2 * FILES_OVERHEAD + parts);
    assert_eq!(src.count(), 2 * 4096);
    assert_eq!(dst.count(), 4 * 4096);

    drop(src);
    storage.drop_table("src", true).await.unwrap();
    assert_eq!(env.objects(), FILES_OVERHEAD + parts);

    storage.freeze("dst", None, Some("backup")).await.unwrap();
    assert_eq!(env.objects(), FILES_OVERHEAD + parts);
    drop(dst);
    storage.drop_table("dst", true).await.unwrap();
    assert_eq!(env.objects(), parts);

    storage.system_unfreeze("backup").await.unwrap();
    storage.reclaim_now().await;
    assert_eq!(env.objects(), 0);
}

#[tokio::test]
async fn test_freeze_unfreeze_round_trip() {
    let env = Env::new();
    let storage = env.open().await;
    let table = storage
        .create_table("t", schema(), TableSettings::default())
        .await
        .unwrap();
    table.insert(&rows("2020-01-03", 0, 4096)).await.unwrap();
    table.insert(&rows("2020-01-04", 0, 4096)).await.unwrap();
    let baseline = env.objects();

    let frozen = storage.freeze("t", None, Some("first")).await.unwrap();
    assert_eq!(frozen.parts.len(), 2);
    assert_eq!(env.objects(), baseline);
    assert_eq!(storage.unfreeze("t", "first", None).await.unwrap(), 2);
    storage.reclaim_now().await;
    assert_eq!(env.objects(), baseline);

    // Frozen files outlive the table
    let unnamed = storage
        .freeze("t", Some(&Value::from("2020-01-04")), None)
        .await
        .unwrap();
    assert_eq!(unnamed.parts.len(), 1);
    drop(table);
    storage.drop_table("t", true).await.unwrap();
    assert_eq!(env.objects(), FILES_OVERHEAD_PER_PART_WIDE);

    storage.system_unfreeze(&unnamed.name).await.unwrap();
    storage.reclaim_now().await;
    assert_eq!(env.objects(), 0);
}

#[tokio::test]
async fn test_orphaned_store_directory_removed_on_startup() {
    let env = Env::new();
    let storage = env.open().await;
    let kept = storage
        .create_table("kept", schema(), TableSettings::default())
        .await
        .unwrap();
    kept.insert(&rows("2020-01-03", 0, 100)).await.unwrap();
    let lost = storage
        .create_table("lost", schema(), TableSettings::default())
        .await
        .unwrap();
    lost.insert(&rows("2020-01-03", 0, 100)).await.unwrap();
    let lost_uuid = lost.uuid();
    assert_eq!(
        env.objects(),
        2 * (FILES_OVERHEAD + FILES_OVERHEAD_PER_PART_WIDE)
    );
    drop((kept, lost));
    drop(storage);

    // Metadata removed behind the engine's back
    std::fs::remove_file(env.config.storage.metadata_path.join("metadata/lost.json")).unwrap();

    let storage = env.open().await;
    assert_eq!(storage.tables(), vec!["kept"]);
    assert_eq!(env.objects(), FILES_OVERHEAD + FILES_OVERHEAD_PER_PART_WIDE);
    assert_eq!(storage.table("kept").unwrap().count(), 100);
    assert_eq!(storage.sweep_store_orphans().await.unwrap(), 0);

    let reused = storage
        .create_table_with_uuid("lost", schema(), TableSettings::default(), lost_uuid)
        .await
        .unwrap();
    assert_eq!(reused.count(), 0);
    assert_eq!(
        env.objects(),
        2 * FILES_OVERHEAD + FILES_OVERHEAD_PER_PART_WIDE
    );
}

#[tokio::test]
async fn test_multipart_upload_triples_write_requests() {
    let mut env = Env::new();
    let multipart = Arc::new(MemoryStore::new("multipart"));
    env.connector
        .register("memory://multipart", Arc::clone(&multipart) as Arc<dyn ObjectStore>);
    let mut disk = DiskConfig::object_store("s3_mp", "memory://multipart", env.dir.path().join("mp_metadata"));
    disk.upload_threshold = 0;
    env.config.storage.disks.push(disk);
    env.config.storage.policies.push(PolicyConfig::new("multipart", &["s3_mp"]));
    let storage = env.open().await;

    let single = storage
        .create_table("single", schema(), TableSettings::default())
        .await
        .unwrap();
    let multi = storage
        .create_table("multi", schema(), TableSettings::with_policy("multipart"))
        .await
        .unwrap();
    let block = rows("2020-01-03", 0, 4096);
    single.insert(&block).await.unwrap();
    multi.insert(&block).await.unwrap();

    let single_writes = env.bucket.stats().write_requests();
    assert!(single_writes > 0);
    assert_eq!(multipart.stats().write_requests(), 3 * single_writes);
    assert_eq!(multipart.open_uploads(), 0);
    assert_eq!(multi.sum("id", None).await.unwrap(), single.sum("id", None).await.unwrap());
}

#[tokio::test]
async fn test_reads_survive_flaky_store() {
    let mut env = Env::new();
    let flaky = Arc::new(FlakyStore::new(MemoryStore::new("flaky")).fail_every_nth_get(2));
    env.connector
        .register("memory://flaky", Arc::clone(&flaky) as Arc<dyn ObjectStore>);
    let mut disk = DiskConfig::object_store("flaky", "memory://flaky", env.dir.path().join("flaky_metadata"));
    disk.retry.initial_backoff_ms = 1;
    disk.retry.max_backoff_ms = 5;
    env.config.storage.disks.push(disk);
    env.config.storage.policies.push(PolicyConfig::new("flaky", &["flaky"]));
    let storage = env.open().await;

    let table = storage
        .create_table("t", schema(), TableSettings::with_policy("flaky"))
        .await
        .unwrap();
    table.insert(&rows("2020-01-03", 1, 1000)).await.unwrap();
    for _ in 0..5 {
        assert_eq!(table.sum("id", None).await.unwrap(), 500_500);
    }
    assert!(flaky.injected_failures() > 0);
}

#[tokio::test]
async fn test_filtered_read_fetches_fewer_bytes() {
    let env = Env::new();
    let storage = env.open().await;
    let table = storage
        .create_table("t", schema(), TableSettings::default().index_granularity(64))
        .await
        .unwrap();
    table.insert(&rows("2020-01-03", 0, 4096)).await.unwrap();

    let stats = env.bucket.stats();
    stats.reset();
    let all = table.select(&Query::select(&["data"])).await.unwrap();
    assert_eq!(all.len(), 4096);
    let full_scan = stats.bytes_read();

    stats.reset();
    let some = table
        .select(&Query::select(&["data"]).filter(Predicate::between("id", 100i64, 110i64)))
        .await
        .unwrap();
    assert_eq!(some.len(), 11);
    assert!(stats.bytes_read() < full_scan / 4);
}

fn with_cache(env: &mut Env, pin: bool) {
    let mut cache = CacheConfig::new("s3_cache", env.dir.path().join("cache"));
    cache.pin_index_and_mark_files = pin;
    env.config.storage.caches = vec![cache];
    env.config.storage.disks[0].cache = Some("s3_cache".to_string());
}

#[tokio::test]
async fn test_insufficient_cache_space_skips_insert() {
    let mut env = Env::new();
    with_cache(&mut env, false);
    let storage = Storage::open_with_free_space(
        &env.config,
        env.connector.clone(),
        Arc::new(FixedFreeSpace::new(0)),
    )
    .await
    .unwrap();
    let table = storage
        .create_table("t", schema(), TableSettings::default())
        .await
        .unwrap();
    table.insert(&rows("2020-01-03", 1, 100)).await.unwrap();

    assert_eq!(table.sum("id", None).await.unwrap(), 5050);
    let cache = storage.registry().cache("s3_cache").unwrap();
    assert!(cache.stats().skipped_inserts.load(Ordering::Relaxed) > 0);
    assert_eq!(storage.describe_cache("s3_cache").unwrap().entries, 0);
}

#[tokio::test]
async fn test_cache_pinning_across_reload_and_restart() {
    let mut env = Env::new();
    with_cache(&mut env, true);
    let storage = env.open().await;
    let table = storage
        .create_table("t", schema(), TableSettings::default())
        .await
        .unwrap();
    table.insert(&rows("2020-01-03", 1, 100)).await.unwrap();
    assert_eq!(table.sum("id", None).await.unwrap(), 5050);
    let before = storage.describe_cache("s3_cache").unwrap();
    assert!(before.pinned_size > 0);
    assert!(before.current_size > before.pinned_size);

    // Turning pinning off only affects new admissions
    let mut config = env.config.clone();
    config.storage.caches[0].pin_index_and_mark_files = false;
    storage.reload_config(&config).unwrap();
    let reloaded = storage.describe_cache("s3_cache").unwrap();
    assert!(!reloaded.pin_index_and_mark_files);
    assert_eq!(reloaded.pinned_size, before.pinned_size);

    drop(table);
    drop(storage);
    let storage = env.open().await;
    let after = storage.describe_cache("s3_cache").unwrap();
    assert!(after.pinned_size >= before.pinned_size);
    assert!(after.entries >= before.entries);
    assert_eq!(storage.table("t").unwrap().sum("id", None).await.unwrap(), 5050);

    storage.drop_cache(None).unwrap();
    let dropped = storage.describe_cache("s3_cache").unwrap();
    assert_eq!(dropped.entries, 0);
    assert_eq!(dropped.pinned_size, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reads_consistent_while_disk_restarts() {
    let env = Env::new();
    let storage = Arc::new(env.open().await);
    let table = storage
        .create_table("t", schema(), TableSettings::default().index_granularity(256))
        .await
        .unwrap();
    table.insert(&rows("2020-01-03", 1, 4096)).await.unwrap();
    table.insert(&rows("2020-01-04", 1, 4096)).await.unwrap();
    let expected = 2 * 4096 * 4097 / 2;

    let done = Arc::new(AtomicBool::new(false));
    let restarter = {
        let storage = Arc::clone(&storage);
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            loop {
                storage.restart_disk("s3").unwrap();
                if done.load(Ordering::Relaxed) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                for _ in 0..25 {
                    assert_eq!(table.sum("id", None).await.unwrap(), expected);
                }
            })
        })
        .collect();
    for reader in readers {
        reader.await.unwrap();
    }
    done.store(true, Ordering::Relaxed);
    restarter.await.unwrap();
    assert!(storage.registry().generation("s3").unwrap() > 0);
}
