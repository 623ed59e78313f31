mod common;

use common::*;
use filetime::FileTime;
use sessile::{DriverKind, DriverRegistry, Session, SessionDriver};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn session_file(dir: &TempDir, id: &str) -> PathBuf {
    dir.path().join(format!("test_sess{id}"))
}

fn backdate(path: &PathBuf, secs: u64) {
    let then = SystemTime::now() - Duration::from_secs(secs);
    filetime::set_file_mtime(path, FileTime::from_system_time(then)).unwrap();
}

#[tokio::test]
async fn read_of_unknown_session_is_empty() {
    let dir = TempDir::new().unwrap();
    let mut driver = files_driver(&dir, false).await;
    let id = sessile::id::generate();

    let data = driver.read(&no_ctx(), &id).await.unwrap();
    assert!(data.is_empty());
    driver.close().await.unwrap();

    // Still empty from a fresh instance.
    let mut driver = files_driver(&dir, false).await;
    assert!(driver.read(&no_ctx(), &id).await.unwrap().is_empty());
    driver.close().await.unwrap();
}

#[tokio::test]
async fn write_then_read_round_trips() {
    let dir = TempDir::new().unwrap();
    let id = sessile::id::generate();
    let payload = b"user=42;theme=dark;cart=3".as_slice();

    let mut a = files_driver(&dir, false).await;
    assert!(a.read(&no_ctx(), &id).await.unwrap().is_empty());
    a.write(&no_ctx(), &id, payload).await.unwrap();
    a.close().await.unwrap();

    let mut b = files_driver(&dir, false).await;
    assert_eq!(b.read(&no_ctx(), &id).await.unwrap(), payload);
    b.close().await.unwrap();
}

#[tokio::test]
async fn repeated_write_same_payload_touches_only() {
    let dir = TempDir::new().unwrap();
    let id = sessile::id::generate();
    let payload = b"flash=welcome".as_slice();

    let mut driver = files_driver(&dir, false).await;
    driver.read(&no_ctx(), &id).await.unwrap();
    driver.write(&no_ctx(), &id, payload).await.unwrap();

    let path = session_file(&dir, &id);
    backdate(&path, 900);
    let stale = fs::metadata(&path).unwrap().modified().unwrap();

    // Identical payload: content untouched, mtime refreshed.
    driver.write(&no_ctx(), &id, payload).await.unwrap();
    driver.close().await.unwrap();

    assert_eq!(fs::read(&path).unwrap(), payload);
    assert!(fs::metadata(&path).unwrap().modified().unwrap() > stale);
}

#[tokio::test]
async fn changed_payload_is_rewritten() {
    let dir = TempDir::new().unwrap();
    let id = sessile::id::generate();

    let mut driver = files_driver(&dir, false).await;
    driver.read(&no_ctx(), &id).await.unwrap();
    driver
        .write(&no_ctx(), &id, b"first version, long enough to shrink")
        .await
        .unwrap();
    driver.write(&no_ctx(), &id, b"second").await.unwrap();
    driver.close().await.unwrap();

    assert_eq!(fs::read(session_file(&dir, &id)).unwrap(), b"second");
}

#[tokio::test]
async fn destroy_removes_only_target() {
    let dir = TempDir::new().unwrap();
    let keep = sessile::id::generate();
    let drop_ = sessile::id::generate();

    let mut driver = files_driver(&dir, false).await;
    driver.read(&no_ctx(), &keep).await.unwrap();
    driver.write(&no_ctx(), &keep, b"keep me").await.unwrap();
    driver.close().await.unwrap();
    driver.read(&no_ctx(), &drop_).await.unwrap();
    driver.write(&no_ctx(), &drop_, b"drop me").await.unwrap();
    driver.destroy(&no_ctx(), &drop_).await.unwrap();

    assert!(driver.read(&no_ctx(), &drop_).await.unwrap().is_empty());
    driver.close().await.unwrap();
    assert_eq!(driver.read(&no_ctx(), &keep).await.unwrap(), b"keep me");
    driver.close().await.unwrap();
}

#[tokio::test]
async fn destroying_missing_session_is_ok() {
    let dir = TempDir::new().unwrap();
    let mut driver = files_driver(&dir, false).await;
    driver
        .destroy(&no_ctx(), &sessile::id::generate())
        .await
        .unwrap();
}

#[tokio::test]
async fn close_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mut driver = files_driver(&dir, false).await;
    let id = sessile::id::generate();
    driver.read(&no_ctx(), &id).await.unwrap();

    driver.close().await.unwrap();
    driver.close().await.unwrap();
    driver.close().await.unwrap();
}

#[tokio::test]
async fn gc_removes_only_expired() {
    let dir = TempDir::new().unwrap();
    let mut driver = files_driver(&dir, false).await;

    let ids: Vec<String> = (0..3).map(|_| sessile::id::generate()).collect();
    for (id, age) in ids.iter().zip([10u64, 100, 1000]) {
        driver.read(&no_ctx(), id).await.unwrap();
        driver.write(&no_ctx(), id, b"state").await.unwrap();
        driver.close().await.unwrap();
        backdate(&session_file(&dir, id), age);
    }

    let removed = driver.gc(500).await.unwrap();
    assert_eq!(removed, 1);

    assert!(session_file(&dir, &ids[0]).exists());
    assert!(session_file(&dir, &ids[1]).exists());
    assert!(!session_file(&dir, &ids[2]).exists());
}

#[tokio::test]
async fn gc_never_touches_foreign_files() {
    let dir = TempDir::new().unwrap();
    let mut driver = files_driver(&dir, false).await;

    // Wrong prefix, wrong length, wrong alphabet.
    let foreign = [
        dir.path().join("app.lock"),
        dir.path().join("test_sessdeadbeef"),
        dir.path().join(format!("test_sess{}", "Z".repeat(sessile::id::ID_LEN))),
    ];
    for path in &foreign {
        fs::write(path, b"not a session").unwrap();
        backdate(path, 10_000);
    }

    let removed = driver.gc(500).await.unwrap();
    assert_eq!(removed, 0);
    for path in &foreign {
        assert!(path.exists(), "{} was swept", path.display());
    }
}

#[tokio::test]
async fn id_regeneration_moves_lock_and_record() {
    let dir = TempDir::new().unwrap();
    let id_a = sessile::id::generate();
    let id_b = sessile::id::generate();

    let mut driver = files_driver(&dir, false).await;
    driver.read(&no_ctx(), &id_a).await.unwrap();
    driver.write(&no_ctx(), &id_b, b"migrated").await.unwrap();
    driver.close().await.unwrap();

    assert_eq!(fs::read(session_file(&dir, &id_b)).unwrap(), b"migrated");

    // Nothing was ever persisted under the old id.
    let mut fresh = files_driver(&dir, false).await;
    assert!(fresh.read(&no_ctx(), &id_a).await.unwrap().is_empty());
    fresh.close().await.unwrap();
}

#[tokio::test]
async fn ip_binding_separates_clients() {
    let dir = TempDir::new().unwrap();
    let id = sessile::id::generate();
    let from_x = ctx("203.0.113.5");
    let from_y = ctx("198.51.100.7");

    let mut driver = files_driver(&dir, true).await;
    driver.read(&from_x, &id).await.unwrap();
    driver.write(&from_x, &id, b"belongs to x").await.unwrap();
    driver.close().await.unwrap();

    let mut other = files_driver(&dir, true).await;
    assert!(other.read(&from_y, &id).await.unwrap().is_empty());
    other.close().await.unwrap();
    assert_eq!(other.read(&from_x, &id).await.unwrap(), b"belongs to x");
    other.close().await.unwrap();

    // The bound file name embeds a fixed-width address hash.
    let expected_len = "test_sess".len() + 32 + sessile::id::ID_LEN;
    let bound_files: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .filter(|name| name.len() == expected_len)
        .collect();
    assert!(!bound_files.is_empty());
}

#[tokio::test]
async fn ip_binding_requires_an_address() {
    let dir = TempDir::new().unwrap();
    let mut driver = files_driver(&dir, true).await;
    let id = sessile::id::generate();

    assert!(driver.write(&no_ctx(), &id, b"state").await.is_err());
}

#[tokio::test]
async fn facade_round_trips_and_degrades() {
    let dir = TempDir::new().unwrap();
    let config = files_config(&dir, false);
    let registry = DriverRegistry::new();
    let driver = registry.build(DriverKind::Files, &config).unwrap();

    let mut session = Session::new(driver, config);
    session.open().await.unwrap();

    let id = sessile::id::generate();
    assert!(session.get(&id).await.is_empty());
    assert!(session.set(&id, b"facade state").await);
    assert!(session.close().await);

    assert_eq!(session.get(&id).await, b"facade state");
    assert!(session.destroy(&id).await);
    assert!(session.get(&id).await.is_empty());
    assert!(session.close().await);

    // Malformed ids never reach the driver.
    assert!(session.get("../../etc/passwd").await.is_empty());
    assert!(!session.set("not-hex", b"x").await);
    assert!(!session.destroy("UPPER").await);
}

#[tokio::test]
async fn facade_sweep_uses_configured_lifetime() {
    let dir = TempDir::new().unwrap();
    let config = files_config(&dir, false); // lifetime: 60s
    let registry = DriverRegistry::new();
    let driver = registry.build(DriverKind::Files, &config).unwrap();

    let mut session = Session::new(driver, config);
    session.open().await.unwrap();

    let id = sessile::id::generate();
    session.set(&id, b"stale").await;
    session.close().await;
    backdate(&session_file(&dir, &id), 900);

    assert_eq!(session.sweep().await, 1);
    assert!(session.get(&id).await.is_empty());
    session.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_read_blocks_until_close() {
    let dir = TempDir::new().unwrap();
    let id = sessile::id::generate();

    let mut a = files_driver(&dir, false).await;
    a.read(&no_ctx(), &id).await.unwrap();
    a.write(&no_ctx(), &id, b"first holder").await.unwrap();

    let mut b = files_driver(&dir, false).await;
    let contender_id = id.clone();
    let contender = tokio::spawn(async move {
        let data = b.read(&no_ctx(), &contender_id).await.unwrap();
        (b, data)
    });

    // The second reader must sit on the lock while the first holds it.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!contender.is_finished());

    a.close().await.unwrap();

    let (mut b, data) = contender.await.unwrap();
    assert_eq!(data, b"first holder");
    b.close().await.unwrap();
}
