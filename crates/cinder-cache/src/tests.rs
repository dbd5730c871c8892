use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use cinder_core::{
    ActionTable, BundleItem, ExeKind, ItemSet, ItemState, PackageKind, PatchTrain, Payload,
    Predicate,
};
use cinder_security::sha256_hex;
use semver::Version;

use super::{CacheLayout, CacheManager, ElevationDelegate};

fn test_roots(name: &str) -> (PathBuf, PathBuf) {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let base = std::env::temp_dir().join(format!(
        "cinder-cache-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        name
    ));
    (base.join("machine"), base.join("user"))
}

fn payload_item(id: &str, contents: &[u8], cache_filename: &str) -> BundleItem {
    BundleItem {
        id: id.to_string(),
        display_name: id.to_string(),
        kind: PackageKind::Exe,
        exe_kind: ExeKind::Generic,
        version: Version::new(1, 0, 0),
        per_machine: false,
        durable_cache: true,
        rollback_eligible: true,
        ignorable: false,
        requested_absent: false,
        weight: 1,
        payload: Some(Payload {
            url: None,
            source_path: None,
            sha256: sha256_hex(contents),
            size: contents.len() as u64,
            cache_filename: cache_filename.to_string(),
        }),
        children: Vec::new(),
        applicability: Predicate::Always(true),
        presence: Predicate::Always(false),
        actions: ActionTable::default(),
        action_state: None,
        product_code: None,
        product_codes: Vec::new(),
        service_name: None,
        patch_train: PatchTrain::None,
        ldr_baseline: false,
        install_args: Vec::new(),
        state: ItemState::NotAvailable,
        current_path: None,
        verified: false,
        download_pending: false,
    }
}

fn manager_with(items: Vec<BundleItem>, name: &str) -> (CacheManager, PathBuf) {
    let (machine_root, user_root) = test_roots(name);
    let layout = CacheLayout::new(&machine_root, &user_root, "bundle-1");
    let manager = CacheManager::new(layout, ItemSet::new(items));
    let base = machine_root
        .parent()
        .expect("test root has parent")
        .to_path_buf();
    (manager, base)
}

fn stage_source(manager: &CacheManager, index: usize, base: &PathBuf, contents: &[u8]) -> PathBuf {
    let source_dir = base.join("downloads");
    fs::create_dir_all(&source_dir).expect("must create source dir");
    let item = manager.items().item(index).expect("item must exist");
    let payload = item.payload.expect("payload must exist");
    let source = source_dir.join(&payload.cache_filename);
    fs::write(&source, contents).expect("must write source payload");
    manager.items().set_current_path(index, Some(source.clone()));
    manager
        .items()
        .set_state(index, ItemState::AvailableUnverified);
    source
}

#[test]
fn cached_path_is_deterministic() {
    let layout = CacheLayout::new("/machine", "/user", "bundle-1");
    let payload = Payload {
        url: None,
        source_path: None,
        sha256: sha256_hex(b"x"),
        size: 1,
        cache_filename: "tool.exe".to_string(),
    };

    let first = layout.cached_path(&payload, true, true);
    let second = layout.cached_path(&payload, true, true);
    assert_eq!(first, second);
    assert_eq!(
        first,
        PathBuf::from("/machine/Apps/Cache/tool.exe")
    );

    assert_eq!(
        layout.cached_path(&payload, false, false),
        PathBuf::from("/user/Apps/Cache/temp/bundle-1/tool.exe")
    );
}

#[test]
fn is_cached_false_when_no_entry() {
    let (manager, base) = manager_with(vec![payload_item("a", b"bytes", "a.exe")], "no-entry");
    assert!(!manager.is_cached(0, None).expect("must check"));
    let _ = fs::remove_dir_all(&base);
}

#[test]
fn verify_and_cache_then_is_cached() {
    let (manager, base) = manager_with(vec![payload_item("a", b"bytes", "a.exe")], "cache-ok");
    let source = stage_source(&manager, 0, &base, b"bytes");

    manager
        .verify_and_cache_package(0, None)
        .expect("must cache");

    let cached = manager
        .items()
        .current_path(0)
        .expect("live path must be set");
    assert!(cached.ends_with("Apps/Cache/a.exe"));
    assert!(cached.is_file());
    // source was outside the temp subtree, so it was copied, not moved
    assert!(source.is_file());
    assert_eq!(manager.items().state(0), Some(ItemState::Available));

    assert!(manager.is_cached(0, None).expect("must check"));
    // second call with no intervening mutation is a pure no-op
    let before = manager.items().item(0).expect("item");
    assert!(manager.is_cached(0, None).expect("must check"));
    let after = manager.items().item(0).expect("item");
    assert_eq!(before.current_path, after.current_path);
    assert_eq!(before.state, after.state);

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn verify_and_cache_is_noop_when_already_cached() {
    let (manager, base) = manager_with(vec![payload_item("a", b"bytes", "a.exe")], "noop");
    stage_source(&manager, 0, &base, b"bytes");
    manager
        .verify_and_cache_package(0, None)
        .expect("must cache");

    // drop the source; a second call must succeed without it
    let downloads = base.join("downloads");
    let _ = fs::remove_dir_all(&downloads);
    manager
        .verify_and_cache_package(0, None)
        .expect("must be no-op success");

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn verify_and_cache_moves_temp_sources() {
    let (manager, base) = manager_with(vec![payload_item("a", b"bytes", "a.exe")], "temp-move");
    let temp_root = manager.layout().temp_root(false);
    fs::create_dir_all(&temp_root).expect("must create temp root");
    let source = temp_root.join("a.exe.download");
    fs::write(&source, b"bytes").expect("must write download");
    manager.items().set_current_path(0, Some(source.clone()));
    manager
        .items()
        .set_state(0, ItemState::AvailableUnverified);

    manager
        .verify_and_cache_package(0, None)
        .expect("must cache");

    assert!(!source.exists(), "temp source must be moved, not copied");
    assert!(manager
        .items()
        .current_path(0)
        .expect("live path")
        .is_file());

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn verify_and_cache_rejects_missing_source() {
    let (manager, base) = manager_with(vec![payload_item("a", b"bytes", "a.exe")], "missing");
    manager
        .items()
        .set_current_path(0, Some(base.join("downloads").join("a.exe")));

    let err = manager
        .verify_and_cache_package(0, None)
        .expect_err("missing source must fail");
    assert!(err.to_string().contains("not an existing absolute file"));

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn verify_and_cache_copies_children() {
    let mut item = payload_item("msi", b"parent-bytes", "suite.msi");
    item.children.push(Payload {
        url: None,
        source_path: None,
        sha256: sha256_hex(b"patch-bytes"),
        size: b"patch-bytes".len() as u64,
        cache_filename: "suite-hotfix.msp".to_string(),
    });
    let (manager, base) = manager_with(vec![item], "children");
    let source = stage_source(&manager, 0, &base, b"parent-bytes");
    fs::write(
        source.parent().expect("source dir").join("suite-hotfix.msp"),
        b"patch-bytes",
    )
    .expect("must write child payload");

    manager
        .verify_and_cache_package(0, None)
        .expect("must cache");

    let cache_dir = manager.layout().cache_dir(false, true);
    assert!(cache_dir.join("suite.msi").is_file());
    assert!(cache_dir.join("suite-hotfix.msp").is_file());

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn corrupt_cache_entry_is_deleted_and_live_path_restored() {
    let (manager, base) = manager_with(vec![payload_item("a", b"bytes", "a.exe")], "corrupt");
    let item = manager.items().item(0).expect("item");
    let payload = item.payload.expect("payload");
    let cache_path = manager.layout().cached_path(&payload, false, true);
    fs::create_dir_all(cache_path.parent().expect("cache dir")).expect("must create cache dir");
    fs::write(&cache_path, b"tampered").expect("must write stale entry");

    let original_live = base.join("downloads").join("original.exe");
    manager
        .items()
        .set_current_path(0, Some(original_live.clone()));

    assert!(!manager.is_cached(0, None).expect("must check"));
    assert!(!cache_path.exists(), "stale entry must be deleted");
    assert_eq!(
        manager.items().current_path(0),
        Some(original_live),
        "live path must be restored after a failed check"
    );

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn delete_cached_package_resets_item() {
    let (manager, base) = manager_with(vec![payload_item("a", b"bytes", "a.exe")], "delete");
    stage_source(&manager, 0, &base, b"bytes");
    manager
        .verify_and_cache_package(0, None)
        .expect("must cache");
    let cached = manager.items().current_path(0).expect("live path");
    assert!(cached.is_file());

    manager
        .delete_cached_package(0, None)
        .expect("must delete");
    assert!(!cached.exists());
    assert_eq!(manager.items().current_path(0), None);
    assert_eq!(manager.items().state(0), Some(ItemState::NotAvailable));

    // deleting again is fine
    manager
        .delete_cached_package(0, None)
        .expect("must be idempotent");

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn delete_temporary_cache_directories_removes_temp_subtree() {
    let (manager, base) = manager_with(vec![payload_item("a", b"bytes", "a.exe")], "temp-del");
    let temp_root = manager.layout().temp_root(false);
    fs::create_dir_all(&temp_root).expect("must create temp root");
    fs::write(temp_root.join("leftover.bin"), b"x").expect("must write leftover");

    manager
        .delete_temporary_cache_directories(None)
        .expect("must delete temp");
    assert!(!temp_root.exists());

    let _ = fs::remove_dir_all(&base);
}

#[derive(Default)]
struct RecordingDelegate {
    calls: Vec<String>,
}

impl ElevationDelegate for RecordingDelegate {
    fn is_cached(&mut self, index: usize) -> Result<bool> {
        self.calls.push(format!("is_cached:{index}"));
        Ok(true)
    }

    fn verify_and_cache_package(&mut self, index: usize) -> Result<()> {
        self.calls.push(format!("verify_and_cache:{index}"));
        Ok(())
    }

    fn delete_cached_package(&mut self, index: usize) -> Result<()> {
        self.calls.push(format!("delete:{index}"));
        Ok(())
    }

    fn delete_temporary_cache_directories(&mut self) -> Result<()> {
        self.calls.push("delete_temp".to_string());
        Ok(())
    }
}

#[test]
fn per_machine_items_are_delegated() {
    let mut item = payload_item("a", b"bytes", "a.exe");
    item.per_machine = true;
    let (manager, base) = manager_with(vec![item], "delegate");

    let mut delegate = RecordingDelegate::default();
    assert!(manager
        .is_cached(0, Some(&mut delegate))
        .expect("must delegate"));
    manager
        .verify_and_cache_package(0, Some(&mut delegate))
        .expect("must delegate");
    manager
        .delete_cached_package(0, Some(&mut delegate))
        .expect("must delegate");
    manager
        .delete_temporary_cache_directories(Some(&mut delegate))
        .expect("must delegate");

    assert_eq!(
        delegate.calls,
        vec![
            "is_cached:0",
            "verify_and_cache:0",
            "delete:0",
            "delete_temp"
        ]
    );

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn per_user_items_ignore_delegate() {
    let (manager, base) = manager_with(vec![payload_item("a", b"bytes", "a.exe")], "no-delegate");
    let mut delegate = RecordingDelegate::default();
    assert!(!manager
        .is_cached(0, Some(&mut delegate))
        .expect("must check locally"));
    assert!(delegate.calls.is_empty());

    let _ = fs::remove_dir_all(&base);
}
