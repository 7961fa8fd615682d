use super::*;
use serde::Deserialize;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Draft {
    text: String,
}

#[test]
fn memory_store_get_set_remove() {
    let store = MemoryStore::new();
    assert_eq!(store.get("k").unwrap(), None);
    store.set("k", "v1").unwrap();
    store.set("k", "v2").unwrap();
    assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));
    store.remove("k").unwrap();
    store.remove("k").unwrap();
    assert_eq!(store.get("k").unwrap(), None);
}

#[test]
fn file_store_persists_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let first = FileStore::open(dir.path()).unwrap();
    first.set(FINGERPRINT_KEY, "abc123").unwrap();

    let second = FileStore::open(dir.path()).unwrap();
    assert_eq!(second.get(FINGERPRINT_KEY).unwrap().as_deref(), Some("abc123"));
    assert_eq!(second.get(SESSION_KEY).unwrap(), None);
}

#[test]
fn file_store_remove_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).unwrap();
    store.set(SESSION_KEY, "{}").unwrap();
    store.remove(SESSION_KEY).unwrap();
    store.remove(SESSION_KEY).unwrap();
    assert_eq!(store.get(SESSION_KEY).unwrap(), None);
}

#[test]
fn file_store_creates_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("a/b");
    let store = FileStore::open(&nested).unwrap();
    assert!(nested.is_dir());
    assert_eq!(store.dir(), nested.as_path());
}

#[test]
fn file_store_sanitizes_keys_into_the_directory() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).unwrap();
    store.set("../escape", "x").unwrap();
    assert_eq!(store.get("../escape").unwrap().as_deref(), Some("x"));
    assert!(!dir.path().parent().unwrap().join("escape.json").exists());
}

#[test]
fn json_helpers_round_trip_and_report_corruption() {
    let store = MemoryStore::new();
    assert_eq!(load_json::<Draft>(&store, "draft").unwrap(), None);

    save_json(&store, "draft", &Draft { text: "hello".to_owned() }).unwrap();
    assert_eq!(load_json::<Draft>(&store, "draft").unwrap(), Some(Draft { text: "hello".to_owned() }));

    store.set("draft", "not json").unwrap();
    assert!(matches!(load_json::<Draft>(&store, "draft"), Err(LoadError::Corrupt(_))));
}
