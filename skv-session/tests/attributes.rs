mod support;

use support::{store, FakeBackend};

#[test]
fn set_get_and_username_lookup() {
    let backend = FakeBackend::start();
    let instance = backend.descriptor();
    let store = store();
    let session_id = store.create_session(&instance, "user-42").expect("create");
    let id = session_id.as_str();

    store
        .set_session_attribute(&instance, id, "username", "ada")
        .expect("set");
    store
        .set_session_attribute(&instance, id, "theme", "dark")
        .expect("set");

    assert_eq!(
        store.get_session_attribute(&instance, id, "theme").expect("get").as_deref(),
        Some("dark")
    );
    assert_eq!(store.get_username(&instance, id).expect("username").as_deref(), Some("ada"));
    assert_eq!(store.get_session_attribute(&instance, id, "missing").expect("get"), None);

    let key = format!("session:{id}:theme");
    assert_eq!(backend.ttl_of(&key), Some(1800));
}

#[test]
fn attributes_expire_with_ttl() {
    let backend = FakeBackend::start();
    let instance = backend.descriptor();
    let store = store();

    store
        .set_session_attribute(&instance, "s1", "username", "ada")
        .expect("set");
    backend.advance(1800);
    assert_eq!(store.get_username(&instance, "s1").expect("username"), None);
}

#[test]
fn bulk_delete_pages_through_every_attribute() {
    let backend = FakeBackend::start();
    let instance = backend.descriptor();
    let store = store();

    let session_id = store.create_session(&instance, "user-42").expect("create");
    let id = session_id.as_str();
    for n in 0..250 {
        store
            .set_session_attribute(&instance, id, &format!("attr-{n:03}"), "v")
            .expect("set");
    }
    store
        .set_session_attribute(&instance, "other", "username", "grace")
        .expect("set other");

    let removed = store.delete_session_attributes(&instance, id).expect("delete");
    assert_eq!(removed, 250);

    // Only the session key itself and the other session's attribute remain.
    assert_eq!(backend.len(), 2);
    assert!(backend.contains(&format!("session:{id}")));
    assert!(backend.contains("session:other:username"));

    let commands = backend.commands();
    let scans: Vec<&Vec<String>> = commands.iter().filter(|args| args[0] == "SCAN").collect();
    assert!(scans.len() >= 3, "expected several SCAN pages, got {}", scans.len());
    for scan in &scans {
        assert_eq!(scan[2], "MATCH");
        assert_eq!(scan[3], format!("session:{id}:*"));
        assert_eq!(scan[5], "100");
    }
    assert_eq!(scans[0][1], "0");
    assert!(scans[1..].iter().all(|scan| scan[1] != "0"));
    assert!(commands
        .iter()
        .filter(|args| args[0] == "DEL")
        .all(|args| args[1..].iter().all(|key| !key.contains('*'))));
}

#[test]
fn bulk_delete_of_session_without_attributes_is_zero() {
    let backend = FakeBackend::start();
    let store = store();
    assert_eq!(
        store
            .delete_session_attributes(&backend.descriptor(), "empty")
            .expect("delete"),
        0
    );
    assert_eq!(backend.command_count("DEL"), 0);
}

#[test]
fn glob_characters_in_session_id_are_literal() {
    let backend = FakeBackend::start();
    let instance = backend.descriptor();
    let store = store();

    store.set_session_attribute(&instance, "a*", "k", "v").expect("set");
    store.set_session_attribute(&instance, "ab", "k", "v").expect("set");
    store.set_session_attribute(&instance, "a?c", "k", "v").expect("set");
    store.set_session_attribute(&instance, "abc", "k", "v").expect("set");

    assert_eq!(store.delete_session_attributes(&instance, "a*").expect("delete"), 1);
    assert_eq!(store.delete_session_attributes(&instance, "a?c").expect("delete"), 1);

    assert!(!backend.contains("session:a*:k"));
    assert!(!backend.contains("session:a?c:k"));
    assert!(backend.contains("session:ab:k"));
    assert!(backend.contains("session:abc:k"));
}
