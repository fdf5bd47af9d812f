mod common;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::FakeClient;
use mochi_sync_core::config::{DeckConfig, SynchroniseConfig};
use mochi_sync_core::contract::{Template, TemplateField};
use mochi_sync_core::convert::ParserKind;
use mochi_sync_core::lock::Lock;
use mochi_sync_core::operation::Attachment;
use mochi_sync_core::synchronise::{synchronise, SyncError};
use tempfile::tempdir;
use tokio::sync::watch;

fn write(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn notes_tree(root: &Path) {
    write(root, "top.md", b"# not part of any deck");
    write(root, "spanish/greetings.md", b"# Hola\n\n![wave](img/wave.png)\n");
    write(root, "spanish/img/wave.png", b"\x89PNG fake");
    write(root, "spanish/verbs/ser.md", b"to be");
    write(root, "topics/physics.md", b"## Force\nF = ma\n## Energy\nE = mc^2\n");
}

fn config(root: &Path) -> SynchroniseConfig {
    SynchroniseConfig::new(root).with_deck(
        "/topics",
        DeckConfig {
            parser: Some(ParserKind::Headings),
            ..DeckConfig::default()
        },
    )
}

#[tokio::test]
async fn first_run_creates_everything_and_second_run_is_idle() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("notes");
    notes_tree(&root);
    let lock_path = dir.path().join("mochi-lock.json");
    let client = Arc::new(FakeClient::new());
    let lock = Arc::new(Lock::load(&lock_path).unwrap());
    let config = config(&root);

    let report = synchronise(&config, Arc::clone(&client), Arc::clone(&lock), None)
        .await
        .unwrap();

    assert_eq!(report.files, 4);
    assert_eq!(report.decks, 3);
    assert_eq!(report.skipped_files, vec!["/top.md"]);
    assert_eq!(report.tally.decks_created, 3);
    assert_eq!(report.tally.cards_created, 4);
    assert_eq!(report.tally.attachments_uploaded, 1);
    assert!(report.lock_written);
    assert!(lock_path.exists());

    let spanish = client.deck_by_name("Spanish").unwrap();
    let verbs = client.deck_by_name("Verbs").unwrap();
    assert_eq!(verbs.parent_id.as_deref(), Some(spanish.id.as_str()));
    let greetings = client.cards_in(&spanish.id);
    assert_eq!(greetings.len(), 1);
    assert!(greetings[0].content.contains("](@media/"));
    assert!(!greetings[0].content.contains("img/wave.png"));

    // Same lock in memory, and freshly loaded from disk.
    client.reset_counters();
    let again = synchronise(&config, Arc::clone(&client), Arc::clone(&lock), None)
        .await
        .unwrap();
    assert_eq!(again.tally.total(), 0);
    assert_eq!(client.writes(), 0);
    assert!(!again.lock_written);

    let reloaded = Arc::new(Lock::load(&lock_path).unwrap());
    let from_disk = synchronise(&config, Arc::clone(&client), reloaded, None)
        .await
        .unwrap();
    assert_eq!(from_disk.tally.total(), 0);
    assert!(!from_disk.lock_written);
}

#[tokio::test]
async fn edits_and_removals_are_applied_minimally() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("notes");
    notes_tree(&root);
    let client = Arc::new(FakeClient::new());
    let lock = Arc::new(Lock::new(dir.path().join("mochi-lock.json")));
    let config = config(&root);
    synchronise(&config, Arc::clone(&client), Arc::clone(&lock), None)
        .await
        .unwrap();

    write(&root, "topics/physics.md", b"## Force\nF = ma\n## Energy\nE = mc^2 (rest)\n");
    fs::remove_file(root.join("spanish/verbs/ser.md")).unwrap();
    write(&root, "spanish/img/wave.png", b"\x89PNG redrawn");

    let report = synchronise(&config, Arc::clone(&client), Arc::clone(&lock), None)
        .await
        .unwrap();
    assert_eq!(report.tally.cards_updated, 2, "energy text and greetings image");
    assert_eq!(report.tally.cards_deleted, 1);
    assert_eq!(report.tally.cards_created, 0);
    assert_eq!(report.tally.attachments_uploaded, 1);
    assert_eq!(report.tally.decks_created, 0);

    let verbs = client.deck_by_name("Verbs").unwrap();
    assert!(client.cards_in(&verbs.id).is_empty());
    assert!(lock.cards(&verbs.id).is_empty());
}

#[tokio::test]
async fn archive_mode_keeps_removed_cards_remotely() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("notes");
    write(&root, "a/keep.md", b"keep");
    write(&root, "a/drop.md", b"drop");
    let client = Arc::new(FakeClient::new());
    let lock = Arc::new(Lock::new(dir.path().join("mochi-lock.json")));
    let mut config = SynchroniseConfig::new(&root);
    config.archive_removed = true;
    synchronise(&config, Arc::clone(&client), Arc::clone(&lock), None)
        .await
        .unwrap();

    fs::remove_file(root.join("a/drop.md")).unwrap();
    let report = synchronise(&config, Arc::clone(&client), Arc::clone(&lock), None)
        .await
        .unwrap();
    assert_eq!(report.tally.cards_archived, 1);

    let deck = client.deck_by_name("A").unwrap();
    let cards = client.cards_in(&deck.id);
    assert_eq!(cards.len(), 2);
    assert_eq!(cards.iter().filter(|c| c.archived).count(), 1);

    // Already archived: nothing more to do.
    let report = synchronise(&config, Arc::clone(&client), Arc::clone(&lock), None)
        .await
        .unwrap();
    assert_eq!(report.tally.total(), 0);
}

#[tokio::test]
async fn stale_decks_are_deleted_when_enabled() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("notes");
    write(&root, "a/one.md", b"one");
    write(&root, "b/c/two.md", b"two");
    let client = Arc::new(FakeClient::new());
    let lock = Arc::new(Lock::new(dir.path().join("mochi-lock.json")));
    let mut config = SynchroniseConfig::new(&root);
    synchronise(&config, Arc::clone(&client), Arc::clone(&lock), None)
        .await
        .unwrap();

    fs::remove_dir_all(root.join("b")).unwrap();
    let report = synchronise(&config, Arc::clone(&client), Arc::clone(&lock), None)
        .await
        .unwrap();
    assert_eq!(report.tally.decks_deleted, 0, "off by default");
    assert!(client.deck_by_name("C").is_some());

    config.delete_stale_decks = true;
    let report = synchronise(&config, Arc::clone(&client), Arc::clone(&lock), None)
        .await
        .unwrap();
    assert_eq!(report.tally.decks_deleted, 2);
    assert!(client.deck_by_name("B").is_none());
    assert!(client.deck_by_name("C").is_none());
    assert!(client.deck_by_name("A").is_some());
    assert!(lock.get_deck("/b").is_none());
    assert!(lock.get_deck("/b/c").is_none());
}

fn vocabulary_template() -> Template {
    let field = |id: &str, name: &str, pos: &str| {
        (
            id.to_string(),
            TemplateField {
                id: id.to_string(),
                name: name.to_string(),
                pos: pos.to_string(),
            },
        )
    };
    Template {
        id: "tmpl-vocab".into(),
        name: "Vocabulary".into(),
        fields: BTreeMap::from([field("f1", "name", "a"), field("f2", "meaning", "b")]),
    }
}

#[tokio::test]
async fn templated_deck_round_trip() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("notes");
    write(&root, "es/words.md", b"- hola: hello\n- gato: cat\n");
    let client = Arc::new(FakeClient::new().with_templates(vec![vocabulary_template()]));
    let lock = Arc::new(Lock::new(dir.path().join("mochi-lock.json")));
    let config = SynchroniseConfig::new(&root).with_deck(
        "/es",
        DeckConfig {
            name: Some("Spanish".into()),
            parser: Some(ParserKind::Vocabulary),
            template: Some("Vocabulary".into()),
        },
    );

    let report = synchronise(&config, Arc::clone(&client), Arc::clone(&lock), None)
        .await
        .unwrap();
    assert_eq!(report.tally.cards_created, 2);
    let deck = client.deck_by_name("Spanish").unwrap();
    let cards = client.cards_in(&deck.id);
    assert!(cards.iter().all(|c| c.template_id.as_deref() == Some("tmpl-vocab")));
    assert!(cards.iter().any(|c| c.fields.get("f2").map(String::as_str) == Some("cat")));

    write(&root, "es/words.md", b"- hola: hi\n- gato: cat\n");
    let report = synchronise(&config, Arc::clone(&client), Arc::clone(&lock), None)
        .await
        .unwrap();
    assert_eq!(report.tally.cards_updated, 1);
    assert_eq!(report.tally.cards_created, 0);
    assert_eq!(report.tally.cards_deleted, 0);
}

#[tokio::test]
async fn unknown_template_fails_before_any_write() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("notes");
    write(&root, "es/words.md", b"- hola: hello\n");
    let client = Arc::new(FakeClient::new());
    let lock = Arc::new(Lock::new(dir.path().join("mochi-lock.json")));
    let config = SynchroniseConfig::new(&root).with_deck(
        "/es",
        DeckConfig {
            template: Some("Missing".into()),
            ..DeckConfig::default()
        },
    );

    let err = synchronise(&config, Arc::clone(&client), lock, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownTemplate { ref name, .. } if name == "Missing"));
    assert_eq!(client.writes(), 0);
}

#[tokio::test]
async fn cancellation_stops_before_writes() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("notes");
    write(&root, "a/one.md", b"one");
    let client = Arc::new(FakeClient::new());
    let lock = Arc::new(Lock::new(dir.path().join("mochi-lock.json")));
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    let err = synchronise(&SynchroniseConfig::new(&root), Arc::clone(&client), lock, Some(rx))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));
    assert_eq!(client.writes(), 0);
}

#[tokio::test]
async fn deleted_remote_deck_is_recreated() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("notes");
    write(&root, "a/one.md", b"one");
    let client = Arc::new(FakeClient::new());
    let lock = Arc::new(Lock::new(dir.path().join("mochi-lock.json")));
    let config = SynchroniseConfig::new(&root);
    synchronise(&config, Arc::clone(&client), Arc::clone(&lock), None)
        .await
        .unwrap();

    // Deleted behind our back: the lock entry is pruned and the deck recreated.
    let old = client.deck_by_name("A").unwrap();
    client.state.lock().unwrap().decks.remove(&old.id);

    let report = synchronise(&config, Arc::clone(&client), Arc::clone(&lock), None)
        .await
        .unwrap();
    assert_eq!(report.tally.decks_created, 1);
    assert_eq!(report.tally.cards_created, 1);
    let (new_id, _) = lock.get_deck("/a").unwrap();
    assert_ne!(new_id, old.id);
}

#[tokio::test]
async fn attachments_stay_inside_the_root_and_upload_once_per_content() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("notes");
    write(dir.path(), "secret.png", b"outside the notes");
    write(&root, "a/img/one.png", b"same bytes");
    write(&root, "a/img/two.png", b"same bytes");
    write(&root, "shared/pic.png", b"shared picture");
    let absolute = dir.path().join("secret.png");
    let note = format!(
        "![s]({})\n![t](../../secret.png)\n![1](img/one.png)\n![2](img/two.png)\n![p](../shared/pic.png)\n",
        absolute.display()
    );
    write(&root, "a/n.md", note.as_bytes());

    let client = Arc::new(FakeClient::new());
    let lock = Arc::new(Lock::new(dir.path().join("mochi-lock.json")));
    let config = SynchroniseConfig::new(&root);

    let report = synchronise(&config, Arc::clone(&client), Arc::clone(&lock), None)
        .await
        .unwrap();
    assert_eq!(report.tally.cards_created, 1);
    assert_eq!(report.tally.attachments_uploaded, 2);

    let same = Attachment::new("img/one.png", b"same bytes".to_vec()).name;
    let shared = Attachment::new("shared/pic.png", b"shared picture".to_vec()).name;
    let secret = Attachment::new("secret.png", b"outside the notes".to_vec()).name;
    {
        let state = client.state.lock().unwrap();
        let mut uploaded: Vec<&str> = state.attachments.iter().map(|(_, name)| name.as_str()).collect();
        uploaded.sort_unstable();
        let mut expected = vec![same.as_str(), shared.as_str()];
        expected.sort_unstable();
        assert_eq!(uploaded, expected);
        assert!(!uploaded.contains(&secret.as_str()));

        let card = state.cards.values().next().expect("card created");
        assert!(card.content.contains(&format!("![1](@media/{same})")));
        assert!(card.content.contains(&format!("![2](@media/{same})")));
        assert!(card.content.contains(&format!("![p](@media/{shared})")));
        assert!(card.content.contains("![t](../../secret.png)"));
    }

    client.reset_counters();
    let again = synchronise(&config, Arc::clone(&client), Arc::clone(&lock), None)
        .await
        .unwrap();
    assert_eq!(again.tally.total(), 0);
    assert_eq!(client.writes(), 0);
}
