//! Blueprint store behaviour against local bare repositories.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use orch_blueprints::{BlueprintStore, RetryPolicy, StoreError};
use orch_connector::MockConnector;
use orch_connector::git::git_available;
use orch_core::config::StoreConfig;
use orch_core::{CommitIdentity, Tag};
use tempfile::TempDir;
use uuid::Uuid;

struct Fixture {
    _root: TempDir,
    store: Arc<BlueprintStore>,
}

fn fixture() -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        workdir: Some(root.path().join("work")),
        ..StoreConfig::default()
    };
    let connector = Arc::new(MockConnector::new(
        root.path().join("repos"),
        CommitIdentity::default(),
        "main",
    ));
    let store = BlueprintStore::new(connector, &config).with_retry(RetryPolicy {
        timeout: Duration::from_secs(60),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(100),
    });
    Fixture {
        _root: root,
        store: Arc::new(store),
    }
}

fn write_blueprint(dir: &Path, marker: &str) {
    std::fs::create_dir_all(dir.join("playbooks")).unwrap();
    std::fs::write(
        dir.join("service.yaml"),
        format!("tosca_definitions_version: tosca_simple_yaml_1_3\n# {marker}\n"),
    )
    .unwrap();
    std::fs::write(dir.join("playbooks/create.yml"), "- hosts: all\n").unwrap();
}

/// Relative path -> contents for every file under `dir`.
fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1) {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(dir).unwrap();
            files.insert(
                rel.to_string_lossy().into_owned(),
                std::fs::read(entry.path()).unwrap(),
            );
        }
    }
    files
}

macro_rules! require_git {
    () => {
        if !git_available().await {
            eprintln!("git not found, skipping");
            return;
        }
    };
}

#[tokio::test]
async fn save_then_fetch_round_trips_content() {
    require_git!();
    let fx = fixture();
    let src = tempfile::tempdir().unwrap();
    write_blueprint(src.path(), "first");

    let id = Uuid::new_v4();
    let saved = fx.store.save(id, src.path(), None, None).await.unwrap();
    assert_eq!(saved.tag, Tag::new(1, 0));
    assert_eq!(saved.commit_sha.len(), 40);

    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("checkout");
    let fetched = fx.store.fetch(id, Some(saved.tag), &dest).await.unwrap();

    assert_eq!(fetched, saved.tag);
    assert_eq!(snapshot(&dest), snapshot(src.path()));
    assert!(!dest.join(".git").exists());
}

#[tokio::test]
async fn tags_advance_by_major_then_minor() {
    require_git!();
    let fx = fixture();
    let src = tempfile::tempdir().unwrap();
    let id = Uuid::new_v4();

    write_blueprint(src.path(), "one");
    let first = fx.store.save(id, src.path(), None, None).await.unwrap();
    write_blueprint(src.path(), "two");
    let second = fx.store.save(id, src.path(), None, None).await.unwrap();
    write_blueprint(src.path(), "three");
    let third = fx
        .store
        .save(id, src.path(), Some("patch"), Some(Tag::new(2, 0)))
        .await
        .unwrap();

    assert_eq!(first.tag.encode(), "v1.0");
    assert_eq!(second.tag.encode(), "v2.0");
    assert_eq!(third.tag.encode(), "v2.1");

    assert_eq!(
        fx.store.list_tags(id).await.unwrap(),
        vec![Tag::new(1, 0), Tag::new(2, 0), Tag::new(2, 1)]
    );
    assert_eq!(fx.store.last_tag(id).await.unwrap(), Some(Tag::new(2, 1)));
    assert_eq!(fx.store.commits(id).await.unwrap().len(), 3);

    let versions = fx.store.versions(id).await.unwrap();
    assert_eq!(versions[0].message.as_deref(), Some("v1.0"));
    assert_eq!(versions[2].message.as_deref(), Some("patch"));
}

#[tokio::test]
async fn fetch_latest_and_old_revisions() {
    require_git!();
    let fx = fixture();
    let src = tempfile::tempdir().unwrap();
    let id = Uuid::new_v4();

    write_blueprint(src.path(), "old");
    let old = fx.store.save(id, src.path(), None, None).await.unwrap();
    write_blueprint(src.path(), "new");
    std::fs::remove_file(src.path().join("playbooks/create.yml")).unwrap();
    fx.store.save(id, src.path(), None, None).await.unwrap();

    let out = tempfile::tempdir().unwrap();
    let latest = fx.store.fetch(id, None, &out.path().join("a")).await.unwrap();
    assert_eq!(latest, Tag::new(2, 0));
    assert!(!out.path().join("a/playbooks/create.yml").exists());

    fx.store.fetch(id, Some(old.tag), &out.path().join("b")).await.unwrap();
    let manifest = std::fs::read_to_string(out.path().join("b/service.yaml")).unwrap();
    assert!(manifest.contains("# old"));
    assert!(out.path().join("b/playbooks/create.yml").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_saves_get_distinct_tags() {
    require_git!();
    let fx = fixture();
    let id = Uuid::new_v4();
    let seed = tempfile::tempdir().unwrap();
    write_blueprint(seed.path(), "seed");
    fx.store.save(id, seed.path(), None, None).await.unwrap();

    let mut handles = Vec::new();
    for n in 0..4 {
        let store = Arc::clone(&fx.store);
        handles.push(tokio::spawn(async move {
            let src = tempfile::tempdir().unwrap();
            write_blueprint(src.path(), &format!("writer {n}"));
            store.save(id, src.path(), None, None).await.unwrap().tag
        }));
    }
    let mut tags = Vec::new();
    for h in handles {
        tags.push(h.await.unwrap());
    }
    tags.sort();
    tags.dedup();
    assert_eq!(tags.len(), 4, "tags must be pairwise distinct: {tags:?}");
    assert_eq!(fx.store.list_tags(id).await.unwrap().len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_saves_share_one_repository() {
    require_git!();
    let fx = fixture();
    let id = Uuid::new_v4();

    let mut handles = Vec::new();
    for n in 0..8 {
        let store = Arc::clone(&fx.store);
        handles.push(tokio::spawn(async move {
            let src = tempfile::tempdir().unwrap();
            write_blueprint(src.path(), &format!("first {n}"));
            store.save(id, src.path(), None, None).await
        }));
    }
    let mut tags = Vec::new();
    for h in handles {
        tags.push(h.await.unwrap().expect("every first save lands").tag);
    }
    tags.sort();
    let expected: Vec<Tag> = (1..=8).map(|major| Tag::new(major, 0)).collect();
    assert_eq!(tags, expected);
    assert_eq!(fx.store.list_tags(id).await.unwrap(), expected);
}

#[tokio::test]
async fn exhausted_major_fails_without_retrying() {
    require_git!();
    let fx = fixture();
    let src = tempfile::tempdir().unwrap();
    write_blueprint(src.path(), "x");
    let id = Uuid::new_v4();
    fx.store.save(id, src.path(), None, None).await.unwrap();
    // An unknown reference is taken verbatim.
    let top = Tag::new(u32::MAX, 0);
    let saved = fx.store.save(id, src.path(), None, Some(top)).await.unwrap();
    assert_eq!(saved.tag, top);

    let started = std::time::Instant::now();
    let err = fx.store.save(id, src.path(), None, None).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidTag(_)), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(fx.store.list_tags(id).await.unwrap(), vec![Tag::FIRST, top]);
}

#[tokio::test]
async fn missing_blueprint_and_version_are_not_found() {
    require_git!();
    let fx = fixture();
    let out = tempfile::tempdir().unwrap();

    let unknown = Uuid::new_v4();
    let err = fx.store.fetch(unknown, None, out.path()).await.unwrap_err();
    assert!(matches!(err, StoreError::BlueprintNotFound(id) if id == unknown));
    assert!(!fx.store.exists(unknown).await.unwrap());
    assert!(matches!(
        fx.store.tag_exists(unknown, Tag::FIRST).await,
        Err(StoreError::BlueprintNotFound(_))
    ));

    let src = tempfile::tempdir().unwrap();
    write_blueprint(src.path(), "x");
    let id = Uuid::new_v4();
    fx.store.save(id, src.path(), None, None).await.unwrap();
    let err = fx
        .store
        .fetch(id, Some(Tag::new(9, 0)), out.path())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::VersionNotFound { ref tag, .. } if tag == "v9.0"));
    assert!(err.is_not_found());
    assert!(!fx.store.tag_exists(id, Tag::new(9, 0)).await.unwrap());
    assert!(fx.store.tag_exists(id, Tag::FIRST).await.unwrap());
}

#[tokio::test]
async fn delete_tag_and_repo() {
    require_git!();
    let fx = fixture();
    let src = tempfile::tempdir().unwrap();
    write_blueprint(src.path(), "x");
    let id = Uuid::new_v4();
    fx.store.save(id, src.path(), None, None).await.unwrap();
    fx.store.save(id, src.path(), None, None).await.unwrap();

    assert!(fx.store.delete_tag(id, Tag::FIRST).await.unwrap());
    assert!(!fx.store.delete_tag(id, Tag::FIRST).await.unwrap());
    assert_eq!(fx.store.list_tags(id).await.unwrap(), vec![Tag::new(2, 0)]);

    assert_eq!(fx.store.delete_repo(id).await.unwrap(), 1);
    assert!(!fx.store.exists(id).await.unwrap());
    assert!(matches!(
        fx.store.delete_repo(id).await,
        Err(StoreError::BlueprintNotFound(_))
    ));
}

#[tokio::test]
async fn collaborators_pass_through() {
    require_git!();
    let fx = fixture();
    let src = tempfile::tempdir().unwrap();
    write_blueprint(src.path(), "x");
    let id = Uuid::new_v4();
    fx.store.save(id, src.path(), None, None).await.unwrap();

    fx.store.add_user(id, "alice").await.unwrap();
    fx.store.add_user(id, "alice").await.unwrap();
    assert_eq!(fx.store.list_users(id).await.unwrap(), vec!["alice".to_string()]);
    assert!(fx.store.remove_user(id, "alice").await.unwrap());
    assert!(!fx.store.remove_user(id, "alice").await.unwrap());
    assert!(fx.store.repo_url(id).await.unwrap().starts_with("file://"));
}

#[tokio::test]
async fn save_gives_up_at_the_deadline() {
    require_git!();
    let root = tempfile::tempdir().unwrap();
    // Clones go under a path that is a regular file, so every attempt fails.
    let blocked = root.path().join("work");
    std::fs::write(&blocked, "").unwrap();
    let connector = Arc::new(MockConnector::new(
        root.path().join("repos"),
        CommitIdentity::default(),
        "main",
    ));
    let config = StoreConfig {
        workdir: Some(blocked),
        ..StoreConfig::default()
    };
    let store = BlueprintStore::new(connector, &config).with_retry(RetryPolicy {
        timeout: Duration::from_millis(300),
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(50),
    });

    let src = tempfile::tempdir().unwrap();
    write_blueprint(src.path(), "x");
    let id = Uuid::new_v4();
    match store.save(id, src.path(), None, None).await {
        Err(StoreError::SaveTimeout {
            blueprint_id,
            attempts,
            elapsed,
        }) => {
            assert_eq!(blueprint_id, id);
            assert!(attempts > 1);
            assert!(elapsed >= Duration::from_millis(300));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    // The repository itself was created before the first attempt.
    assert!(store.exists(id).await.unwrap());
}
