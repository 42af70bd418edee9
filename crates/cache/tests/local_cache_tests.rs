//! Integration tests for the local artifact store.

use morph_cache::{ArtifactMeta, ClaimOutcome, GcStats, LocalArtifactCache};
use morph_core::{ArtifactKind, CacheKey};
use tempfile::TempDir;
use time::OffsetDateTime;

fn cache() -> (TempDir, LocalArtifactCache) {
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = LocalArtifactCache::new(temp.path().join("artifacts")).expect("cache");
    (temp, cache)
}

fn meta_for(key: CacheKey, name: &str) -> ArtifactMeta {
    let now = OffsetDateTime::now_utc();
    ArtifactMeta {
        cache_key: key,
        kind: ArtifactKind::Chunk,
        source_name: name.to_string(),
        repo: "upstream:test".to_string(),
        sha1: "0123456789abcdef0123456789abcdef01234567".to_string(),
        artifacts: vec![format!("{name}-runtime")],
        dependency_keys: Vec::new(),
        build_started: now,
        build_ended: now,
        last_access: now,
    }
}

/// Commit one artifact group under `key`.
fn commit_group(cache: &LocalArtifactCache, key: CacheKey, name: &str, payload: &[u8]) {
    let ClaimOutcome::Claimed(mut claim) = cache.claim(&key).unwrap() else {
        panic!("expected a fresh claim");
    };
    let artifact = claim.artifact_partial(ArtifactKind::Chunk, &format!("{name}-runtime"));
    std::fs::write(&artifact, payload).unwrap();
    let log = claim.build_log_partial();
    std::fs::write(&log, format!("built {name}\n")).unwrap();
    claim.write_meta(&meta_for(key, name)).unwrap();
    claim.commit().unwrap();
}

#[test]
fn commit_publishes_artifact_with_sidecars() {
    let (_temp, cache) = cache();
    let key = CacheKey::compute(b"hello");

    commit_group(&cache, key, "hello", b"tar bytes");

    assert!(cache.has(&key, ArtifactKind::Chunk, "hello-runtime"));
    assert!(cache.is_built(&key));
    assert_eq!(cache.read_build_log(&key).unwrap(), "built hello\n");
    let meta = cache.read_meta(&key).unwrap();
    assert_eq!(meta.artifacts, ["hello-runtime"]);
}

#[test]
fn second_claim_while_held_is_busy() {
    let (_temp, cache) = cache();
    let key = CacheKey::compute(b"contended");

    let first = cache.claim(&key).unwrap();
    let ClaimOutcome::Claimed(_claim) = first else {
        panic!("expected a claim");
    };

    // Same-process second claim must observe the lock.
    match cache.claim(&key).unwrap() {
        ClaimOutcome::Busy => {}
        ClaimOutcome::Done => panic!("nothing committed yet"),
        ClaimOutcome::Claimed(_) => panic!("two concurrent claims for one key"),
    }
}

#[test]
fn claim_after_commit_is_done() {
    let (_temp, cache) = cache();
    let key = CacheKey::compute(b"done");
    commit_group(&cache, key, "done", b"bytes");

    assert!(matches!(cache.claim(&key).unwrap(), ClaimOutcome::Done));
}

#[test]
fn claim_is_reacquirable_after_drop() {
    let (_temp, cache) = cache();
    let key = CacheKey::compute(b"dropped");

    {
        let ClaimOutcome::Claimed(_claim) = cache.claim(&key).unwrap() else {
            panic!("expected a claim");
        };
        // Dropped uncommitted.
    }

    assert!(matches!(
        cache.claim(&key).unwrap(),
        ClaimOutcome::Claimed(_)
    ));
}

#[test]
fn abort_preserves_build_log_and_drops_artifacts() {
    let (_temp, cache) = cache();
    let key = CacheKey::compute(b"failed build");

    let ClaimOutcome::Claimed(mut claim) = cache.claim(&key).unwrap() else {
        panic!("expected a claim");
    };
    let artifact = claim.artifact_partial(ArtifactKind::Chunk, "broken-runtime");
    std::fs::write(&artifact, b"half a tarball").unwrap();
    let log = claim.build_log_partial();
    std::fs::write(&log, "echo X\nX\n").unwrap();
    claim.abort().unwrap();

    assert!(!cache.has(&key, ArtifactKind::Chunk, "broken-runtime"));
    assert!(!cache.is_built(&key));
    // The log survives failure.
    assert!(cache.read_build_log(&key).unwrap().contains('X'));
}

#[test]
fn stale_partials_are_swept_on_next_claim() {
    let (_temp, cache) = cache();
    let key = CacheKey::compute(b"crashed");

    let partial = cache
        .dir()
        .join(format!("{}.chunk.crashed-runtime.partial", key.to_hex()));
    std::fs::write(&partial, b"leftover").unwrap();

    let ClaimOutcome::Claimed(_claim) = cache.claim(&key).unwrap() else {
        panic!("expected a claim");
    };
    assert!(!partial.exists());
}

#[test]
fn gc_evicts_least_recently_accessed_whole_groups() {
    let (_temp, cache) = cache();
    let old_key = CacheKey::compute(b"old");
    let new_key = CacheKey::compute(b"new");

    commit_group(&cache, old_key, "old", &[0u8; 4096]);
    commit_group(&cache, new_key, "new", &[0u8; 4096]);

    // Make `old` clearly older.
    let mut meta = cache.read_meta(&old_key).unwrap();
    meta.last_access = OffsetDateTime::UNIX_EPOCH;
    let ClaimOutcome::Done = cache.claim(&old_key).unwrap() else {
        panic!("committed group should be done");
    };
    // Rewrite meta through a read so the test can age the entry.
    let meta_path = cache.dir().join(format!("{}.meta", old_key.to_hex()));
    std::fs::write(&meta_path, serde_json::to_string(&meta).unwrap()).unwrap();

    let stats = cache.gc(6000).unwrap();
    assert_eq!(stats.groups_deleted, 1);
    assert!(!cache.is_built(&old_key), "old group should be evicted");
    assert!(cache.is_built(&new_key), "new group should survive");
    assert!(!cache.has(&old_key, ArtifactKind::Chunk, "old-runtime"));
}

#[test]
fn gc_below_budget_is_a_no_op() {
    let (_temp, cache) = cache();
    let key = CacheKey::compute(b"small");
    commit_group(&cache, key, "small", b"tiny");

    assert_eq!(cache.gc(u64::MAX).unwrap(), GcStats::default());
    assert!(cache.is_built(&key));
}

#[test]
fn open_for_read_bumps_last_access() {
    let (_temp, cache) = cache();
    let key = CacheKey::compute(b"touched");
    commit_group(&cache, key, "touched", b"bytes");

    let meta_path = cache.dir().join(format!("{}.meta", key.to_hex()));
    let mut meta = cache.read_meta(&key).unwrap();
    meta.last_access = OffsetDateTime::UNIX_EPOCH;
    std::fs::write(&meta_path, serde_json::to_string(&meta).unwrap()).unwrap();

    let _file = cache
        .open_for_read(&key, ArtifactKind::Chunk, "touched-runtime")
        .unwrap();
    let bumped = cache.read_meta(&key).unwrap();
    assert!(bumped.last_access > OffsetDateTime::UNIX_EPOCH);
}

#[test]
fn missing_artifact_is_not_found() {
    let (_temp, cache) = cache();
    let key = CacheKey::compute(b"absent");
    let err = cache
        .open_for_read(&key, ArtifactKind::Chunk, "absent-runtime")
        .unwrap_err();
    assert!(matches!(err, morph_cache::CacheError::NotFound(_)));
}
