//! Controller tests: claim table semantics and initiator-visible flows.

use async_trait::async_trait;
use httpmock::prelude::*;
use httpmock::Method::HEAD;
use morph_core::source::SubmodulePin;
use morph_core::{CacheKey, Config, GitRepoCache};
use morph_distbuild::controller::{ClaimStatus, ClaimTable, ControllerDaemon};
use morph_distbuild::protocol::Message;
use morph_distbuild::worker::WorkerDaemon;
use morph_distbuild::InitiatorClient;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DEFS_SHA: &str = "1111111111111111111111111111111111111111";
const CHUNK_SHA: &str = "2222222222222222222222222222222222222222";

/// In-memory git cache for controller-side graph resolution.
#[derive(Default)]
struct FakeGit {
    refs: HashMap<(String, String), String>,
    files: HashMap<(String, String, String), Vec<u8>>,
}

impl FakeGit {
    fn with_simple_system() -> Self {
        let mut git = Self::default();
        git.refs.insert(
            ("defs".to_string(), "master".to_string()),
            DEFS_SHA.to_string(),
        );
        git.files.insert(
            (
                "defs".to_string(),
                DEFS_SHA.to_string(),
                "systems/base.morph".to_string(),
            ),
            b"kind: system\nname: base\narch: testarch\nstrata:\n- morph: strata/core.morph\n"
                .to_vec(),
        );
        git.files.insert(
            (
                "defs".to_string(),
                DEFS_SHA.to_string(),
                "strata/core.morph".to_string(),
            ),
            b"kind: stratum\nname: core\nchunks:\n\
              - name: hello\n  repo: upstream:hello\n  ref: master\n"
                .to_vec(),
        );
        git.refs.insert(
            ("upstream:hello".to_string(), "master".to_string()),
            CHUNK_SHA.to_string(),
        );
        git.files.insert(
            (
                "upstream:hello".to_string(),
                CHUNK_SHA.to_string(),
                "hello.morph".to_string(),
            ),
            b"kind: chunk\nname: hello\nbuild-system: manual\ninstall-commands: ['true']\n"
                .to_vec(),
        );
        git
    }
}

fn unavailable(repo: &str, reference: &str, reason: impl ToString) -> morph_core::Error {
    morph_core::Error::SourceUnavailable {
        repo: repo.to_string(),
        reference: reference.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl GitRepoCache for FakeGit {
    async fn ensure_fetched(&self, _repo: &str, _ref: &str) -> morph_core::Result<()> {
        Ok(())
    }

    async fn resolve_ref(&self, repo: &str, ref_: &str) -> morph_core::Result<String> {
        self.refs
            .get(&(repo.to_string(), ref_.to_string()))
            .cloned()
            .ok_or_else(|| unavailable(repo, ref_, "no such ref"))
    }

    async fn cat_file(&self, repo: &str, sha1: &str, path: &str) -> morph_core::Result<Vec<u8>> {
        self.files
            .get(&(repo.to_string(), sha1.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| unavailable(repo, sha1, format!("no file {path}")))
    }

    async fn submodules_at(
        &self,
        _repo: &str,
        _sha1: &str,
    ) -> morph_core::Result<Vec<SubmodulePin>> {
        Ok(Vec::new())
    }

    async fn checkout(&self, _repo: &str, _sha1: &str, _dest: &Path) -> morph_core::Result<()> {
        Ok(())
    }
}

fn controller_config(shared_cache: &str, worker_addrs: &[String]) -> Config {
    let mut config = Config::for_testing(Path::new("/nonexistent"));
    config.arch = "testarch".to_string();
    config.shared_cache = Some(shared_cache.to_string());
    config.distbuild.controller_bind = "127.0.0.1:0".to_string();
    config.distbuild.reconnect_delay_secs = 1;
    config.distbuild.workers = worker_addrs
        .iter()
        .map(|addr| morph_core::config::WorkerConfig {
            addr: addr.clone(),
            cache_url: None,
        })
        .collect();
    config
}

async fn start_controller(config: Config) -> String {
    let git: Arc<dyn GitRepoCache> = Arc::new(FakeGit::with_simple_system());
    let daemon = ControllerDaemon::bind(config, git).await.expect("bind");
    let addr = daemon.local_addr().expect("addr").to_string();
    tokio::spawn(daemon.run());
    addr
}

#[tokio::test]
async fn claim_table_grants_once_and_queues_waiters() {
    let table = ClaimTable::new();
    let key = CacheKey::compute(b"claimed");

    assert!(matches!(
        table.claim(&key, "worker-a").await,
        ClaimStatus::Granted
    ));
    assert_eq!(table.holder(&key).await.as_deref(), Some("worker-a"));

    let ClaimStatus::InFlight(done) = table.claim(&key, "worker-b").await else {
        panic!("second claim for the same key must wait");
    };

    let waiter = tokio::spawn(async move { done.notified().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "waiter should block until release");

    table.release(&key).await;
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter woken")
        .unwrap();
    assert!(table.holder(&key).await.is_none());

    // The key is claimable again after release.
    assert!(matches!(
        table.claim(&key, "worker-b").await,
        ClaimStatus::Granted
    ));
}

#[tokio::test]
async fn release_worker_frees_all_its_claims() {
    let table = ClaimTable::new();
    let key_a = CacheKey::compute(b"a");
    let key_b = CacheKey::compute(b"b");
    let key_c = CacheKey::compute(b"c");

    table.claim(&key_a, "w1").await;
    table.claim(&key_b, "w1").await;
    table.claim(&key_c, "w2").await;

    table.release_worker("w1").await;
    assert!(table.holder(&key_a).await.is_none());
    assert!(table.holder(&key_b).await.is_none());
    assert_eq!(table.holder(&key_c).await.as_deref(), Some("w2"));
}

#[tokio::test]
async fn fully_cached_build_finishes_without_workers() {
    // Shared cache says everything exists: the controller marks each unit
    // done without dispatching anything.
    let shared = MockServer::start_async().await;
    shared
        .mock_async(|when, then| {
            when.method(HEAD).path("/1.0/artifacts");
            then.status(200);
        })
        .await;

    let addr = start_controller(controller_config(&shared.base_url(), &[])).await;
    let mut initiator = InitiatorClient::connect(&addr).await.unwrap();
    let id = initiator
        .send_build_request("defs", "master", "systems/base.morph")
        .await
        .unwrap();

    let mut saw_progress = false;
    let finished = tokio::time::timeout(
        Duration::from_secs(10),
        initiator.wait_for_build(&id, |message| {
            if matches!(message, Message::BuildProgress { .. }) {
                saw_progress = true;
            }
        }),
    )
    .await
    .expect("terminal message in time")
    .unwrap();

    assert!(finished, "fully cached build should finish");
    assert!(saw_progress);
}

#[tokio::test]
async fn uncached_build_without_workers_fails() {
    let shared = MockServer::start_async().await;
    shared
        .mock_async(|when, then| {
            when.method(HEAD).path("/1.0/artifacts");
            then.status(404);
        })
        .await;

    let addr = start_controller(controller_config(&shared.base_url(), &[])).await;
    let mut initiator = InitiatorClient::connect(&addr).await.unwrap();
    let id = initiator
        .send_build_request("defs", "master", "systems/base.morph")
        .await
        .unwrap();

    let mut reason = String::new();
    let finished = tokio::time::timeout(
        Duration::from_secs(10),
        initiator.wait_for_build(&id, |message| {
            if let Message::BuildFailed { reason: r, .. } = message {
                reason = r.clone();
            }
        }),
    )
    .await
    .expect("terminal message in time")
    .unwrap();

    assert!(!finished);
    assert!(reason.contains("no workers"), "reason was: {reason}");
}

#[tokio::test]
async fn worker_that_never_uploads_fails_the_build() {
    let shared = MockServer::start_async().await;
    shared
        .mock_async(|when, then| {
            when.method(HEAD).path("/1.0/artifacts");
            then.status(404);
        })
        .await;

    let worker = WorkerDaemon::bind("127.0.0.1:0").await.unwrap();
    let worker_addr = worker.local_addr().unwrap().to_string();
    tokio::spawn(worker.run());

    let mut config = controller_config(&shared.base_url(), &[worker_addr]);
    // The "build" succeeds but uploads nothing, which the controller must
    // detect through the shared cache.
    config.distbuild.build_command =
        vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()];
    let addr = start_controller(config).await;

    let mut initiator = InitiatorClient::connect(&addr).await.unwrap();
    let id = initiator
        .send_build_request("defs", "master", "systems/base.morph")
        .await
        .unwrap();

    let mut reason = String::new();
    let finished = tokio::time::timeout(
        Duration::from_secs(20),
        initiator.wait_for_build(&id, |message| {
            if let Message::BuildFailed { reason: r, .. } = message {
                reason = r.clone();
            }
        }),
    )
    .await
    .expect("terminal message in time")
    .unwrap();

    assert!(!finished);
    assert!(
        reason.contains("shared cache"),
        "failure should mention the missing upload; reason was: {reason}"
    );
}

#[tokio::test]
async fn build_cancel_reaches_a_terminal_state() {
    let shared = MockServer::start_async().await;
    shared
        .mock_async(|when, then| {
            when.method(HEAD).path("/1.0/artifacts");
            then.status(404);
        })
        .await;

    let worker = WorkerDaemon::bind("127.0.0.1:0").await.unwrap();
    let worker_addr = worker.local_addr().unwrap().to_string();
    tokio::spawn(worker.run());

    let mut config = controller_config(&shared.base_url(), &[worker_addr]);
    config.distbuild.build_command = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "echo building; sleep 30".to_string(),
    ];
    let addr = start_controller(config).await;

    let mut initiator = InitiatorClient::connect(&addr).await.unwrap();
    let id = initiator
        .send_build_request("defs", "master", "systems/base.morph")
        .await
        .unwrap();

    // Wait for evidence the build is running, then cancel.
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), initiator.next())
            .await
            .expect("activity")
            .unwrap()
            .expect("frame");
        if matches!(message, Message::BuildOutput { .. }) {
            break;
        }
    }
    initiator.send_cancel(&id).await.unwrap();

    let mut reason = String::new();
    let finished = tokio::time::timeout(
        Duration::from_secs(10),
        initiator.wait_for_build(&id, |message| {
            if let Message::BuildFailed { reason: r, .. } = message {
                reason = r.clone();
            }
        }),
    )
    .await
    .expect("terminal after cancel")
    .unwrap();

    assert!(!finished);
    assert!(reason.contains("cancel"), "reason was: {reason}");
}
