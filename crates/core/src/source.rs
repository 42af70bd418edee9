//! Source resolution: pinning morphology references to git commits.
//!
//! The git plumbing itself is an external collaborator behind the
//! `GitRepoCache` trait; this module adds ref pinning and in-process
//! memoisation on top, so later ref movement cannot silently change what
//! a build means.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A pinned git submodule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmodulePin {
    /// Path of the submodule inside the superproject.
    pub path: String,
    /// URL the submodule is fetched from.
    pub url: String,
    /// The exact commit the superproject pins.
    pub sha1: String,
}

/// A fully resolved source: commit, morphology text, submodule pins.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub repo: String,
    pub sha1: String,
    pub morph_path: String,
    pub text: String,
    pub submodules: Vec<SubmodulePin>,
}

/// Interface to the git repository cache.
///
/// Implementations mirror repositories under the cache directory and keep
/// them fetched; everything here is specified against commit SHA-1s except
/// `resolve_ref`, which turns floating refs into them.
#[async_trait]
pub trait GitRepoCache: Send + Sync + 'static {
    /// Make sure `ref_` of `repo` is available locally.
    async fn ensure_fetched(&self, repo: &str, ref_: &str) -> crate::Result<()>;

    /// Resolve a branch, tag or SHA-1 to a full 40-hex SHA-1.
    async fn resolve_ref(&self, repo: &str, ref_: &str) -> crate::Result<String>;

    /// Read one file from the tree at `sha1`.
    async fn cat_file(&self, repo: &str, sha1: &str, path: &str) -> crate::Result<Vec<u8>>;

    /// The submodules pinned by the tree at `sha1`.
    async fn submodules_at(&self, repo: &str, sha1: &str) -> crate::Result<Vec<SubmodulePin>>;

    /// Materialise the tree at `sha1` (with submodules) into `dest`.
    async fn checkout(&self, repo: &str, sha1: &str, dest: &Path) -> crate::Result<()>;
}

/// Whether a ref is already a full SHA-1.
pub fn is_sha1(ref_: &str) -> bool {
    ref_.len() == 40 && ref_.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Resolves `(repo, ref, morph path)` triples, memoising per process.
///
/// Resolution is a pure function of its inputs for a fixed git state, so
/// both the ref pinning and the per-commit lookups are cached.
pub struct SourceResolver {
    git: Arc<dyn GitRepoCache>,
    refs: Mutex<HashMap<(String, String), String>>,
    sources: Mutex<HashMap<(String, String, String), ResolvedSource>>,
}

impl SourceResolver {
    pub fn new(git: Arc<dyn GitRepoCache>) -> Self {
        Self {
            git,
            refs: Mutex::new(HashMap::new()),
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying git cache, for checkouts during staging.
    pub fn git(&self) -> &Arc<dyn GitRepoCache> {
        &self.git
    }

    /// Pin a ref to a full SHA-1, fetching if needed.
    pub async fn resolve_ref(&self, repo: &str, ref_: &str) -> crate::Result<String> {
        if is_sha1(ref_) {
            return Ok(ref_.to_string());
        }
        let memo_key = (repo.to_string(), ref_.to_string());
        if let Some(sha1) = self.refs.lock().await.get(&memo_key) {
            return Ok(sha1.clone());
        }
        self.git.ensure_fetched(repo, ref_).await?;
        let sha1 = self.git.resolve_ref(repo, ref_).await?;
        if !is_sha1(&sha1) {
            return Err(crate::Error::SourceUnavailable {
                repo: repo.to_string(),
                reference: ref_.to_string(),
                reason: format!("resolved to {sha1:?}, not a SHA-1"),
            });
        }
        tracing::debug!(repo = %repo, reference = %ref_, sha1 = %sha1, "pinned ref");
        self.refs.lock().await.insert(memo_key, sha1.clone());
        Ok(sha1)
    }

    /// Resolve a morphology reference to its pinned source.
    pub async fn resolve(
        &self,
        repo: &str,
        ref_: &str,
        morph_path: &str,
    ) -> crate::Result<ResolvedSource> {
        let sha1 = self.resolve_ref(repo, ref_).await?;
        let memo_key = (repo.to_string(), sha1.clone(), morph_path.to_string());
        if let Some(source) = self.sources.lock().await.get(&memo_key) {
            return Ok(source.clone());
        }

        let bytes = self.git.cat_file(repo, &sha1, morph_path).await?;
        let text = String::from_utf8(bytes).map_err(|_| crate::Error::SourceUnavailable {
            repo: repo.to_string(),
            reference: sha1.clone(),
            reason: format!("{morph_path} is not valid UTF-8"),
        })?;
        let submodules = self.git.submodules_at(repo, &sha1).await?;

        let source = ResolvedSource {
            repo: repo.to_string(),
            sha1,
            morph_path: morph_path.to_string(),
            text,
            submodules,
        };
        self.sources.lock().await.insert(memo_key, source.clone());
        Ok(source)
    }
}

#[cfg(test)]
pub mod testutil {
    //! An in-memory `GitRepoCache` for tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct FakeGitRepoCache {
        /// (repo, ref) -> sha1
        pub refs: HashMap<(String, String), String>,
        /// (repo, sha1, path) -> file contents
        pub files: HashMap<(String, String, String), Vec<u8>>,
        /// (repo, sha1) -> submodule pins
        pub submodules: HashMap<(String, String), Vec<SubmodulePin>>,
        pub resolve_calls: AtomicUsize,
        pub cat_calls: AtomicUsize,
    }

    impl FakeGitRepoCache {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_ref(&mut self, repo: &str, ref_: &str, sha1: &str) {
            self.refs
                .insert((repo.to_string(), ref_.to_string()), sha1.to_string());
        }

        pub fn add_file(&mut self, repo: &str, sha1: &str, path: &str, contents: &str) {
            self.files.insert(
                (repo.to_string(), sha1.to_string(), path.to_string()),
                contents.as_bytes().to_vec(),
            );
        }

        pub fn add_submodule(&mut self, repo: &str, sha1: &str, pin: SubmodulePin) {
            self.submodules
                .entry((repo.to_string(), sha1.to_string()))
                .or_default()
                .push(pin);
        }
    }

    #[async_trait]
    impl GitRepoCache for FakeGitRepoCache {
        async fn ensure_fetched(&self, _repo: &str, _ref: &str) -> crate::Result<()> {
            Ok(())
        }

        async fn resolve_ref(&self, repo: &str, ref_: &str) -> crate::Result<String> {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            self.refs
                .get(&(repo.to_string(), ref_.to_string()))
                .cloned()
                .ok_or_else(|| crate::Error::SourceUnavailable {
                    repo: repo.to_string(),
                    reference: ref_.to_string(),
                    reason: "no such ref".to_string(),
                })
        }

        async fn cat_file(&self, repo: &str, sha1: &str, path: &str) -> crate::Result<Vec<u8>> {
            self.cat_calls.fetch_add(1, Ordering::SeqCst);
            self.files
                .get(&(repo.to_string(), sha1.to_string(), path.to_string()))
                .cloned()
                .ok_or_else(|| crate::Error::SourceUnavailable {
                    repo: repo.to_string(),
                    reference: sha1.to_string(),
                    reason: format!("no file {path}"),
                })
        }

        async fn submodules_at(
            &self,
            repo: &str,
            sha1: &str,
        ) -> crate::Result<Vec<SubmodulePin>> {
            Ok(self
                .submodules
                .get(&(repo.to_string(), sha1.to_string()))
                .cloned()
                .unwrap_or_default())
        }

        async fn checkout(&self, repo: &str, sha1: &str, dest: &Path) -> crate::Result<()> {
            std::fs::create_dir_all(dest).map_err(|e| crate::Error::SourceUnavailable {
                repo: repo.to_string(),
                reference: sha1.to_string(),
                reason: e.to_string(),
            })?;
            for ((r, s, path), contents) in &self.files {
                if r == repo && s == sha1 {
                    let target = dest.join(path);
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent).ok();
                    }
                    std::fs::write(&target, contents).map_err(|e| {
                        crate::Error::SourceUnavailable {
                            repo: repo.to_string(),
                            reference: sha1.to_string(),
                            reason: e.to_string(),
                        }
                    })?;
                }
            }
            // Submodule trees appear under their path, as a real checkout
            // with submodule update would leave them.
            for pin in self
                .submodules
                .get(&(repo.to_string(), sha1.to_string()))
                .cloned()
                .unwrap_or_default()
            {
                std::fs::create_dir_all(dest.join(&pin.path)).ok();
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::FakeGitRepoCache;
    use super::*;
    use std::sync::atomic::Ordering;

    const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

    fn resolver_with_hello() -> (SourceResolver, Arc<FakeGitRepoCache>) {
        let mut git = FakeGitRepoCache::new();
        git.add_ref("upstream:hello", "master", SHA);
        git.add_file("upstream:hello", SHA, "hello.morph", "kind: chunk\nname: hello\nbuild-system: autotools\n");
        let git = Arc::new(git);
        (SourceResolver::new(git.clone()), git)
    }

    #[tokio::test]
    async fn pins_floating_ref_to_sha1() {
        let (resolver, _git) = resolver_with_hello();
        let source = resolver
            .resolve("upstream:hello", "master", "hello.morph")
            .await
            .unwrap();
        assert_eq!(source.sha1, SHA);
        assert!(source.text.contains("kind: chunk"));
    }

    #[tokio::test]
    async fn sha1_refs_skip_the_git_cache() {
        let (resolver, git) = resolver_with_hello();
        let sha1 = resolver.resolve_ref("upstream:hello", SHA).await.unwrap();
        assert_eq!(sha1, SHA);
        assert_eq!(git.resolve_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn memoises_ref_and_file_lookups() {
        let (resolver, git) = resolver_with_hello();
        for _ in 0..3 {
            resolver
                .resolve("upstream:hello", "master", "hello.morph")
                .await
                .unwrap();
        }
        assert_eq!(git.resolve_calls.load(Ordering::SeqCst), 1);
        assert_eq!(git.cat_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_ref_is_source_unavailable() {
        let (resolver, _git) = resolver_with_hello();
        let err = resolver
            .resolve("upstream:hello", "no-such-branch", "hello.morph")
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn carries_submodule_pins() {
        let (mut git, sub_sha) = (FakeGitRepoCache::new(), "fedcba9876543210fedcba9876543210fedcba98");
        git.add_ref("upstream:outer", "master", SHA);
        git.add_file("upstream:outer", SHA, "outer.morph", "kind: chunk\nname: outer\nbuild-system: manual\ninstall-commands: ['true']\n");
        git.add_submodule(
            "upstream:outer",
            SHA,
            SubmodulePin {
                path: "vendor/inner".to_string(),
                url: "upstream:inner".to_string(),
                sha1: sub_sha.to_string(),
            },
        );
        let resolver = SourceResolver::new(Arc::new(git));
        let source = resolver
            .resolve("upstream:outer", "master", "outer.morph")
            .await
            .unwrap();
        assert_eq!(source.submodules.len(), 1);
        assert_eq!(source.submodules[0].sha1, sub_sha);
    }
}
