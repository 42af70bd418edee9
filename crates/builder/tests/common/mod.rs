//! Shared test fixtures for builder integration tests.
//!
//! Note: #[allow(dead_code)] because each test file compiles common/
//! separately.
#![allow(dead_code)]

use async_trait::async_trait;
use morph_core::source::SubmodulePin;
use morph_core::{BuildGraph, Config, GitRepoCache, GraphBuilder, SourceResolver};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub const DEFS_SHA: &str = "1111111111111111111111111111111111111111";

/// In-memory git cache: refs, files, and checkouts materialised from the
/// recorded file map.
#[derive(Default)]
pub struct FakeGit {
    refs: HashMap<(String, String), String>,
    files: HashMap<(String, String, String), Vec<u8>>,
}

impl FakeGit {
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

    async fn checkout(&self, repo: &str, sha1: &str, dest: &Path) -> morph_core::Result<()> {
        std::fs::create_dir_all(dest).map_err(|e| unavailable(repo, sha1, e))?;
        for ((r, s, path), contents) in &self.files {
            if r == repo && s == sha1 {
                let target = dest.join(path);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| unavailable(repo, sha1, e))?;
                }
                std::fs::write(&target, contents).map_err(|e| unavailable(repo, sha1, e))?;
            }
        }
        Ok(())
    }
}

/// A definitions repo with one stratum whose chunks come from `chunks`:
/// `(name, extra chunk-spec yaml lines, chunk morphology text)`.
pub fn definitions_with_chunks(chunks: &[(&str, &str, &str)]) -> FakeGit {
    let mut git = FakeGit::new();
    git.add_ref("defs", "master", DEFS_SHA);
    git.add_file(
        "defs",
        DEFS_SHA,
        "systems/base.morph",
        "kind: system\nname: base\narch: testarch\nstrata:\n- morph: strata/core.morph\n",
    );

    let mut stratum = String::from("kind: stratum\nname: core\nchunks:\n");
    for (index, (name, spec_extra, morph_text)) in chunks.iter().enumerate() {
        let sha = format!("{:040x}", 0xc0de00 + index);
        stratum.push_str(&format!(
            "- name: {name}\n  repo: upstream:{name}\n  ref: master\n"
        ));
        for line in spec_extra.lines() {
            stratum.push_str(&format!("  {line}\n"));
        }
        git.add_ref(&format!("upstream:{name}"), "master", &sha);
        git.add_file(
            &format!("upstream:{name}"),
            &sha,
            &format!("{name}.morph"),
            morph_text,
        );
    }
    git.add_file("defs", DEFS_SHA, "strata/core.morph", &stratum);
    git
}

/// Resolve the test system into a build graph.
pub async fn resolve_graph(git: Arc<FakeGit>, config: &Config) -> BuildGraph {
    let resolver = SourceResolver::new(git as Arc<dyn GitRepoCache>);
    GraphBuilder::new(&resolver, config)
        .build("defs", "master", "systems/base.morph")
        .await
        .expect("graph resolution")
}

/// A test config rooted in `root`, with the test architecture.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::for_testing(root);
    config.arch = "testarch".to_string();
    config
}
