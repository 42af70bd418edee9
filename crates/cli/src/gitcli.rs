//! `GitRepoCache` backed by the git command line.
//!
//! Repositories are mirrored bare under `<cachedir>/gits/<urlencoded>`;
//! checkouts are materialised with `git archive`, submodules included via
//! their own mirrors. This is the workspace's only implementation of the
//! external git interface.

use async_trait::async_trait;
use morph_core::source::SubmodulePin;
use morph_core::{Error, GitRepoCache, Result};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::Mutex;

pub struct GitCliRepoCache {
    dir: PathBuf,
    // One git mutation at a time; concurrent fetches into the same mirror
    // corrupt refs.
    fetch_lock: Mutex<()>,
}

impl GitCliRepoCache {
    pub fn new(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            fetch_lock: Mutex::new(()),
        })
    }

    fn mirror_dir(&self, repo: &str) -> PathBuf {
        let quoted = utf8_percent_encode(repo, NON_ALPHANUMERIC).to_string();
        self.dir.join(quoted)
    }

    async fn git(&self, args: &[&str], cwd: Option<&Path>) -> Result<Vec<u8>> {
        let mut command = Command::new("git");
        command.args(args).stdin(Stdio::null());
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let output = command.output().await.map_err(|e| Error::SourceUnavailable {
            repo: String::new(),
            reference: String::new(),
            reason: format!("git {}: {e}", args.join(" ")),
        })?;
        if !output.status.success() {
            return Err(Error::SourceUnavailable {
                repo: String::new(),
                reference: String::new(),
                reason: format!(
                    "git {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(output.stdout)
    }

    async fn git_in(&self, repo: &str, args: &[&str]) -> Result<Vec<u8>> {
        let mirror = self.mirror_dir(repo);
        self.git(args, Some(&mirror)).await.map_err(|err| match err {
            Error::SourceUnavailable { reason, .. } => Error::SourceUnavailable {
                repo: repo.to_string(),
                reference: String::new(),
                reason,
            },
            other => other,
        })
    }

    async fn unpack_archive(&self, repo: &str, sha1: &str, dest: &Path) -> Result<()> {
        let bytes = self.git_in(repo, &["archive", "--format=tar", sha1]).await?;
        std::fs::create_dir_all(dest).map_err(|e| Error::SourceUnavailable {
            repo: repo.to_string(),
            reference: sha1.to_string(),
            reason: e.to_string(),
        })?;
        let mut archive = tar::Archive::new(&bytes[..]);
        archive.unpack(dest).map_err(|e| Error::SourceUnavailable {
            repo: repo.to_string(),
            reference: sha1.to_string(),
            reason: format!("unpack archive: {e}"),
        })
    }
}

#[async_trait]
impl GitRepoCache for GitCliRepoCache {
    async fn ensure_fetched(&self, repo: &str, ref_: &str) -> Result<()> {
        let _guard = self.fetch_lock.lock().await;
        let mirror = self.mirror_dir(repo);
        if !mirror.exists() {
            tracing::info!(repo = %repo, "mirroring repository");
            self.git(
                &[
                    "clone",
                    "--mirror",
                    repo,
                    &mirror.display().to_string(),
                ],
                None,
            )
            .await
            .map_err(|err| match err {
                Error::SourceUnavailable { reason, .. } => Error::SourceUnavailable {
                    repo: repo.to_string(),
                    reference: ref_.to_string(),
                    reason,
                },
                other => other,
            })?;
        } else {
            tracing::debug!(repo = %repo, "updating mirror");
            self.git_in(repo, &["remote", "update", "--prune"]).await?;
        }
        Ok(())
    }

    async fn resolve_ref(&self, repo: &str, ref_: &str) -> Result<String> {
        let spec = format!("{ref_}^{{commit}}");
        let stdout = self.git_in(repo, &["rev-parse", "--verify", &spec]).await?;
        let sha1 = String::from_utf8_lossy(&stdout).trim().to_string();
        if sha1.is_empty() {
            return Err(Error::SourceUnavailable {
                repo: repo.to_string(),
                reference: ref_.to_string(),
                reason: "ref did not resolve".to_string(),
            });
        }
        Ok(sha1)
    }

    async fn cat_file(&self, repo: &str, sha1: &str, path: &str) -> Result<Vec<u8>> {
        let spec = format!("{sha1}:{path}");
        self.git_in(repo, &["cat-file", "blob", &spec]).await
    }

    async fn submodules_at(&self, repo: &str, sha1: &str) -> Result<Vec<SubmodulePin>> {
        // No .gitmodules at this commit means no submodules.
        let Ok(_) = self.cat_file(repo, sha1, ".gitmodules").await else {
            return Ok(Vec::new());
        };

        let blob = format!("{sha1}:.gitmodules");
        let paths = self
            .git_in(
                repo,
                &[
                    "config",
                    "--blob",
                    &blob,
                    "--get-regexp",
                    r"submodule\..*\.path",
                ],
            )
            .await?;

        let mut pins = Vec::new();
        for line in String::from_utf8_lossy(&paths).lines() {
            let Some((config_key, path)) = line.split_once(' ') else {
                continue;
            };
            let name = config_key
                .strip_prefix("submodule.")
                .and_then(|rest| rest.strip_suffix(".path"))
                .unwrap_or(config_key);
            let url_key = format!("submodule.{name}.url");
            let url_out = self
                .git_in(repo, &["config", "--blob", &blob, "--get", &url_key])
                .await?;
            let url = String::from_utf8_lossy(&url_out).trim().to_string();

            // The pinned commit is the gitlink entry in the tree.
            let tree_out = self.git_in(repo, &["ls-tree", sha1, path]).await?;
            let tree_line = String::from_utf8_lossy(&tree_out);
            let pinned = tree_line
                .split_whitespace()
                .nth(2)
                .unwrap_or_default()
                .to_string();
            if pinned.is_empty() {
                continue;
            }
            pins.push(SubmodulePin {
                path: path.to_string(),
                url,
                sha1: pinned,
            });
        }
        Ok(pins)
    }

    async fn checkout(&self, repo: &str, sha1: &str, dest: &Path) -> Result<()> {
        self.unpack_archive(repo, sha1, dest).await?;
        for pin in self.submodules_at(repo, sha1).await? {
            self.ensure_fetched(&pin.url, &pin.sha1).await?;
            self.unpack_archive(&pin.url, &pin.sha1, &dest.join(&pin.path))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    /// Create a one-commit repository with a hello.morph file.
    fn make_repo() -> (TempDir, String) {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("upstream");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(
            repo.join("hello.morph"),
            "kind: chunk\nname: hello\nbuild-system: manual\ninstall-commands: ['true']\n",
        )
        .unwrap();
        for args in [
            vec!["init", "-q"],
            vec!["add", "."],
            vec![
                "-c",
                "user.email=morph@test",
                "-c",
                "user.name=morph",
                "commit",
                "-q",
                "-m",
                "initial",
            ],
        ] {
            let status = StdCommand::new("git")
                .args(&args)
                .current_dir(&repo)
                .status()
                .expect("run git");
            assert!(status.success(), "git {args:?}");
        }
        let url = repo.display().to_string();
        (temp, url)
    }

    #[tokio::test]
    async fn mirrors_resolves_and_reads_files() {
        let (temp, url) = make_repo();
        let cache = GitCliRepoCache::new(temp.path().join("gits")).unwrap();

        cache.ensure_fetched(&url, "HEAD").await.unwrap();
        let sha1 = cache.resolve_ref(&url, "HEAD").await.unwrap();
        assert_eq!(sha1.len(), 40);

        let bytes = cache.cat_file(&url, &sha1, "hello.morph").await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("kind: chunk"));

        let missing = cache.cat_file(&url, &sha1, "no-such-file").await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn checkout_materialises_the_tree() {
        let (temp, url) = make_repo();
        let cache = GitCliRepoCache::new(temp.path().join("gits")).unwrap();

        cache.ensure_fetched(&url, "HEAD").await.unwrap();
        let sha1 = cache.resolve_ref(&url, "HEAD").await.unwrap();
        let dest = temp.path().join("checkout");
        cache.checkout(&url, &sha1, &dest).await.unwrap();
        assert!(dest.join("hello.morph").exists());
    }

    #[tokio::test]
    async fn repo_without_submodules_reports_none() {
        let (temp, url) = make_repo();
        let cache = GitCliRepoCache::new(temp.path().join("gits")).unwrap();
        cache.ensure_fetched(&url, "HEAD").await.unwrap();
        let sha1 = cache.resolve_ref(&url, "HEAD").await.unwrap();
        assert!(cache.submodules_at(&url, &sha1).await.unwrap().is_empty());
    }
}
