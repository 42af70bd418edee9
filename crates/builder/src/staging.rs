//! Staging area assembly.
//!
//! A chunk builds inside an ephemeral root composed from its dependency
//! artifacts. Dependencies are unpacked in topological order with ties
//! broken by cache key, so the root is assembled deterministically; the
//! chunk's source is then checked out (with pinned submodules) into
//! `<root>/<name>.build`, and the install tree is captured from
//! `<root>/<name>.inst`.

use crate::error::{BuildError, BuildResult};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use morph_cache::LocalArtifactCache;
use morph_core::graph::{BuildGraph, BuildUnit};
use morph_core::{Config, GitRepoCache};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The ephemeral filesystem a chunk build runs in.
pub struct StagingArea {
    root: PathBuf,
    source_name: String,
}

impl StagingArea {
    /// Create a fresh, empty staging root for `unit` under the work dir.
    ///
    /// The directory is named by cache key; the at-most-one-builder
    /// guarantee makes that collision-free.
    pub fn create(config: &Config, unit: &BuildUnit) -> BuildResult<Self> {
        let root = config
            .work_dir
            .join(format!("{}.staging", unit.cache_key.to_hex()));
        if root.exists() {
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            source_name: unit.source_name.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the chunk source is checked out.
    pub fn build_dir(&self) -> PathBuf {
        self.root.join(format!("{}.build", self.source_name))
    }

    /// The DESTDIR the install phase populates.
    pub fn destdir(&self) -> PathBuf {
        self.root.join(format!("{}.inst", self.source_name))
    }

    /// Unpack every dependency artifact into the staging root.
    ///
    /// Artifact tarballs are DESTDIR-relative, so a bootstrap dependency
    /// (built with the tools prefix) lands under the tools prefix and
    /// everything else under its own prefix, all rooted at `/`.
    pub fn install_dependencies(
        &self,
        cache: &LocalArtifactCache,
        graph: &BuildGraph,
        unit: &BuildUnit,
    ) -> BuildResult<()> {
        // Unpack order is what makes the root bit-deterministic.
        let depths = graph.depths();
        let mut deps: Vec<usize> = unit.dependencies.clone();
        sort_for_assembly(&mut deps, graph, &depths);
        for dep_index in deps {
            let dep = &graph.units[dep_index];
            let reader = cache
                .open_for_read(&dep.cache_key, dep.kind, &dep.name)
                .map_err(|_| BuildError::MissingDependency {
                    name: dep.name.clone(),
                })?;
            unpack_tarball(reader, &self.root)?;
            tracing::debug!(artifact = %dep.name, "staged dependency");
        }
        Ok(())
    }

    /// Check out the unit's pinned source tree, submodules included.
    pub async fn checkout_source(
        &self,
        git: &Arc<dyn GitRepoCache>,
        unit: &BuildUnit,
    ) -> BuildResult<()> {
        let build_dir = self.build_dir();
        fs::create_dir_all(&build_dir)?;
        git.checkout(&unit.repo, &unit.sha1, &build_dir).await?;
        fs::create_dir_all(self.destdir())?;
        Ok(())
    }

    /// Delete the staging root.
    pub fn destroy(self) -> BuildResult<()> {
        fs::remove_dir_all(&self.root)?;
        Ok(())
    }
}

/// Deterministic unpack order: topological depth, ties broken by cache
/// key, then artifact name (split artifacts of one source share a key).
pub(crate) fn sort_for_assembly(indices: &mut [usize], graph: &BuildGraph, depths: &[usize]) {
    indices.sort_by(|&a, &b| {
        (depths[a], graph.units[a].cache_key, &graph.units[a].name)
            .cmp(&(depths[b], graph.units[b].cache_key, &graph.units[b].name))
    });
}

/// Unpack a gzipped tarball into `dest`.
pub fn unpack_tarball(reader: impl std::io::Read, dest: &Path) -> BuildResult<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .map_err(|e| BuildError::Staging(format!("unpack into {}: {e}", dest.display())))?;
    Ok(())
}

/// Tar the given paths (relative to `base`) into a gzipped tarball at
/// `output`. Paths are added in sorted order so equal inputs give equal
/// archives.
pub fn pack_tarball(base: &Path, paths: &[String], output: &Path) -> BuildResult<()> {
    let file = File::create(output)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut sorted: Vec<&String> = paths.iter().collect();
    sorted.sort();
    for rel in sorted {
        let full = base.join(rel);
        let meta = fs::symlink_metadata(&full)?;
        if meta.is_dir() {
            builder.append_dir(rel, &full)?;
        } else {
            builder.append_path_with_name(&full, rel)?;
        }
    }
    let encoder = builder
        .into_inner()
        .map_err(|e| BuildError::Staging(format!("finish tar: {e}")))?;
    encoder
        .finish()
        .map_err(|e| BuildError::Staging(format!("finish gzip: {e}")))?;
    Ok(())
}

/// Tar an entire directory tree, rooted at its own top level.
pub fn pack_tree(base: &Path, output: &Path) -> BuildResult<()> {
    let mut paths = Vec::new();
    for entry in walkdir::WalkDir::new(base).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| BuildError::Staging(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(base)
            .map_err(|e| BuildError::Staging(e.to_string()))?;
        paths.push(rel.to_string_lossy().to_string());
    }
    pack_tarball(base, &paths, output)
}

/// Enumerate the files, links and directories under `destdir`, as
/// `/`-relative path strings, sorted.
pub fn walk_install_tree(destdir: &Path) -> BuildResult<Vec<String>> {
    let mut paths = Vec::new();
    for entry in walkdir::WalkDir::new(destdir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| BuildError::Staging(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(destdir)
            .map_err(|e| BuildError::Staging(e.to_string()))?;
        paths.push(rel.to_string_lossy().to_string());
    }
    Ok(paths)
}
