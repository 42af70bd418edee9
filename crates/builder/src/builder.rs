//! Builders: produce one source's artifacts from its staged dependencies.
//!
//! A chunk build claims its cache key, assembles a staging area, runs the
//! phase commands under the scrubbed environment with output streamed to
//! the build log, captures the install tree through the split rules and
//! commits every split artifact plus metadata. Strata and systems are
//! assembled by unioning their members' tarballs.

use crate::error::{BuildError, BuildResult};
use crate::staging::{self, StagingArea};
use async_trait::async_trait;
use morph_cache::{ArtifactMeta, ClaimOutcome, LocalArtifactCache};
use morph_core::graph::{ArtifactKind, BuildGraph, BuildUnit};
use morph_core::{BuildEnvironment, CacheKey, Config, GitRepoCache, Phase};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How a unit reached its terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The builder produced the artifacts.
    Built,
    /// The cache already had them.
    Cached,
}

/// Something that can satisfy one build unit. The local builder and the
/// distbuild dispatch both implement this; the plan executor only knows
/// the trait.
#[async_trait]
pub trait UnitBuilder: Send + Sync + 'static {
    async fn build(
        &self,
        graph: Arc<BuildGraph>,
        unit_index: usize,
        cancel: CancellationToken,
    ) -> BuildResult<BuildOutcome>;
}

/// Builds units on this host against the local artifact cache.
pub struct LocalBuilder {
    config: Config,
    cache: Arc<LocalArtifactCache>,
    git: Arc<dyn GitRepoCache>,
}

impl LocalBuilder {
    pub fn new(config: Config, cache: Arc<LocalArtifactCache>, git: Arc<dyn GitRepoCache>) -> Self {
        Self { config, cache, git }
    }

    /// All units sharing `key`: one build satisfies every one of them.
    fn group<'g>(graph: &'g BuildGraph, key: &CacheKey) -> Vec<&'g BuildUnit> {
        graph.units.iter().filter(|u| &u.cache_key == key).collect()
    }

    /// Metadata skeleton for a group; the caller fills `dependency_keys`.
    fn meta_for(group: &[&BuildUnit], started: OffsetDateTime) -> ArtifactMeta {
        let lead = group[0];
        let now = OffsetDateTime::now_utc();
        ArtifactMeta {
            cache_key: lead.cache_key,
            kind: lead.kind,
            source_name: lead.source_name.clone(),
            repo: lead.repo.clone(),
            sha1: lead.sha1.clone(),
            artifacts: group.iter().map(|u| u.name.clone()).collect(),
            dependency_keys: Vec::new(),
            build_started: started,
            build_ended: now,
            last_access: now,
        }
    }

    async fn build_chunk(
        &self,
        graph: &BuildGraph,
        unit_index: usize,
        mut claim: morph_cache::Claim,
        cancel: CancellationToken,
    ) -> BuildResult<BuildOutcome> {
        let unit = &graph.units[unit_index];
        let group = Self::group(graph, &unit.cache_key);
        let chunk = unit
            .chunk
            .as_ref()
            .ok_or_else(|| BuildError::Staging(format!("{} has no chunk morphology", unit.name)))?;
        let started = OffsetDateTime::now_utc();

        let staging = StagingArea::create(&self.config, unit)?;
        // Union of the group's dependencies, staged once each.
        let mut dep_indices: Vec<usize> = group
            .iter()
            .flat_map(|u| u.dependencies.iter().copied())
            .collect();
        dep_indices.sort_unstable();
        dep_indices.dedup();
        let union_unit = BuildUnit {
            dependencies: dep_indices.clone(),
            ..unit.clone()
        };
        staging.install_dependencies(&self.cache, graph, &union_unit)?;
        staging.checkout_source(&self.git, unit).await?;

        let max_jobs = chunk.max_jobs.unwrap_or_else(|| self.config.max_jobs());
        let env = BuildEnvironment::new(&self.config, &unit.prefix, unit.build_mode, max_jobs);
        let destdir = staging.destdir();
        let mut command_env = env.env().clone();
        // Inside the chroot, paths are root-relative; without it the build
        // sees the host filesystem and absolute staging paths.
        let sandbox = if self.config.staging_chroot {
            command_env.insert(
                "DESTDIR".to_string(),
                format!("/{}.inst", unit.source_name),
            );
            Sandbox::Chroot {
                root: staging.root().to_path_buf(),
                cwd: format!("/{}.build", unit.source_name),
            }
        } else {
            command_env.insert("DESTDIR".to_string(), destdir.display().to_string());
            Sandbox::Host {
                cwd: staging.build_dir(),
            }
        };

        let log_path = claim.build_log_partial();
        let mut log = File::create(&log_path)?;
        writeln!(log, "# build {} ({})", unit.source_name, unit.cache_key)?;

        for phase in Phase::ALL {
            let commands = chunk.commands_for(phase);
            if commands.is_empty() {
                continue;
            }
            writeln!(log, "# phase {phase}")?;
            for command in &commands {
                if cancel.is_cancelled() {
                    log.flush()?;
                    claim.abort()?;
                    staging.destroy()?;
                    return Err(BuildError::Cancelled);
                }
                writeln!(log, "# {command}")?;
                let exit = run_command(command, &sandbox, &command_env, &mut log).await?;
                if exit != 0 {
                    writeln!(log, "# command failed with exit code {exit}")?;
                    log.flush()?;
                    tracing::warn!(
                        unit = %unit.source_name,
                        phase = %phase,
                        exit_code = exit,
                        "build command failed"
                    );
                    claim.abort()?;
                    staging.destroy()?;
                    return Err(BuildError::BuildCommandFailed {
                        unit: unit.source_name.clone(),
                        phase,
                        exit_code: exit,
                    });
                }
            }
        }

        // Capture the install tree through the split rules.
        let all_paths = staging::walk_install_tree(&destdir)?;
        let file_paths: Vec<String> = all_paths
            .into_iter()
            .filter(|rel| {
                fs::symlink_metadata(destdir.join(rel))
                    .map(|m| !m.is_dir())
                    .unwrap_or(false)
            })
            .collect();
        let (groups, unmatched) =
            unit.split_rules
                .partition_files(file_paths.iter().map(|s| s.as_str()));
        if !unmatched.is_empty() {
            writeln!(log, "# {} files matched no split rule", unmatched.len())?;
        }
        for artifact_name in unit.split_rules.artifacts() {
            let empty = Vec::new();
            let members = groups.get(artifact_name).unwrap_or(&empty);
            let partial = claim.artifact_partial(ArtifactKind::Chunk, artifact_name);
            staging::pack_tarball(&destdir, members, &partial)?;
            writeln!(log, "# artifact {artifact_name}: {} files", members.len())?;
        }
        log.flush()?;

        let mut meta = Self::meta_for(&group, started);
        meta.dependency_keys = dep_keys(graph, &dep_indices);
        claim.write_meta(&meta)?;
        claim.commit()?;
        staging.destroy()?;
        tracing::info!(source = %unit.source_name, key = %unit.cache_key, "chunk built");
        Ok(BuildOutcome::Built)
    }

    async fn build_stratum(
        &self,
        graph: &BuildGraph,
        unit_index: usize,
        mut claim: morph_cache::Claim,
        cancel: CancellationToken,
    ) -> BuildResult<BuildOutcome> {
        let unit = &graph.units[unit_index];
        let group = Self::group(graph, &unit.cache_key);
        let started = OffsetDateTime::now_utc();

        let log_path = claim.build_log_partial();
        let mut log = File::create(&log_path)?;
        writeln!(log, "# assemble {} ({})", unit.source_name, unit.cache_key)?;

        let depths = graph.depths();
        let mut dep_indices: Vec<usize> = Vec::new();
        for stratum_unit in &group {
            if cancel.is_cancelled() {
                log.flush()?;
                claim.abort()?;
                return Err(BuildError::Cancelled);
            }
            let assemble = self
                .config
                .work_dir
                .join(format!("{}.{}.assemble", unit.cache_key.to_hex(), stratum_unit.name));
            if assemble.exists() {
                fs::remove_dir_all(&assemble)?;
            }
            fs::create_dir_all(&assemble)?;

            let mut members = stratum_unit.dependencies.clone();
            staging::sort_for_assembly(&mut members, graph, &depths);
            for &member in &members {
                let member_unit = &graph.units[member];
                let reader = self
                    .cache
                    .open_for_read(&member_unit.cache_key, member_unit.kind, &member_unit.name)
                    .map_err(|_| BuildError::MissingDependency {
                        name: member_unit.name.clone(),
                    })?;
                staging::unpack_tarball(reader, &assemble)?;
                writeln!(log, "# adding {}", member_unit.name)?;
            }
            dep_indices.extend(members);

            let partial = claim.artifact_partial(ArtifactKind::Stratum, &stratum_unit.name);
            staging::pack_tree(&assemble, &partial)?;
            fs::remove_dir_all(&assemble)?;
        }
        log.flush()?;

        dep_indices.sort_unstable();
        dep_indices.dedup();
        let mut meta = Self::meta_for(&group, started);
        meta.dependency_keys = dep_keys(graph, &dep_indices);
        claim.write_meta(&meta)?;
        claim.commit()?;
        tracing::info!(source = %unit.source_name, key = %unit.cache_key, "stratum assembled");
        Ok(BuildOutcome::Built)
    }

    async fn build_system(
        &self,
        graph: &BuildGraph,
        unit_index: usize,
        mut claim: morph_cache::Claim,
        cancel: CancellationToken,
    ) -> BuildResult<BuildOutcome> {
        let unit = &graph.units[unit_index];
        let group = Self::group(graph, &unit.cache_key);
        let started = OffsetDateTime::now_utc();

        let log_path = claim.build_log_partial();
        let mut log = File::create(&log_path)?;
        writeln!(log, "# assemble rootfs {} ({})", unit.source_name, unit.cache_key)?;

        let rootfs = self
            .config
            .work_dir
            .join(format!("{}.rootfs", unit.cache_key.to_hex()));
        if rootfs.exists() {
            fs::remove_dir_all(&rootfs)?;
        }
        fs::create_dir_all(&rootfs)?;

        let mut members = unit.dependencies.clone();
        staging::sort_for_assembly(&mut members, graph, &graph.depths());
        for &member in &members {
            if cancel.is_cancelled() {
                log.flush()?;
                claim.abort()?;
                fs::remove_dir_all(&rootfs)?;
                return Err(BuildError::Cancelled);
            }
            let member_unit = &graph.units[member];
            let reader = self
                .cache
                .open_for_read(&member_unit.cache_key, member_unit.kind, &member_unit.name)
                .map_err(|_| BuildError::MissingDependency {
                    name: member_unit.name.clone(),
                })?;
            staging::unpack_tarball(reader, &rootfs)?;
            writeln!(log, "# adding {}", member_unit.name)?;
        }

        let partial = claim.artifact_partial(ArtifactKind::System, &unit.name);
        staging::pack_tree(&rootfs, &partial)?;
        fs::remove_dir_all(&rootfs)?;
        log.flush()?;

        let mut meta = Self::meta_for(&group, started);
        meta.dependency_keys = dep_keys(graph, &members);
        claim.write_meta(&meta)?;
        claim.commit()?;
        tracing::info!(source = %unit.source_name, key = %unit.cache_key, "system assembled");
        Ok(BuildOutcome::Built)
    }
}

fn dep_keys(graph: &BuildGraph, indices: &[usize]) -> Vec<CacheKey> {
    let mut keys: Vec<CacheKey> = indices.iter().map(|&i| graph.units[i].cache_key).collect();
    keys.sort_unstable();
    keys.dedup();
    keys
}

#[async_trait]
impl UnitBuilder for LocalBuilder {
    async fn build(
        &self,
        graph: Arc<BuildGraph>,
        unit_index: usize,
        cancel: CancellationToken,
    ) -> BuildResult<BuildOutcome> {
        let unit = &graph.units[unit_index];
        let claim = match self.cache.claim(&unit.cache_key)? {
            ClaimOutcome::Done => {
                tracing::debug!(key = %unit.cache_key, "already cached, skipping");
                return Ok(BuildOutcome::Cached);
            }
            ClaimOutcome::Busy => {
                return Err(BuildError::Cache(morph_cache::CacheError::Busy(
                    unit.cache_key.to_hex(),
                )));
            }
            ClaimOutcome::Claimed(claim) => claim,
        };
        match unit.kind {
            ArtifactKind::Chunk => self.build_chunk(&graph, unit_index, claim, cancel).await,
            ArtifactKind::Stratum => self.build_stratum(&graph, unit_index, claim, cancel).await,
            ArtifactKind::System => self.build_system(&graph, unit_index, claim, cancel).await,
        }
    }
}

/// Where a build command runs.
enum Sandbox {
    /// Chrooted into the staging root; `cwd` is root-relative.
    Chroot { root: std::path::PathBuf, cwd: String },
    /// Directly on the host, for unprivileged builds.
    Host { cwd: std::path::PathBuf },
}

/// Run one shell command with merged stdout and stderr streamed into the
/// build log, line by line.
async fn run_command(
    command: &str,
    sandbox: &Sandbox,
    env: &BTreeMap<String, String>,
    log: &mut File,
) -> BuildResult<i32> {
    let mut invocation = Command::new("/bin/sh");
    invocation
        .arg("-c")
        .arg(command)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    match sandbox {
        Sandbox::Chroot { root, cwd } => {
            use std::ffi::CString;
            let root_c = CString::new(root.as_os_str().as_encoded_bytes().to_vec())
                .map_err(|e| BuildError::Staging(e.to_string()))?;
            let cwd_c = CString::new(cwd.as_bytes())
                .map_err(|e| BuildError::Staging(e.to_string()))?;
            // SAFETY: only async-signal-safe calls between fork and exec.
            unsafe {
                invocation.pre_exec(move || {
                    if libc::chroot(root_c.as_ptr()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::chdir(cwd_c.as_ptr()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        Sandbox::Host { cwd } => {
            invocation.current_dir(cwd);
        }
    }
    let mut child = invocation.spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BuildError::Staging("child stdout unavailable".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| BuildError::Staging("child stderr unavailable".to_string()))?;

    // Each pipe gets its own pump so neither can block the other.
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let tx_err = tx.clone();
    let out_pump = tokio::spawn(pump_lines(stdout, tx));
    let err_pump = tokio::spawn(pump_lines(stderr, tx_err));

    while let Some(line) = rx.recv().await {
        tracing::debug!(target: "build-output", "{line}");
        writeln!(log, "{line}")?;
    }
    let _ = out_pump.await;
    let _ = err_pump.await;

    let status = child.wait().await?;
    Ok(status.code().unwrap_or(-1))
}

/// Read `\n`-terminated byte lines and forward them as text, draining the
/// pipe to EOF. Reading raw bytes keeps a tool that emits non-UTF-8 output
/// from stalling against a full pipe buffer.
async fn pump_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if tx.send(line_to_text(&buf)).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Build output is UTF-8 text; a non-UTF-8 line is carried base64-encoded.
fn line_to_text(line: &[u8]) -> String {
    let mut line = line;
    if line.last() == Some(&b'\n') {
        line = &line[..line.len() - 1];
    }
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    match std::str::from_utf8(line) {
        Ok(text) => text.to_string(),
        Err(_) => {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(line)
        }
    }
}
