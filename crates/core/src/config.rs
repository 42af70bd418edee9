//! Configuration types shared across crates.
//!
//! A single `Config` value is created at startup (binaries load it through
//! figment from a TOML file merged with `MORPH_`-prefixed environment
//! variables) and threaded down explicitly; nothing reads it from a global.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Cache directory; artifacts live under `artifacts/`, bare git
    /// mirrors under `gits/`.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Scratch directory for staging areas.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Target architecture (e.g. "x86_64").
    #[serde(default = "default_arch")]
    pub arch: String,
    /// Toolchain target triplet, exported as TOOLCHAIN_TARGET.
    #[serde(default)]
    pub toolchain_target: Option<String>,
    /// CFLAGS exported into every build.
    #[serde(default = "default_target_cflags")]
    pub target_cflags: String,
    /// Prefix bootstrap-mode chunks install into.
    #[serde(default = "default_tools_prefix")]
    pub tools_prefix: String,
    /// Keep the host PATH inside builds instead of the fixed default.
    #[serde(default)]
    pub keep_path: bool,
    /// Chroot build commands into the staging root. Needs privileges;
    /// disable for unprivileged builds and tests.
    #[serde(default = "default_staging_chroot")]
    pub staging_chroot: bool,
    /// Disable the ccache wrapper directory.
    #[serde(default)]
    pub no_ccache: bool,
    /// Directory holding ccache compiler wrappers.
    #[serde(default = "default_ccache_dir")]
    pub ccache_dir: PathBuf,
    /// Parallelism for `MAKEFLAGS=-jN`; defaults to the host CPU count.
    #[serde(default)]
    pub max_jobs: Option<u32>,
    /// Worker-pool width for the local plan executor.
    #[serde(default = "default_build_width")]
    pub build_width: usize,
    /// Base URL of the shared artifact cache, if any.
    #[serde(default)]
    pub shared_cache: Option<String>,
    /// Distributed build configuration.
    #[serde(default)]
    pub distbuild: DistbuildConfig,
    /// Cache server configuration.
    #[serde(default)]
    pub server: CacheServerConfig,
}

/// Distributed build configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DistbuildConfig {
    /// Address the controller listens on for initiators.
    #[serde(default = "default_controller_bind")]
    pub controller_bind: String,
    /// Address a worker daemon listens on for its controller.
    #[serde(default = "default_worker_bind")]
    pub worker_bind: String,
    /// Workers the controller dials out to.
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    /// Delay before re-dialling a lost worker, in seconds.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// Command the controller asks workers to run for one unit; the cache
    /// key is appended and the build graph arrives on stdin.
    #[serde(default = "default_build_command")]
    pub build_command: Vec<String>,
}

/// One worker as seen from the controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// TCP address of the worker daemon.
    pub addr: String,
    /// Base URL of the worker's local cache server (read-only from here).
    pub cache_url: Option<String>,
}

/// Remote artifact cache server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheServerConfig {
    /// Bind address (e.g. "0.0.0.0:8080").
    #[serde(default = "default_server_bind")]
    pub bind: String,
    /// Accept POST uploads and server-side fetches.
    #[serde(default)]
    pub enable_writes: bool,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./work")
}

fn default_arch() -> String {
    std::env::consts::ARCH.to_string()
}

fn default_target_cflags() -> String {
    "-O2 -g".to_string()
}

fn default_tools_prefix() -> String {
    "/tools".to_string()
}

fn default_ccache_dir() -> PathBuf {
    PathBuf::from("/usr/lib/ccache")
}

fn default_staging_chroot() -> bool {
    true
}

fn default_build_width() -> usize {
    1
}

fn default_controller_bind() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_worker_bind() -> String {
    "127.0.0.1:3434".to_string()
}

fn default_reconnect_delay_secs() -> u64 {
    30
}

fn default_build_command() -> Vec<String> {
    vec!["morph".to_string(), "build-artifact".to_string()]
}

fn default_server_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            work_dir: default_work_dir(),
            arch: default_arch(),
            toolchain_target: None,
            target_cflags: default_target_cflags(),
            tools_prefix: default_tools_prefix(),
            keep_path: false,
            staging_chroot: default_staging_chroot(),
            no_ccache: false,
            ccache_dir: default_ccache_dir(),
            max_jobs: None,
            build_width: default_build_width(),
            shared_cache: None,
            distbuild: DistbuildConfig::default(),
            server: CacheServerConfig::default(),
        }
    }
}

impl Default for DistbuildConfig {
    fn default() -> Self {
        Self {
            controller_bind: default_controller_bind(),
            worker_bind: default_worker_bind(),
            workers: Vec::new(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            build_command: default_build_command(),
        }
    }
}

impl Default for CacheServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            enable_writes: false,
        }
    }
}

impl Config {
    /// The toolchain target triplet, derived from the arch when unset.
    pub fn toolchain_target(&self) -> String {
        self.toolchain_target
            .clone()
            .unwrap_or_else(|| format!("{}-morph-linux-gnu", self.arch))
    }

    /// Parallelism for MAKEFLAGS, falling back to the host CPU count.
    pub fn max_jobs(&self) -> u32 {
        self.max_jobs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        })
    }

    /// Directory holding cached artifacts.
    pub fn artifact_dir(&self) -> PathBuf {
        self.cache_dir.join("artifacts")
    }

    /// Directory holding bare git mirrors.
    pub fn git_dir(&self) -> PathBuf {
        self.cache_dir.join("gits")
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.build_width == 0 {
            return Err("build_width must be at least 1".to_string());
        }
        if let Some(0) = self.max_jobs {
            return Err("max_jobs must be at least 1".to_string());
        }
        if self.tools_prefix.is_empty() || !self.tools_prefix.starts_with('/') {
            return Err(format!(
                "tools_prefix must be an absolute path, got {:?}",
                self.tools_prefix
            ));
        }
        Ok(())
    }

    /// Create a test configuration rooted in a scratch directory.
    ///
    /// **For testing only.**
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            cache_dir: root.join("cache"),
            work_dir: root.join("work"),
            arch: "x86_64".to_string(),
            toolchain_target: Some("x86_64-morph-linux-gnu".to_string()),
            keep_path: true,
            staging_chroot: false,
            no_ccache: true,
            max_jobs: Some(2),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert!(config.max_jobs() >= 1);
        assert!(config.artifact_dir().ends_with("artifacts"));
    }

    #[test]
    fn toolchain_target_derived_from_arch() {
        let mut config = Config::default();
        config.arch = "armv7".to_string();
        config.toolchain_target = None;
        assert_eq!(config.toolchain_target(), "armv7-morph-linux-gnu");
        config.toolchain_target = Some("armv7lhf-custom-linux-gnueabi".to_string());
        assert_eq!(config.toolchain_target(), "armv7lhf-custom-linux-gnueabi");
    }

    #[test]
    fn rejects_zero_build_width() {
        let mut config = Config::default();
        config.build_width = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserialize_with_defaults() {
        let config: Config = serde_json::from_str(r#"{"arch": "x86_64"}"#).unwrap();
        assert_eq!(config.target_cflags, "-O2 -g");
        assert!(!config.server.enable_writes);
    }
}
