//! The scrubbed environment build commands run in.
//!
//! Builds see a whitelisted copy of the host environment plus a fixed set
//! of overrides, so host state cannot leak into artifacts. Only a stable
//! subset of the result participates in cache keys.

use crate::config::Config;
use crate::morphology::BuildMode;
use serde_json::json;
use std::collections::BTreeMap;

/// Host variables a build is allowed to keep.
const WHITELIST: &[&str] = &[
    "DISTCC_HOSTS",
    "TMPDIR",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "FAKEROOTKEY",
    "FAKED_MODE",
    "FAKEROOT_FD_BASE",
];

const DEFAULT_PATH: &str = "/sbin:/usr/sbin:/bin:/usr/bin";
const OVERRIDE_USERNAME: &str = "morph";

/// The environment for one chunk build.
#[derive(Clone, Debug)]
pub struct BuildEnvironment {
    env: BTreeMap<String, String>,
    arch: String,
    bootstrap: bool,
}

impl BuildEnvironment {
    /// Construct the scrubbed environment for a chunk with the given
    /// prefix and mode. `DESTDIR` is staging-specific and added by the
    /// builder, not here.
    pub fn new(config: &Config, prefix: &str, build_mode: BuildMode, max_jobs: u32) -> Self {
        let bootstrap = build_mode == BuildMode::Bootstrap;
        let mut env = BTreeMap::new();

        for name in WHITELIST {
            if let Ok(value) = std::env::var(name) {
                env.insert(name.to_string(), value);
            }
        }

        env.insert("TERM".to_string(), "dumb".to_string());
        env.insert("SHELL".to_string(), "/bin/sh".to_string());
        env.insert("USER".to_string(), OVERRIDE_USERNAME.to_string());
        env.insert("USERNAME".to_string(), OVERRIDE_USERNAME.to_string());
        env.insert("LOGNAME".to_string(), OVERRIDE_USERNAME.to_string());
        env.insert("LC_ALL".to_string(), "C".to_string());
        env.insert("HOME".to_string(), "/tmp".to_string());

        let mut path = if config.keep_path || bootstrap {
            std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string())
        } else {
            DEFAULT_PATH.to_string()
        };
        path = format!("{}/bin:{}", config.tools_prefix, path);
        if prefix != config.tools_prefix {
            path = format!("{prefix}/bin:{path}");
        }
        if !config.no_ccache {
            path = format!("{}:{}", config.ccache_dir.display(), path);
        }
        env.insert("PATH".to_string(), path);

        env.insert("TOOLCHAIN_TARGET".to_string(), config.toolchain_target());
        env.insert("CFLAGS".to_string(), config.target_cflags.clone());
        env.insert("PREFIX".to_string(), prefix.to_string());
        env.insert(
            "BOOTSTRAP".to_string(),
            if bootstrap { "true" } else { "false" }.to_string(),
        );
        env.insert("MAKEFLAGS".to_string(), format!("-j{max_jobs}"));

        Self {
            env,
            arch: config.arch.clone(),
            bootstrap,
        }
    }

    /// The full environment map, for running build commands.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap
    }

    /// The policy subset that participates in cache keys. Deliberately
    /// excludes anything host-dependent such as PATH or TMPDIR.
    pub fn cache_id(&self) -> serde_json::Value {
        json!({
            "arch": self.arch,
            "target": self.env.get("TOOLCHAIN_TARGET"),
            "cflags": self.env.get("CFLAGS"),
            "prefix": self.env.get("PREFIX"),
            "bootstrap": self.env.get("BOOTSTRAP"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn config() -> Config {
        let mut config = Config::for_testing(Path::new("/nonexistent"));
        config.keep_path = false;
        config
    }

    #[test]
    fn sets_the_always_present_variables() {
        let env = BuildEnvironment::new(&config(), "/usr", BuildMode::Normal, 4);
        let map = env.env();
        assert_eq!(map.get("PREFIX").unwrap(), "/usr");
        assert_eq!(map.get("BOOTSTRAP").unwrap(), "false");
        assert_eq!(map.get("MAKEFLAGS").unwrap(), "-j4");
        assert_eq!(map.get("LC_ALL").unwrap(), "C");
        assert_eq!(map.get("TOOLCHAIN_TARGET").unwrap(), "x86_64-morph-linux-gnu");
    }

    #[test]
    fn bootstrap_mode_flips_the_flag_and_keeps_host_path() {
        let env = BuildEnvironment::new(&config(), "/tools", BuildMode::Bootstrap, 1);
        assert_eq!(env.env().get("BOOTSTRAP").unwrap(), "true");
        assert!(env.is_bootstrap());
    }

    #[test]
    fn scrubbed_path_starts_from_the_fixed_default() {
        let env = BuildEnvironment::new(&config(), "/usr", BuildMode::Normal, 1);
        let path = env.env().get("PATH").unwrap();
        assert!(path.contains("/tools/bin"));
        assert!(path.ends_with(DEFAULT_PATH));
    }

    #[test]
    fn chunk_prefix_bin_is_on_the_path() {
        let env = BuildEnvironment::new(&config(), "/plover", BuildMode::Normal, 1);
        let path = env.env().get("PATH").unwrap();
        assert!(path.starts_with("/plover/bin:"));
    }

    #[test]
    fn host_junk_does_not_leak() {
        let env = BuildEnvironment::new(&config(), "/usr", BuildMode::Normal, 1);
        assert!(!env.env().contains_key("CARGO_HOME"));
        assert!(!env.env().contains_key("HOSTNAME"));
    }

    #[test]
    fn cache_id_ignores_path_and_tmpdir() {
        let mut a = config();
        a.keep_path = false;
        let mut b = config();
        b.keep_path = true;
        let env_a = BuildEnvironment::new(&a, "/usr", BuildMode::Normal, 2);
        let env_b = BuildEnvironment::new(&b, "/usr", BuildMode::Normal, 8);
        assert_eq!(env_a.cache_id(), env_b.cache_id());
    }
}
