//! Predefined command sequences for known build systems.
//!
//! A chunk that declares `build-system: autotools` gets the autotools
//! defaults for every phase it does not spell out itself; `manual` supplies
//! nothing and the morphology must carry all commands.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The canonical build phases, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    PreConfigure,
    Configure,
    PostConfigure,
    PreBuild,
    Build,
    PostBuild,
    PreInstall,
    Install,
    PostInstall,
    Strip,
}

impl Phase {
    /// All phases in canonical execution order.
    pub const ALL: [Phase; 10] = [
        Phase::PreConfigure,
        Phase::Configure,
        Phase::PostConfigure,
        Phase::PreBuild,
        Phase::Build,
        Phase::PostBuild,
        Phase::PreInstall,
        Phase::Install,
        Phase::PostInstall,
        Phase::Strip,
    ];

    /// The phase name as it appears in morphology text.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::PreConfigure => "pre-configure",
            Phase::Configure => "configure",
            Phase::PostConfigure => "post-configure",
            Phase::PreBuild => "pre-build",
            Phase::Build => "build",
            Phase::PostBuild => "post-build",
            Phase::PreInstall => "pre-install",
            Phase::Install => "install",
            Phase::PostInstall => "post-install",
            Phase::Strip => "strip",
        }
    }

    /// The morphology field carrying this phase's commands.
    pub fn field(&self) -> String {
        format!("{}-commands", self.name())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A known build system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildSystem {
    Manual,
    Autotools,
    Cmake,
    PythonDistutils,
}

impl BuildSystem {
    /// All known build systems.
    pub const ALL: [BuildSystem; 4] = [
        BuildSystem::Manual,
        BuildSystem::Autotools,
        BuildSystem::Cmake,
        BuildSystem::PythonDistutils,
    ];

    /// Look up a build system by its morphology name.
    pub fn from_name(name: &str) -> crate::Result<Self> {
        match name {
            "manual" => Ok(BuildSystem::Manual),
            "autotools" => Ok(BuildSystem::Autotools),
            "cmake" => Ok(BuildSystem::Cmake),
            "python-distutils" => Ok(BuildSystem::PythonDistutils),
            other => Err(crate::Error::UnknownBuildSystem(other.to_string())),
        }
    }

    /// The morphology name of this build system.
    pub fn name(&self) -> &'static str {
        match self {
            BuildSystem::Manual => "manual",
            BuildSystem::Autotools => "autotools",
            BuildSystem::Cmake => "cmake",
            BuildSystem::PythonDistutils => "python-distutils",
        }
    }

    /// Default commands for a phase. Empty for phases the build system
    /// does not define, and for everything under `manual`.
    pub fn default_commands(&self, phase: Phase) -> Vec<String> {
        let commands: &[&str] = match (self, phase) {
            (BuildSystem::Autotools, Phase::Configure) => &[
                "export NOCONFIGURE=1; \
                 if [ -e autogen ]; then ./autogen; \
                 elif [ -e autogen.sh ]; then ./autogen.sh; \
                 elif [ ! -e ./configure ]; then autoreconf -ivf; fi",
                "./configure --prefix=\"$PREFIX\"",
            ],
            (BuildSystem::Autotools, Phase::Build) => &["make"],
            (BuildSystem::Autotools, Phase::Install) => &["make DESTDIR=\"$DESTDIR\" install"],
            (BuildSystem::Cmake, Phase::Configure) => {
                &["cmake -DCMAKE_INSTALL_PREFIX=\"$PREFIX\" ."]
            }
            (BuildSystem::Cmake, Phase::Build) => &["make"],
            (BuildSystem::Cmake, Phase::Install) => &["make DESTDIR=\"$DESTDIR\" install"],
            (BuildSystem::PythonDistutils, Phase::Build) => &["python setup.py build"],
            (BuildSystem::PythonDistutils, Phase::Install) => {
                &["python setup.py install --prefix \"$PREFIX\" --root \"$DESTDIR\""]
            }
            _ => &[],
        };
        commands.iter().map(|c| c.to_string()).collect()
    }
}

impl Default for BuildSystem {
    fn default() -> Self {
        BuildSystem::Manual
    }
}

impl fmt::Display for BuildSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
