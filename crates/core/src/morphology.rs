//! Morphology loading and validation.
//!
//! A morphology is a YAML mapping with a `kind` tag. The loader parses the
//! text, rejects unknown top-level keys, fills defaults, validates against
//! the kind's schema and yields a typed record. The `canonical()` form has
//! every default inlined and serialises with sorted keys, so equivalent
//! inputs are byte-identical; that form feeds the cache key.

use crate::buildsystem::{BuildSystem, Phase};
use serde::{Deserialize, Serialize};
use serde_json::{Value as Json, json};
use serde_yaml::Value as Yaml;
use std::collections::BTreeMap;

/// Morphology kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MorphologyKind {
    Chunk,
    Stratum,
    System,
    Cluster,
}

impl MorphologyKind {
    pub fn name(&self) -> &'static str {
        match self {
            MorphologyKind::Chunk => "chunk",
            MorphologyKind::Stratum => "stratum",
            MorphologyKind::System => "system",
            MorphologyKind::Cluster => "cluster",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "chunk" => Some(MorphologyKind::Chunk),
            "stratum" => Some(MorphologyKind::Stratum),
            "system" => Some(MorphologyKind::System),
            "cluster" => Some(MorphologyKind::Cluster),
            _ => None,
        }
    }
}

/// How a chunk participates in staging and output assembly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Installed only into the output.
    Normal,
    /// Installed into later staging areas and the output.
    Test,
    /// Installed under the tools prefix, staging only.
    Bootstrap,
}

impl BuildMode {
    pub fn name(&self) -> &'static str {
        match self {
            BuildMode::Normal => "normal",
            BuildMode::Test => "test",
            BuildMode::Bootstrap => "bootstrap",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "normal" => Some(BuildMode::Normal),
            "test" => Some(BuildMode::Test),
            "bootstrap" => Some(BuildMode::Bootstrap),
            _ => None,
        }
    }
}

impl Default for BuildMode {
    fn default() -> Self {
        BuildMode::Normal
    }
}

/// One `products` entry: route matching items into the named artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductSpec {
    pub artifact: String,
    pub include: Vec<String>,
}

/// A chunk morphology: one source project and how to build it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkMorphology {
    pub name: String,
    pub build_system: BuildSystem,
    /// Explicit per-phase command lists; absent phases fall back to the
    /// build system's defaults.
    pub commands: BTreeMap<Phase, Vec<String>>,
    pub products: Vec<ProductSpec>,
    pub max_jobs: Option<u32>,
    pub description: Option<String>,
}

impl ChunkMorphology {
    /// Effective commands for a phase: explicit, else build-system default.
    pub fn commands_for(&self, phase: Phase) -> Vec<String> {
        match self.commands.get(&phase) {
            Some(explicit) => explicit.clone(),
            None => self.build_system.default_commands(phase),
        }
    }

    /// A synthetic morphology for a chunk spec that names its build system
    /// inline instead of shipping a `.morph` file.
    pub fn synthesised(name: &str, build_system: BuildSystem) -> Self {
        Self {
            name: name.to_string(),
            build_system,
            commands: BTreeMap::new(),
            products: Vec::new(),
            max_jobs: None,
            description: None,
        }
    }
}

/// A chunk reference inside a stratum.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub name: String,
    pub repo: String,
    #[serde(rename = "ref")]
    pub ref_: String,
    /// Path of the chunk morphology inside the chunk repo.
    pub morph: String,
    /// Names of earlier chunks in the same stratum this chunk needs staged.
    pub build_depends: Vec<String>,
    pub build_mode: BuildMode,
    pub prefix: String,
    /// Inline build system for repos that carry no morphology file.
    pub build_system: Option<BuildSystem>,
}

/// A stratum's dependency on another stratum.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StratumRef {
    /// Path of the depended-on stratum morphology in the definitions repo.
    pub morph: String,
    /// Restrict to these stratum artifacts; `None` exposes all.
    pub artifacts: Option<Vec<String>>,
}

/// A stratum morphology: a named collection of chunks with build ordering.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StratumMorphology {
    pub name: String,
    pub build_depends: Vec<StratumRef>,
    pub chunks: Vec<ChunkSpec>,
    pub products: Vec<ProductSpec>,
    pub description: Option<String>,
}

/// A stratum reference inside a system.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemStratumSpec {
    pub name: String,
    pub morph: String,
    /// Subset of the stratum's artifacts to include; `None` takes all.
    pub artifacts: Option<Vec<String>>,
}

/// A system morphology: strata assembled into a root filesystem.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemMorphology {
    pub name: String,
    pub arch: String,
    pub strata: Vec<SystemStratumSpec>,
    pub configuration_extensions: Vec<String>,
    pub description: Option<String>,
}

/// A cluster morphology. Deployment is outside the build core, so the
/// systems list is carried opaquely.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterMorphology {
    pub name: String,
    pub systems: Vec<Json>,
    pub description: Option<String>,
}

/// A loaded, validated morphology.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Morphology {
    Chunk(ChunkMorphology),
    Stratum(StratumMorphology),
    System(SystemMorphology),
    Cluster(ClusterMorphology),
}

impl Morphology {
    pub fn kind(&self) -> MorphologyKind {
        match self {
            Morphology::Chunk(_) => MorphologyKind::Chunk,
            Morphology::Stratum(_) => MorphologyKind::Stratum,
            Morphology::System(_) => MorphologyKind::System,
            Morphology::Cluster(_) => MorphologyKind::Cluster,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Morphology::Chunk(m) => &m.name,
            Morphology::Stratum(m) => &m.name,
            Morphology::System(m) => &m.name,
            Morphology::Cluster(m) => &m.name,
        }
    }

    /// Canonical form: defaults inlined, cosmetic fields dropped, keys
    /// sorted by serde_json's map. Equivalent morphologies serialise to
    /// identical bytes; this is what cache keys hash.
    pub fn canonical(&self) -> Json {
        match self {
            Morphology::Chunk(m) => {
                let mut map = serde_json::Map::new();
                map.insert("kind".into(), json!("chunk"));
                map.insert("name".into(), json!(m.name));
                map.insert("build-system".into(), json!(m.build_system.name()));
                map.insert(
                    "products".into(),
                    json!(
                        m.products
                            .iter()
                            .map(|p| json!({"artifact": p.artifact, "include": p.include}))
                            .collect::<Vec<_>>()
                    ),
                );
                if let Some(max_jobs) = m.max_jobs {
                    map.insert("max-jobs".into(), json!(max_jobs));
                }
                for phase in Phase::ALL {
                    if let Some(commands) = m.commands.get(&phase) {
                        map.insert(phase.field(), json!(commands));
                    }
                }
                Json::Object(map)
            }
            Morphology::Stratum(m) => json!({
                "kind": "stratum",
                "name": m.name,
                "build-depends": m.build_depends
                    .iter()
                    .map(|d| json!({"morph": d.morph, "artifacts": d.artifacts}))
                    .collect::<Vec<_>>(),
                "chunks": m.chunks
                    .iter()
                    .map(|c| json!({
                        "name": c.name,
                        "repo": c.repo,
                        "ref": c.ref_,
                        "morph": c.morph,
                        "build-depends": c.build_depends,
                        "build-mode": c.build_mode.name(),
                        "prefix": c.prefix,
                        "build-system": c.build_system.map(|b| b.name()),
                    }))
                    .collect::<Vec<_>>(),
                "products": m.products
                    .iter()
                    .map(|p| json!({"artifact": p.artifact, "include": p.include}))
                    .collect::<Vec<_>>(),
            }),
            Morphology::System(m) => json!({
                "kind": "system",
                "name": m.name,
                "arch": m.arch,
                "strata": m.strata
                    .iter()
                    .map(|s| json!({
                        "name": s.name,
                        "morph": s.morph,
                        "artifacts": s.artifacts,
                    }))
                    .collect::<Vec<_>>(),
                "configuration-extensions": m.configuration_extensions,
            }),
            Morphology::Cluster(m) => json!({
                "kind": "cluster",
                "name": m.name,
                "systems": m.systems,
            }),
        }
    }
}

/// Known target architectures.
pub const KNOWN_ARCHES: &[&str] = &[
    "x86_32", "x86_64", "armv7l", "armv7lhf", "armv8l64", "armv8b64", "ppc64", "mips64b",
    "testarch",
];

/// Loads morphology text into typed records.
#[derive(Clone, Debug, Default)]
pub struct MorphologyLoader;

impl MorphologyLoader {
    pub fn new() -> Self {
        Self
    }

    /// Parse and validate one morphology document.
    ///
    /// `filename` is used for error context and to default `name`;
    /// `kind_hint`, when given, must match the document's `kind`.
    pub fn load(
        &self,
        text: &str,
        filename: &str,
        kind_hint: Option<MorphologyKind>,
    ) -> crate::Result<Morphology> {
        let doc: Yaml = serde_yaml::from_str(text).map_err(|e| invalid(filename, e))?;
        let mapping = match doc {
            Yaml::Mapping(m) => m,
            _ => return Err(invalid(filename, "document is not a mapping")),
        };

        let mut fields = Fields::new(filename, mapping)?;

        let kind_name = fields.require_str("kind")?;
        let kind = MorphologyKind::from_name(&kind_name)
            .ok_or_else(|| invalid(filename, format!("unknown kind {kind_name:?}")))?;
        if let Some(hint) = kind_hint {
            if hint != kind {
                return Err(invalid(
                    filename,
                    format!("expected a {} morphology, found {}", hint.name(), kind.name()),
                ));
            }
        }

        let default_name = filename_stem(filename);
        let morph = match kind {
            MorphologyKind::Chunk => Morphology::Chunk(self.load_chunk(&mut fields, &default_name)?),
            MorphologyKind::Stratum => {
                Morphology::Stratum(self.load_stratum(&mut fields, &default_name)?)
            }
            MorphologyKind::System => {
                Morphology::System(self.load_system(&mut fields, &default_name)?)
            }
            MorphologyKind::Cluster => {
                Morphology::Cluster(self.load_cluster(&mut fields, &default_name)?)
            }
        };
        fields.reject_unknown()?;
        Ok(morph)
    }

    fn load_chunk(&self, fields: &mut Fields, default_name: &str) -> crate::Result<ChunkMorphology> {
        let name = fields.opt_str("name")?.unwrap_or_else(|| default_name.to_string());
        let build_system_name = fields.opt_str("build-system")?;
        let build_system = match build_system_name {
            Some(bs_name) => BuildSystem::from_name(&bs_name)
                .map_err(|e| invalid(fields.filename, e.to_string()))?,
            None => BuildSystem::Manual,
        };

        let mut commands = BTreeMap::new();
        for phase in Phase::ALL {
            if let Some(list) = fields.opt_string_list(&phase.field())? {
                commands.insert(phase, list);
            }
        }

        let products = fields.opt_products("products")?;
        let max_jobs = fields.opt_u32("max-jobs")?;
        let description = fields.opt_str("description")?;

        if build_system == BuildSystem::Manual && !commands.contains_key(&Phase::Install) {
            return Err(invalid(
                fields.filename,
                format!("chunk {name}: manual build system needs install-commands"),
            ));
        }

        Ok(ChunkMorphology {
            name,
            build_system,
            commands,
            products,
            max_jobs,
            description,
        })
    }

    fn load_stratum(
        &self,
        fields: &mut Fields,
        default_name: &str,
    ) -> crate::Result<StratumMorphology> {
        let filename = fields.filename;
        let name = fields.opt_str("name")?.unwrap_or_else(|| default_name.to_string());
        let description = fields.opt_str("description")?;
        let products = fields.opt_products("products")?;

        let build_depends = match fields.take("build-depends") {
            None => Vec::new(),
            Some(value) => {
                let seq = as_seq(filename, "build-depends", value)?;
                seq.into_iter()
                    .map(|item| self.load_stratum_ref(filename, item))
                    .collect::<crate::Result<Vec<_>>>()?
            }
        };

        let chunks_value = fields
            .take("chunks")
            .ok_or_else(|| invalid(filename, format!("stratum {name}: empty stratum")))?;
        let chunk_values = as_seq(filename, "chunks", chunks_value)?;
        if chunk_values.is_empty() {
            return Err(invalid(filename, format!("stratum {name}: empty stratum")));
        }

        let mut chunks = Vec::new();
        let mut seen = Vec::new();
        for value in chunk_values {
            let spec = self.load_chunk_spec(filename, &name, value)?;
            if seen.contains(&spec.name) {
                return Err(invalid(
                    filename,
                    format!("stratum {name}: duplicate chunk {}", spec.name),
                ));
            }
            for dep in &spec.build_depends {
                if dep == &spec.name {
                    return Err(invalid(
                        filename,
                        format!("chunk {} depends on itself", spec.name),
                    ));
                }
                if !seen.contains(dep) {
                    return Err(invalid(
                        filename,
                        format!(
                            "chunk {}: build-depends references {dep:?}, which is not an \
                             earlier chunk in stratum {name}",
                            spec.name
                        ),
                    ));
                }
            }
            seen.push(spec.name.clone());
            chunks.push(spec);
        }

        Ok(StratumMorphology {
            name,
            build_depends,
            chunks,
            products,
            description,
        })
    }

    fn load_stratum_ref(&self, filename: &str, value: Yaml) -> crate::Result<StratumRef> {
        match value {
            Yaml::String(morph) => Ok(StratumRef {
                morph,
                artifacts: None,
            }),
            Yaml::Mapping(mapping) => {
                let mut fields = Fields::new(filename, mapping)?;
                let morph = fields.require_str("morph")?;
                let artifacts = fields.opt_string_list("artifacts")?;
                fields.reject_unknown()?;
                Ok(StratumRef { morph, artifacts })
            }
            _ => Err(invalid(filename, "build-depends entries must be mappings")),
        }
    }

    fn load_chunk_spec(
        &self,
        filename: &str,
        stratum: &str,
        value: Yaml,
    ) -> crate::Result<ChunkSpec> {
        let mapping = match value {
            Yaml::Mapping(m) => m,
            _ => return Err(invalid(filename, "chunk specs must be mappings")),
        };
        let mut fields = Fields::new(filename, mapping)?;
        let name = fields.require_str("name")?;
        let repo = fields.require_str("repo")?;
        let ref_ = fields.require_str("ref")?;
        if ref_.is_empty() {
            return Err(invalid(
                filename,
                format!("chunk {name} in stratum {stratum} has an empty ref"),
            ));
        }
        let morph = fields
            .opt_str("morph")?
            .unwrap_or_else(|| format!("{name}.morph"));
        let build_depends = fields.opt_string_list("build-depends")?.unwrap_or_default();
        let build_mode = match fields.opt_str("build-mode")? {
            None => BuildMode::Normal,
            Some(mode) => BuildMode::from_name(&mode).ok_or_else(|| {
                invalid(
                    filename,
                    format!("chunk {name}: unknown build-mode {mode:?}"),
                )
            })?,
        };
        let prefix = fields.opt_str("prefix")?.unwrap_or_else(|| "/usr".to_string());
        let build_system = match fields.opt_str("build-system")? {
            None => None,
            Some(bs_name) => Some(
                BuildSystem::from_name(&bs_name).map_err(|e| invalid(filename, e.to_string()))?,
            ),
        };
        fields.reject_unknown()?;
        Ok(ChunkSpec {
            name,
            repo,
            ref_,
            morph,
            build_depends,
            build_mode,
            prefix,
            build_system,
        })
    }

    fn load_system(
        &self,
        fields: &mut Fields,
        default_name: &str,
    ) -> crate::Result<SystemMorphology> {
        let filename = fields.filename;
        let name = fields.opt_str("name")?.unwrap_or_else(|| default_name.to_string());
        let description = fields.opt_str("description")?;

        let arch = fields.require_str("arch")?;
        if !KNOWN_ARCHES.contains(&arch.as_str()) {
            return Err(invalid(filename, format!("unknown architecture {arch:?}")));
        }

        let strata_value = fields
            .take("strata")
            .ok_or_else(|| invalid(filename, format!("system {name} has no strata")))?;
        let strata_values = as_seq(filename, "strata", strata_value)?;
        if strata_values.is_empty() {
            return Err(invalid(filename, format!("system {name} has no strata")));
        }

        let mut strata = Vec::new();
        let mut seen = Vec::new();
        for value in strata_values {
            let mapping = match value {
                Yaml::Mapping(m) => m,
                _ => return Err(invalid(filename, "strata entries must be mappings")),
            };
            let mut entry = Fields::new(filename, mapping)?;
            let morph = entry.require_str("morph")?;
            let stratum_name = entry
                .opt_str("name")?
                .unwrap_or_else(|| filename_stem(&morph));
            let artifacts = entry.opt_string_list("artifacts")?;
            entry.reject_unknown()?;
            if seen.contains(&stratum_name) {
                return Err(invalid(
                    filename,
                    format!("system {name}: duplicate stratum {stratum_name}"),
                ));
            }
            seen.push(stratum_name.clone());
            strata.push(SystemStratumSpec {
                name: stratum_name,
                morph,
                artifacts,
            });
        }

        let configuration_extensions = fields
            .opt_string_list("configuration-extensions")?
            .unwrap_or_default();

        Ok(SystemMorphology {
            name,
            arch,
            strata,
            configuration_extensions,
            description,
        })
    }

    fn load_cluster(
        &self,
        fields: &mut Fields,
        default_name: &str,
    ) -> crate::Result<ClusterMorphology> {
        let filename = fields.filename;
        let name = fields.opt_str("name")?.unwrap_or_else(|| default_name.to_string());
        let description = fields.opt_str("description")?;
        let systems = match fields.take("systems") {
            None => return Err(invalid(filename, format!("cluster {name} has no systems"))),
            Some(value) => as_seq(filename, "systems", value)?
                .iter()
                .map(|v| yaml_to_json(filename, v))
                .collect::<crate::Result<Vec<_>>>()?,
        };
        Ok(ClusterMorphology {
            name,
            systems,
            description,
        })
    }
}

fn invalid(path: &str, reason: impl ToString) -> crate::Error {
    crate::Error::InvalidMorphology {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

fn filename_stem(filename: &str) -> String {
    let base = filename.rsplit('/').next().unwrap_or(filename);
    base.strip_suffix(".morph").unwrap_or(base).to_string()
}

fn as_seq(filename: &str, field: &str, value: Yaml) -> crate::Result<Vec<Yaml>> {
    match value {
        Yaml::Sequence(seq) => Ok(seq),
        _ => Err(invalid(filename, format!("{field} must be a list"))),
    }
}

fn yaml_to_json(filename: &str, value: &Yaml) -> crate::Result<Json> {
    match value {
        Yaml::Null => Ok(Json::Null),
        Yaml::Bool(b) => Ok(json!(b)),
        Yaml::Number(n) => serde_json::to_value(n).map_err(|e| invalid(filename, e)),
        Yaml::String(s) => Ok(json!(s)),
        Yaml::Sequence(seq) => Ok(Json::Array(
            seq.iter()
                .map(|v| yaml_to_json(filename, v))
                .collect::<crate::Result<Vec<_>>>()?,
        )),
        Yaml::Mapping(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                let key = match k {
                    Yaml::String(s) => s.clone(),
                    _ => return Err(invalid(filename, "mapping keys must be strings")),
                };
                out.insert(key, yaml_to_json(filename, v)?);
            }
            Ok(Json::Object(out))
        }
        Yaml::Tagged(_) => Err(invalid(filename, "YAML tags are not allowed")),
    }
}

/// Typed access to a YAML mapping with unknown-key tracking.
struct Fields<'a> {
    filename: &'a str,
    map: BTreeMap<String, Yaml>,
}

impl<'a> Fields<'a> {
    fn new(filename: &'a str, mapping: serde_yaml::Mapping) -> crate::Result<Self> {
        let mut map = BTreeMap::new();
        for (k, v) in mapping {
            match k {
                Yaml::String(s) => {
                    map.insert(s, v);
                }
                _ => return Err(invalid(filename, "mapping keys must be strings")),
            }
        }
        Ok(Self { filename, map })
    }

    fn take(&mut self, key: &str) -> Option<Yaml> {
        self.map.remove(key)
    }

    fn require_str(&mut self, key: &str) -> crate::Result<String> {
        match self.take(key) {
            Some(Yaml::String(s)) => Ok(s),
            Some(_) => Err(invalid(self.filename, format!("{key} must be a string"))),
            None => Err(invalid(self.filename, format!("missing field {key}"))),
        }
    }

    fn opt_str(&mut self, key: &str) -> crate::Result<Option<String>> {
        match self.take(key) {
            None | Some(Yaml::Null) => Ok(None),
            Some(Yaml::String(s)) => Ok(Some(s)),
            Some(_) => Err(invalid(self.filename, format!("{key} must be a string"))),
        }
    }

    fn opt_u32(&mut self, key: &str) -> crate::Result<Option<u32>> {
        match self.take(key) {
            None | Some(Yaml::Null) => Ok(None),
            Some(Yaml::Number(n)) => n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .map(Some)
                .ok_or_else(|| invalid(self.filename, format!("{key} must be a positive integer"))),
            Some(_) => Err(invalid(self.filename, format!("{key} must be an integer"))),
        }
    }

    fn opt_string_list(&mut self, key: &str) -> crate::Result<Option<Vec<String>>> {
        match self.take(key) {
            None | Some(Yaml::Null) => Ok(None),
            Some(Yaml::Sequence(seq)) => {
                let mut out = Vec::new();
                for item in seq {
                    match item {
                        Yaml::String(s) => out.push(s),
                        _ => {
                            return Err(invalid(
                                self.filename,
                                format!("{key} must be a list of strings"),
                            ));
                        }
                    }
                }
                Ok(Some(out))
            }
            Some(_) => Err(invalid(self.filename, format!("{key} must be a list"))),
        }
    }

    fn opt_products(&mut self, key: &str) -> crate::Result<Vec<ProductSpec>> {
        let value = match self.take(key) {
            None | Some(Yaml::Null) => return Ok(Vec::new()),
            Some(value) => value,
        };
        let seq = as_seq(self.filename, key, value)?;
        let mut out = Vec::new();
        for item in seq {
            let mapping = match item {
                Yaml::Mapping(m) => m,
                _ => return Err(invalid(self.filename, format!("{key} entries must be mappings"))),
            };
            let mut fields = Fields::new(self.filename, mapping)?;
            let artifact = fields.require_str("artifact")?;
            let include = fields.opt_string_list("include")?.ok_or_else(|| {
                invalid(self.filename, format!("product {artifact} has no include list"))
            })?;
            fields.reject_unknown()?;
            out.push(ProductSpec { artifact, include });
        }
        Ok(out)
    }

    fn reject_unknown(&self) -> crate::Result<()> {
        if let Some(key) = self.map.keys().next() {
            return Err(invalid(self.filename, format!("unknown field {key:?}")));
        }
        Ok(())
    }
}
