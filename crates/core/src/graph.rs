//! The build graph: expanding a system morphology into build units and
//! computing their cache keys.
//!
//! One build unit is one artifact to produce. The graph builder walks
//! system -> strata -> chunks, emits a unit per split artifact, wires the
//! dependency edges, rejects cycles before any key is computed, and then
//! derives keys bottom-up so every unit's key folds in its dependencies'.

use crate::buildenv::BuildEnvironment;
use crate::config::Config;
use crate::key::CacheKey;
use crate::morphology::{
    BuildMode, ChunkMorphology, Morphology, MorphologyKind, MorphologyLoader, StratumMorphology,
};
use crate::source::{SourceResolver, SubmodulePin};
use crate::splitrules::{self, SplitRules};
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// The kind of artifact a build unit produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Chunk,
    Stratum,
    System,
}

impl ArtifactKind {
    pub fn name(&self) -> &'static str {
        match self {
            ArtifactKind::Chunk => "chunk",
            ArtifactKind::Stratum => "stratum",
            ArtifactKind::System => "system",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "chunk" => Some(ArtifactKind::Chunk),
            "stratum" => Some(ArtifactKind::Stratum),
            "system" => Some(ArtifactKind::System),
            _ => None,
        }
    }

    /// Scheduling priority: chunks before strata before systems.
    pub fn priority(&self) -> u8 {
        match self {
            ArtifactKind::Chunk => 0,
            ArtifactKind::Stratum => 1,
            ArtifactKind::System => 2,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One artifact to produce: the atomic scheduling entity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildUnit {
    /// Artifact name, e.g. `zlib-runtime` or `core-devel`.
    pub name: String,
    pub kind: ArtifactKind,
    /// The morphology the unit came from (chunk, stratum or system name).
    pub source_name: String,
    pub repo: String,
    pub sha1: String,
    pub morph_path: String,
    pub build_mode: BuildMode,
    pub prefix: String,
    /// The chunk morphology, for chunk units; aggregates carry none.
    pub chunk: Option<ChunkMorphology>,
    /// File rules for chunks, artifact rules for aggregates.
    pub split_rules: SplitRules,
    pub submodules: Vec<SubmodulePin>,
    /// Indices of the units this one needs, in `BuildGraph::units`.
    pub dependencies: Vec<usize>,
    pub cache_key: CacheKey,
}

/// The resolved DAG of build units, topologically consistent: every
/// dependency index precedes its dependent in `units`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BuildGraph {
    pub units: Vec<BuildUnit>,
}

impl BuildGraph {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Find a unit by its cache key.
    pub fn find_by_key(&self, key: &CacheKey) -> Option<usize> {
        self.units.iter().position(|u| &u.cache_key == key)
    }

    /// Reverse edges: for each unit, who depends on it.
    pub fn dependents(&self) -> Vec<Vec<usize>> {
        let mut out = vec![Vec::new(); self.units.len()];
        for (index, unit) in self.units.iter().enumerate() {
            for &dep in &unit.dependencies {
                out[dep].push(index);
            }
        }
        out
    }

    /// Every unit reachable from `index` along reverse edges, excluding
    /// `index` itself. Used to cascade failure.
    pub fn transitive_dependents(&self, index: usize) -> Vec<usize> {
        let dependents = self.dependents();
        let mut seen = vec![false; self.units.len()];
        let mut queue = vec![index];
        while let Some(current) = queue.pop() {
            for &next in &dependents[current] {
                if !seen[next] {
                    seen[next] = true;
                    queue.push(next);
                }
            }
        }
        (0..self.units.len()).filter(|&i| seen[i]).collect()
    }

    /// Longest-path depth of every unit: leaves are 0, a dependent is one
    /// more than its deepest dependency. Valid because dependency indices
    /// always precede their dependents.
    pub fn depths(&self) -> Vec<usize> {
        let mut depths = vec![0usize; self.units.len()];
        for (index, unit) in self.units.iter().enumerate() {
            for &dep in &unit.dependencies {
                depths[index] = depths[index].max(depths[dep] + 1);
            }
        }
        depths
    }

    /// The root (last-emitted) unit, normally the system artifact.
    pub fn root(&self) -> Option<&BuildUnit> {
        self.units.last()
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    pub fn from_json(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|e| crate::Error::Serialization(e.to_string()))
    }
}

/// Expands a system morphology reference into a `BuildGraph`.
pub struct GraphBuilder<'a> {
    resolver: &'a SourceResolver,
    config: &'a Config,
    loader: MorphologyLoader,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(resolver: &'a SourceResolver, config: &'a Config) -> Self {
        Self {
            resolver,
            config,
            loader: MorphologyLoader::new(),
        }
    }

    /// Build the full DAG for the system at `(repo, ref, morph path)`.
    pub async fn build(
        &self,
        repo: &str,
        ref_: &str,
        system_morph: &str,
    ) -> crate::Result<BuildGraph> {
        let system_source = self.resolver.resolve(repo, ref_, system_morph).await?;
        let system = match self
            .loader
            .load(&system_source.text, system_morph, Some(MorphologyKind::System))?
        {
            Morphology::System(system) => system,
            _ => unreachable!("loader honours the kind hint"),
        };

        // Load the stratum closure: everything the system names plus
        // whatever those strata build-depend on, all from the pinned
        // definitions commit.
        let mut strata: BTreeMap<String, StratumMorphology> = BTreeMap::new();
        let mut morph_paths: BTreeMap<String, String> = BTreeMap::new();
        let mut pending: Vec<String> = system.strata.iter().map(|s| s.morph.clone()).collect();
        let mut visited: Vec<String> = Vec::new();
        while let Some(path) = pending.pop() {
            if visited.contains(&path) {
                continue;
            }
            visited.push(path.clone());
            let source = self.resolver.resolve(repo, &system_source.sha1, &path).await?;
            let stratum = match self
                .loader
                .load(&source.text, &path, Some(MorphologyKind::Stratum))?
            {
                Morphology::Stratum(stratum) => stratum,
                _ => unreachable!("loader honours the kind hint"),
            };
            for dep in &stratum.build_depends {
                pending.push(dep.morph.clone());
            }
            morph_paths.insert(stratum.name.clone(), path);
            strata.insert(stratum.name.clone(), stratum);
        }

        let order = stratum_order(&strata, &morph_paths)?;

        let mut graph = GraphAccumulator::new();
        for stratum_name in &order {
            let stratum = &strata[stratum_name];
            self.expand_stratum(&mut graph, stratum, &morph_paths, &system_source.sha1)
                .await?;
        }

        // The system artifact aggregates the selected stratum artifacts.
        let system_rules = splitrules::unify_system_rules(&system)?;
        let mut system_deps = Vec::new();
        for spec in &system.strata {
            let stratum = strata.get(&spec.name).ok_or_else(|| {
                crate::Error::UnsatisfiedDependency {
                    name: spec.name.clone(),
                }
            })?;
            system_deps.extend(graph.select_stratum_units(&stratum.name, spec.artifacts.as_deref())?);
        }
        system_deps.sort_unstable();
        system_deps.dedup();

        let system_unit = BuildUnit {
            name: format!("{}-rootfs", system.name),
            kind: ArtifactKind::System,
            source_name: system.name.clone(),
            repo: repo.to_string(),
            sha1: system_source.sha1.clone(),
            morph_path: system_morph.to_string(),
            build_mode: BuildMode::Normal,
            prefix: "/usr".to_string(),
            chunk: None,
            split_rules: system_rules,
            submodules: Vec::new(),
            dependencies: system_deps,
            cache_key: CacheKey::from_bytes([0; 32]),
        };
        graph.units.push(system_unit);
        graph.canonical_morphs.push(Morphology::System(system).canonical());

        let mut build_graph = BuildGraph { units: graph.units };
        check_acyclic(&build_graph)?;
        self.compute_keys(&mut build_graph, &graph.canonical_morphs)?;

        tracing::info!(
            units = build_graph.len(),
            system = %system_morph,
            "resolved build graph"
        );
        Ok(build_graph)
    }

    async fn expand_stratum(
        &self,
        graph: &mut GraphAccumulator,
        stratum: &StratumMorphology,
        morph_paths: &BTreeMap<String, String>,
        definitions_sha1: &str,
    ) -> crate::Result<()> {
        // Chunk artifacts of strata this stratum build-depends on are
        // staged into every chunk build of this stratum.
        let mut stratum_dep_units = Vec::new();
        for dep in &stratum.build_depends {
            let dep_name = dep
                .morph
                .rsplit('/')
                .next()
                .unwrap_or(&dep.morph)
                .trim_end_matches(".morph");
            // Resolve the dependency by its loaded name; the morph path
            // stem matches the stratum name by convention.
            let resolved_name = morph_paths
                .iter()
                .find(|(_, path)| path.as_str() == dep.morph)
                .map(|(name, _)| name.clone())
                .unwrap_or_else(|| dep_name.to_string());
            stratum_dep_units.extend(
                graph.select_chunk_units_of_stratum(&resolved_name, dep.artifacts.as_deref())?,
            );
        }

        let mut chunk_units_by_name: HashMap<String, Vec<usize>> = HashMap::new();
        for spec in &stratum.chunks {
            let chunk = self.load_chunk_morphology(spec).await?;
            let source = self
                .resolver
                .resolve(&spec.repo, &spec.ref_, &spec.morph)
                .await
                .ok();
            // For synthesised chunks the morph file does not exist; the
            // source sha still has to pin.
            let (sha1, submodules) = match source {
                Some(resolved) => (resolved.sha1, resolved.submodules),
                None => {
                    let sha1 = self.resolver.resolve_ref(&spec.repo, &spec.ref_).await?;
                    let submodules = self
                        .resolver
                        .git()
                        .submodules_at(&spec.repo, &sha1)
                        .await?;
                    (sha1, submodules)
                }
            };

            let rules = splitrules::unify_chunk_rules(&chunk)?;
            let artifact_names: Vec<String> =
                rules.artifacts().iter().map(|a| a.to_string()).collect();

            let mut unit_indices = Vec::new();
            for artifact_name in &artifact_names {
                let mut deps = stratum_dep_units.clone();
                for dep_chunk in &spec.build_depends {
                    let dep_units = chunk_units_by_name.get(dep_chunk).ok_or_else(|| {
                        crate::Error::UnsatisfiedDependency {
                            name: dep_chunk.clone(),
                        }
                    })?;
                    deps.extend(select_peer_artifacts(
                        artifact_name,
                        dep_units,
                        &graph.units,
                    ));
                }
                deps.sort_unstable();
                deps.dedup();

                let unit = BuildUnit {
                    name: artifact_name.clone(),
                    kind: ArtifactKind::Chunk,
                    source_name: spec.name.clone(),
                    repo: spec.repo.clone(),
                    sha1: sha1.clone(),
                    morph_path: spec.morph.clone(),
                    build_mode: spec.build_mode,
                    prefix: spec.prefix.clone(),
                    chunk: Some(chunk.clone()),
                    split_rules: rules.clone(),
                    submodules: submodules.clone(),
                    dependencies: deps,
                    cache_key: CacheKey::from_bytes([0; 32]),
                };
                unit_indices.push(graph.units.len());
                graph.units.push(unit);
                graph
                    .canonical_morphs
                    .push(Morphology::Chunk(chunk.clone()).canonical());
            }
            chunk_units_by_name.insert(spec.name.clone(), unit_indices);
        }

        // Partition this stratum's chunk artifacts into stratum artifacts.
        // Bootstrap chunks exist only to stage later builds and never reach
        // the output.
        let stratum_rules = splitrules::unify_stratum_rules(stratum)?;
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for indices in chunk_units_by_name.values() {
            for &index in indices {
                let unit = &graph.units[index];
                if unit.build_mode == BuildMode::Bootstrap {
                    continue;
                }
                if let Some(artifact) =
                    stratum_rules.match_artifact(&unit.source_name, &unit.name)
                {
                    groups.entry(artifact.to_string()).or_default().push(index);
                }
            }
        }

        let stratum_morph_path = morph_paths
            .get(&stratum.name)
            .cloned()
            .unwrap_or_else(|| format!("{}.morph", stratum.name));
        for artifact_name in stratum_rules.artifacts() {
            let Some(mut members) = groups.remove(artifact_name) else {
                continue;
            };
            members.sort_unstable();
            let unit = BuildUnit {
                name: artifact_name.to_string(),
                kind: ArtifactKind::Stratum,
                source_name: stratum.name.clone(),
                repo: String::new(),
                sha1: definitions_sha1.to_string(),
                morph_path: stratum_morph_path.clone(),
                build_mode: BuildMode::Normal,
                prefix: "/usr".to_string(),
                chunk: None,
                split_rules: stratum_rules.clone(),
                submodules: Vec::new(),
                dependencies: members,
                cache_key: CacheKey::from_bytes([0; 32]),
            };
            graph
                .stratum_units
                .entry(stratum.name.clone())
                .or_default()
                .push(graph.units.len());
            graph.units.push(unit);
            graph
                .canonical_morphs
                .push(Morphology::Stratum(stratum.clone()).canonical());
        }
        Ok(())
    }

    async fn load_chunk_morphology(
        &self,
        spec: &crate::morphology::ChunkSpec,
    ) -> crate::Result<ChunkMorphology> {
        match self.resolver.resolve(&spec.repo, &spec.ref_, &spec.morph).await {
            Ok(source) => {
                let morph = self.loader.load(
                    &source.text,
                    &spec.morph,
                    Some(MorphologyKind::Chunk),
                )?;
                match morph {
                    Morphology::Chunk(chunk) => Ok(chunk),
                    _ => unreachable!("loader honours the kind hint"),
                }
            }
            Err(err) => match spec.build_system {
                // No morphology file in the chunk repo; the spec must name
                // the build system inline.
                Some(build_system) => Ok(ChunkMorphology::synthesised(&spec.name, build_system)),
                None => Err(err),
            },
        }
    }

    /// Derive cache keys bottom-up, per source.
    ///
    /// One build produces every split artifact of its source, so all units
    /// of one source share a key; a unit's own artifact name is identity,
    /// not key input. `units` is in emit order, which is topologically
    /// consistent and keeps a source's units contiguous, so dependency
    /// keys are always ready when a group is reached.
    fn compute_keys(
        &self,
        graph: &mut BuildGraph,
        canonical_morphs: &[serde_json::Value],
    ) -> crate::Result<()> {
        let mut index = 0;
        while index < graph.units.len() {
            // The group: contiguous units of the same source.
            let mut end = index + 1;
            while end < graph.units.len() && same_source(&graph.units[index], &graph.units[end]) {
                end += 1;
            }

            let unit = &graph.units[index];
            let env = BuildEnvironment::new(
                self.config,
                &unit.prefix,
                unit.build_mode,
                self.config.max_jobs(),
            );

            // Fold in the union of the group's dependencies.
            let mut kids: Vec<serde_json::Value> = Vec::new();
            let mut seen = Vec::new();
            for group_unit in &graph.units[index..end] {
                for &dep in &group_unit.dependencies {
                    if seen.contains(&dep) {
                        continue;
                    }
                    seen.push(dep);
                    let dep_unit = &graph.units[dep];
                    kids.push(json!({
                        "artifact": dep_unit.name,
                        "cache-key": dep_unit.cache_key.to_hex(),
                    }));
                }
            }
            kids.sort_by(|a, b| a.to_string().cmp(&b.to_string()));

            let split_rules: Vec<serde_json::Value> = unit
                .split_rules
                .specs()
                .iter()
                .map(|named| json!({"artifact": named.artifact, "rule": named.rule}))
                .collect();

            let mut record = serde_json::Map::new();
            record.insert("metadata-version".into(), json!(1));
            record.insert("env".into(), env.cache_id());
            record.insert("kids".into(), json!(kids));
            record.insert("kind".into(), json!(unit.kind.name()));
            record.insert("source".into(), json!(unit.source_name));
            record.insert("morphology".into(), canonical_morphs[index].clone());
            record.insert("split-rules".into(), json!(split_rules));
            match unit.kind {
                ArtifactKind::Chunk => {
                    record.insert("tree".into(), json!(unit.sha1));
                    record.insert("build-mode".into(), json!(unit.build_mode.name()));
                    record.insert("prefix".into(), json!(unit.prefix));
                    record.insert("submodules".into(), json!(unit.submodules));
                }
                ArtifactKind::Stratum => {
                    record.insert("stratum-format-version".into(), json!(1));
                }
                ArtifactKind::System => {
                    record.insert("system-compatibility-version".into(), json!(1));
                    record.insert("arch".into(), json!(self.config.arch));
                }
            }

            let key = CacheKey::of_canonical(&serde_json::Value::Object(record))?;
            for group_unit in &mut graph.units[index..end] {
                tracing::debug!(artifact = %group_unit.name, key = %key, "computed cache key");
                group_unit.cache_key = key;
            }
            index = end;
        }
        Ok(())
    }
}

/// Accumulates units during expansion.
struct GraphAccumulator {
    units: Vec<BuildUnit>,
    canonical_morphs: Vec<serde_json::Value>,
    /// Stratum name -> indices of its stratum artifacts.
    stratum_units: BTreeMap<String, Vec<usize>>,
}

impl GraphAccumulator {
    fn new() -> Self {
        Self {
            units: Vec::new(),
            canonical_morphs: Vec::new(),
            stratum_units: BTreeMap::new(),
        }
    }

    /// Stratum artifact units for `stratum`, restricted to `artifacts`.
    fn select_stratum_units(
        &self,
        stratum: &str,
        artifacts: Option<&[String]>,
    ) -> crate::Result<Vec<usize>> {
        let indices = self.stratum_units.get(stratum).ok_or_else(|| {
            crate::Error::UnsatisfiedDependency {
                name: stratum.to_string(),
            }
        })?;
        match artifacts {
            None => Ok(indices.clone()),
            Some(selected) => {
                let mut out = Vec::new();
                for wanted in selected {
                    let found = indices
                        .iter()
                        .find(|&&i| &self.units[i].name == wanted)
                        .copied()
                        .ok_or_else(|| crate::Error::UnsatisfiedDependency {
                            name: wanted.clone(),
                        })?;
                    out.push(found);
                }
                Ok(out)
            }
        }
    }

    /// Chunk units included in the exposed artifacts of `stratum`; these
    /// are what later strata stage.
    fn select_chunk_units_of_stratum(
        &self,
        stratum: &str,
        artifacts: Option<&[String]>,
    ) -> crate::Result<Vec<usize>> {
        let stratum_units = self.select_stratum_units(stratum, artifacts)?;
        let mut out = Vec::new();
        for index in stratum_units {
            out.extend(self.units[index].dependencies.iter().copied());
        }
        out.sort_unstable();
        out.dedup();
        Ok(out)
    }
}

/// Whether two units come from the same source and therefore share one
/// build and one cache key.
fn same_source(a: &BuildUnit, b: &BuildUnit) -> bool {
    a.kind == b.kind
        && a.source_name == b.source_name
        && a.sha1 == b.sha1
        && a.morph_path == b.morph_path
}

/// Map a chunk artifact's within-stratum dependency through the peer's
/// split artifacts: runtime wants runtime, devel wants devel and runtime,
/// anything else takes everything.
fn select_peer_artifacts(artifact: &str, peer_units: &[usize], units: &[BuildUnit]) -> Vec<usize> {
    if artifact.ends_with("-runtime") {
        let runtime: Vec<usize> = peer_units
            .iter()
            .copied()
            .filter(|&i| units[i].name.ends_with("-runtime"))
            .collect();
        if !runtime.is_empty() {
            return runtime;
        }
    } else if artifact.ends_with("-devel") {
        let matched: Vec<usize> = peer_units
            .iter()
            .copied()
            .filter(|&i| {
                units[i].name.ends_with("-devel") || units[i].name.ends_with("-runtime")
            })
            .collect();
        if !matched.is_empty() {
            return matched;
        }
    }
    peer_units.to_vec()
}

/// Topological order of strata by their build-depends, rejecting cycles.
fn stratum_order(
    strata: &BTreeMap<String, StratumMorphology>,
    morph_paths: &BTreeMap<String, String>,
) -> crate::Result<Vec<String>> {
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut nodes = BTreeMap::new();
    for name in strata.keys() {
        nodes.insert(name.clone(), graph.add_node(name.clone()));
    }
    let path_to_name: BTreeMap<&str, &str> = morph_paths
        .iter()
        .map(|(name, path)| (path.as_str(), name.as_str()))
        .collect();
    for (name, stratum) in strata {
        for dep in &stratum.build_depends {
            let dep_name = path_to_name
                .get(dep.morph.as_str())
                .copied()
                .ok_or_else(|| crate::Error::UnsatisfiedDependency {
                    name: dep.morph.clone(),
                })?;
            // Edge from dependency to dependent so the order comes out
            // leaves first.
            graph.add_edge(nodes[dep_name], nodes[name], ());
        }
    }

    for component in tarjan_scc(&graph) {
        if component.len() > 1 {
            let mut path: Vec<String> =
                component.iter().map(|&n| graph[n].clone()).collect();
            path.sort();
            return Err(crate::Error::DependencyCycle { path });
        }
    }

    let sorted = petgraph::algo::toposort(&graph, None).map_err(|cycle| {
        crate::Error::DependencyCycle {
            path: vec![graph[cycle.node_id()].clone()],
        }
    })?;
    Ok(sorted.into_iter().map(|n| graph[n].clone()).collect())
}

/// Belt-and-braces cycle check over the final unit graph.
fn check_acyclic(graph: &BuildGraph) -> crate::Result<()> {
    let mut pg: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<_> = (0..graph.units.len()).map(|i| pg.add_node(i)).collect();
    for (index, unit) in graph.units.iter().enumerate() {
        for &dep in &unit.dependencies {
            pg.add_edge(nodes[dep], nodes[index], ());
        }
    }
    for component in tarjan_scc(&pg) {
        if component.len() > 1 {
            let mut path: Vec<String> = component
                .iter()
                .map(|&n| graph.units[pg[n]].name.clone())
                .collect();
            path.sort();
            return Err(crate::Error::DependencyCycle { path });
        }
    }
    Ok(())
}
