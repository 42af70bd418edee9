//! Artifact split rules.
//!
//! A chunk build produces several artifacts (`-runtime`, `-devel`, ...) by
//! partitioning the installed file tree; a stratum partitions its chunks'
//! artifacts the same way. Rules are ordered and first match wins, so
//! specific rules come before the catch-all.

use crate::morphology::{ChunkMorphology, StratumMorphology, SystemMorphology};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One uncompiled rule, as stored in morphology text and graph files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleSpec {
    /// Match a staged file path against any of the patterns.
    Files { patterns: Vec<String> },
    /// Match a chunk-artifact name against any of the patterns.
    Artifacts { patterns: Vec<String> },
    /// Match exactly one (source, artifact) pair.
    Assign { source: String, artifact: String },
    /// Match every artifact of one source.
    Source { source: String },
}

/// A rule bound to the artifact it routes matches into.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedRule {
    pub artifact: String,
    pub rule: RuleSpec,
}

#[derive(Clone, Debug)]
enum Compiled {
    Files(Vec<Regex>),
    Artifacts(Vec<Regex>),
    Assign { source: String, artifact: String },
    Source { source: String },
}

/// Patterns are start-anchored, matching the original rule semantics.
fn compile_patterns(patterns: &[String]) -> crate::Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("^(?:{p})")).map_err(|e| crate::Error::InvalidMorphology {
                path: String::new(),
                reason: format!("bad split-rule pattern {p:?}: {e}"),
            })
        })
        .collect()
}

fn compile(spec: &RuleSpec) -> crate::Result<Compiled> {
    Ok(match spec {
        RuleSpec::Files { patterns } => Compiled::Files(compile_patterns(patterns)?),
        RuleSpec::Artifacts { patterns } => Compiled::Artifacts(compile_patterns(patterns)?),
        RuleSpec::Assign { source, artifact } => Compiled::Assign {
            source: source.clone(),
            artifact: artifact.clone(),
        },
        RuleSpec::Source { source } => Compiled::Source {
            source: source.clone(),
        },
    })
}

/// Ordered first-match-wins rules for splitting one source's output.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<NamedRule>", into = "Vec<NamedRule>")]
pub struct SplitRules {
    rules: Vec<NamedRule>,
    compiled: Vec<Compiled>,
}

impl SplitRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule; later rules only see what earlier ones left over.
    pub fn add(&mut self, artifact: &str, rule: RuleSpec) -> crate::Result<()> {
        self.compiled.push(compile(&rule)?);
        self.rules.push(NamedRule {
            artifact: artifact.to_string(),
            rule,
        });
        Ok(())
    }

    /// Artifact names in rule order, deduplicated.
    pub fn artifacts(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for named in &self.rules {
            if !seen.contains(&named.artifact.as_str()) {
                seen.push(named.artifact.as_str());
            }
        }
        seen
    }

    /// The uncompiled rules, e.g. for cache-key folding.
    pub fn specs(&self) -> &[NamedRule] {
        &self.rules
    }

    /// First artifact whose rule matches the given file path.
    pub fn match_file(&self, path: &str) -> Option<&str> {
        self.rules
            .iter()
            .zip(&self.compiled)
            .find(|(_, compiled)| match compiled {
                Compiled::Files(regexes) => regexes.iter().any(|r| r.is_match(path)),
                _ => false,
            })
            .map(|(named, _)| named.artifact.as_str())
    }

    /// First artifact whose rule matches the given (source, artifact) pair.
    pub fn match_artifact(&self, source: &str, artifact: &str) -> Option<&str> {
        self.rules
            .iter()
            .zip(&self.compiled)
            .find(|(_, compiled)| match compiled {
                Compiled::Artifacts(regexes) => regexes.iter().any(|r| r.is_match(artifact)),
                Compiled::Assign {
                    source: s,
                    artifact: a,
                } => s == source && a == artifact,
                Compiled::Source { source: s } => s == source,
                Compiled::Files(_) => false,
            })
            .map(|(named, _)| named.artifact.as_str())
    }

    /// Group file paths by the artifact they belong to.
    ///
    /// Returns the per-artifact groups and the paths no rule claimed.
    pub fn partition_files<'a, I>(&self, paths: I) -> (BTreeMap<String, Vec<String>>, Vec<String>)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut unmatched = Vec::new();
        for path in paths {
            match self.match_file(path) {
                Some(artifact) => groups
                    .entry(artifact.to_string())
                    .or_default()
                    .push(path.to_string()),
                None => unmatched.push(path.to_string()),
            }
        }
        (groups, unmatched)
    }
}

impl TryFrom<Vec<NamedRule>> for SplitRules {
    type Error = crate::Error;

    fn try_from(rules: Vec<NamedRule>) -> crate::Result<Self> {
        let mut out = SplitRules::new();
        for named in rules {
            out.add(&named.artifact.clone(), named.rule)?;
        }
        Ok(out)
    }
}

impl From<SplitRules> for Vec<NamedRule> {
    fn from(rules: SplitRules) -> Self {
        rules.rules
    }
}

/// Default file-split suffixes for chunks, most specific first. The final
/// catch-all guarantees no installed file is silently dropped.
pub const DEFAULT_CHUNK_RULES: &[(&str, &[&str])] = &[
    (
        "-devel",
        &[
            r"(usr/)?include/.*",
            r"(usr/)?lib(32|64)?/.*\.a$",
            r"(usr/)?lib(32|64)?/.*\.la$",
            r"(usr/)?(lib(32|64)?|share)/pkgconfig/.*",
            r"(usr/)?share/(man|doc|info)/.*",
        ],
    ),
    ("-runtime", &[r".*"]),
];

/// Default artifact-split suffixes for strata.
pub const DEFAULT_STRATUM_RULES: &[(&str, &[&str])] =
    &[("-devel", &[r".*-devel$"]), ("-runtime", &[r".*"])];

/// Split rules for a chunk: explicit products, then the defaults the
/// products did not override.
pub fn unify_chunk_rules(chunk: &ChunkMorphology) -> crate::Result<SplitRules> {
    let mut rules = SplitRules::new();
    for product in &chunk.products {
        rules.add(
            &product.artifact,
            RuleSpec::Files {
                patterns: product.include.clone(),
            },
        )?;
    }
    for (suffix, patterns) in DEFAULT_CHUNK_RULES {
        let artifact = format!("{}{}", chunk.name, suffix);
        if !rules.artifacts().contains(&artifact.as_str()) {
            rules.add(
                &artifact,
                RuleSpec::Files {
                    patterns: patterns.iter().map(|p| p.to_string()).collect(),
                },
            )?;
        }
    }
    // An explicit product may narrow the default catch-all away; a final
    // catch-all keeps files from being silently dropped.
    let runtime = format!("{}-runtime", chunk.name);
    if chunk.products.iter().any(|p| p.artifact == runtime) {
        rules.add(
            &format!("{}-misc", chunk.name),
            RuleSpec::Files {
                patterns: vec![r".*".to_string()],
            },
        )?;
    }
    Ok(rules)
}

/// Split rules for a stratum: explicit products, then the defaults.
pub fn unify_stratum_rules(stratum: &StratumMorphology) -> crate::Result<SplitRules> {
    let mut rules = SplitRules::new();
    for product in &stratum.products {
        rules.add(
            &product.artifact,
            RuleSpec::Artifacts {
                patterns: product.include.clone(),
            },
        )?;
    }
    for (suffix, patterns) in DEFAULT_STRATUM_RULES {
        let artifact = format!("{}{}", stratum.name, suffix);
        if !rules.artifacts().contains(&artifact.as_str()) {
            rules.add(
                &artifact,
                RuleSpec::Artifacts {
                    patterns: patterns.iter().map(|p| p.to_string()).collect(),
                },
            )?;
        }
    }
    Ok(rules)
}

/// Split rules for a system: everything goes into `<name>-rootfs`,
/// restricted per-stratum when the spec selects an artifact subset.
pub fn unify_system_rules(system: &SystemMorphology) -> crate::Result<SplitRules> {
    let rootfs = format!("{}-rootfs", system.name);
    let mut rules = SplitRules::new();
    for spec in &system.strata {
        match &spec.artifacts {
            None => rules.add(
                &rootfs,
                RuleSpec::Source {
                    source: spec.name.clone(),
                },
            )?,
            Some(artifacts) => {
                for artifact in artifacts {
                    rules.add(
                        &rootfs,
                        RuleSpec::Assign {
                            source: spec.name.clone(),
                            artifact: artifact.clone(),
                        },
                    )?;
                }
            }
        }
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files_rule(patterns: &[&str]) -> RuleSpec {
        RuleSpec::Files {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn first_match_wins() {
        let mut rules = SplitRules::new();
        rules.add("devel", files_rule(&[r"(usr/)?include/.*"])).unwrap();
        rules.add("runtime", files_rule(&[r".*"])).unwrap();

        assert_eq!(rules.match_file("usr/include/stdio.h"), Some("devel"));
        assert_eq!(rules.match_file("usr/bin/hello"), Some("runtime"));
    }

    #[test]
    fn patterns_are_start_anchored() {
        let mut rules = SplitRules::new();
        rules.add("devel", files_rule(&["include/.*"])).unwrap();

        assert_eq!(rules.match_file("include/stdio.h"), Some("devel"));
        assert_eq!(rules.match_file("opt/include/stdio.h"), None);
    }

    #[test]
    fn partition_reports_unmatched() {
        let mut rules = SplitRules::new();
        rules.add("bins", files_rule(&["bin/.*"])).unwrap();

        let (groups, unmatched) =
            rules.partition_files(["bin/sh", "bin/ls", "etc/passwd"]);
        assert_eq!(groups["bins"], ["bin/sh", "bin/ls"]);
        assert_eq!(unmatched, ["etc/passwd"]);
    }

    #[test]
    fn artifact_names_deduplicated_in_order() {
        let mut rules = SplitRules::new();
        rules.add("a", files_rule(&["x"])).unwrap();
        rules.add("b", files_rule(&["y"])).unwrap();
        rules.add("a", files_rule(&["z"])).unwrap();
        assert_eq!(rules.artifacts(), ["a", "b"]);
    }

    #[test]
    fn assign_and_source_rules_match_artifacts() {
        let mut rules = SplitRules::new();
        rules
            .add(
                "rootfs",
                RuleSpec::Assign {
                    source: "core".to_string(),
                    artifact: "core-runtime".to_string(),
                },
            )
            .unwrap();
        rules
            .add(
                "rootfs",
                RuleSpec::Source {
                    source: "tools".to_string(),
                },
            )
            .unwrap();

        assert_eq!(rules.match_artifact("core", "core-runtime"), Some("rootfs"));
        assert_eq!(rules.match_artifact("core", "core-devel"), None);
        assert_eq!(rules.match_artifact("tools", "tools-devel"), Some("rootfs"));
    }

    #[test]
    fn serde_roundtrip_recompiles() {
        let mut rules = SplitRules::new();
        rules.add("devel", files_rule(&[r"include/.*"])).unwrap();
        rules.add("runtime", files_rule(&[r".*"])).unwrap();

        let json = serde_json::to_string(&rules).unwrap();
        let back: SplitRules = serde_json::from_str(&json).unwrap();
        assert_eq!(back.match_file("include/a.h"), Some("devel"));
        assert_eq!(back.specs(), rules.specs());
    }
}
