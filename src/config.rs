use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::error::HamcError;
use crate::lifecycle::LifecycleConfig;
use crate::model::ResourceKind;
use crate::schema::{AgentId, AgentSchema, ParamKind, ParamSpec, operations_from_nested};
use crate::score::{LocationOp, parse_optional};

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ClusterConfig {
    #[facet(default)]
    pub name: String,
    pub hosts: Vec<String>,
    /// Host intents go to unless a refresh names another DC. Defaults to
    /// the first host.
    #[facet(default)]
    pub dc_host: String,
    /// Live-state TOML read by `--live`, relative to the config file.
    #[facet(default)]
    pub snapshot: String,
    /// Directory intent journals are written to, relative to the config
    /// file. Empty disables the journal.
    #[facet(default)]
    pub journal_dir: String,
    #[facet(default = 10)]
    pub journal_keep: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            hosts: Vec::new(),
            dc_host: String::new(),
            snapshot: String::new(),
            journal_dir: String::new(),
            journal_keep: 10,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct LifecycleSection {
    #[facet(default = 1000)]
    pub tick_ms: u64,
    #[facet(default = 20)]
    pub action_timeout_ticks: u32,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            action_timeout_ticks: 20,
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct ParamConfig {
    pub name: String,
    /// `string`, `integer`, `boolean`, `time`, `score`, `choice` or
    /// `resource`.
    #[facet(default)]
    pub kind: String,
    pub default: Option<String>,
    pub preferred: Option<String>,
    #[facet(default)]
    pub required: bool,
    #[facet(default)]
    pub advanced: bool,
    #[facet(default)]
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct AgentConfig {
    #[facet(default)]
    pub params: Vec<ParamConfig>,
    /// Operation -> field -> default value.
    #[facet(default)]
    pub operations: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct LocationConfig {
    pub host: String,
    #[facet(default)]
    pub score: String,
    #[facet(default)]
    pub op: String,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct ResourceConfig {
    /// Registry key.
    pub name: String,
    /// Edited id; defaults to `name`.
    #[facet(default)]
    pub id: String,
    #[facet(default)]
    pub kind: String,
    #[facet(default)]
    pub agent: String,
    #[facet(default)]
    pub params: BTreeMap<String, String>,
    #[facet(default)]
    pub meta: BTreeMap<String, String>,
    #[facet(default)]
    pub operations: BTreeMap<String, BTreeMap<String, String>>,
    #[facet(default)]
    pub locations: Vec<LocationConfig>,
    /// Registry key of a resource to share meta-attributes with, or
    /// `default`.
    #[facet(default)]
    pub meta_same_as: String,
    #[facet(default)]
    pub operations_same_as: String,
    #[facet(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct EdgeConfig {
    pub parent: String,
    pub child: String,
    #[facet(default)]
    pub colocation: bool,
    #[facet(default)]
    pub order: bool,
    #[facet(default)]
    pub score: String,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    pub cluster: ClusterConfig,
    #[facet(default)]
    pub lifecycle: LifecycleSection,
    /// Agent schemas keyed by `class:provider:type`.
    #[facet(default)]
    pub agents: BTreeMap<String, AgentConfig>,
    #[facet(default)]
    pub resources: Vec<ResourceConfig>,
    #[facet(default)]
    pub edges: Vec<EdgeConfig>,
}

// ── SessionConfig ─────────────────────────────────────────

/// Parsed session file plus where it was loaded from.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Canonicalized path to the config file.
    pub config_path: PathBuf,
    pub config: Config,
}

impl SessionConfig {
    pub fn dc_host(&self) -> &str {
        let cluster = &self.config.cluster;
        if cluster.dc_host.is_empty() {
            cluster.hosts.first().map(String::as_str).unwrap_or("")
        } else {
            &cluster.dc_host
        }
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            tick: Duration::from_millis(self.config.lifecycle.tick_ms),
            action_timeout_ticks: self.config.lifecycle.action_timeout_ticks,
        }
    }

    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.relative(&self.config.cluster.snapshot)
    }

    pub fn journal_dir(&self) -> Option<PathBuf> {
        self.relative(&self.config.cluster.journal_dir)
    }

    fn relative(&self, path: &str) -> Option<PathBuf> {
        if path.is_empty() {
            return None;
        }
        let base = self.config_path.parent().unwrap_or(Path::new("."));
        Some(base.join(path))
    }

    /// Build the configured agent schemas.
    pub fn schemas(&self) -> Result<BTreeMap<AgentId, AgentSchema>, HamcError> {
        let mut schemas = BTreeMap::new();
        for (name, agent) in &self.config.agents {
            let id: AgentId = name.parse()?;
            let params = agent
                .params
                .iter()
                .map(param_spec)
                .collect::<Result<Vec<_>, _>>()?;
            let schema =
                AgentSchema::for_primitive(params, operations_from_nested(&agent.operations));
            schemas.insert(id, schema);
        }
        Ok(schemas)
    }
}

fn param_spec(p: &ParamConfig) -> Result<ParamSpec, HamcError> {
    let kind = if p.kind.is_empty() { "string" } else { p.kind.as_str() };
    let mut spec = ParamSpec::new(&p.name, ParamKind::from_name(kind, p.choices.clone())?);
    if let Some(default) = &p.default {
        spec = spec.with_default(default);
    }
    if let Some(preferred) = &p.preferred {
        spec = spec.with_preferred(preferred);
    }
    if p.required {
        spec = spec.required();
    }
    if p.advanced {
        spec = spec.advanced();
    }
    Ok(spec)
}

fn validation(message: String) -> HamcError {
    HamcError::Validation { message }
}

pub fn validate_config(config: &Config) -> Result<(), HamcError> {
    let cluster = &config.cluster;
    if cluster.hosts.is_empty() {
        return Err(validation("cluster.hosts must list at least one host".into()));
    }
    let mut hosts = BTreeSet::new();
    for host in &cluster.hosts {
        if host.is_empty() {
            return Err(validation("host names must not be empty".into()));
        }
        if !hosts.insert(host.as_str()) {
            return Err(validation(format!("duplicate host '{host}'")));
        }
    }
    if !cluster.dc_host.is_empty() && !hosts.contains(cluster.dc_host.as_str()) {
        return Err(validation(format!(
            "dc_host '{}' is not one of the cluster hosts",
            cluster.dc_host
        )));
    }
    if config.lifecycle.tick_ms == 0 || config.lifecycle.action_timeout_ticks == 0 {
        return Err(validation(
            "lifecycle tick_ms and action_timeout_ticks must be positive".into(),
        ));
    }

    for (name, agent) in &config.agents {
        name.parse::<AgentId>()?;
        for p in &agent.params {
            if p.name.is_empty() {
                return Err(validation(format!("agent '{name}' has a parameter without a name")));
            }
            param_spec(p)?;
        }
    }

    let mut names = BTreeSet::new();
    for r in &config.resources {
        if r.name.is_empty() {
            return Err(validation("every resource needs a name".into()));
        }
        if !names.insert(r.name.as_str()) {
            return Err(validation(format!("duplicate resource '{}'", r.name)));
        }
        let kind: ResourceKind = r.kind.parse()?;
        if kind.has_agent() && r.agent.is_empty() {
            return Err(validation(format!("resource '{}' needs an agent", r.name)));
        }
        if !r.agent.is_empty() {
            r.agent.parse::<AgentId>()?;
        }
        for loc in &r.locations {
            if !hosts.contains(loc.host.as_str()) {
                return Err(validation(format!(
                    "resource '{}' has a location on unknown host '{}'",
                    r.name, loc.host
                )));
            }
            parse_optional(&loc.score)?;
            loc.op.parse::<LocationOp>()?;
        }
    }

    let known = |name: &str| names.contains(name);
    for r in &config.resources {
        for reference in [&r.meta_same_as, &r.operations_same_as] {
            if !reference.is_empty()
                && !matches!(reference.as_str(), "default" | "defaults")
                && !known(reference)
            {
                return Err(validation(format!(
                    "resource '{}' is the same as unknown resource '{reference}'",
                    r.name
                )));
            }
        }
        for member in &r.members {
            if !known(member) {
                return Err(validation(format!(
                    "resource '{}' has unknown member '{member}'",
                    r.name
                )));
            }
        }
    }
    reject_same_as_cycles(config, |r| &r.meta_same_as)?;
    reject_same_as_cycles(config, |r| &r.operations_same_as)?;
    for e in &config.edges {
        for end in [&e.parent, &e.child] {
            if !known(end) {
                return Err(validation(format!("edge names unknown resource '{end}'")));
            }
        }
        if !e.colocation && !e.order {
            return Err(validation(format!(
                "edge {} -> {} must want colocation, order or both",
                e.parent, e.child
            )));
        }
        parse_optional(&e.score)?;
    }
    Ok(())
}

/// A `same as` chain must end in a resource with its own values.
fn reject_same_as_cycles(
    config: &Config,
    reference: impl Fn(&ResourceConfig) -> &String,
) -> Result<(), HamcError> {
    let next: BTreeMap<&str, &str> = config
        .resources
        .iter()
        .map(|r| (r.name.as_str(), reference(r).as_str()))
        .filter(|(_, target)| !target.is_empty() && !matches!(*target, "default" | "defaults"))
        .collect();
    for start in next.keys() {
        let mut visited = BTreeSet::new();
        let mut cur = *start;
        while let Some(target) = next.get(cur) {
            if !visited.insert(cur) {
                return Err(validation(format!(
                    "resource '{start}' is part of a 'same as' cycle"
                )));
            }
            cur = *target;
        }
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn load_config(path: &Path) -> Result<SessionConfig, HamcError> {
    let contents = std::fs::read_to_string(path).map_err(|source| HamcError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config: Config = facet_toml::from_str(&contents).map_err(|e| HamcError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    validate_config(&config)?;

    let canonical = path.canonicalize().map_err(|source| HamcError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    Ok(SessionConfig {
        config_path: canonical,
        config,
    })
}
