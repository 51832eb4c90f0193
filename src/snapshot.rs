//! Parsed live cluster state and the sources that produce it.
//!
//! Resources are keyed by cluster id. The snapshot is plain data: merging it
//! into the session's saved slots happens in [`crate::session`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use facet::Facet;

use crate::domain_state::DomainState;
use crate::error::HamcError;
use crate::locked::Locked;

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct ResourceSnapshot {
    #[facet(default)]
    pub kind: String,
    /// `class:provider:type`; empty for groups, clones, DRBD and domains.
    #[facet(default)]
    pub agent: String,
    #[facet(default)]
    pub params: BTreeMap<String, String>,
    #[facet(default)]
    pub meta: BTreeMap<String, String>,
    #[facet(default)]
    pub operations: BTreeMap<String, BTreeMap<String, String>>,
    /// Cluster id of the resource whose meta-attributes this one shares.
    #[facet(default)]
    pub meta_ref: String,
    #[facet(default)]
    pub operations_ref: String,
    /// Members of a group or clone, by cluster id.
    #[facet(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct LocationSnapshot {
    pub id: String,
    pub resource: String,
    pub host: String,
    pub score: String,
    #[facet(default)]
    pub op: String,
}

/// A pairwise order or colocation. `parent` is the `first` / `with-rsc` side.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct PairConstraintSnapshot {
    pub id: String,
    pub parent: String,
    pub child: String,
    #[facet(default)]
    pub score: String,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct ResourceSetSnapshot {
    pub id: String,
    /// `colocation` or `order`.
    pub kind: String,
    #[facet(default)]
    pub score: String,
    /// Registry key of the placeholder that owns the sets.
    pub placeholder: String,
    #[facet(default)]
    pub first: Vec<String>,
    #[facet(default)]
    pub then: Vec<String>,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct ClusterSnapshot {
    #[facet(default)]
    pub dc: String,
    #[facet(default)]
    pub resources: BTreeMap<String, ResourceSnapshot>,
    #[facet(default)]
    pub locations: Vec<LocationSnapshot>,
    #[facet(default)]
    pub colocations: Vec<PairConstraintSnapshot>,
    #[facet(default)]
    pub orders: Vec<PairConstraintSnapshot>,
    #[facet(default)]
    pub resource_sets: Vec<ResourceSetSnapshot>,
    /// Cluster id -> host -> fail count.
    #[facet(default)]
    pub fail_counts: BTreeMap<String, BTreeMap<String, u64>>,
    /// Clone cluster id -> failed instance id -> host.
    #[facet(default)]
    pub failed_instances: BTreeMap<String, BTreeMap<String, String>>,
    #[facet(default)]
    pub running_on: BTreeMap<String, Vec<String>>,
    #[facet(default)]
    pub orphaned: Vec<String>,
    /// Domain -> host -> `virsh domstate` output.
    #[facet(default)]
    pub domains: BTreeMap<String, BTreeMap<String, String>>,
}

impl ClusterSnapshot {
    /// Hosts with a non-zero fail count for `crm_id`.
    pub fn failed_hosts(&self, crm_id: &str) -> BTreeSet<String> {
        self.fail_counts
            .get(crm_id)
            .map(|hosts| {
                hosts
                    .iter()
                    .filter(|(_, count)| **count > 0)
                    .map(|(host, _)| host.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn domain_state(&self, domain: &str, host: &str) -> Result<DomainState, HamcError> {
        match self.domains.get(domain).and_then(|hosts| hosts.get(host)) {
            Some(state) => state.parse(),
            None => Ok(DomainState::ShutOff),
        }
    }
}

/// Where live cluster state comes from. Implementations block for the
/// round-trip; an unreachable host is an `Err`.
pub trait ClusterStateSource: Send + Sync {
    fn fetch_snapshot(&self, host: &str) -> Result<ClusterSnapshot, HamcError>;

    fn domain_state(&self, domain: &str, host: &str) -> Result<DomainState, HamcError>;
}

pub fn load_snapshot(path: &Path) -> Result<ClusterSnapshot, HamcError> {
    let contents = std::fs::read_to_string(path).map_err(|source| HamcError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    facet_toml::from_str(&contents).map_err(|e| HamcError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Reads a snapshot TOML file on every call; the same file answers for
/// every host.
#[derive(Debug, Clone)]
pub struct FileStateSource {
    path: PathBuf,
}

impl FileStateSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ClusterStateSource for FileStateSource {
    fn fetch_snapshot(&self, host: &str) -> Result<ClusterSnapshot, HamcError> {
        tracing::debug!(host, path = %self.path.display(), "reading snapshot file");
        load_snapshot(&self.path)
    }

    fn domain_state(&self, domain: &str, host: &str) -> Result<DomainState, HamcError> {
        load_snapshot(&self.path)?.domain_state(domain, host)
    }
}

/// In-memory source whose answers can be changed while a session runs.
#[derive(Debug, Default)]
pub struct StaticStateSource {
    snapshot: Locked<ClusterSnapshot>,
    domains: Locked<BTreeMap<(String, String), DomainState>>,
    unreachable: Locked<BTreeSet<String>>,
}

impl StaticStateSource {
    pub fn new(snapshot: ClusterSnapshot) -> Self {
        Self {
            snapshot: Locked::new(snapshot),
            ..Default::default()
        }
    }

    pub fn set_snapshot(&self, snapshot: ClusterSnapshot) {
        self.snapshot.update(|s| *s = snapshot);
    }

    pub fn set_domain_state(&self, domain: &str, host: &str, state: DomainState) {
        self.domains
            .update(|d| d.insert((domain.to_string(), host.to_string()), state));
    }

    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        self.unreachable.update(|u| {
            if unreachable {
                u.insert(host.to_string());
            } else {
                u.remove(host);
            }
        });
    }

    fn check_reachable(&self, host: &str) -> Result<(), HamcError> {
        if self.unreachable.read(|u| u.contains(host)) {
            return Err(HamcError::StateSource {
                host: host.to_string(),
                message: "host unreachable".into(),
            });
        }
        Ok(())
    }
}

impl ClusterStateSource for StaticStateSource {
    fn fetch_snapshot(&self, host: &str) -> Result<ClusterSnapshot, HamcError> {
        self.check_reachable(host)?;
        Ok(self.snapshot.snapshot())
    }

    fn domain_state(&self, domain: &str, host: &str) -> Result<DomainState, HamcError> {
        self.check_reachable(host)?;
        let explicit = self
            .domains
            .read(|d| d.get(&(domain.to_string(), host.to_string())).copied());
        match explicit {
            Some(state) => Ok(state),
            None => self.snapshot.read(|s| s.domain_state(domain, host)),
        }
    }
}
