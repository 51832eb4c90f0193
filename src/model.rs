//! Resources and their mutable state.
//!
//! The kind of a resource is a closed variant; what a resource can do is
//! expressed through the capability traits [`HasParameters`],
//! [`HasLocations`] and [`HasOperations`] on its state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::HamcError;
use crate::locked::Locked;
use crate::params::{LocationSet, OperationSet, ParameterSet, Reference, SameAs};
use crate::placeholder::Placeholder;
use crate::schema::{AgentId, AgentSchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Primitive,
    Stonith,
    Group,
    Clone,
    MasterSlave,
    /// Resource-set grouping used for N:M colocation and order.
    Placeholder,
    Drbd,
    VirtualDomain,
}

impl ResourceKind {
    /// Prefix the cluster id carries for this role.
    pub fn id_prefix(self) -> Option<&'static str> {
        match self {
            ResourceKind::Primitive => Some("res_"),
            ResourceKind::Stonith => Some("stonith_"),
            ResourceKind::Group => Some("grp_"),
            ResourceKind::Clone => Some("cl_"),
            ResourceKind::MasterSlave => Some("ms_"),
            ResourceKind::Placeholder | ResourceKind::Drbd | ResourceKind::VirtualDomain => None,
        }
    }

    /// Cluster id a resource with this kind and edited id is committed as.
    pub fn expected_id(self, agent_type: Option<&str>, edited_id: &str) -> String {
        match (self, agent_type) {
            (ResourceKind::Primitive, Some(t)) => format!("res_{}_{edited_id}", sanitize_type(t)),
            _ => match self.id_prefix() {
                Some(prefix) => format!("{prefix}{edited_id}"),
                None => edited_id.to_string(),
            },
        }
    }

    /// The edited id a discovered cluster id maps back to. Ids that do not
    /// carry the expected prefix are taken as they are.
    pub fn edited_id_from(self, agent_type: Option<&str>, crm_id: &str) -> String {
        let prefix = match (self, agent_type) {
            (ResourceKind::Primitive, Some(t)) => Some(format!("res_{}_", sanitize_type(t))),
            _ => self.id_prefix().map(str::to_string),
        };
        prefix
            .as_deref()
            .and_then(|p| crm_id.strip_prefix(p))
            .filter(|rest| !rest.is_empty())
            .unwrap_or(crm_id)
            .to_string()
    }

    pub fn is_service(self) -> bool {
        matches!(
            self,
            ResourceKind::Primitive
                | ResourceKind::Stonith
                | ResourceKind::Group
                | ResourceKind::Clone
                | ResourceKind::MasterSlave
        )
    }

    pub fn is_clone(self) -> bool {
        matches!(self, ResourceKind::Clone | ResourceKind::MasterSlave)
    }

    pub fn has_locations(self) -> bool {
        self.is_service()
    }

    pub fn has_operations(self) -> bool {
        matches!(self, ResourceKind::Primitive | ResourceKind::Stonith)
    }

    pub fn has_agent(self) -> bool {
        matches!(self, ResourceKind::Primitive | ResourceKind::Stonith)
    }
}

// Agent types such as `external/ssh` contain characters ids may not.
fn sanitize_type(t: &str) -> String {
    t.replace(['/', ':'], "_")
}

impl FromStr for ResourceKind {
    type Err = HamcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" | "primitive" => ResourceKind::Primitive,
            "stonith" => ResourceKind::Stonith,
            "group" => ResourceKind::Group,
            "clone" => ResourceKind::Clone,
            "master" | "ms" | "master-slave" => ResourceKind::MasterSlave,
            "placeholder" => ResourceKind::Placeholder,
            "drbd" => ResourceKind::Drbd,
            "domain" | "vm" => ResourceKind::VirtualDomain,
            other => {
                return Err(HamcError::Validation {
                    message: format!("unknown resource kind '{other}'"),
                });
            }
        })
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Primitive => "primitive",
            ResourceKind::Stonith => "stonith",
            ResourceKind::Group => "group",
            ResourceKind::Clone => "clone",
            ResourceKind::MasterSlave => "master",
            ResourceKind::Placeholder => "placeholder",
            ResourceKind::Drbd => "drbd",
            ResourceKind::VirtualDomain => "domain",
        })
    }
}

pub trait HasParameters {
    fn parameters(&self) -> &ParameterSet;
    fn parameters_mut(&mut self) -> &mut ParameterSet;
    fn meta_same_as(&self) -> &Reference;
}

pub trait HasLocations {
    fn locations(&self) -> &LocationSet;
    fn locations_mut(&mut self) -> &mut LocationSet;
}

pub trait HasOperations {
    fn operations(&self) -> &OperationSet;
    fn operations_mut(&mut self) -> &mut OperationSet;
}

/// Everything about a resource that changes over a session.
#[derive(Debug, Clone, Default)]
pub struct ResourceState {
    pub edited_id: String,
    /// Id assigned once committed; `None` while the resource is new.
    pub crm_id: Option<String>,
    pub is_new: bool,
    pub is_orphaned: bool,
    pub is_removed: bool,
    pub params: ParameterSet,
    pub meta_same_as: Reference,
    pub operations: OperationSet,
    pub locations: LocationSet,
    /// Enclosing group or clone, by registry key.
    pub container: Option<String>,
    /// Members of a group or clone, by registry key, in order.
    pub members: Vec<String>,
    pub failed_hosts: BTreeSet<String>,
    /// Failed clone instance id -> host it failed on.
    pub failed_instances: BTreeMap<String, String>,
    pub running_on: BTreeSet<String>,
    pub placeholder: Option<Placeholder>,
    pub(crate) changed_cache: Option<BTreeMap<String, bool>>,
    /// Bumped whenever cached verdicts are dropped, so a check computed
    /// from an older snapshot does not overwrite them.
    pub(crate) verdict_generation: u64,
}

impl ResourceState {
    pub fn is_failed(&self) -> bool {
        !self.failed_hosts.is_empty() || !self.failed_instances.is_empty()
    }

    /// Save what `submitted` carried after a successful apply. Edits made
    /// since that snapshot was taken stay pending. Locations are settled
    /// host by host as their intents land.
    pub fn commit(&mut self, submitted: &ResourceState, crm_id: &str) {
        self.crm_id = Some(crm_id.to_string());
        self.is_new = false;
        self.params.commit(&submitted.params);
        self.meta_same_as.commit(&submitted.meta_same_as);
        self.operations.commit(&submitted.operations);
        self.invalidate();
    }

    /// Forget cached change verdicts; the next check is a full one.
    pub fn invalidate(&mut self) {
        self.changed_cache = None;
        self.verdict_generation += 1;
    }

    /// Forget the cached verdict for one check so a cheap re-check
    /// recomputes it.
    pub fn forget_verdict(&mut self, key: &str) {
        if let Some(cache) = &mut self.changed_cache {
            cache.remove(key);
        }
        self.verdict_generation += 1;
    }
}

impl HasParameters for ResourceState {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn meta_same_as(&self) -> &Reference {
        &self.meta_same_as
    }
}

impl HasLocations for ResourceState {
    fn locations(&self) -> &LocationSet {
        &self.locations
    }

    fn locations_mut(&mut self) -> &mut LocationSet {
        &mut self.locations
    }
}

impl HasOperations for ResourceState {
    fn operations(&self) -> &OperationSet {
        &self.operations
    }

    fn operations_mut(&mut self) -> &mut OperationSet {
        &mut self.operations
    }
}

/// A configurable cluster entity. Identity is fixed; everything else sits
/// behind the resource's single lock.
#[derive(Debug)]
pub struct Resource {
    key: String,
    kind: ResourceKind,
    agent: Option<AgentId>,
    schema: Arc<AgentSchema>,
    pub state: Locked<ResourceState>,
}

impl Resource {
    /// A resource the user just created; nothing to diff against yet.
    pub fn new(
        key: &str,
        kind: ResourceKind,
        agent: Option<AgentId>,
        schema: Arc<AgentSchema>,
    ) -> Self {
        let mut state = ResourceState {
            edited_id: key.to_string(),
            is_new: true,
            ..Default::default()
        };
        if kind == ResourceKind::Placeholder {
            state.placeholder = Some(Placeholder::new(key));
        }
        Self {
            key: key.to_string(),
            kind,
            agent,
            schema,
            state: Locked::new(state),
        }
    }

    /// A resource discovered in the live cluster under `crm_id`.
    pub fn committed(
        key: &str,
        crm_id: &str,
        kind: ResourceKind,
        agent: Option<AgentId>,
        schema: Arc<AgentSchema>,
    ) -> Self {
        let resource = Self::new(key, kind, agent, schema);
        resource.state.update(|s| {
            s.is_new = false;
            s.crm_id = Some(crm_id.to_string());
        });
        resource
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn agent(&self) -> Option<&AgentId> {
        self.agent.as_ref()
    }

    pub fn schema(&self) -> &AgentSchema {
        &self.schema
    }

    pub fn is_new(&self) -> bool {
        self.state.read(|s| s.is_new)
    }

    /// Committed id, or the id the resource will be committed as.
    pub fn crm_id(&self) -> String {
        self.state.read(|s| self.crm_id_of(s))
    }

    pub fn crm_id_of(&self, state: &ResourceState) -> String {
        state.crm_id.clone().unwrap_or_else(|| self.expected_id(state))
    }

    pub fn expected_id(&self, state: &ResourceState) -> String {
        self.kind
            .expected_id(self.agent.as_ref().map(|a| a.kind.as_str()), &state.edited_id)
    }

    pub fn running_on(&self) -> BTreeSet<String> {
        self.state.read(|s| s.running_on.clone())
    }

    // ── edit entry points ────────────────────────────────────────

    pub fn set_param(&self, name: &str, value: &str) {
        self.state.update(|s| {
            s.params.set_edited(name, value);
            s.forget_verdict(name);
        });
    }

    pub fn set_operation(&self, op: &str, field: &str, value: &str) {
        self.state.update(|s| {
            s.operations.set_edited(op, field, value);
            s.forget_verdict(crate::detect::OPERATIONS);
        });
    }

    pub fn set_location(&self, host: &str, location: crate::params::HostLocation) {
        self.state.update(|s| {
            s.locations.set_edited(host, location);
            s.forget_verdict(crate::detect::LOCATIONS);
        });
    }

    pub fn set_meta_same_as(&self, same_as: SameAs) {
        self.state.update(|s| {
            s.meta_same_as.edited = Some(same_as);
            s.invalidate();
        });
    }

    pub fn set_operations_same_as(&self, same_as: SameAs) {
        self.state.update(|s| {
            s.operations.same_as.edited = Some(same_as);
            s.invalidate();
        });
    }

    pub fn rename(&self, edited_id: &str) {
        self.state.update(|s| {
            s.edited_id = edited_id.to_string();
            s.forget_verdict(crate::detect::ID);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipaddr() -> Resource {
        Resource::new(
            "ip1",
            ResourceKind::Primitive,
            Some("ocf:heartbeat:IPaddr2".parse().unwrap()),
            Arc::new(AgentSchema::default()),
        )
    }

    #[test]
    fn expected_ids_by_role() {
        assert_eq!(ResourceKind::Group.expected_id(None, "g1"), "grp_g1");
        assert_eq!(ResourceKind::Clone.expected_id(None, "c1"), "cl_c1");
        assert_eq!(ResourceKind::MasterSlave.expected_id(None, "m1"), "ms_m1");
        assert_eq!(ResourceKind::Stonith.expected_id(Some("external/ssh"), "f1"), "stonith_f1");
        assert_eq!(
            ResourceKind::Primitive.expected_id(Some("IPaddr2"), "ip1"),
            "res_IPaddr2_ip1"
        );
        assert_eq!(ResourceKind::Drbd.expected_id(None, "r0"), "r0");
    }

    #[test]
    fn new_resource_uses_expected_id() {
        let r = ipaddr();
        assert!(r.is_new());
        assert_eq!(r.crm_id(), "res_IPaddr2_ip1");
    }

    #[test]
    fn committed_resource_keeps_its_id() {
        let r = Resource::committed(
            "web",
            "my_web",
            ResourceKind::Primitive,
            None,
            Arc::new(AgentSchema::default()),
        );
        assert!(!r.is_new());
        assert_eq!(r.crm_id(), "my_web");
    }

    #[test]
    fn placeholder_gets_resource_sets() {
        let ph = Resource::new(
            "ph1",
            ResourceKind::Placeholder,
            None,
            Arc::new(AgentSchema::default()),
        );
        assert!(ph.state.read(|s| s.placeholder.is_some()));
    }

    #[test]
    fn edited_id_strips_expected_prefix() {
        assert_eq!(
            ResourceKind::Primitive.edited_id_from(Some("IPaddr2"), "res_IPaddr2_ip1"),
            "ip1"
        );
        assert_eq!(ResourceKind::Group.edited_id_from(None, "grp_web"), "web");
        assert_eq!(ResourceKind::Primitive.edited_id_from(Some("IPaddr2"), "vip"), "vip");
    }

    #[test]
    fn kind_round_trip_names() {
        for name in ["primitive", "group", "clone", "master", "drbd", "domain"] {
            let kind: ResourceKind = name.parse().unwrap();
            assert_eq!(kind.to_string(), name);
        }
        assert!("cluster".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn commit_clears_new_flag() {
        let r = ipaddr();
        r.set_param("ip", "10.0.0.5");
        let submitted = r.state.snapshot();
        r.state.update(|s| s.commit(&submitted, "res_IPaddr2_ip1"));
        r.state.read(|s| {
            assert!(!s.is_new);
            assert_eq!(s.params.saved("ip"), Some("10.0.0.5"));
        });
    }
}
