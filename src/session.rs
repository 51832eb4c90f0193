//! A browsing session over one cluster: the resources, their dependency
//! graph, the collaborators that read and change the live cluster, and the
//! lifecycle trackers.
//!
//! Reconciliation entry points are spread over the modules that own them
//! (`apply`, `constraints`, `lifecycle`) as `impl Session` blocks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use facet::Facet;
use tokio::sync::broadcast;

use crate::config::{ResourceConfig, SessionConfig};
use crate::constraints::DependencyGraph;
use crate::detect;
use crate::error::HamcError;
use crate::intent::{CommandExecutor, Intent, Submitted, submit_checked};
use crate::lifecycle::{DomainTracker, LifecycleConfig, LifecycleEvent};
use crate::locked::Locked;
use crate::logging::IntentJournal;
use crate::model::{Resource, ResourceKind};
use crate::params::{HostLocation, SameAs, SavedLocation};
use crate::placeholder::{EdgeKind, Placeholder};
use crate::registry::{RefFamily, Registry};
use crate::schema::{
    AgentId, AgentSchema, clone_meta_attrs, default_operations, drbd_resource_params,
    group_meta_attrs, operations_from_nested, virtual_domain_params,
};
use crate::score::{LocationOp, Score, parse_optional};
use crate::snapshot::{ClusterSnapshot, ClusterStateSource};

pub struct Session {
    pub(crate) registry: Registry,
    pub(crate) graph: Locked<DependencyGraph>,
    pub(crate) hosts: Vec<String>,
    dc_host: Locked<String>,
    executor: Arc<dyn CommandExecutor>,
    pub(crate) source: Arc<dyn ClusterStateSource>,
    schemas: BTreeMap<AgentId, Arc<AgentSchema>>,
    pub(crate) lifecycle: LifecycleConfig,
    pub(crate) trackers: Locked<BTreeMap<String, Arc<DomainTracker>>>,
    pub(crate) events: broadcast::Sender<LifecycleEvent>,
    journal: Option<IntentJournal>,
}

/// Per-resource line of `status` output.
#[derive(Debug, Clone, Facet)]
pub struct ResourceStatus {
    pub key: String,
    pub crm_id: String,
    pub kind: String,
    pub changed: bool,
    pub fields: Vec<String>,
    pub new: bool,
    pub orphaned: bool,
    pub removed: bool,
    pub failed: bool,
    pub running_on: Vec<String>,
}

impl Session {
    /// `hosts` is the ordered cluster host list; intents that are not
    /// host-specific go to `dc_host`.
    pub fn new(
        hosts: Vec<String>,
        dc_host: &str,
        executor: Arc<dyn CommandExecutor>,
        source: Arc<dyn ClusterStateSource>,
    ) -> Result<Self, HamcError> {
        if hosts.is_empty() {
            return Err(HamcError::Validation {
                message: "a cluster needs at least one host".into(),
            });
        }
        if !hosts.iter().any(|h| h == dc_host) {
            return Err(HamcError::UnknownHost {
                name: dc_host.to_string(),
            });
        }
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            registry: Registry::new(),
            graph: Locked::new(DependencyGraph::default()),
            hosts,
            dc_host: Locked::new(dc_host.to_string()),
            executor,
            source,
            schemas: BTreeMap::new(),
            lifecycle: LifecycleConfig::default(),
            trackers: Locked::new(BTreeMap::new()),
            events,
            journal: None,
        })
    }

    pub fn with_lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_journal(mut self, journal: IntentJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_schema(mut self, agent: AgentId, schema: AgentSchema) -> Self {
        self.schemas.insert(agent, Arc::new(schema));
        self
    }

    /// Build a session holding the desired state described by a session
    /// file. Every configured resource starts out new; a refresh matches
    /// them against what is live.
    pub fn from_config(
        config: &SessionConfig,
        executor: Arc<dyn CommandExecutor>,
        source: Arc<dyn ClusterStateSource>,
    ) -> Result<Self, HamcError> {
        let hosts = config.config.cluster.hosts.clone();
        let mut session = Self::new(hosts, config.dc_host(), executor, source)?
            .with_lifecycle(config.lifecycle());
        session.schemas = config
            .schemas()?
            .into_iter()
            .map(|(agent, schema)| (agent, Arc::new(schema)))
            .collect();

        for rc in &config.config.resources {
            session.add_configured(rc)?;
        }
        for rc in &config.config.resources {
            session.link_configured(rc)?;
        }
        for edge in &config.config.edges {
            let score = parse_optional(&edge.score)?.unwrap_or(Score::Infinity);
            session.graph.update(|g| {
                let e = g.ensure_edge(&edge.parent, &edge.child);
                e.colocation = edge.colocation;
                e.order = edge.order;
                e.score = score;
            });
        }
        Ok(session)
    }

    fn add_configured(&self, rc: &ResourceConfig) -> Result<(), HamcError> {
        let kind: ResourceKind = rc.kind.parse()?;
        let agent = if rc.agent.is_empty() {
            None
        } else {
            Some(rc.agent.parse::<AgentId>()?)
        };
        let schema = self.schema_for(kind, agent.as_ref());
        let resource = Resource::new(&rc.name, kind, agent, schema);
        if !rc.id.is_empty() {
            resource.rename(&rc.id);
        }
        for (name, value) in rc.params.iter().chain(&rc.meta) {
            resource.set_param(name, value);
        }
        for (op, fields) in &rc.operations {
            for (field, value) in fields {
                resource.set_operation(op, field, value);
            }
        }
        for loc in &rc.locations {
            if !self.hosts.contains(&loc.host) {
                return Err(HamcError::UnknownHost {
                    name: loc.host.clone(),
                });
            }
            let location = HostLocation {
                score: parse_optional(&loc.score)?,
                op: loc.op.parse()?,
            };
            resource.set_location(&loc.host, location);
        }
        self.registry.insert(resource);
        Ok(())
    }

    /// Second pass over configured resources: anything naming another
    /// resource.
    fn link_configured(&self, rc: &ResourceConfig) -> Result<(), HamcError> {
        let resource = self.registry.require(&rc.name)?;
        if !rc.meta_same_as.is_empty() {
            self.registry
                .select_reference(&rc.name, RefFamily::Meta, parse_same_as(&rc.meta_same_as))?;
        }
        if !rc.operations_same_as.is_empty() {
            self.registry.select_reference(
                &rc.name,
                RefFamily::Operations,
                parse_same_as(&rc.operations_same_as),
            )?;
        }
        if !rc.members.is_empty() {
            for member in &rc.members {
                let member = self.registry.require(member)?;
                member.state.update(|s| s.container = Some(rc.name.clone()));
            }
            resource
                .state
                .update(|s| s.members = rc.members.clone());
        }
        Ok(())
    }

    /// Schema for a resource: the configured agent schema if there is
    /// one, otherwise what the cluster manager defines for the kind.
    pub fn schema_for(&self, kind: ResourceKind, agent: Option<&AgentId>) -> Arc<AgentSchema> {
        if let Some(schema) = agent.and_then(|a| self.schemas.get(a)) {
            return Arc::clone(schema);
        }
        Arc::new(match kind {
            ResourceKind::Primitive | ResourceKind::Stonith => {
                AgentSchema::for_primitive(Vec::new(), default_operations())
            }
            ResourceKind::Group => AgentSchema::new(group_meta_attrs(), Default::default()),
            ResourceKind::Clone => AgentSchema::new(clone_meta_attrs(false), Default::default()),
            ResourceKind::MasterSlave => {
                AgentSchema::new(clone_meta_attrs(true), Default::default())
            }
            ResourceKind::Drbd => AgentSchema::new(drbd_resource_params(), Default::default()),
            ResourceKind::VirtualDomain => {
                AgentSchema::new(virtual_domain_params(), Default::default())
            }
            ResourceKind::Placeholder => AgentSchema::default(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn dc_host(&self) -> String {
        self.dc_host.snapshot()
    }

    pub fn graph(&self) -> DependencyGraph {
        self.graph.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn has_changed(&self, key: &str, param: Option<&str>) -> Result<bool, HamcError> {
        let resource = self.registry.require(key)?;
        Ok(detect::has_changed(&resource, param))
    }

    /// Submit one intent against the DC.
    pub(crate) fn submit(&self, intent: Intent, dry_run: bool) -> Result<Submitted, HamcError> {
        let dc = self.dc_host();
        self.submit_to(&dc, intent, dry_run)
    }

    pub(crate) fn submit_to(
        &self,
        host: &str,
        intent: Intent,
        dry_run: bool,
    ) -> Result<Submitted, HamcError> {
        let result = submit_checked(self.executor.as_ref(), &intent, host, dry_run);
        if let Some(journal) = &self.journal {
            journal.record(&intent, host, dry_run, result.is_ok());
        }
        let submission = result?;
        Ok(Submitted {
            intent,
            host: host.to_string(),
            dry_run,
            output: submission.output,
        })
    }

    // ── live state ───────────────────────────────────────

    /// Fetch a snapshot from the DC, falling back to the other hosts in
    /// order, and merge it into the saved slots.
    pub fn refresh(&self) -> Result<(), HamcError> {
        let dc = self.dc_host();
        let order = std::iter::once(&dc).chain(self.hosts.iter().filter(|h| **h != dc));
        let mut last_err = None;
        for host in order {
            match self.source.fetch_snapshot(host) {
                Ok(snapshot) => {
                    tracing::debug!(
                        host = %host,
                        resources = snapshot.resources.len(),
                        "fetched snapshot"
                    );
                    return self.merge_snapshot(&snapshot);
                }
                Err(e) => {
                    tracing::warn!(host = %host, error = %e, "snapshot unavailable");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| HamcError::StateSource {
            host: dc,
            message: "no host answered".into(),
        }))
    }

    /// Replace every resource's saved slots with what `snapshot` reports.
    /// Edited values are left alone.
    pub fn merge_snapshot(&self, snapshot: &ClusterSnapshot) -> Result<(), HamcError> {
        if !snapshot.dc.is_empty() && self.hosts.contains(&snapshot.dc) {
            self.dc_host.update(|dc| *dc = snapshot.dc.clone());
        }

        let mut seen: BTreeSet<String> = BTreeSet::new();
        for (crm_id, rs) in &snapshot.resources {
            let kind: ResourceKind = rs.kind.parse()?;
            let agent = if rs.agent.is_empty() {
                None
            } else {
                Some(rs.agent.parse::<AgentId>()?)
            };
            let resource = match self.registry.find_by_crm_id(crm_id) {
                Some(existing) => existing,
                None => {
                    tracing::debug!(crm_id = %crm_id, %kind, "discovered resource");
                    let resource = Resource::committed(
                        crm_id,
                        crm_id,
                        kind,
                        agent.clone(),
                        self.schema_for(kind, agent.as_ref()),
                    );
                    let agent_kind = agent.as_ref().map(|a| a.kind.as_str());
                    resource.rename(&kind.edited_id_from(agent_kind, crm_id));
                    self.registry.insert(resource)
                }
            };
            seen.insert(resource.key().to_string());

            let mut saved = rs.params.clone();
            saved.extend(rs.meta.iter().map(|(k, v)| (k.clone(), v.clone())));
            let operations = operations_from_nested(&rs.operations);
            resource.state.update(|s| {
                s.is_new = false;
                s.crm_id = Some(crm_id.clone());
                s.is_removed = false;
                s.params.replace_saved(saved);
                s.operations.saved = operations;
                s.is_orphaned = snapshot.orphaned.contains(crm_id);
                s.failed_hosts = snapshot.failed_hosts(crm_id);
                s.failed_instances = snapshot
                    .failed_instances
                    .get(crm_id)
                    .cloned()
                    .unwrap_or_default();
                s.running_on = snapshot
                    .running_on
                    .get(crm_id)
                    .map(|hosts| hosts.iter().cloned().collect())
                    .unwrap_or_default();
                s.locations.saved.clear();
                s.invalidate();
            });
        }

        // References and membership need every resource in place first.
        for (crm_id, rs) in &snapshot.resources {
            let Some(resource) = self.registry.find_by_crm_id(crm_id) else {
                continue;
            };
            let meta_ref = self.saved_reference(&rs.meta_ref);
            let ops_ref = self.saved_reference(&rs.operations_ref);
            let members = rs
                .members
                .iter()
                .filter_map(|m| self.registry.resolve_key(m))
                .collect::<Vec<_>>();
            for member in &members {
                if let Some(m) = self.registry.get(member) {
                    m.state.update(|s| s.container = Some(resource.key().to_string()));
                }
            }
            resource.state.update(|s| {
                merge_reference(&mut s.meta_same_as.saved, meta_ref);
                merge_reference(&mut s.operations.same_as.saved, ops_ref);
                if !members.is_empty() {
                    s.members = members;
                }
            });
        }

        for loc in &snapshot.locations {
            let Some(resource) = self.registry.find_by_crm_id(&loc.resource) else {
                tracing::warn!(
                    id = %loc.id,
                    resource = %loc.resource,
                    "location for unknown resource"
                );
                continue;
            };
            let location = HostLocation {
                score: parse_optional(&loc.score)?,
                op: loc.op.parse::<LocationOp>()?,
            };
            resource.state.update(|s| {
                s.locations.saved.insert(
                    loc.host.clone(),
                    SavedLocation {
                        id: loc.id.clone(),
                        location,
                    },
                );
            });
        }

        let placeholders = self.merge_constraints(snapshot)?;
        seen.extend(placeholders);

        for resource in self.registry.all() {
            if seen.contains(resource.key()) || resource.kind() == ResourceKind::Placeholder {
                continue;
            }
            resource.state.update(|s| {
                if !s.is_new && !s.is_removed {
                    tracing::info!(resource = %resource.key(), "no longer in the cluster");
                    s.is_removed = true;
                    s.invalidate();
                }
            });
        }
        Ok(())
    }

    fn saved_reference(&self, crm_id: &str) -> Option<SameAs> {
        if crm_id.is_empty() {
            return None;
        }
        self.registry.resolve_key(crm_id).map(SameAs::Resource)
    }

    /// Pairwise constraints become live edges; resource sets fill their
    /// placeholders. Returns the placeholder keys seen.
    fn merge_constraints(&self, snapshot: &ClusterSnapshot) -> Result<Vec<String>, HamcError> {
        self.graph.update(|g| {
            for edge in g.edges().to_vec() {
                if let Some(e) = g.edge_mut(&edge.parent, &edge.child) {
                    e.saved_colocation_id = None;
                    e.saved_order_id = None;
                }
            }
        });

        for (kind, list) in [
            (EdgeKind::Colocation, &snapshot.colocations),
            (EdgeKind::Order, &snapshot.orders),
        ] {
            for c in list {
                let (Some(parent), Some(child)) = (
                    self.registry.resolve_key(&c.parent),
                    self.registry.resolve_key(&c.child),
                ) else {
                    tracing::warn!(id = %c.id, "constraint between unknown resources");
                    continue;
                };
                let score = parse_optional(&c.score)?.unwrap_or(Score::Infinity);
                self.graph.update(|g| {
                    let e = g.ensure_edge(&parent, &child);
                    e.score = score;
                    match kind {
                        EdgeKind::Colocation => {
                            e.colocation = true;
                            e.saved_colocation_id = Some(c.id.clone());
                        }
                        EdgeKind::Order => {
                            e.order = true;
                            e.saved_order_id = Some(c.id.clone());
                        }
                    }
                });
            }
        }

        let mut placeholders = Vec::new();
        for set in &snapshot.resource_sets {
            let kind = match set.kind.as_str() {
                "colocation" => EdgeKind::Colocation,
                "order" => EdgeKind::Order,
                other => {
                    return Err(HamcError::Validation {
                        message: format!("resource set '{}' has unknown kind '{other}'", set.id),
                    });
                }
            };
            let ph = match self.registry.get(&set.placeholder) {
                Some(ph) => ph,
                None => self.registry.insert(Resource::committed(
                    &set.placeholder,
                    &set.placeholder,
                    ResourceKind::Placeholder,
                    None,
                    self.schema_for(ResourceKind::Placeholder, None),
                )),
            };
            placeholders.push(ph.key().to_string());
            let score = parse_optional(&set.score)?.unwrap_or(Score::Infinity);
            ph.state.update(|s| {
                s.is_new = false;
                s.is_removed = false;
                let placeholder = s
                    .placeholder
                    .get_or_insert_with(|| Placeholder::new(&set.placeholder));
                let c = placeholder.constraint_mut(kind);
                c.id = Some(set.id.clone());
                c.score = score;
                c.first = set.first.clone();
                c.then = set.then.clone();
            });

            let parents = set.first.iter().filter_map(|m| self.registry.resolve_key(m));
            let children = set.then.iter().filter_map(|m| self.registry.resolve_key(m));
            let edges: Vec<(String, String)> = parents
                .map(|p| (p, ph.key().to_string()))
                .chain(children.map(|c| (ph.key().to_string(), c)))
                .collect();
            self.graph.update(|g| {
                for (parent, child) in edges {
                    let e = g.ensure_edge(&parent, &child);
                    match kind {
                        EdgeKind::Colocation => {
                            e.colocation = true;
                            e.saved_colocation_id = Some(set.id.clone());
                        }
                        EdgeKind::Order => {
                            e.order = true;
                            e.saved_order_id = Some(set.id.clone());
                        }
                    }
                }
            });
        }
        Ok(placeholders)
    }

    /// Submit every wanted edge that is not live yet. Edges touching a
    /// removed resource are skipped.
    pub fn reconcile_graph(&self, dry_run: bool) -> Result<Vec<Submitted>, HamcError> {
        let edges = self.graph.read(|g| g.edges().to_vec());
        let mut submitted = Vec::new();
        for edge in edges.iter().filter(|e| e.colocation || e.order) {
            let removed = [&edge.parent, &edge.child].into_iter().any(|key| {
                self.registry
                    .get(key)
                    .is_none_or(|r| r.state.read(|s| s.is_removed))
            });
            if removed {
                continue;
            }
            submitted.extend(self.add_edge(
                &edge.parent,
                &edge.child,
                edge.colocation,
                edge.order,
                dry_run,
            )?);
        }
        Ok(submitted)
    }

    // ── resource removal ─────────────────────────────────

    /// Forget a resource and every edge touching it.
    pub fn remove_resource(&self, key: &str) -> Result<Arc<Resource>, HamcError> {
        let resource = match self.registry.get(key) {
            Some(r) if r.kind() == ResourceKind::Drbd => self.registry.remove_drbd(key)?,
            Some(_) => self.registry.remove(key).ok_or_else(|| HamcError::UnknownResource {
                name: key.to_string(),
            })?,
            None => {
                return Err(HamcError::UnknownResource {
                    name: key.to_string(),
                });
            }
        };
        self.graph.update(|g| g.remove_resource(key));
        Ok(resource)
    }

    // ── reporting ────────────────────────────────────────

    pub fn status(&self) -> Vec<ResourceStatus> {
        self.registry
            .all()
            .into_iter()
            .map(|r| {
                let changed = !r.state.read(|s| s.is_removed) && detect::has_changed(&r, None);
                let fields = if changed { detect::changed_fields(&r) } else { Vec::new() };
                r.state.read(|s| ResourceStatus {
                    key: r.key().to_string(),
                    crm_id: r.crm_id_of(s),
                    kind: r.kind().to_string(),
                    changed,
                    fields,
                    new: s.is_new,
                    orphaned: s.is_orphaned,
                    removed: s.is_removed,
                    failed: s.is_failed(),
                    running_on: s.running_on.iter().cloned().collect(),
                })
            })
            .collect()
    }
}

fn parse_same_as(value: &str) -> SameAs {
    match value {
        "" => SameAs::NothingSelected,
        "default" | "defaults" => SameAs::DefaultValues,
        key => SameAs::Resource(key.to_string()),
    }
}

/// Live state only knows about real references; a sentinel chosen in the
/// session survives a refresh that reports none.
fn merge_reference(saved: &mut SameAs, live: Option<SameAs>) {
    match live {
        Some(reference) => *saved = reference,
        None => {
            if saved.resource().is_some() {
                *saved = SameAs::NothingSelected;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::RecordingExecutor;
    use crate::snapshot::{
        LocationSnapshot, PairConstraintSnapshot, ResourceSetSnapshot, ResourceSnapshot,
        StaticStateSource,
    };

    fn ip_snapshot(crm_id: &str, ip: &str) -> (String, ResourceSnapshot) {
        (
            crm_id.to_string(),
            ResourceSnapshot {
                kind: "primitive".into(),
                agent: "ocf:heartbeat:IPaddr2".into(),
                params: BTreeMap::from([("ip".to_string(), ip.to_string())]),
                ..Default::default()
            },
        )
    }

    fn session(
        snapshot: ClusterSnapshot,
    ) -> (Session, Arc<RecordingExecutor>, Arc<StaticStateSource>) {
        let exec = Arc::new(RecordingExecutor::new());
        let source = Arc::new(StaticStateSource::new(snapshot));
        let session = Session::new(
            vec!["h1".into(), "h2".into()],
            "h1",
            exec.clone(),
            source.clone(),
        )
        .unwrap();
        (session, exec, source)
    }

    #[test]
    fn rejects_dc_outside_hosts() {
        let result = Session::new(
            vec!["h1".into()],
            "h9",
            Arc::new(RecordingExecutor::new()),
            Arc::new(StaticStateSource::default()),
        );
        assert!(matches!(result, Err(HamcError::UnknownHost { .. })));
    }

    #[test]
    fn refresh_discovers_committed_resources() {
        let mut snapshot = ClusterSnapshot::default();
        snapshot.resources.extend([ip_snapshot("res_IPaddr2_web", "10.0.0.1")]);
        snapshot.running_on.insert("res_IPaddr2_web".into(), vec!["h2".into()]);
        let (session, _, _) = session(snapshot);
        session.refresh().unwrap();

        let web = session.registry().require("res_IPaddr2_web").unwrap();
        assert!(!web.is_new());
        assert_eq!(web.state.read(|s| s.edited_id.clone()), "web");
        assert_eq!(web.running_on(), BTreeSet::from(["h2".to_string()]));
        assert!(!session.has_changed("res_IPaddr2_web", None).unwrap());
    }

    #[test]
    fn refresh_matches_new_resources_by_expected_id() {
        let mut snapshot = ClusterSnapshot::default();
        snapshot.resources.extend([ip_snapshot("res_IPaddr2_ip1", "10.0.0.1")]);
        let (session, _, _) = session(snapshot);
        let ip = session.registry.insert(Resource::new(
            "ip1",
            ResourceKind::Primitive,
            Some("ocf:heartbeat:IPaddr2".parse().unwrap()),
            session.schema_for(ResourceKind::Primitive, None),
        ));
        ip.set_param("ip", "10.0.0.1");
        session.refresh().unwrap();

        assert!(!ip.is_new());
        assert_eq!(session.registry().keys(), vec!["ip1".to_string()]);
        assert!(!session.has_changed("ip1", None).unwrap());
    }

    #[test]
    fn vanished_resources_are_marked_removed() {
        let mut snapshot = ClusterSnapshot::default();
        snapshot.resources.extend([ip_snapshot("res_IPaddr2_web", "10.0.0.1")]);
        let (session, _, source) = session(snapshot);
        session.refresh().unwrap();
        source.set_snapshot(ClusterSnapshot::default());
        session.refresh().unwrap();
        let web = session.registry().require("res_IPaddr2_web").unwrap();
        assert!(web.state.read(|s| s.is_removed));
    }

    #[test]
    fn refresh_falls_back_when_dc_unreachable() {
        let mut snapshot = ClusterSnapshot::default();
        snapshot.resources.extend([ip_snapshot("res_IPaddr2_web", "10.0.0.1")]);
        let (session, _, source) = session(snapshot);
        source.set_unreachable("h1", true);
        session.refresh().unwrap();
        assert!(session.registry().contains("res_IPaddr2_web"));
    }

    #[test]
    fn merge_fills_saved_locations_and_edges() {
        let mut snapshot = ClusterSnapshot::default();
        snapshot.resources.extend([
            ip_snapshot("res_IPaddr2_a", "10.0.0.1"),
            ip_snapshot("res_IPaddr2_b", "10.0.0.2"),
        ]);
        snapshot.locations.push(LocationSnapshot {
            id: "loc_res_IPaddr2_a_h1".into(),
            resource: "res_IPaddr2_a".into(),
            host: "h1".into(),
            score: "ALWAYS".into(),
            op: String::new(),
        });
        snapshot.orders.push(PairConstraintSnapshot {
            id: "ord_res_IPaddr2_a_res_IPaddr2_b".into(),
            parent: "res_IPaddr2_a".into(),
            child: "res_IPaddr2_b".into(),
            score: String::new(),
        });
        let (session, exec, _) = session(snapshot);
        session.refresh().unwrap();

        let a = session.registry().require("res_IPaddr2_a").unwrap();
        a.set_location("h1", HostLocation::new(Score::Infinity, LocationOp::Eq));
        assert!(!session.has_changed("res_IPaddr2_a", None).unwrap());

        session.add_order("res_IPaddr2_a", "res_IPaddr2_b", false).unwrap();
        assert!(exec.intents().is_empty());
    }

    #[test]
    fn resource_set_removal_keeps_other_members() {
        let mut snapshot = ClusterSnapshot::default();
        snapshot.resources.extend([
            ip_snapshot("res_IPaddr2_a", "10.0.0.1"),
            ip_snapshot("res_IPaddr2_b", "10.0.0.2"),
            ip_snapshot("res_IPaddr2_c", "10.0.0.3"),
        ]);
        snapshot.resource_sets.push(ResourceSetSnapshot {
            id: "col_ph1".into(),
            kind: "colocation".into(),
            score: "INFINITY".into(),
            placeholder: "ph1".into(),
            first: vec!["res_IPaddr2_a".into(), "res_IPaddr2_b".into(), "res_IPaddr2_c".into()],
            then: Vec::new(),
        });
        let (session, exec, _) = session(snapshot);
        session.refresh().unwrap();

        session.remove_colocation("res_IPaddr2_b", "ph1", false).unwrap();
        let intents = exec.intents();
        assert_eq!(intents.len(), 1);
        match &intents[0] {
            Intent::SetResourceSet(c) => {
                assert_eq!(c.id, "col_ph1");
                assert_eq!(
                    c.sets[0].members,
                    vec!["res_IPaddr2_a".to_string(), "res_IPaddr2_c".to_string()]
                );
            }
            other => panic!("unexpected intent {other:?}"),
        }
    }

    #[test]
    fn pairwise_master_slave_edge_carries_roles() {
        let (session, exec, _) = session(ClusterSnapshot::default());
        session.registry.insert(Resource::committed(
            "ms1",
            "ms_ms1",
            ResourceKind::MasterSlave,
            None,
            session.schema_for(ResourceKind::MasterSlave, None),
        ));
        session.registry.insert(Resource::committed(
            "fs",
            "res_Filesystem_fs",
            ResourceKind::Primitive,
            Some("ocf:heartbeat:Filesystem".parse().unwrap()),
            session.schema_for(ResourceKind::Primitive, None),
        ));
        session.add_edge("ms1", "fs", true, true, false).unwrap();
        match &exec.intents()[0] {
            Intent::SetOrderAndColocation { colocation: Some(c), order: Some(o), .. } => {
                assert_eq!(c.id, "col_res_Filesystem_fs_ms_ms1");
                assert_eq!(c.with_rsc_role.as_deref(), Some("Master"));
                assert_eq!(o.id, "ord_ms_ms1_res_Filesystem_fs");
                assert_eq!(o.first_action.as_deref(), Some("promote"));
                assert_eq!(o.then_action.as_deref(), Some("start"));
            }
            other => panic!("unexpected intent {other:?}"),
        }

        exec.clear();
        session.add_edge("ms1", "fs", true, true, false).unwrap();
        assert!(exec.intents().is_empty());

        session.remove_order("ms1", "fs", false).unwrap();
        assert_eq!(
            exec.intents(),
            vec![Intent::RemoveOrder {
                id: "ord_ms_ms1_res_Filesystem_fs".into()
            }]
        );
    }

    #[test]
    fn two_placeholders_cannot_be_linked() {
        let (session, _, _) = session(ClusterSnapshot::default());
        for key in ["ph1", "ph2"] {
            session.registry.insert(Resource::new(
                key,
                ResourceKind::Placeholder,
                None,
                Arc::new(AgentSchema::default()),
            ));
        }
        assert!(session.add_order("ph1", "ph2", false).is_err());
    }

    #[test]
    fn configured_reference_cycle_is_refused() {
        use crate::config::{ClusterConfig, Config};
        let resource = |name: &str, same_as: &str| ResourceConfig {
            name: name.into(),
            agent: "ocf:heartbeat:IPaddr2".into(),
            meta_same_as: same_as.into(),
            ..Default::default()
        };
        let config = SessionConfig {
            config_path: std::path::PathBuf::from("/tmp/hamc.toml"),
            config: Config {
                cluster: ClusterConfig {
                    hosts: vec!["h1".into()],
                    ..Default::default()
                },
                resources: vec![resource("a", "b"), resource("b", "a")],
                ..Default::default()
            },
        };
        let result = Session::from_config(
            &config,
            Arc::new(RecordingExecutor::new()),
            Arc::new(StaticStateSource::default()),
        );
        assert!(matches!(
            result,
            Err(HamcError::InvalidParameter { ref resource, .. }) if resource == "b"
        ));
    }

    #[test]
    fn removing_drbd_drops_edges() {
        let (session, _, _) = session(ClusterSnapshot::default());
        let schema = session.schema_for(ResourceKind::Drbd, None);
        session
            .registry
            .insert(Resource::committed("r0", "r0", ResourceKind::Drbd, None, Arc::clone(&schema)));
        session
            .registry
            .insert(Resource::committed("r1", "r1", ResourceKind::Drbd, None, schema));
        session.graph.update(|g| g.ensure_edge("r0", "r1").order = true);
        session.remove_resource("r0").unwrap();
        assert!(session.graph().edges().is_empty());
        assert!(session.remove_resource("r0").is_err());
    }
}
