//! Placement reconciliation: host locations, pairwise order/colocation, and
//! the resource-set path through constraint placeholders.
//!
//! Intents are computed from a snapshot of the resource state, submitted
//! against the DC, and only then written back under the resource lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::HamcError;
use crate::intent::{ColocationSpec, Intent, OrderSpec, Submitted};
use crate::model::{Resource, ResourceKind};
use crate::params::{HostLocation, LocationSet, SavedLocation};
use crate::placeholder::{EdgeKind, Side};
use crate::score::{LocationOp, Score};
use crate::session::Session;

// ── host locations ────────────────────────────────────────

/// Id a new location constraint is created under.
pub fn location_id(crm_id: &str, host: &str, op: LocationOp) -> String {
    match op {
        LocationOp::Eq => format!("loc_{crm_id}_{host}"),
        LocationOp::Ne => format!("nloc_{crm_id}_{host}"),
    }
}

/// Intents that move every host's location from saved to desired.
///
/// Hosts are visited in the given order; unchanged hosts emit nothing. The
/// cluster manager cannot change score and operation in one step, so a
/// removal always comes before the re-add on the same host.
pub fn location_intents(crm_id: &str, hosts: &[String], locations: &LocationSet) -> Vec<Intent> {
    let mut intents = Vec::new();
    for host in hosts {
        if !locations.is_changed(host) {
            continue;
        }
        let desired = locations.desired(host);
        let saved = locations.saved.get(host);

        if let Some(saved) = saved
            && (desired.is_empty() || desired.op != saved.location.op)
        {
            intents.push(Intent::RemoveLocation {
                resource: crm_id.to_string(),
                location_id: saved.id.clone(),
                host: host.clone(),
            });
        }

        if let Some(score) = desired.score {
            let location_id = match saved {
                Some(saved) if saved.location.op == desired.op => saved.id.clone(),
                _ => location_id(crm_id, host, desired.op),
            };
            intents.push(Intent::SetLocation {
                resource: crm_id.to_string(),
                location_id,
                host: host.clone(),
                score,
                op: desired.op,
            });
        }
    }
    intents
}

/// Record one landed location intent in the saved slot.
pub fn record_location(locations: &mut LocationSet, intent: &Intent) {
    match intent {
        Intent::RemoveLocation { host, .. } => {
            locations.saved.remove(host);
        }
        Intent::SetLocation {
            host,
            location_id,
            score,
            op,
            ..
        } => {
            locations.saved.insert(
                host.clone(),
                SavedLocation {
                    id: location_id.clone(),
                    location: HostLocation::new(*score, *op),
                },
            );
        }
        _ => {}
    }
}

/// Drop the location edits that were reconciled and have not been edited
/// again since.
pub fn settle_location_edits(
    locations: &mut LocationSet,
    submitted: &BTreeMap<String, HostLocation>,
) {
    for (host, location) in submitted {
        if locations.edited.get(host) == Some(location) {
            locations.edited.remove(host);
        }
    }
}

// ── dependency graph ──────────────────────────────────────

/// A desired relation between two resources, by registry key. `parent`
/// is started first and is the one the child is colocated with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub parent: String,
    pub child: String,
    pub colocation: bool,
    pub order: bool,
    pub score: Score,
    pub reversed_colocation: bool,
    pub reversed_order: bool,
    /// Live constraint ids, once submitted or discovered.
    pub saved_colocation_id: Option<String>,
    pub saved_order_id: Option<String>,
}

impl Edge {
    fn new(parent: &str, child: &str) -> Self {
        Self {
            parent: parent.to_string(),
            child: child.to_string(),
            colocation: false,
            order: false,
            score: Score::Infinity,
            reversed_colocation: false,
            reversed_order: false,
            saved_colocation_id: None,
            saved_order_id: None,
        }
    }

    fn saved_id(&self, kind: EdgeKind) -> Option<&String> {
        match kind {
            EdgeKind::Colocation => self.saved_colocation_id.as_ref(),
            EdgeKind::Order => self.saved_order_id.as_ref(),
        }
    }

    fn saved_id_mut(&mut self, kind: EdgeKind) -> &mut Option<String> {
        match kind {
            EdgeKind::Colocation => &mut self.saved_colocation_id,
            EdgeKind::Order => &mut self.saved_order_id,
        }
    }

    fn reversed(&self, kind: EdgeKind) -> bool {
        match kind {
            EdgeKind::Colocation => self.reversed_colocation,
            EdgeKind::Order => self.reversed_order,
        }
    }

    fn wants(&self, kind: EdgeKind) -> bool {
        match kind {
            EdgeKind::Colocation => self.colocation,
            EdgeKind::Order => self.order,
        }
    }

    fn set_wants(&mut self, kind: EdgeKind, wanted: bool) {
        match kind {
            EdgeKind::Colocation => self.colocation = wanted,
            EdgeKind::Order => self.order = wanted,
        }
    }

    fn is_dead(&self) -> bool {
        !self.colocation
            && !self.order
            && self.saved_colocation_id.is_none()
            && self.saved_order_id.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: Vec<Edge>,
}

impl DependencyGraph {
    pub fn edge(&self, parent: &str, child: &str) -> Option<&Edge> {
        self.edges
            .iter()
            .find(|e| e.parent == parent && e.child == child)
    }

    pub fn edge_mut(&mut self, parent: &str, child: &str) -> Option<&mut Edge> {
        self.edges
            .iter_mut()
            .find(|e| e.parent == parent && e.child == child)
    }

    /// The edge between `parent` and `child`, created empty if missing.
    pub fn ensure_edge(&mut self, parent: &str, child: &str) -> &mut Edge {
        let pos = match self
            .edges
            .iter()
            .position(|e| e.parent == parent && e.child == child)
        {
            Some(pos) => pos,
            None => {
                self.edges.push(Edge::new(parent, child));
                self.edges.len() - 1
            }
        };
        &mut self.edges[pos]
    }

    pub fn parents_of(&self, child: &str) -> Vec<Edge> {
        self.edges
            .iter()
            .filter(|e| e.child == child)
            .cloned()
            .collect()
    }

    pub fn children_of(&self, parent: &str) -> Vec<Edge> {
        self.edges
            .iter()
            .filter(|e| e.parent == parent)
            .cloned()
            .collect()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Drop edges that are neither wanted nor live.
    pub fn prune(&mut self) {
        self.edges.retain(|e| !e.is_dead());
    }

    /// Forget every edge touching `key`.
    pub fn remove_resource(&mut self, key: &str) {
        self.edges.retain(|e| e.parent != key && e.child != key);
    }
}

fn order_id(parent_crm: &str, child_crm: &str) -> String {
    format!("ord_{parent_crm}_{child_crm}")
}

fn colocation_id(parent_crm: &str, child_crm: &str) -> String {
    format!("col_{child_crm}_{parent_crm}")
}

fn order_spec(parent: &Resource, parent_crm: &str, child_crm: &str, score: Score) -> OrderSpec {
    let master = parent.kind() == ResourceKind::MasterSlave;
    OrderSpec {
        id: order_id(parent_crm, child_crm),
        score,
        first_action: master.then(|| "promote".to_string()),
        then_action: master.then(|| "start".to_string()),
    }
}

fn colocation_spec(
    parent: &Resource,
    parent_crm: &str,
    child_crm: &str,
    score: Score,
) -> ColocationSpec {
    ColocationSpec {
        id: colocation_id(parent_crm, child_crm),
        score,
        with_rsc_role: (parent.kind() == ResourceKind::MasterSlave).then(|| "Master".to_string()),
    }
}

// ── session operations ────────────────────────────────────

impl Session {
    /// Bring `key`'s host locations in line with its edits, removing before
    /// re-adding on each host. Saved locations are updated unless
    /// `dry_run`.
    pub fn set_locations(&self, key: &str, dry_run: bool) -> Result<Vec<Submitted>, HamcError> {
        let resource = self.registry.require(key)?;
        if !resource.kind().has_locations() {
            return Ok(Vec::new());
        }
        let (crm_id, locations) = resource
            .state
            .read(|s| (resource.crm_id_of(s), s.locations.clone()));
        let intents = location_intents(&crm_id, &self.hosts, &locations);
        let mut submitted = Vec::with_capacity(intents.len());
        for intent in intents {
            let landed = self.submit(intent, dry_run)?;
            if !dry_run {
                resource.state.update(|s| {
                    record_location(&mut s.locations, &landed.intent);
                    s.forget_verdict(crate::detect::LOCATIONS);
                });
            }
            submitted.push(landed);
        }
        if !dry_run {
            resource.state.update(|s| {
                settle_location_edits(&mut s.locations, &locations.edited);
                s.forget_verdict(crate::detect::LOCATIONS);
            });
        }
        Ok(submitted)
    }

    /// Record a desired location edit and reconcile it immediately.
    pub fn place(
        &self,
        key: &str,
        host: &str,
        location: HostLocation,
        dry_run: bool,
    ) -> Result<Vec<Submitted>, HamcError> {
        if !self.hosts.iter().any(|h| h == host) {
            return Err(HamcError::UnknownHost { name: host.to_string() });
        }
        self.registry.require(key)?.set_location(host, location);
        self.set_locations(key, dry_run)
    }

    pub fn add_order(
        &self,
        parent: &str,
        child: &str,
        dry_run: bool,
    ) -> Result<Vec<Submitted>, HamcError> {
        self.add_edge(parent, child, false, true, dry_run)
    }

    pub fn add_colocation(
        &self,
        parent: &str,
        child: &str,
        dry_run: bool,
    ) -> Result<Vec<Submitted>, HamcError> {
        self.add_edge(parent, child, true, false, dry_run)
    }

    pub fn remove_order(
        &self,
        parent: &str,
        child: &str,
        dry_run: bool,
    ) -> Result<Vec<Submitted>, HamcError> {
        self.remove_edge_kind(parent, child, EdgeKind::Order, dry_run)
    }

    pub fn remove_colocation(
        &self,
        parent: &str,
        child: &str,
        dry_run: bool,
    ) -> Result<Vec<Submitted>, HamcError> {
        self.remove_edge_kind(parent, child, EdgeKind::Colocation, dry_run)
    }

    /// Mark the order between two resources reversed, so a placeholder set
    /// is flipped before its next membership change.
    pub fn reverse_edge(&self, parent: &str, child: &str, kind: EdgeKind) {
        self.graph.update(|g| {
            let edge = g.ensure_edge(parent, child);
            match kind {
                EdgeKind::Colocation => edge.reversed_colocation = !edge.reversed_colocation,
                EdgeKind::Order => edge.reversed_order = !edge.reversed_order,
            }
        });
    }

    /// Want colocation and/or order from `parent` to `child` and submit
    /// what is not live yet. Nothing is emitted for constraints that are.
    pub fn add_edge(
        &self,
        parent: &str,
        child: &str,
        colocation: bool,
        order: bool,
        dry_run: bool,
    ) -> Result<Vec<Submitted>, HamcError> {
        let parent_res = self.registry.require(parent)?;
        let child_res = self.registry.require(child)?;
        let parent_ph = parent_res.kind() == ResourceKind::Placeholder;
        let child_ph = child_res.kind() == ResourceKind::Placeholder;
        if parent_ph && child_ph {
            return Err(HamcError::Validation {
                message: format!("cannot link two constraint placeholders ({parent} -> {child})"),
            });
        }

        let mut edge = self
            .graph
            .read(|g| g.edge(parent, child).cloned())
            .unwrap_or_else(|| Edge::new(parent, child));
        edge.colocation |= colocation;
        edge.order |= order;
        if !dry_run {
            self.graph.update(|g| {
                let wanted = g.ensure_edge(parent, child);
                wanted.colocation |= colocation;
                wanted.order |= order;
            });
        }

        if parent_ph || child_ph {
            let mut submitted = Vec::new();
            for kind in [EdgeKind::Colocation, EdgeKind::Order] {
                let wanted = match kind {
                    EdgeKind::Colocation => colocation,
                    EdgeKind::Order => order,
                };
                if wanted {
                    submitted.extend(
                        self.placeholder_add(&parent_res, &child_res, &edge, kind, dry_run)?,
                    );
                }
            }
            return Ok(submitted);
        }

        let parent_crm = parent_res.crm_id();
        let child_crm = child_res.crm_id();
        let colocation = (colocation && edge.saved_colocation_id.is_none())
            .then(|| colocation_spec(&parent_res, &parent_crm, &child_crm, edge.score));
        let order = (order && edge.saved_order_id.is_none())
            .then(|| order_spec(&parent_res, &parent_crm, &child_crm, edge.score));
        if colocation.is_none() && order.is_none() {
            return Ok(Vec::new());
        }

        let col_id = colocation.as_ref().map(|c| c.id.clone());
        let ord_id = order.as_ref().map(|o| o.id.clone());
        let submitted = self.submit(
            Intent::SetOrderAndColocation {
                parent: parent_crm,
                child: child_crm,
                colocation,
                order,
            },
            dry_run,
        )?;
        if !dry_run {
            self.graph.update(|g| {
                if let Some(edge) = g.edge_mut(parent, child) {
                    if col_id.is_some() {
                        edge.saved_colocation_id = col_id;
                    }
                    if ord_id.is_some() {
                        edge.saved_order_id = ord_id;
                    }
                }
            });
        }
        Ok(vec![submitted])
    }

    fn remove_edge_kind(
        &self,
        parent: &str,
        child: &str,
        kind: EdgeKind,
        dry_run: bool,
    ) -> Result<Vec<Submitted>, HamcError> {
        let Some(edge) = self.graph.read(|g| g.edge(parent, child).cloned()) else {
            return Ok(Vec::new());
        };
        let parent_res = self.registry.require(parent)?;
        let child_res = self.registry.require(child)?;

        let submitted = if parent_res.kind() == ResourceKind::Placeholder
            || child_res.kind() == ResourceKind::Placeholder
        {
            self.placeholder_remove(&parent_res, &child_res, &edge, kind, dry_run)?
        } else {
            match edge.saved_id(kind) {
                Some(id) => {
                    let intent = match kind {
                        EdgeKind::Colocation => Intent::RemoveColocation { id: id.clone() },
                        EdgeKind::Order => Intent::RemoveOrder { id: id.clone() },
                    };
                    vec![self.submit(intent, dry_run)?]
                }
                None => Vec::new(),
            }
        };

        if !dry_run {
            self.graph.update(|g| {
                if let Some(edge) = g.edge_mut(parent, child) {
                    edge.set_wants(kind, false);
                    *edge.saved_id_mut(kind) = None;
                }
                g.prune();
            });
        }
        Ok(submitted)
    }

    /// Resolve which end of the edge is the placeholder and which side of
    /// its sets the other end belongs to.
    fn placeholder_end(
        parent: &Arc<Resource>,
        child: &Arc<Resource>,
    ) -> (Arc<Resource>, Arc<Resource>, Side) {
        if parent.kind() == ResourceKind::Placeholder {
            (Arc::clone(parent), Arc::clone(child), Side::Then)
        } else {
            (Arc::clone(child), Arc::clone(parent), Side::First)
        }
    }

    fn placeholder_add(
        &self,
        parent: &Arc<Resource>,
        child: &Arc<Resource>,
        edge: &Edge,
        kind: EdgeKind,
        dry_run: bool,
    ) -> Result<Vec<Submitted>, HamcError> {
        let (ph_res, member, side) = Self::placeholder_end(parent, child);
        let member_crm = member.crm_id();
        let Some(mut ph) = ph_res.state.read(|s| s.placeholder.clone()) else {
            return Ok(Vec::new());
        };

        if edge.reversed(kind) != ph.constraint(kind).reversed {
            ph.reverse(kind);
        }
        let Some(intent) = ph.add_member(kind, side, &member_crm) else {
            return Ok(Vec::new());
        };
        let submitted = self.submit(intent, dry_run)?;
        if !dry_run {
            let id = ph.constraint_id(kind);
            ph.constraint_mut(kind).id = Some(id.clone());
            ph_res.state.update(|s| s.placeholder = Some(ph));
            self.graph.update(|g| {
                if let Some(edge) = g.edge_mut(parent.key(), child.key()) {
                    *edge.saved_id_mut(kind) = Some(id);
                }
            });
        }
        Ok(vec![submitted])
    }

    fn placeholder_remove(
        &self,
        parent: &Arc<Resource>,
        child: &Arc<Resource>,
        edge: &Edge,
        kind: EdgeKind,
        dry_run: bool,
    ) -> Result<Vec<Submitted>, HamcError> {
        let (ph_res, member, _) = Self::placeholder_end(parent, child);
        let member_crm = member.crm_id();
        let Some(mut ph) = ph_res.state.read(|s| s.placeholder.clone()) else {
            return Ok(Vec::new());
        };
        if edge.reversed(kind) != ph.constraint(kind).reversed {
            ph.reverse(kind);
        }
        let submitted = match ph.remove_member(kind, &member_crm) {
            Some(intent) => vec![self.submit(intent, dry_run)?],
            None => Vec::new(),
        };
        if !dry_run {
            ph_res.state.update(|s| s.placeholder = Some(ph));
        }
        Ok(submitted)
    }

    /// Submit every parent edge of a freshly created resource.
    pub fn reconcile_edges(&self, child: &str, dry_run: bool) -> Result<Vec<Submitted>, HamcError> {
        let parents = self.graph.read(|g| g.parents_of(child));
        let mut submitted = Vec::new();
        let wanted = parents
            .iter()
            .filter(|e| e.wants(EdgeKind::Colocation) || e.wants(EdgeKind::Order));
        for edge in wanted {
            tracing::debug!(parent = %edge.parent, child, "submitting parent edge");
            submitted.extend(self.add_edge(
                &edge.parent,
                child,
                edge.colocation,
                edge.order,
                dry_run,
            )?);
        }
        Ok(submitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::RecordingExecutor;
    use crate::schema::AgentSchema;
    use crate::snapshot::StaticStateSource;

    fn hosts() -> Vec<String> {
        vec!["h1".into(), "h2".into(), "h3".into()]
    }

    fn saved(locs: &mut LocationSet, host: &str, id: &str, score: Score, op: LocationOp) {
        locs.saved.insert(
            host.into(),
            SavedLocation {
                id: id.into(),
                location: HostLocation::new(score, op),
            },
        );
    }

    #[test]
    fn new_location_on_one_host_only() {
        let mut locs = LocationSet::default();
        locs.set_edited("h1", HostLocation::new(Score::Infinity, LocationOp::Eq));
        locs.set_edited("h2", HostLocation::default());
        let intents = location_intents("res_IPaddr2_ip1", &hosts(), &locs);
        assert_eq!(
            intents,
            vec![Intent::SetLocation {
                resource: "res_IPaddr2_ip1".into(),
                location_id: "loc_res_IPaddr2_ip1_h1".into(),
                host: "h1".into(),
                score: Score::Infinity,
                op: LocationOp::Eq,
            }]
        );
    }

    #[test]
    fn operation_change_removes_before_adding() {
        let mut locs = LocationSet::default();
        saved(&mut locs, "h2", "loc_a_h2", Score::Value(100), LocationOp::Eq);
        locs.set_edited("h2", HostLocation::new(Score::Value(100), LocationOp::Ne));
        let intents = location_intents("a", &hosts(), &locs);
        assert_eq!(intents.len(), 2);
        assert!(matches!(
            &intents[0],
            Intent::RemoveLocation { location_id, .. } if location_id == "loc_a_h2"
        ));
        assert!(matches!(
            &intents[1],
            Intent::SetLocation { location_id, op: LocationOp::Ne, .. }
                if location_id == "nloc_a_h2"
        ));
    }

    #[test]
    fn cleared_score_only_removes() {
        let mut locs = LocationSet::default();
        saved(&mut locs, "h1", "loc_a_h1", Score::Infinity, LocationOp::Eq);
        locs.set_edited("h1", HostLocation::default());
        let intents = location_intents("a", &hosts(), &locs);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].name(), "RemoveLocation");
    }

    #[test]
    fn score_change_with_same_op_updates_in_place() {
        let mut locs = LocationSet::default();
        saved(&mut locs, "h1", "loc_a_h1", Score::Infinity, LocationOp::Eq);
        locs.set_edited("h1", HostLocation::new(Score::Value(50), LocationOp::Eq));
        let intents = location_intents("a", &hosts(), &locs);
        assert_eq!(intents.len(), 1);
        assert!(matches!(
            &intents[0],
            Intent::SetLocation { location_id, .. } if location_id == "loc_a_h1"
        ));
    }

    #[test]
    fn alias_scores_are_not_a_change() {
        let mut locs = LocationSet::default();
        saved(&mut locs, "h1", "loc_a_h1", Score::Infinity, LocationOp::Eq);
        locs.set_edited("h1", HostLocation::new("ALWAYS".parse().unwrap(), LocationOp::Eq));
        assert!(location_intents("a", &hosts(), &locs).is_empty());
    }

    #[test]
    fn commit_then_recompute_is_empty() {
        let mut locs = LocationSet::default();
        saved(&mut locs, "h3", "loc_a_h3", Score::Value(5), LocationOp::Eq);
        locs.set_edited("h1", HostLocation::new(Score::Infinity, LocationOp::Eq));
        locs.set_edited("h3", HostLocation::default());
        let submitted = locs.edited.clone();
        for intent in location_intents("a", &hosts(), &locs) {
            record_location(&mut locs, &intent);
        }
        settle_location_edits(&mut locs, &submitted);
        assert!(locs.edited.is_empty());
        assert!(location_intents("a", &hosts(), &locs).is_empty());
        assert_eq!(locs.saved["h1"].id, "loc_a_h1");
        assert!(!locs.saved.contains_key("h3"));
    }

    fn session() -> (Session, Arc<RecordingExecutor>) {
        let exec = Arc::new(RecordingExecutor::new());
        let session = Session::new(
            vec!["h1".into(), "h2".into()],
            "h1",
            exec.clone(),
            Arc::new(StaticStateSource::default()),
        )
        .unwrap();
        (session, exec)
    }

    fn committed_ip(session: &Session, key: &str) -> Arc<Resource> {
        session.registry.insert(Resource::committed(
            key,
            &format!("res_IPaddr2_{key}"),
            ResourceKind::Primitive,
            Some("ocf:heartbeat:IPaddr2".parse().unwrap()),
            Arc::new(AgentSchema::default()),
        ))
    }

    #[test]
    fn failed_re_add_keeps_the_removal() {
        let (session, exec) = session();
        let ip = committed_ip(&session, "ip1");
        ip.state.update(|s| {
            saved(&mut s.locations, "h1", "loc_res_IPaddr2_ip1_h1", Score::Infinity, LocationOp::Eq)
        });
        exec.fail_on("SetLocation");
        let moved = HostLocation::new(Score::Infinity, LocationOp::Ne);
        assert!(session.place("ip1", "h1", moved, false).is_err());
        assert!(ip.state.read(|s| !s.locations.saved.contains_key("h1")));

        exec.accept_all();
        exec.clear();
        session.set_locations("ip1", false).unwrap();
        assert_eq!(
            exec.intents(),
            vec![Intent::SetLocation {
                resource: "res_IPaddr2_ip1".into(),
                location_id: "nloc_res_IPaddr2_ip1_h1".into(),
                host: "h1".into(),
                score: Score::Infinity,
                op: LocationOp::Ne,
            }]
        );
        ip.state.read(|s| {
            assert!(s.locations.edited.is_empty());
            assert_eq!(s.locations.saved["h1"].id, "nloc_res_IPaddr2_ip1_h1");
        });
    }

    #[test]
    fn dry_run_edge_is_not_wanted_afterwards() {
        let (session, exec) = session();
        committed_ip(&session, "a");
        committed_ip(&session, "b");
        assert_eq!(session.add_order("a", "b", true).unwrap().len(), 1);
        assert!(session.graph().edge("a", "b").is_none());

        exec.clear();
        assert!(session.reconcile_graph(false).unwrap().is_empty());
        assert!(exec.intents().is_empty());
    }

    #[test]
    fn graph_prunes_dead_edges() {
        let mut g = DependencyGraph::default();
        g.ensure_edge("a", "b").order = true;
        g.ensure_edge("a", "c");
        g.prune();
        assert_eq!(g.edges().len(), 1);
        assert_eq!(g.parents_of("b").len(), 1);
        assert!(g.children_of("c").is_empty());
    }
}
