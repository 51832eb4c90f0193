//! The commit half of reconciliation: validate, build the payload, submit,
//! and only then move edited values into the saved slots.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::detect;
use crate::error::HamcError;
use crate::intent::{Enclosing, Intent, PayloadMode, ResourcePayload, Submitted};
use crate::model::{Resource, ResourceKind, ResourceState};
use crate::params::OperationMap;
use crate::schema::ParamKind;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Unchanged,
    Created,
    Updated,
}

/// What one apply did, or would do when `dry_run` is set.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub resource: String,
    pub dry_run: bool,
    pub outcome: ApplyOutcome,
    pub submissions: Vec<Submitted>,
}

impl ApplyReport {
    pub fn intents(&self) -> impl Iterator<Item = &Intent> {
        self.submissions.iter().map(|s| &s.intent)
    }

    /// One line per intent plus any executor output, for the status channel.
    pub fn tooltip(&self) -> String {
        if self.submissions.is_empty() {
            return format!("{}: nothing to do", self.resource);
        }
        let verb = if self.dry_run { "would submit" } else { "submitted" };
        let mut out = format!("{} {verb}:", self.resource);
        for s in &self.submissions {
            let _ = write!(out, "\n  {} @ {}", s.intent, s.host);
            let output = s.output.trim();
            if !output.is_empty() {
                for line in output.lines() {
                    let _ = write!(out, "\n    {line}");
                }
            }
        }
        out
    }
}

/// Cluster ids must be valid XML ids.
fn validate_id(id: &str) -> Result<(), String> {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return Err(format!("id '{id}' must start with a letter or '_'")),
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')) {
        Ok(())
    } else {
        Err(format!("id '{id}' may only contain letters, digits, '_', '-' and '.'"))
    }
}

fn current<'a>(state: &'a ResourceState, name: &str) -> Option<&'a str> {
    state
        .params
        .edited(name)
        .or_else(|| state.params.saved(name))
}

impl Session {
    /// Submit `key`'s edits against the DC.
    ///
    /// Field and reference problems are reported before anything is
    /// submitted. A failed create/update leaves the resource exactly as it
    /// was, so calling `apply` again retries from the same state.
    pub fn apply(&self, key: &str, dry_run: bool) -> Result<ApplyReport, HamcError> {
        let resource = self.registry.require(key)?;
        let mut report = ApplyReport {
            resource: key.to_string(),
            dry_run,
            outcome: ApplyOutcome::Unchanged,
            submissions: Vec::new(),
        };
        if resource.state.read(|s| s.is_removed) || !detect::has_changed(&resource, None) {
            return Ok(report);
        }

        let state = resource.state.snapshot();
        self.validate_fields(&resource, &state)?;
        self.check_references(&resource, &state)?;

        let crm_id = resource.crm_id_of(&state);
        let is_new = state.is_new;
        report.outcome = if is_new {
            ApplyOutcome::Created
        } else {
            ApplyOutcome::Updated
        };

        if resource.kind() == ResourceKind::Placeholder {
            // Placeholders live in the resource sets they own.
            if !dry_run {
                resource.state.update(|s| s.commit(&state, &crm_id));
            }
            return Ok(report);
        }

        let payload = self.build_payload(&resource, &state, &crm_id)?;
        tracing::info!(resource = key, crm_id = %crm_id, new = is_new, dry_run, "applying");
        report
            .submissions
            .push(self.submit(Intent::SetParameters(payload), dry_run)?);

        if is_new {
            if !dry_run {
                resource.state.update(|s| {
                    s.is_new = false;
                    s.crm_id = Some(crm_id.clone());
                });
                let in_group = state
                    .container
                    .as_deref()
                    .and_then(|c| self.registry.get(c))
                    .is_some_and(|c| c.kind() == ResourceKind::Group);
                if !in_group {
                    report.submissions.extend(self.reconcile_edges(key, dry_run)?);
                }
            }
        } else if state.is_failed() {
            for intent in self.cleanup_intents(&resource, &state, &crm_id) {
                report.submissions.push(self.submit(intent, dry_run)?);
            }
        }

        report.submissions.extend(self.set_locations(key, dry_run)?);

        if !dry_run {
            resource.state.update(|s| s.commit(&state, &crm_id));
        }
        Ok(report)
    }

    fn validate_fields(&self, resource: &Resource, state: &ResourceState) -> Result<(), HamcError> {
        let invalid = |param: &str, message: String| HamcError::InvalidParameter {
            resource: resource.key().to_string(),
            param: param.to_string(),
            message,
        };

        validate_id(&resource.crm_id_of(state)).map_err(|m| invalid("id", m))?;

        for spec in resource.schema().params() {
            let value = current(state, &spec.name)
                .filter(|v| !v.is_empty())
                .or(spec.default.as_deref());
            match value {
                Some(value) => spec.validate(value).map_err(|m| invalid(&spec.name, m))?,
                None if spec.required => {
                    return Err(invalid(&spec.name, "is required".to_string()));
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Every resource-reference parameter must name a resource the session
    /// knows about.
    fn check_references(
        &self,
        resource: &Resource,
        state: &ResourceState,
    ) -> Result<(), HamcError> {
        for spec in resource.schema().params() {
            if spec.kind != ParamKind::ResourceRef {
                continue;
            }
            let Some(target) = current(state, &spec.name).filter(|v| !v.is_empty()) else {
                continue;
            };
            if self.registry.resolve_key(target).is_none() {
                return Err(HamcError::Configuration {
                    resource: resource.key().to_string(),
                    param: spec.name.clone(),
                    message: format!("names unknown resource '{target}'"),
                });
            }
        }
        Ok(())
    }

    fn build_payload(
        &self,
        resource: &Resource,
        state: &ResourceState,
        crm_id: &str,
    ) -> Result<ResourcePayload, HamcError> {
        let schema = resource.schema();
        let is_new = state.is_new;

        let mut class_attrs = BTreeMap::new();
        class_attrs.insert("id".to_string(), crm_id.to_string());
        if let Some(agent) = resource.agent() {
            class_attrs.insert("class".to_string(), agent.class.clone());
            if let Some(provider) = &agent.provider {
                class_attrs.insert("provider".to_string(), provider.clone());
            }
            class_attrs.insert("type".to_string(), agent.kind.clone());
        }

        let meta_ref = match state.meta_same_as.current().resource() {
            Some(target) => Some(format!(
                "{}-meta_attributes",
                self.registry.require(target)?.crm_id()
            )),
            None => None,
        };

        let mut names: Vec<String> = schema.params().map(|p| p.name.clone()).collect();
        for name in state.params.names() {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }

        let mut params = BTreeMap::new();
        let mut meta_attrs = BTreeMap::new();
        for name in names {
            let is_meta = schema.is_meta_attr(&name);
            if is_meta && meta_ref.is_some() {
                continue;
            }
            let value = match current(state, &name) {
                Some(v) => v,
                None if is_new => match schema.preferred_value(&name) {
                    Some(v) => v,
                    None => continue,
                },
                None => continue,
            };
            if value.is_empty() || (is_new && schema.default_value(&name) == Some(value)) {
                continue;
            }
            let target = if is_meta { &mut meta_attrs } else { &mut params };
            target.insert(name, value.to_string());
        }

        let (operations, operations_ref) = if resource.kind().has_operations() {
            match state.operations.same_as.current().resource() {
                Some(target) => (
                    OperationMap::default(),
                    Some(format!("{}-operations", self.registry.require(target)?.crm_id())),
                ),
                None => (effective_operations(resource, state), None),
            }
        } else {
            (OperationMap::default(), None)
        };

        let enclosing = match state.container.as_deref() {
            Some(container) => {
                let container = self.registry.require(container)?;
                Some(Enclosing {
                    kind: container.kind(),
                    crm_id: container.crm_id(),
                    is_new: container.is_new(),
                })
            }
            None => None,
        };

        let members = state
            .members
            .iter()
            .map(|m| self.registry.require(m).map(|r| r.crm_id()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ResourcePayload {
            mode: if is_new {
                PayloadMode::Create
            } else {
                PayloadMode::Update
            },
            crm_id: crm_id.to_string(),
            kind: resource.kind(),
            class_attrs,
            params,
            meta_attrs,
            meta_attrs_ref: meta_ref,
            operations,
            operations_ref,
            enclosing,
            members,
        })
    }

    /// One cleanup per failed clone instance, or one per cluster host.
    fn cleanup_intents(
        &self,
        resource: &Resource,
        state: &ResourceState,
        crm_id: &str,
    ) -> Vec<Intent> {
        if resource.kind().is_clone() && !state.failed_instances.is_empty() {
            return state
                .failed_instances
                .iter()
                .map(|(instance, host)| Intent::CleanupResource {
                    resource: instance.clone(),
                    host: host.clone(),
                })
                .collect();
        }
        self.hosts
            .iter()
            .map(|host| Intent::CleanupResource {
                resource: crm_id.to_string(),
                host: host.clone(),
            })
            .collect()
    }
}

/// Agent defaults, overlaid by saved values, overlaid by edits. An empty
/// edit drops the field.
fn effective_operations(resource: &Resource, state: &ResourceState) -> OperationMap {
    let mut ops = resource.schema().operation_defaults().clone();
    for (op, field, value) in state.operations.saved.iter() {
        ops.set(op, field, value);
    }
    for (op, field, value) in state.operations.edited.iter() {
        if value.is_empty() {
            ops.remove(op, field);
        } else {
            ops.set(op, field, value);
        }
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::intent::{CommandExecutor, RecordingExecutor, Submission};
    use crate::locked::Locked;
    use crate::params::HostLocation;
    use crate::schema::{AgentSchema, ParamSpec, default_operations, drbd_resource_params};
    use crate::score::{LocationOp, Score};
    use crate::snapshot::StaticStateSource;

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

    fn ip_schema() -> Arc<AgentSchema> {
        Arc::new(AgentSchema::for_primitive(
            vec![ParamSpec::new("ip", ParamKind::String).required()],
            default_operations(),
        ))
    }

    fn add_ip(session: &Session, key: &str) -> Arc<Resource> {
        session.registry.insert(Resource::new(
            key,
            ResourceKind::Primitive,
            Some("ocf:heartbeat:IPaddr2".parse().unwrap()),
            ip_schema(),
        ))
    }

    fn payload(intent: &Intent) -> &ResourcePayload {
        match intent {
            Intent::SetParameters(p) => p,
            other => panic!("expected SetParameters, got {other:?}"),
        }
    }

    #[test]
    fn create_omits_defaults_and_commits() {
        let (session, exec) = session();
        let ip = add_ip(&session, "ip1");
        ip.set_param("ip", "10.0.0.1");
        ip.set_param("target-role", "Started");
        ip.set_param("priority", "5");

        let report = session.apply("ip1", false).unwrap();
        assert_eq!(report.outcome, ApplyOutcome::Created);
        let intents = exec.intents();
        let p = payload(&intents[0]);
        assert_eq!(p.mode, PayloadMode::Create);
        assert_eq!(p.crm_id, "res_IPaddr2_ip1");
        assert_eq!(p.class_attrs["provider"], "heartbeat");
        assert_eq!(p.params["ip"], "10.0.0.1");
        assert!(!p.meta_attrs.contains_key("target-role"));
        assert_eq!(p.meta_attrs["priority"], "5");
        assert_eq!(p.operations.get("monitor", "interval"), Some("10s"));
        assert!(!ip.is_new());
    }

    /// Edits `ip` on the watched resource while its parameters are in flight.
    struct EditingExecutor {
        inner: RecordingExecutor,
        watched: Locked<Option<Arc<Resource>>>,
    }

    impl CommandExecutor for EditingExecutor {
        fn submit(&self, intent: &Intent, host: &str, dry_run: bool) -> Submission {
            if matches!(intent, Intent::SetParameters(_))
                && let Some(resource) = self.watched.snapshot()
            {
                resource.set_param("ip", "10.0.0.99");
            }
            self.inner.submit(intent, host, dry_run)
        }
    }

    #[test]
    fn edit_during_submission_stays_pending() {
        let exec = Arc::new(EditingExecutor {
            inner: RecordingExecutor::new(),
            watched: Locked::new(None),
        });
        let session = Session::new(
            vec!["h1".into()],
            "h1",
            exec.clone(),
            Arc::new(StaticStateSource::default()),
        )
        .unwrap();
        let ip = session.registry.insert(Resource::committed(
            "ip1",
            "res_IPaddr2_ip1",
            ResourceKind::Primitive,
            Some("ocf:heartbeat:IPaddr2".parse().unwrap()),
            ip_schema(),
        ));
        ip.state.update(|s| s.params.set_saved("ip", "10.0.0.1"));
        ip.set_param("ip", "10.0.0.2");
        exec.watched.update(|w| *w = Some(Arc::clone(&ip)));

        session.apply("ip1", false).unwrap();

        let intents = exec.inner.intents();
        assert_eq!(payload(&intents[0]).params["ip"], "10.0.0.2");
        ip.state.read(|s| {
            assert_eq!(s.params.saved("ip"), Some("10.0.0.2"));
            assert_eq!(s.params.edited("ip"), Some("10.0.0.99"));
        });
        assert!(detect::has_changed(&ip, None));
    }

    #[test]
    fn second_apply_is_a_no_op() {
        let (session, exec) = session();
        let ip = add_ip(&session, "ip1");
        ip.set_param("ip", "10.0.0.1");
        ip.set_location("h1", HostLocation::new(Score::Infinity, LocationOp::Eq));
        session.apply("ip1", false).unwrap();
        exec.clear();

        ip.set_param("ip", "10.0.0.1");
        let report = session.apply("ip1", false).unwrap();
        assert_eq!(report.outcome, ApplyOutcome::Unchanged);
        assert!(exec.intents().is_empty());
    }

    #[test]
    fn dry_run_leaves_state_alone() {
        let (session, exec) = session();
        let ip = add_ip(&session, "ip1");
        ip.set_param("ip", "10.0.0.1");
        let report = session.apply("ip1", true).unwrap();
        assert!(report.dry_run);
        assert!(exec.recorded()[0].dry_run);
        assert!(ip.is_new());
        assert!(report.tooltip().contains("would submit"));
    }

    #[test]
    fn failed_submission_keeps_resource_new() {
        let (session, exec) = session();
        let ip = add_ip(&session, "ip1");
        ip.set_param("ip", "10.0.0.1");
        exec.fail_on("SetParameters");
        let err = session.apply("ip1", false).unwrap_err();
        assert!(matches!(err, HamcError::Command { .. }));
        assert!(ip.is_new());
        assert_eq!(ip.state.read(|s| s.params.saved("ip").map(str::to_string)), None);
    }

    #[test]
    fn missing_required_field_blocks_apply() {
        let (session, exec) = session();
        add_ip(&session, "ip1");
        let err = session.apply("ip1", false).unwrap_err();
        assert!(matches!(err, HamcError::InvalidParameter { ref param, .. } if param == "ip"));
        assert!(exec.intents().is_empty());
    }

    #[test]
    fn bad_value_blocks_apply() {
        let (session, exec) = session();
        let ip = add_ip(&session, "ip1");
        ip.set_param("ip", "10.0.0.1");
        ip.set_param("priority", "high");
        assert!(session.apply("ip1", false).is_err());
        assert!(exec.intents().is_empty());
    }

    #[test]
    fn unknown_after_is_a_configuration_error() {
        let (session, exec) = session();
        let schema = Arc::new(AgentSchema::new(drbd_resource_params(), OperationMap::default()));
        let r0 = session
            .registry
            .insert(Resource::new("r0", ResourceKind::Drbd, None, schema));
        r0.set_param("name", "r0");
        r0.set_param("after", "r1");

        let err = session.apply("r0", false).unwrap_err();
        match err {
            HamcError::Configuration { param, .. } => assert_eq!(param, "after"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(exec.intents().is_empty());
    }

    #[test]
    fn new_resource_locations_only_for_scored_hosts() {
        let (session, exec) = session();
        let ip = add_ip(&session, "ip1");
        ip.set_param("ip", "10.0.0.1");
        ip.set_location("h1", HostLocation::new(Score::Infinity, LocationOp::Eq));
        ip.set_location("h2", HostLocation::default());
        session.apply("ip1", false).unwrap();

        let locations: Vec<Intent> = exec
            .intents()
            .into_iter()
            .filter(|i| matches!(i, Intent::SetLocation { .. } | Intent::RemoveLocation { .. }))
            .collect();
        assert_eq!(
            locations,
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
    fn failed_existing_resource_is_cleaned_per_host() {
        let (session, exec) = session();
        let ip = session.registry.insert(Resource::committed(
            "ip1",
            "res_IPaddr2_ip1",
            ResourceKind::Primitive,
            Some("ocf:heartbeat:IPaddr2".parse().unwrap()),
            ip_schema(),
        ));
        ip.state.update(|s| {
            s.params.set_saved("ip", "10.0.0.1");
            s.failed_hosts.insert("h2".into());
        });
        ip.set_param("ip", "10.0.0.2");
        session.apply("ip1", false).unwrap();

        let cleanups: Vec<String> = exec
            .intents()
            .into_iter()
            .filter_map(|i| match i {
                Intent::CleanupResource { host, .. } => Some(host),
                _ => None,
            })
            .collect();
        assert_eq!(cleanups, vec!["h1".to_string(), "h2".to_string()]);
        assert_eq!(payload(&exec.intents()[0]).mode, PayloadMode::Update);
    }

    #[test]
    fn failed_clone_is_cleaned_per_instance() {
        let (session, exec) = session();
        let cl = session.registry.insert(Resource::committed(
            "cl1",
            "cl_cl1",
            ResourceKind::Clone,
            None,
            Arc::new(AgentSchema::new(
                crate::schema::clone_meta_attrs(false),
                OperationMap::default(),
            )),
        ));
        cl.state.update(|s| {
            s.failed_instances.insert("res_Dummy_d:0".into(), "h1".into());
            s.failed_instances.insert("res_Dummy_d:1".into(), "h2".into());
        });
        cl.set_param("clone-max", "2");
        session.apply("cl1", false).unwrap();

        let cleanups: Vec<(String, String)> = exec
            .intents()
            .into_iter()
            .filter_map(|i| match i {
                Intent::CleanupResource { resource, host } => Some((resource, host)),
                _ => None,
            })
            .collect();
        assert_eq!(
            cleanups,
            vec![
                ("res_Dummy_d:0".to_string(), "h1".to_string()),
                ("res_Dummy_d:1".to_string(), "h2".to_string()),
            ]
        );
    }

    #[test]
    fn shared_meta_attrs_are_sent_by_reference() {
        let (session, exec) = session();
        session.registry.insert(Resource::committed(
            "web",
            "res_IPaddr2_web",
            ResourceKind::Primitive,
            Some("ocf:heartbeat:IPaddr2".parse().unwrap()),
            ip_schema(),
        ));
        let ip = add_ip(&session, "ip1");
        ip.set_param("ip", "10.0.0.1");
        ip.set_param("priority", "9");
        ip.set_meta_same_as(crate::params::SameAs::Resource("web".into()));
        session.apply("ip1", true).unwrap();

        let intents = exec.intents();
        let p = payload(&intents[0]);
        assert_eq!(p.meta_attrs_ref.as_deref(), Some("res_IPaddr2_web-meta_attributes"));
        assert!(p.meta_attrs.is_empty());
    }

    #[test]
    fn new_resource_submits_parent_edges() {
        let (session, exec) = session();
        session.registry.insert(Resource::committed(
            "db",
            "res_IPaddr2_db",
            ResourceKind::Primitive,
            Some("ocf:heartbeat:IPaddr2".parse().unwrap()),
            ip_schema(),
        ));
        let ip = add_ip(&session, "ip1");
        ip.set_param("ip", "10.0.0.1");
        session.graph.update(|g| {
            let edge = g.ensure_edge("db", "ip1");
            edge.colocation = true;
            edge.order = true;
        });
        session.apply("ip1", false).unwrap();

        let intents = exec.intents();
        assert!(intents.iter().any(|i| matches!(
            i,
            Intent::SetOrderAndColocation { parent, child, colocation: Some(_), order: Some(_) }
                if parent == "res_IPaddr2_db" && child == "res_IPaddr2_ip1"
        )));
    }

    #[test]
    fn id_charset_is_checked() {
        assert!(validate_id("res_IPaddr2_ip1").is_ok());
        assert!(validate_id("1abc").is_err());
        assert!(validate_id("a b").is_err());
    }
}
