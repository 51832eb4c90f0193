//! Changed / unchanged classification of a resource against its saved state.
//!
//! A full check computes one verdict per flat parameter plus one per
//! dedicated sub-check (id, meta reference, operations, locations) and caches
//! them on the resource. A cheap re-check for one parameter recomputes that
//! verdict and any forgotten ones, and takes the rest from the cache.
//!
//! The verdicts are computed on a clone of the state taken outside the lock;
//! only the cache and sentinel updates happen inside it.

use std::collections::BTreeMap;

use crate::model::{HasLocations, HasOperations, HasParameters, Resource, ResourceState};
use crate::params::SameAs;
use crate::schema::AgentSchema;

pub const ID: &str = "@id";
pub const META_REF: &str = "@meta_ref";
pub const OPERATIONS: &str = "@operations";
pub const LOCATIONS: &str = "@locations";

const SUB_CHECKS: [&str; 4] = [ID, META_REF, OPERATIONS, LOCATIONS];

/// Whether applying `resource` would submit anything.
///
/// With `param` set, only that verdict (plus any forgotten ones) is
/// recomputed; without a prior full check this falls back to a full one.
pub fn has_changed(resource: &Resource, param: Option<&str>) -> bool {
    infer_sentinels(resource);
    match evaluate(resource, param) {
        Some(evaluation) => {
            let changed = evaluation.changed();
            remember(resource, evaluation);
            changed
        }
        None => true,
    }
}

/// Verdicts computed from one snapshot of a resource's state.
#[derive(Debug)]
struct Evaluation {
    generation: u64,
    verdicts: BTreeMap<String, bool>,
}

impl Evaluation {
    fn changed(&self) -> bool {
        self.verdicts.values().any(|v| *v)
    }
}

/// Compute verdicts outside the lock. `None` for a new resource.
fn evaluate(resource: &Resource, param: Option<&str>) -> Option<Evaluation> {
    let state = resource.state.snapshot();
    if state.is_new {
        return None;
    }

    let keys = verdict_keys(resource.schema(), &state);
    let verdicts = match (param, &state.changed_cache) {
        (Some(param), Some(cache)) => keys
            .into_iter()
            .map(|key| {
                let verdict = match cache.get(&key) {
                    Some(cached) if key != param => *cached,
                    _ => verdict(resource, &state, &key),
                };
                (key, verdict)
            })
            .collect(),
        _ => keys
            .into_iter()
            .map(|key| {
                let verdict = verdict(resource, &state, &key);
                (key, verdict)
            })
            .collect(),
    };
    Some(Evaluation {
        generation: state.verdict_generation,
        verdicts,
    })
}

/// Cache the verdicts unless an edit dropped any since they were computed.
fn remember(resource: &Resource, evaluation: Evaluation) {
    resource.state.update(|s| {
        if s.verdict_generation == evaluation.generation {
            s.changed_cache = Some(evaluation.verdicts);
        }
    });
}

/// Names of everything that differs, for status output.
pub fn changed_fields(resource: &Resource) -> Vec<String> {
    let state = resource.state.snapshot();
    if state.is_new {
        return vec!["(new)".to_string()];
    }
    verdict_keys(resource.schema(), &state)
        .into_iter()
        .filter(|key| verdict(resource, &state, key))
        .collect()
}

fn verdict_keys(schema: &AgentSchema, state: &ResourceState) -> Vec<String> {
    let mut keys: Vec<String> = schema.params().map(|p| p.name.clone()).collect();
    for name in state.params.names() {
        if !keys.iter().any(|k| k == name) {
            keys.push(name.to_string());
        }
    }
    keys.extend(SUB_CHECKS.iter().map(|k| k.to_string()));
    keys
}

fn verdict(resource: &Resource, state: &ResourceState, key: &str) -> bool {
    match key {
        ID => id_rewritten(resource, state),
        META_REF => state.meta_same_as().is_changed(),
        OPERATIONS => check_operations_changed(state, resource.schema()),
        LOCATIONS => check_host_locations_changed(state),
        name => param_changed(resource.schema(), state, name),
    }
}

/// Compare one flat parameter's edit with its saved value. Shared
/// meta-attributes are not compared; the reference itself is.
pub fn param_changed<T: HasParameters>(schema: &AgentSchema, state: &T, name: &str) -> bool {
    let Some(edited) = state.parameters().edited(name) else {
        return false;
    };
    if schema.is_meta_attr(name) && state.meta_same_as().current().resource().is_some() {
        return false;
    }
    let default = schema.default_value(name).unwrap_or("");
    let edited = if edited.is_empty() { default } else { edited };
    let saved = state.parameters().saved(name).unwrap_or(default);
    edited != saved
}

/// Operation fields keyed by (operation, field), plus the operations
/// reference.
pub fn check_operations_changed<T: HasOperations>(state: &T, schema: &AgentSchema) -> bool {
    let ops = state.operations();
    if ops.same_as.is_changed() {
        return true;
    }
    if ops.same_as.current().resource().is_some() {
        return false;
    }
    ops.edited.iter().any(|(op, field, edited)| {
        let default = schema.op_default(op, field).unwrap_or("");
        let edited = if edited.is_empty() { default } else { edited };
        let saved = ops.saved.get(op, field).unwrap_or(default);
        edited != saved
    })
}

/// Host locations keyed by host.
pub fn check_host_locations_changed<T: HasLocations>(state: &T) -> bool {
    let locations = state.locations();
    locations.edited.keys().any(|host| locations.is_changed(host))
}

/// The committed id no longer matches what the edited id would produce.
pub fn id_rewritten(resource: &Resource, state: &ResourceState) -> bool {
    match &state.crm_id {
        Some(crm_id) => *crm_id != resource.expected_id(state) && *crm_id != state.edited_id,
        None => false,
    }
}

/// A parameter flagged advanced stays visible while its current value
/// differs from the default.
pub fn is_hidden_as_advanced(resource: &Resource, name: &str) -> bool {
    let schema = resource.schema();
    let Some(spec) = schema.param(name) else {
        return false;
    };
    if !spec.advanced {
        return false;
    }
    let default = spec.default.as_deref().unwrap_or("");
    resource.state.read(|s| {
        let current = s
            .params
            .edited(name)
            .filter(|v| !v.is_empty())
            .or(s.params.saved(name))
            .unwrap_or(default);
        current == default
    })
}

/// Select "default values" when own meta-attributes or operations all sit
/// at their defaults and nothing was selected. Not a change.
pub fn infer_sentinels(resource: &Resource) {
    let schema = resource.schema();
    resource.state.update(|s| {
        if s.meta_same_as.current() == &SameAs::NothingSelected
            && schema.meta_attrs().next().is_some()
        {
            let at_defaults = schema.meta_attrs().all(|spec| {
                let default = spec.default.as_deref().unwrap_or("");
                let current = s
                    .params
                    .edited(&spec.name)
                    .or(s.params.saved(&spec.name))
                    .filter(|v| !v.is_empty())
                    .unwrap_or(default);
                current == default
            });
            if at_defaults {
                select_default_values(&mut s.meta_same_as);
            }
        }

        let ops = &mut s.operations;
        if ops.same_as.current() == &SameAs::NothingSelected
            && !schema.operation_defaults().is_empty()
        {
            let mut fields: Vec<(String, String)> = ops
                .edited
                .keys()
                .chain(ops.saved.keys())
                .map(|(op, field)| (op.to_string(), field.to_string()))
                .collect();
            fields.sort();
            fields.dedup();
            let at_defaults = fields.iter().all(|(op, field)| {
                let default = schema.op_default(op, field).unwrap_or("");
                let current = ops
                    .edited
                    .get(op, field)
                    .or(ops.saved.get(op, field))
                    .filter(|v| !v.is_empty())
                    .unwrap_or(default);
                current == default
            });
            if at_defaults {
                select_default_values(&mut ops.same_as);
            }
        }
    });
}

fn select_default_values(reference: &mut crate::params::Reference) {
    if reference.saved == SameAs::NothingSelected {
        reference.saved = SameAs::DefaultValues;
    }
    if reference.edited == Some(SameAs::NothingSelected) {
        reference.edited = Some(SameAs::DefaultValues);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::model::ResourceKind;
    use crate::params::HostLocation;
    use crate::schema::{ParamKind, ParamSpec, default_operations};
    use crate::score::{LocationOp, Score};

    fn committed() -> Resource {
        let schema = AgentSchema::for_primitive(
            vec![
                ParamSpec::new("ip", ParamKind::String).required(),
                ParamSpec::new("cidr_netmask", ParamKind::Integer).advanced(),
            ],
            default_operations(),
        );
        let r = Resource::committed(
            "ip1",
            "res_IPaddr2_ip1",
            ResourceKind::Primitive,
            Some("ocf:heartbeat:IPaddr2".parse().unwrap()),
            Arc::new(schema),
        );
        r.rename("ip1");
        r.state.update(|s| s.params.set_saved("ip", "10.0.0.1"));
        r
    }

    #[test]
    fn new_resource_is_always_changed() {
        let r = Resource::new("x", ResourceKind::Group, None, Arc::new(AgentSchema::default()));
        assert!(has_changed(&r, None));
    }

    #[test]
    fn matching_edit_is_not_a_change() {
        let r = committed();
        assert!(!has_changed(&r, None));
        r.set_param("ip", "10.0.0.1");
        assert!(!has_changed(&r, Some("ip")));
        r.set_param("ip", "10.0.0.9");
        assert!(has_changed(&r, Some("ip")));
    }

    #[test]
    fn clearing_to_default_is_not_a_change() {
        let r = committed();
        r.set_param("target-role", "");
        assert!(!has_changed(&r, None));
        r.set_param("target-role", "Stopped");
        assert!(has_changed(&r, None));
    }

    #[test]
    fn cheap_recheck_uses_cached_verdicts() {
        let r = committed();
        r.set_param("ip", "10.0.0.9");
        assert!(has_changed(&r, None));
        // the cached "ip" verdict keeps the resource changed
        assert!(has_changed(&r, Some("target-role")));
    }

    #[test]
    fn edit_during_check_is_not_overwritten_by_stale_verdicts() {
        let r = committed();
        let stale = evaluate(&r, None).unwrap();
        assert!(!stale.changed());
        r.set_param("ip", "10.0.0.9");
        remember(&r, stale);
        assert!(has_changed(&r, Some("target-role")));
    }

    #[test]
    fn cheap_recheck_without_cache_is_full() {
        let r = committed();
        r.set_operation("monitor", "interval", "30s");
        assert!(has_changed(&r, Some("ip")));
    }

    #[test]
    fn operation_change_detected_by_field() {
        let r = committed();
        r.set_operation("monitor", "interval", "10s");
        assert!(!has_changed(&r, None));
        r.set_operation("monitor", "timeout", "40s");
        assert!(has_changed(&r, Some(OPERATIONS)));
    }

    #[test]
    fn location_change_detected() {
        let r = committed();
        r.set_location("h1", HostLocation::new(Score::Infinity, LocationOp::Eq));
        assert!(has_changed(&r, None));
    }

    #[test]
    fn out_of_band_id_edit_is_a_change() {
        let r = committed();
        assert!(!has_changed(&r, None));
        r.rename("ip2");
        assert!(has_changed(&r, Some(ID)));
    }

    #[test]
    fn shared_meta_attrs_are_not_compared() {
        let r = committed();
        r.state.update(|s| s.meta_same_as.saved = SameAs::Resource("other".into()));
        r.set_param("priority", "10");
        assert!(!has_changed(&r, None));
    }

    #[test]
    fn sentinel_inferred_without_change() {
        let r = committed();
        assert!(!has_changed(&r, None));
        r.state.read(|s| {
            assert_eq!(s.meta_same_as.saved, SameAs::DefaultValues);
            assert_eq!(s.operations.same_as.saved, SameAs::DefaultValues);
        });
    }

    #[test]
    fn sentinel_not_inferred_over_own_values() {
        let r = committed();
        r.state.update(|s| s.params.set_saved("priority", "7"));
        has_changed(&r, None);
        r.state
            .read(|s| assert_eq!(s.meta_same_as.saved, SameAs::NothingSelected));
    }

    #[test]
    fn advanced_param_shown_when_not_default() {
        let r = committed();
        assert!(is_hidden_as_advanced(&r, "priority"));
        assert!(!is_hidden_as_advanced(&r, "ip"));
        r.set_param("priority", "5");
        assert!(!is_hidden_as_advanced(&r, "priority"));
    }
}
