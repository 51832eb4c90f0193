//! The set of resources known to a session, and everything that needs to
//! look across resources: `same as` resolution, reference candidates, DRBD
//! `after` bookkeeping.
//!
//! Lock order: the map lock is never held while a resource lock is taken,
//! and no code path holds two resource locks at once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::HamcError;
use crate::locked::Locked;
use crate::model::{Resource, ResourceKind};
use crate::params::SameAs;

/// Which `same as` reference a lookup follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefFamily {
    Meta,
    Operations,
}

#[derive(Debug, Default)]
pub struct Registry {
    resources: Locked<BTreeMap<String, Arc<Resource>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource, replacing any previous one under the same key.
    pub fn insert(&self, resource: Resource) -> Arc<Resource> {
        let resource = Arc::new(resource);
        self.resources
            .update(|m| m.insert(resource.key().to_string(), Arc::clone(&resource)));
        resource
    }

    pub fn get(&self, key: &str) -> Option<Arc<Resource>> {
        self.resources.read(|m| m.get(key).cloned())
    }

    pub fn require(&self, key: &str) -> Result<Arc<Resource>, HamcError> {
        self.get(key).ok_or_else(|| HamcError::UnknownResource {
            name: key.to_string(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.resources.read(|m| m.contains_key(key))
    }

    pub fn remove(&self, key: &str) -> Option<Arc<Resource>> {
        self.resources.update(|m| m.remove(key))
    }

    /// All resources in key order.
    pub fn all(&self) -> Vec<Arc<Resource>> {
        self.resources.read(|m| m.values().cloned().collect())
    }

    pub fn keys(&self) -> Vec<String> {
        self.resources.read(|m| m.keys().cloned().collect())
    }

    /// Resource known to the cluster as `crm_id`. New resources match on
    /// the id they will be committed as.
    pub fn find_by_crm_id(&self, crm_id: &str) -> Option<Arc<Resource>> {
        self.all().into_iter().find(|r| r.crm_id() == crm_id)
    }

    /// Resolve a registry key or cluster id to the registry key.
    pub fn resolve_key(&self, name: &str) -> Option<String> {
        if self.contains(name) {
            return Some(name.to_string());
        }
        self.find_by_crm_id(name).map(|r| r.key().to_string())
    }

    /// Effective value of a flat parameter: the referenced resource's value
    /// when a meta-attribute is shared, else saved, preferred, default.
    pub fn get_value(&self, key: &str, param: &str) -> Result<Option<String>, HamcError> {
        let mut visited = BTreeSet::new();
        self.value_via(key, param, &mut visited)
    }

    fn value_via(
        &self,
        key: &str,
        param: &str,
        visited: &mut BTreeSet<String>,
    ) -> Result<Option<String>, HamcError> {
        let resource = self.require(key)?;
        visited.insert(key.to_string());
        let schema = resource.schema();
        let (reference, saved) = resource.state.read(|s| {
            (
                s.meta_same_as.current().resource().map(str::to_string),
                s.params.saved(param).map(str::to_string),
            )
        });
        if schema.is_meta_attr(param)
            && let Some(target) = reference
            && !visited.contains(&target)
            && self.contains(&target)
        {
            return self.value_via(&target, param, visited);
        }
        Ok(saved
            .or_else(|| schema.preferred_value(param).map(str::to_string))
            .or_else(|| schema.default_value(param).map(str::to_string)))
    }

    /// Effective value of one operation field: through the operations
    /// reference if one is set, else saved, else the agent's default.
    pub fn get_op_value(
        &self,
        key: &str,
        op: &str,
        field: &str,
    ) -> Result<Option<String>, HamcError> {
        let mut visited = BTreeSet::new();
        self.op_value_via(key, op, field, &mut visited)
    }

    fn op_value_via(
        &self,
        key: &str,
        op: &str,
        field: &str,
        visited: &mut BTreeSet<String>,
    ) -> Result<Option<String>, HamcError> {
        let resource = self.require(key)?;
        visited.insert(key.to_string());
        let (reference, saved) = resource.state.read(|s| {
            (
                s.operations.same_as.current().resource().map(str::to_string),
                s.operations.saved.get(op, field).map(str::to_string),
            )
        });
        if let Some(target) = reference
            && !visited.contains(&target)
            && self.contains(&target)
        {
            return self.op_value_via(&target, op, field, visited);
        }
        Ok(saved.or_else(|| resource.schema().op_default(op, field).map(str::to_string)))
    }

    fn current_reference(&self, key: &str, family: RefFamily) -> Option<String> {
        let resource = self.get(key)?;
        resource.state.read(|s| {
            let reference = match family {
                RefFamily::Meta => &s.meta_same_as,
                RefFamily::Operations => &s.operations.same_as,
            };
            reference.current().resource().map(str::to_string)
        })
    }

    /// Whether following `family` references from `from` ever reaches `to`.
    fn chain_reaches(&self, from: &str, to: &str, family: RefFamily) -> bool {
        let mut visited = BTreeSet::new();
        let mut cur = from.to_string();
        while visited.insert(cur.clone()) {
            match self.current_reference(&cur, family) {
                Some(next) if next == to => return true,
                Some(next) => cur = next,
                None => return false,
            }
        }
        false
    }

    /// Resources `key` may pick as its `same as` reference. Incompatible
    /// resources and any whose own chain leads back to `key` are left out,
    /// so a cycle can never be selected.
    pub fn selectable_references(
        &self,
        key: &str,
        family: RefFamily,
    ) -> Result<Vec<String>, HamcError> {
        let target = self.require(key)?;
        let candidates = self
            .all()
            .into_iter()
            .filter(|c| c.key() != key)
            .filter(|c| !c.state.read(|s| s.is_removed))
            .filter(|c| match family {
                RefFamily::Meta => c.kind() == target.kind() && c.kind().is_service(),
                RefFamily::Operations => {
                    c.kind().has_operations() && c.agent().is_some() && c.agent() == target.agent()
                }
            })
            .map(|c| c.key().to_string())
            .filter(|c| !self.chain_reaches(c, key, family))
            .collect();
        Ok(candidates)
    }

    /// Point `key`'s reference at `same_as`, refusing a choice that is not
    /// in the selectable list.
    pub fn select_reference(
        &self,
        key: &str,
        family: RefFamily,
        same_as: SameAs,
    ) -> Result<(), HamcError> {
        let resource = self.require(key)?;
        if let SameAs::Resource(target) = &same_as
            && !self.selectable_references(key, family)?.contains(target)
        {
            return Err(HamcError::InvalidParameter {
                resource: key.to_string(),
                param: match family {
                    RefFamily::Meta => "meta_same_as".to_string(),
                    RefFamily::Operations => "operations_same_as".to_string(),
                },
                message: format!("'{target}' cannot be referenced from here"),
            });
        }
        match family {
            RefFamily::Meta => resource.set_meta_same_as(same_as),
            RefFamily::Operations => resource.set_operations_same_as(same_as),
        }
        Ok(())
    }

    /// Drop a DRBD resource and clear every `after` that pointed at it.
    pub fn remove_drbd(&self, key: &str) -> Result<Arc<Resource>, HamcError> {
        let resource = self.require(key)?;
        if resource.kind() != ResourceKind::Drbd {
            return Err(HamcError::Validation {
                message: format!("'{key}' is a {}, not a DRBD resource", resource.kind()),
            });
        }
        let removed = self.remove(key).ok_or_else(|| HamcError::UnknownResource {
            name: key.to_string(),
        })?;
        let crm_id = removed.crm_id();
        for other in self.all() {
            if other.kind() != ResourceKind::Drbd {
                continue;
            }
            let pointed_here = other.state.read(|s| {
                s.params
                    .edited("after")
                    .or(s.params.saved("after"))
                    .is_some_and(|after| after == key || after == crm_id)
            });
            if pointed_here {
                tracing::debug!(resource = other.key(), after = key, "clearing resync-after");
                other.set_param("after", "");
            }
        }
        Ok(removed)
    }
}
