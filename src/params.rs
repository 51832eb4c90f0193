//! Per-resource parameter storage: edited and saved slots for flat
//! parameters, operations and host locations, plus the `same as` references.
//!
//! Values are read through [`crate::registry::Registry`], which owns the
//! resolution chain (reference, saved, preferred, default) because a
//! reference needs to see another resource.

use std::collections::{BTreeMap, BTreeSet};

use crate::score::{LocationOp, Score};

/// Operation values keyed by `(operation, field)`, e.g. `("monitor", "interval")`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationMap(BTreeMap<(String, String), String>);

impl OperationMap {
    pub fn get(&self, op: &str, field: &str) -> Option<&str> {
        self.0
            .get(&(op.to_string(), field.to_string()))
            .map(String::as_str)
    }

    pub fn set(&mut self, op: &str, field: &str, value: &str) {
        self.0
            .insert((op.to_string(), field.to_string()), value.to_string());
    }

    pub fn remove(&mut self, op: &str, field: &str) -> Option<String> {
        self.0.remove(&(op.to_string(), field.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.0
            .iter()
            .map(|((op, field), value)| (op.as_str(), field.as_str(), value.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.keys().map(|(op, field)| (op.as_str(), field.as_str()))
    }

    /// Fields set for one operation, in field order.
    pub fn fields_of(&self, op: &str) -> Vec<(&str, &str)> {
        self.iter()
            .filter(|(o, _, _)| *o == op)
            .map(|(_, field, value)| (field, value))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// What a resource's meta-attributes or operations are taken from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SameAs {
    /// No reference; the resource's own values apply.
    #[default]
    NothingSelected,
    /// The user chose "default values" explicitly.
    DefaultValues,
    /// Values are read through another resource, by registry key.
    Resource(String),
}

impl SameAs {
    pub fn resource(&self) -> Option<&str> {
        match self {
            SameAs::Resource(key) => Some(key),
            _ => None,
        }
    }

    /// Both sentinels mean "own values", so switching between them is not a
    /// configuration change.
    pub fn equivalent(&self, other: &SameAs) -> bool {
        self.resource() == other.resource()
    }
}

/// Edited and saved slots of one `same as` reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reference {
    pub edited: Option<SameAs>,
    pub saved: SameAs,
}

impl Reference {
    pub fn current(&self) -> &SameAs {
        self.edited.as_ref().unwrap_or(&self.saved)
    }

    pub fn is_changed(&self) -> bool {
        !self.current().equivalent(&self.saved)
    }

    /// Save the reference that was submitted. A newer edit stays pending.
    pub fn commit(&mut self, submitted: &Reference) {
        if let Some(sent) = &submitted.edited {
            self.saved = sent.clone();
            if self.edited.as_ref() == Some(sent) {
                self.edited = None;
            }
        }
    }
}

/// Flat parameters (agent parameters and meta-attributes).
///
/// Only overrides live in `edited`; a parameter absent there shows its
/// saved value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    edited: BTreeMap<String, String>,
    saved: BTreeMap<String, String>,
}

impl ParameterSet {
    /// Record user input. Saved and default values are untouched.
    pub fn set_edited(&mut self, name: &str, value: &str) {
        self.edited.insert(name.to_string(), value.to_string());
    }

    pub fn edited(&self, name: &str) -> Option<&str> {
        self.edited.get(name).map(String::as_str)
    }

    pub fn saved(&self, name: &str) -> Option<&str> {
        self.saved.get(name).map(String::as_str)
    }

    /// Replace the saved slot with freshly observed live values.
    pub fn replace_saved(&mut self, saved: BTreeMap<String, String>) {
        self.saved = saved;
    }

    pub fn set_saved(&mut self, name: &str, value: &str) {
        self.saved.insert(name.to_string(), value.to_string());
    }

    /// Every parameter name that has an edited or saved value.
    pub fn names(&self) -> BTreeSet<&str> {
        self.edited
            .keys()
            .chain(self.saved.keys())
            .map(String::as_str)
            .collect()
    }

    pub fn has_edits(&self) -> bool {
        !self.edited.is_empty()
    }

    /// Copy the submitted edits into the saved slot. An empty edited value
    /// removes the saved one. Edits made since `submitted` was taken stay
    /// pending.
    pub fn commit(&mut self, submitted: &ParameterSet) {
        for (name, value) in &submitted.edited {
            if value.is_empty() {
                self.saved.remove(name);
            } else {
                self.saved.insert(name.clone(), value.clone());
            }
            if self.edited.get(name) == Some(value) {
                self.edited.remove(name);
            }
        }
    }
}

/// Operation values with their own `same as` reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationSet {
    pub edited: OperationMap,
    pub saved: OperationMap,
    pub same_as: Reference,
}

impl OperationSet {
    pub fn set_edited(&mut self, op: &str, field: &str, value: &str) {
        self.edited.set(op, field, value);
    }

    pub fn commit(&mut self, submitted: &OperationSet) {
        for (op, field, value) in submitted.edited.iter() {
            if value.is_empty() {
                self.saved.remove(op, field);
            } else {
                self.saved.set(op, field, value);
            }
            if self.edited.get(op, field) == Some(value) {
                self.edited.remove(op, field);
            }
        }
        self.same_as.commit(&submitted.same_as);
    }
}

/// A placement preference of one resource for one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostLocation {
    pub score: Option<Score>,
    pub op: LocationOp,
}

impl HostLocation {
    pub fn new(score: Score, op: LocationOp) -> Self {
        Self {
            score: Some(score),
            op,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.score.is_none()
    }
}

/// A location constraint confirmed in the live cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedLocation {
    pub id: String,
    pub location: HostLocation,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationSet {
    pub edited: BTreeMap<String, HostLocation>,
    pub saved: BTreeMap<String, SavedLocation>,
}

impl LocationSet {
    pub fn set_edited(&mut self, host: &str, location: HostLocation) {
        self.edited.insert(host.to_string(), location);
    }

    pub fn saved_location(&self, host: &str) -> HostLocation {
        self.saved
            .get(host)
            .map(|s| s.location.clone())
            .unwrap_or_default()
    }

    /// The location the user wants for `host`: the edit if there is one,
    /// otherwise what is already live.
    pub fn desired(&self, host: &str) -> HostLocation {
        self.edited
            .get(host)
            .cloned()
            .unwrap_or_else(|| self.saved_location(host))
    }

    pub fn is_changed(&self, host: &str) -> bool {
        self.desired(host) != self.saved_location(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_map_two_level_lookup() {
        let mut ops = OperationMap::default();
        ops.set("monitor", "interval", "10s");
        ops.set("monitor", "timeout", "20s");
        ops.set("start", "timeout", "60s");
        assert_eq!(ops.get("monitor", "interval"), Some("10s"));
        assert_eq!(ops.get("start", "interval"), None);
        assert_eq!(
            ops.fields_of("monitor"),
            vec![("interval", "10s"), ("timeout", "20s")]
        );
        assert_eq!(ops.remove("start", "timeout").as_deref(), Some("60s"));
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn set_edited_leaves_saved_alone() {
        let mut params = ParameterSet::default();
        params.set_saved("ip", "10.0.0.1");
        params.set_edited("ip", "10.0.0.2");
        assert_eq!(params.saved("ip"), Some("10.0.0.1"));
        assert_eq!(params.edited("ip"), Some("10.0.0.2"));
    }

    #[test]
    fn commit_moves_edits_and_drops_cleared_values() {
        let mut params = ParameterSet::default();
        params.set_saved("ip", "10.0.0.1");
        params.set_saved("nic", "eth0");
        params.set_edited("ip", "10.0.0.2");
        params.set_edited("nic", "");
        let submitted = params.clone();
        params.commit(&submitted);
        assert_eq!(params.saved("ip"), Some("10.0.0.2"));
        assert_eq!(params.saved("nic"), None);
        assert!(!params.has_edits());
    }

    #[test]
    fn commit_keeps_edits_made_after_submission() {
        let mut params = ParameterSet::default();
        params.set_saved("ip", "10.0.0.1");
        params.set_edited("ip", "10.0.0.2");
        let submitted = params.clone();
        params.set_edited("ip", "10.0.0.99");
        params.set_edited("nic", "eth1");
        params.commit(&submitted);
        assert_eq!(params.saved("ip"), Some("10.0.0.2"));
        assert_eq!(params.edited("ip"), Some("10.0.0.99"));
        assert_eq!(params.edited("nic"), Some("eth1"));
        assert_eq!(params.saved("nic"), None);
    }

    #[test]
    fn operation_commit_keeps_newer_edits() {
        let mut ops = OperationSet::default();
        ops.set_edited("monitor", "interval", "20s");
        ops.set_edited("start", "timeout", "60s");
        let submitted = ops.clone();
        ops.set_edited("monitor", "interval", "30s");
        ops.commit(&submitted);
        assert_eq!(ops.saved.get("monitor", "interval"), Some("20s"));
        assert_eq!(ops.saved.get("start", "timeout"), Some("60s"));
        assert_eq!(ops.edited.get("monitor", "interval"), Some("30s"));
        assert_eq!(ops.edited.get("start", "timeout"), None);
    }

    #[test]
    fn sentinels_are_equivalent() {
        assert!(SameAs::NothingSelected.equivalent(&SameAs::DefaultValues));
        assert!(!SameAs::NothingSelected.equivalent(&SameAs::Resource("a".into())));
    }

    #[test]
    fn reference_change_ignores_sentinel_switch() {
        let mut r = Reference::default();
        r.edited = Some(SameAs::DefaultValues);
        assert!(!r.is_changed());
        r.edited = Some(SameAs::Resource("web".into()));
        assert!(r.is_changed());
        let submitted = r.clone();
        r.commit(&submitted);
        assert_eq!(r.saved, SameAs::Resource("web".into()));
        assert!(r.edited.is_none());
    }

    #[test]
    fn location_desired_falls_back_to_saved() {
        let mut locs = LocationSet::default();
        locs.saved.insert(
            "h1".into(),
            SavedLocation {
                id: "loc_a_h1".into(),
                location: HostLocation::new(Score::Infinity, LocationOp::Eq),
            },
        );
        assert!(!locs.is_changed("h1"));
        assert!(!locs.is_changed("h2"));
        locs.set_edited("h1", HostLocation::default());
        assert!(locs.is_changed("h1"));
    }
}
