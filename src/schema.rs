//! Parameter metadata.
//!
//! Resource-agent metadata is owned by the agents themselves; this module
//! only holds what reconciliation needs from it: per-parameter kind,
//! default, preferred value and the required/advanced/meta-attribute flags,
//! plus operation defaults keyed by (operation, field).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::HamcError;
use crate::params::OperationMap;
use crate::score::Score;

/// `class:provider:type`, e.g. `ocf:heartbeat:IPaddr2` or `stonith:external/ssh`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId {
    pub class: String,
    pub provider: Option<String>,
    pub kind: String,
}

impl FromStr for AgentId {
    type Err = HamcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let invalid = || HamcError::Validation {
            message: format!("agent must be class:provider:type or class:type (got '{s}')"),
        };
        match parts.as_slice() {
            [class, provider, kind] if !class.is_empty() && !kind.is_empty() => Ok(AgentId {
                class: class.to_string(),
                provider: Some(provider.to_string()).filter(|p| !p.is_empty()),
                kind: kind.to_string(),
            }),
            [class, kind] if !class.is_empty() && !kind.is_empty() => Ok(AgentId {
                class: class.to_string(),
                provider: None,
                kind: kind.to_string(),
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.provider {
            Some(p) => write!(f, "{}:{}:{}", self.class, p, self.kind),
            None => write!(f, "{}:{}", self.class, self.kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
    /// Durations such as `20s`, `500ms`, `2min`.
    Time,
    Score,
    Choice(Vec<String>),
    /// Names another resource known to the session (DRBD `after`).
    ResourceRef,
}

impl ParamKind {
    pub fn from_name(name: &str, choices: Vec<String>) -> Result<Self, HamcError> {
        Ok(match name {
            "" | "string" => ParamKind::String,
            "integer" => ParamKind::Integer,
            "boolean" => ParamKind::Boolean,
            "time" => ParamKind::Time,
            "score" => ParamKind::Score,
            "resource" => ParamKind::ResourceRef,
            "choice" if !choices.is_empty() => ParamKind::Choice(choices),
            other => {
                return Err(HamcError::Validation {
                    message: format!("unknown parameter kind '{other}'"),
                });
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<String>,
    pub preferred: Option<String>,
    pub required: bool,
    pub advanced: bool,
    pub meta_attr: bool,
}

impl ParamSpec {
    pub fn new(name: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            default: None,
            preferred: None,
            required: false,
            advanced: false,
            meta_attr: false,
        }
    }

    pub fn with_default(mut self, value: &str) -> Self {
        self.default = Some(value.to_string());
        self
    }

    pub fn with_preferred(mut self, value: &str) -> Self {
        self.preferred = Some(value.to_string());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn advanced(mut self) -> Self {
        self.advanced = true;
        self
    }

    pub fn meta(mut self) -> Self {
        self.meta_attr = true;
        self
    }

    /// Check a non-empty value against the parameter kind.
    pub fn validate(&self, value: &str) -> Result<(), String> {
        match &self.kind {
            ParamKind::String | ParamKind::ResourceRef => Ok(()),
            ParamKind::Integer => value
                .trim()
                .parse::<i64>()
                .map(|_| ())
                .map_err(|_| format!("'{value}' is not an integer")),
            ParamKind::Boolean => match value.to_ascii_lowercase().as_str() {
                "true" | "false" | "yes" | "no" | "on" | "off" | "1" | "0" => Ok(()),
                _ => Err(format!("'{value}' is not a boolean")),
            },
            ParamKind::Time => validate_time(value),
            ParamKind::Score => value
                .parse::<Score>()
                .map(|_| ())
                .map_err(|e| e.to_string()),
            ParamKind::Choice(choices) => {
                if choices.iter().any(|c| c == value) {
                    Ok(())
                } else {
                    Err(format!("'{value}' is not one of {}", choices.join(", ")))
                }
            }
        }
    }
}

fn validate_time(value: &str) -> Result<(), String> {
    let v = value.trim();
    let split = v.find(|c: char| !c.is_ascii_digit()).unwrap_or(v.len());
    let (num, unit) = v.split_at(split);
    if num.is_empty() {
        return Err(format!("'{value}' is not a duration"));
    }
    match unit {
        "" | "s" | "ms" | "us" | "m" | "min" | "h" | "hr" => Ok(()),
        _ => Err(format!("'{value}' has an unknown time unit '{unit}'")),
    }
}

/// Everything reconciliation needs to know about one resource agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentSchema {
    params: Vec<ParamSpec>,
    operation_defaults: OperationMap,
}

impl AgentSchema {
    pub fn new(params: Vec<ParamSpec>, operation_defaults: OperationMap) -> Self {
        Self {
            params,
            operation_defaults,
        }
    }

    /// Agent parameters plus the cluster-manager meta-attributes that every
    /// primitive carries.
    pub fn for_primitive(agent_params: Vec<ParamSpec>, operation_defaults: OperationMap) -> Self {
        let mut params = agent_params;
        params.extend(primitive_meta_attrs());
        Self::new(params, operation_defaults)
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params.iter()
    }

    pub fn meta_attrs(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params.iter().filter(|p| p.meta_attr)
    }

    pub fn is_meta_attr(&self, name: &str) -> bool {
        self.param(name).is_some_and(|p| p.meta_attr)
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.param(name).is_some_and(|p| p.required)
    }

    pub fn default_value(&self, name: &str) -> Option<&str> {
        self.param(name).and_then(|p| p.default.as_deref())
    }

    pub fn preferred_value(&self, name: &str) -> Option<&str> {
        self.param(name).and_then(|p| p.preferred.as_deref())
    }

    pub fn operation_defaults(&self) -> &OperationMap {
        &self.operation_defaults
    }

    pub fn op_default(&self, op: &str, field: &str) -> Option<&str> {
        self.operation_defaults.get(op, field)
    }
}

/// Meta-attributes understood by the cluster manager for every primitive.
pub fn primitive_meta_attrs() -> Vec<ParamSpec> {
    vec![
        ParamSpec::new(
            "target-role",
            ParamKind::Choice(vec!["Started".into(), "Stopped".into(), "Master".into()]),
        )
        .with_default("Started")
        .meta(),
        ParamSpec::new("is-managed", ParamKind::Boolean)
            .with_default("true")
            .meta(),
        ParamSpec::new("priority", ParamKind::Integer)
            .with_default("0")
            .meta()
            .advanced(),
        ParamSpec::new("migration-threshold", ParamKind::Integer)
            .with_default("0")
            .meta()
            .advanced(),
        ParamSpec::new("resource-stickiness", ParamKind::Score)
            .with_default("0")
            .meta(),
        ParamSpec::new("failure-timeout", ParamKind::Time)
            .with_default("0")
            .meta()
            .advanced(),
        ParamSpec::new("allow-migrate", ParamKind::Boolean)
            .with_default("false")
            .meta()
            .advanced(),
    ]
}

pub fn group_meta_attrs() -> Vec<ParamSpec> {
    vec![
        ParamSpec::new(
            "target-role",
            ParamKind::Choice(vec!["Started".into(), "Stopped".into()]),
        )
        .with_default("Started")
        .meta(),
        ParamSpec::new("is-managed", ParamKind::Boolean)
            .with_default("true")
            .meta(),
    ]
}

pub fn clone_meta_attrs(master_slave: bool) -> Vec<ParamSpec> {
    let mut attrs = group_meta_attrs();
    attrs.extend([
        ParamSpec::new("clone-max", ParamKind::Integer).meta(),
        ParamSpec::new("clone-node-max", ParamKind::Integer)
            .with_default("1")
            .meta(),
        ParamSpec::new("notify", ParamKind::Boolean)
            .with_default("false")
            .with_preferred("true")
            .meta(),
        ParamSpec::new("globally-unique", ParamKind::Boolean)
            .with_default("false")
            .meta()
            .advanced(),
        ParamSpec::new("interleave", ParamKind::Boolean)
            .with_default("false")
            .with_preferred("true")
            .meta(),
    ]);
    if master_slave {
        attrs.extend([
            ParamSpec::new("master-max", ParamKind::Integer)
                .with_default("1")
                .meta(),
            ParamSpec::new("master-node-max", ParamKind::Integer)
                .with_default("1")
                .meta(),
        ]);
    }
    attrs
}

/// Settings of a DRBD replicated resource that reconciliation compares.
pub fn drbd_resource_params() -> Vec<ParamSpec> {
    vec![
        ParamSpec::new("name", ParamKind::String).required(),
        ParamSpec::new(
            "protocol",
            ParamKind::Choice(vec!["A".into(), "B".into(), "C".into()]),
        )
        .with_default("C"),
        ParamSpec::new("after", ParamKind::ResourceRef),
        ParamSpec::new("rate", ParamKind::String).advanced(),
        ParamSpec::new("allow-two-primaries", ParamKind::Boolean)
            .with_default("no")
            .advanced(),
    ]
}

pub fn virtual_domain_params() -> Vec<ParamSpec> {
    vec![
        ParamSpec::new("name", ParamKind::String).required(),
        ParamSpec::new("vcpu", ParamKind::Integer).with_default("1"),
        ParamSpec::new("memory", ParamKind::Integer).with_default("524288"),
        ParamSpec::new(
            "on_poweroff",
            ParamKind::Choice(vec!["destroy".into(), "restart".into(), "preserve".into()]),
        )
        .with_default("destroy")
        .advanced(),
    ]
}

/// Operation defaults applied when an agent does not ship its own.
pub fn default_operations() -> OperationMap {
    let mut ops = OperationMap::default();
    ops.set("start", "timeout", "20s");
    ops.set("stop", "timeout", "20s");
    ops.set("monitor", "interval", "10s");
    ops.set("monitor", "timeout", "20s");
    ops
}

/// Build a schema from parameter declarations keyed by operation name.
pub fn operations_from_nested(nested: &BTreeMap<String, BTreeMap<String, String>>) -> OperationMap {
    let mut ops = OperationMap::default();
    for (op, fields) in nested {
        for (field, value) in fields {
            ops.set(op, field, value);
        }
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_three_parts() {
        let id: AgentId = "ocf:heartbeat:IPaddr2".parse().unwrap();
        assert_eq!(id.class, "ocf");
        assert_eq!(id.provider.as_deref(), Some("heartbeat"));
        assert_eq!(id.kind, "IPaddr2");
        assert_eq!(id.to_string(), "ocf:heartbeat:IPaddr2");
    }

    #[test]
    fn agent_id_two_parts() {
        let id: AgentId = "stonith:external/ssh".parse().unwrap();
        assert_eq!(id.provider, None);
        assert_eq!(id.kind, "external/ssh");
    }

    #[test]
    fn agent_id_rejects_garbage() {
        assert!("IPaddr2".parse::<AgentId>().is_err());
        assert!("ocf::".parse::<AgentId>().is_err());
    }

    #[test]
    fn validates_by_kind() {
        let int = ParamSpec::new("n", ParamKind::Integer);
        assert!(int.validate("42").is_ok());
        assert!(int.validate("forty").is_err());

        let time = ParamSpec::new("t", ParamKind::Time);
        assert!(time.validate("20s").is_ok());
        assert!(time.validate("500ms").is_ok());
        assert!(time.validate("90").is_ok());
        assert!(time.validate("s").is_err());
        assert!(time.validate("20 parsecs").is_err());

        let choice = ParamSpec::new("c", ParamKind::Choice(vec!["A".into(), "C".into()]));
        assert!(choice.validate("C").is_ok());
        assert!(choice.validate("B").is_err());
    }

    #[test]
    fn primitive_schema_classifies_meta_attrs() {
        let schema = AgentSchema::for_primitive(
            vec![ParamSpec::new("ip", ParamKind::String).required()],
            default_operations(),
        );
        assert!(schema.is_meta_attr("target-role"));
        assert!(!schema.is_meta_attr("ip"));
        assert!(schema.is_required("ip"));
        assert_eq!(schema.default_value("is-managed"), Some("true"));
        assert_eq!(schema.op_default("monitor", "interval"), Some("10s"));
    }
}
