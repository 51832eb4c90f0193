//! Structured configuration intents and the executor that carries them out.
//!
//! Intents are hand-off data: flag names, escaping and the actual `crm` /
//! `drbdadm` / `virsh` invocation belong to the executor implementation.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::HamcError;
use crate::locked::Locked;
use crate::model::ResourceKind;
use crate::params::OperationMap;
use crate::placeholder::EdgeKind;
use crate::score::{LocationOp, Score};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    Create,
    Update,
}

/// Group or clone a resource is wrapped in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enclosing {
    pub kind: ResourceKind,
    pub crm_id: String,
    pub is_new: bool,
}

/// Partitioned attribute maps for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePayload {
    pub mode: PayloadMode,
    pub crm_id: String,
    pub kind: ResourceKind,
    /// `id`, `class`, `provider`, `type`.
    pub class_attrs: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    pub meta_attrs: BTreeMap<String, String>,
    /// Id of another resource's meta-attribute set, when shared.
    pub meta_attrs_ref: Option<String>,
    pub operations: OperationMap,
    pub operations_ref: Option<String>,
    pub enclosing: Option<Enclosing>,
    /// Group/clone members as cluster ids, in order.
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColocationSpec {
    pub id: String,
    pub score: Score,
    pub with_rsc_role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSpec {
    pub id: String,
    pub score: Score,
    pub first_action: Option<String>,
    pub then_action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSetSpec {
    pub id: String,
    pub members: Vec<String>,
    pub sequential: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSetConstraint {
    pub id: String,
    pub kind: EdgeKind,
    pub score: Score,
    pub sets: Vec<ResourceSetSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    SetParameters(ResourcePayload),
    RemoveLocation {
        resource: String,
        location_id: String,
        host: String,
    },
    SetLocation {
        resource: String,
        location_id: String,
        host: String,
        score: Score,
        op: LocationOp,
    },
    /// `parent` is the `first`/`with-rsc` side, `child` the dependent.
    SetOrderAndColocation {
        parent: String,
        child: String,
        colocation: Option<ColocationSpec>,
        order: Option<OrderSpec>,
    },
    RemoveOrder {
        id: String,
    },
    RemoveColocation {
        id: String,
    },
    SetResourceSet(ResourceSetConstraint),
    CleanupResource {
        resource: String,
        host: String,
    },
    StartDomain {
        domain: String,
    },
    ShutdownDomain {
        domain: String,
    },
    DestroyDomain {
        domain: String,
    },
    SuspendDomain {
        domain: String,
    },
    ResumeDomain {
        domain: String,
    },
    UndefineDomain {
        domain: String,
    },
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Intent::SetParameters(_) => "SetParameters",
            Intent::RemoveLocation { .. } => "RemoveLocation",
            Intent::SetLocation { .. } => "SetLocation",
            Intent::SetOrderAndColocation { .. } => "SetOrderAndColocation",
            Intent::RemoveOrder { .. } => "RemoveOrder",
            Intent::RemoveColocation { .. } => "RemoveColocation",
            Intent::SetResourceSet(_) => "SetResourceSet",
            Intent::CleanupResource { .. } => "CleanupResource",
            Intent::StartDomain { .. } => "StartDomain",
            Intent::ShutdownDomain { .. } => "ShutdownDomain",
            Intent::DestroyDomain { .. } => "DestroyDomain",
            Intent::SuspendDomain { .. } => "SuspendDomain",
            Intent::ResumeDomain { .. } => "ResumeDomain",
            Intent::UndefineDomain { .. } => "UndefineDomain",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        match self {
            Intent::SetParameters(p) => {
                let mode = match p.mode {
                    PayloadMode::Create => "create",
                    PayloadMode::Update => "update",
                };
                write!(
                    f,
                    "{name} {mode} {} ({} params, {} meta",
                    p.crm_id,
                    p.params.len(),
                    p.meta_attrs.len()
                )?;
                if let Some(r) = &p.meta_attrs_ref {
                    write!(f, ", meta from {r}")?;
                }
                write!(f, ", {} op fields", p.operations.len())?;
                if let Some(r) = &p.operations_ref {
                    write!(f, ", ops from {r}")?;
                }
                if let Some(e) = &p.enclosing {
                    write!(f, ", in {} {}", e.kind, e.crm_id)?;
                }
                f.write_str(")")
            }
            Intent::RemoveLocation {
                resource,
                location_id,
                host,
            } => write!(f, "{name} {location_id} ({resource} on {host})"),
            Intent::SetLocation {
                resource,
                location_id,
                host,
                score,
                op,
            } => write!(f, "{name} {location_id} ({resource} on {host}: {score} {op})"),
            Intent::SetOrderAndColocation {
                parent,
                child,
                colocation,
                order,
            } => {
                write!(f, "{name} {parent} -> {child}")?;
                if let Some(c) = colocation {
                    write!(f, " colocation {} {}", c.id, c.score)?;
                    if let Some(role) = &c.with_rsc_role {
                        write!(f, " with-rsc-role={role}")?;
                    }
                }
                if let Some(o) = order {
                    write!(f, " order {} {}", o.id, o.score)?;
                    if let (Some(first), Some(then)) = (&o.first_action, &o.then_action) {
                        write!(f, " {first}/{then}")?;
                    }
                }
                Ok(())
            }
            Intent::RemoveOrder { id } | Intent::RemoveColocation { id } => {
                write!(f, "{name} {id}")
            }
            Intent::SetResourceSet(c) => {
                let sets: Vec<String> = c
                    .sets
                    .iter()
                    .map(|s| format!("({})", s.members.join(" ")))
                    .collect();
                write!(f, "{name} {} {} {}", c.id, c.score, sets.join(" "))
            }
            Intent::CleanupResource { resource, host } => write!(f, "{name} {resource} on {host}"),
            Intent::StartDomain { domain }
            | Intent::ShutdownDomain { domain }
            | Intent::DestroyDomain { domain }
            | Intent::SuspendDomain { domain }
            | Intent::ResumeDomain { domain }
            | Intent::UndefineDomain { domain } => write!(f, "{name} {domain}"),
        }
    }
}

/// What the executor reports for one intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub ok: bool,
    pub output: String,
}

/// One intent the executor accepted, as reported back to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub intent: Intent,
    pub host: String,
    pub dry_run: bool,
    pub output: String,
}

/// Carries intents to a host. Implementations block for the round-trip.
pub trait CommandExecutor: Send + Sync {
    fn submit(&self, intent: &Intent, host: &str, dry_run: bool) -> Submission;
}

/// Submit one intent and turn a reported failure into an error carrying the
/// raw output. Never retries.
pub fn submit_checked(
    executor: &dyn CommandExecutor,
    intent: &Intent,
    host: &str,
    dry_run: bool,
) -> Result<Submission, HamcError> {
    tracing::debug!(intent = %intent, host, dry_run, "submitting");
    let submission = executor.submit(intent, host, dry_run);
    if submission.ok {
        Ok(submission)
    } else {
        tracing::warn!(intent = intent.name(), host, output = %submission.output, "intent failed");
        Err(HamcError::Command {
            intent: intent.name().to_string(),
            host: host.to_string(),
            output: submission.output,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub intent: Intent,
    pub host: String,
    pub dry_run: bool,
}

/// Executor that accepts everything and remembers what it was given.
///
/// Used for planning (nothing leaves the process) and as the test double.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    log: Locked<Vec<Recorded>>,
    failing: Locked<Vec<&'static str>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report failure for every intent with this name from now on.
    pub fn fail_on(&self, intent_name: &'static str) {
        self.failing.update(|f| f.push(intent_name));
    }

    /// Stop reporting failures.
    pub fn accept_all(&self) {
        self.failing.update(Vec::clear);
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.log.snapshot()
    }

    pub fn intents(&self) -> Vec<Intent> {
        self.log.read(|log| log.iter().map(|r| r.intent.clone()).collect())
    }

    pub fn clear(&self) {
        self.log.update(Vec::clear);
    }
}

impl CommandExecutor for RecordingExecutor {
    fn submit(&self, intent: &Intent, host: &str, dry_run: bool) -> Submission {
        let fails = self.failing.read(|f| f.contains(&intent.name()));
        self.log.update(|log| {
            log.push(Recorded {
                intent: intent.clone(),
                host: host.to_string(),
                dry_run,
            })
        });
        if fails {
            Submission {
                ok: false,
                output: format!("{} rejected by {host}", intent.name()),
            }
        } else {
            Submission {
                ok: true,
                output: String::new(),
            }
        }
    }
}
