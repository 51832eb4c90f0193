//! Resource-set builder owned by constraint placeholders.
//!
//! A placeholder stands between resources that are ordered or colocated as
//! sets: parents of the placeholder form the `first` set, children the
//! `then` set. Every membership change resubmits the whole constraint; the
//! constraint is torn down only once no member is left.

use crate::intent::{Intent, ResourceSetConstraint, ResourceSetSpec};
use crate::score::Score;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeKind {
    Colocation,
    Order,
}

/// Which side of the placeholder a member sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The member is a parent of the placeholder.
    First,
    /// The member is a child of the placeholder.
    Then,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetConstraint {
    /// Live constraint id, once submitted or discovered.
    pub id: Option<String>,
    pub score: Score,
    pub first: Vec<String>,
    pub then: Vec<String>,
    pub reversed: bool,
}

impl Default for SetConstraint {
    fn default() -> Self {
        Self {
            id: None,
            score: Score::Infinity,
            first: Vec::new(),
            then: Vec::new(),
            reversed: false,
        }
    }
}

impl SetConstraint {
    pub fn is_empty(&self) -> bool {
        self.first.is_empty() && self.then.is_empty()
    }

    pub fn contains(&self, member: &str) -> bool {
        self.first.iter().chain(&self.then).any(|m| m == member)
    }

    fn side_mut(&mut self, side: Side) -> &mut Vec<String> {
        match side {
            Side::First => &mut self.first,
            Side::Then => &mut self.then,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    key: String,
    pub colocation: SetConstraint,
    pub order: SetConstraint,
}

impl Placeholder {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            colocation: SetConstraint::default(),
            order: SetConstraint::default(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn constraint(&self, kind: EdgeKind) -> &SetConstraint {
        match kind {
            EdgeKind::Colocation => &self.colocation,
            EdgeKind::Order => &self.order,
        }
    }

    pub fn constraint_mut(&mut self, kind: EdgeKind) -> &mut SetConstraint {
        match kind {
            EdgeKind::Colocation => &mut self.colocation,
            EdgeKind::Order => &mut self.order,
        }
    }

    /// Id the constraint is (or will be) known by in the cluster.
    pub fn constraint_id(&self, kind: EdgeKind) -> String {
        self.constraint(kind).id.clone().unwrap_or_else(|| match kind {
            EdgeKind::Colocation => format!("col_{}", self.key),
            EdgeKind::Order => format!("ord_{}", self.key),
        })
    }

    /// Swap the direction of one constraint. Must run before a membership
    /// delta is built, otherwise the new member lands on the inverted side.
    pub fn reverse(&mut self, kind: EdgeKind) {
        let c = self.constraint_mut(kind);
        std::mem::swap(&mut c.first, &mut c.then);
        c.reversed = !c.reversed;
    }

    /// Merge `member` into the set on `side` and return the resubmission, or
    /// `None` if it is already a member.
    pub fn add_member(&mut self, kind: EdgeKind, side: Side, member: &str) -> Option<Intent> {
        let c = self.constraint_mut(kind);
        if c.contains(member) {
            return None;
        }
        c.side_mut(side).push(member.to_string());
        Some(Intent::SetResourceSet(self.render(kind)))
    }

    /// Trim `member` from the constraint. Returns the resubmitted remainder,
    /// a removal once the constraint is empty, or `None` if `member` was not
    /// in it.
    pub fn remove_member(&mut self, kind: EdgeKind, member: &str) -> Option<Intent> {
        let id = self.constraint_id(kind);
        let c = self.constraint_mut(kind);
        if !c.contains(member) {
            return None;
        }
        c.first.retain(|m| m != member);
        c.then.retain(|m| m != member);
        if !c.is_empty() {
            return Some(Intent::SetResourceSet(self.render(kind)));
        }
        let was_live = c.id.take().is_some();
        if !was_live {
            return None;
        }
        Some(match kind {
            EdgeKind::Colocation => Intent::RemoveColocation { id },
            EdgeKind::Order => Intent::RemoveOrder { id },
        })
    }

    /// The whole constraint as the cluster manager takes it. Colocation sets
    /// are listed dependents first, order sets in execution order.
    pub fn render(&self, kind: EdgeKind) -> ResourceSetConstraint {
        let id = self.constraint_id(kind);
        let c = self.constraint(kind);
        let ordered: [&Vec<String>; 2] = match kind {
            EdgeKind::Order => [&c.first, &c.then],
            EdgeKind::Colocation => [&c.then, &c.first],
        };
        let sets = ordered
            .into_iter()
            .filter(|members| !members.is_empty())
            .enumerate()
            .map(|(i, members)| ResourceSetSpec {
                id: format!("{id}-{i}"),
                members: members.clone(),
                sequential: false,
            })
            .collect();
        ResourceSetConstraint {
            id,
            kind,
            score: c.score,
            sets,
        }
    }
}
