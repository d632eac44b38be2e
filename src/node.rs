use serde::Serialize;

use crate::chain::{FilterField, FilterSelection};
use crate::relation::RelationAccessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Options reflect the current upstream selection; the control is enabled.
    Fresh,
    /// An upstream value changed and this node has not refreshed since.
    Stale,
}

/// What caused a node's access to be recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTrigger {
    UpstreamValue(FilterField),
    OwnOptions,
}

/// Only the node's own refreshed options can enable it.
pub fn compute_access(trigger: AccessTrigger) -> NodeState {
    match trigger {
        AccessTrigger::OwnOptions => NodeState::Fresh,
        AccessTrigger::UpstreamValue(_) => NodeState::Stale,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterNode {
    pub field: FilterField,
    pub options: Vec<String>,
    pub value: Vec<String>,
    pub state: NodeState,
}

impl FilterNode {
    pub fn new(field: FilterField) -> Self {
        Self {
            field,
            options: Vec::new(),
            value: Vec::new(),
            state: NodeState::Stale,
        }
    }

    pub fn enabled(&self) -> bool {
        self.state == NodeState::Fresh
    }

    /// Distinct values of this field's column under every upstream selection.
    pub fn compute_options(
        &self,
        relation: &dyn RelationAccessor,
        selection: &FilterSelection,
    ) -> anyhow::Result<Vec<String>> {
        relation.distinct_values(self.field, &selection.predicates_for(self.field))
    }

    /// Defaults apply only until the session's gate has opened once.
    pub fn compute_reset_value(&self, has_ever_submitted: bool) -> Vec<String> {
        if has_ever_submitted {
            Vec::new()
        } else {
            self.field.default_value()
        }
    }

    pub fn mark_stale(&mut self, cause: FilterField) {
        debug_assert!(cause < self.field, "{cause} is not upstream of {}", self.field);
        self.state = compute_access(AccessTrigger::UpstreamValue(cause));
    }

    /// Requeries options, resets the value and re-enables the node. On failure
    /// the node keeps its previous options and stays stale.
    pub fn refresh(
        &mut self,
        relation: &dyn RelationAccessor,
        selection: &FilterSelection,
        has_ever_submitted: bool,
    ) -> anyhow::Result<()> {
        let options = self.compute_options(relation, selection)?;
        self.options = options;
        self.value = self.compute_reset_value(has_ever_submitted);
        self.state = compute_access(AccessTrigger::OwnOptions);
        Ok(())
    }
}
