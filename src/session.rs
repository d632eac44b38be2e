//! Per-user filter pipeline.
//!
//! A session owns one node per chain field and one submission gate. A value
//! change on field `k` is applied by [`FilterSession::begin`], which marks every
//! downstream node stale; [`FilterSession::step`] then refreshes exactly one
//! node, the next in chain order, whose reset value in turn triggers the node
//! after it. [`FilterSession::settle`] steps until the chain is quiet.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cache::ResultKey;
use crate::chain::{FilterField, FilterSelection, normalize_values};
use crate::engine::{RankSpec, ResultInputs};
use crate::gate::SubmissionGate;
use crate::node::FilterNode;
use crate::relation::{HcpcsDescription, RelationAccessor};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0} is still refreshing; wait for its options to load")]
    StaleControl(FilterField),
    #[error("filters are still refreshing; submit is not available yet")]
    GateClosed,
    #[error("failed to refresh {field} options: {cause:#}")]
    Refresh { field: FilterField, cause: anyhow::Error },
}

/// A user changed one control.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FilterEvent {
    pub field: FilterField,
    #[serde(default)]
    pub value: Vec<String>,
}

/// A settled selection ready for the result engine.
#[derive(Debug, Clone)]
pub struct Submission {
    pub inputs: ResultInputs,
    pub advisory: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub field: FilterField,
    pub label: &'static str,
    pub options: Vec<String>,
    pub value: Vec<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub filters: Vec<NodeView>,
    pub can_submit: bool,
    pub has_ever_submitted: bool,
    pub export_key: Option<ResultKey>,
}

#[derive(Debug)]
pub struct FilterSession {
    nodes: Vec<FilterNode>,
    gate: SubmissionGate,
    pending: Option<FilterField>,
    last_result: Option<ResultKey>,
}

impl FilterSession {
    /// Loads the first field's options globally, applies its default, and
    /// cascades defaults down the chain.
    pub fn open(relation: &dyn RelationAccessor) -> Result<Self, SessionError> {
        let mut nodes: Vec<FilterNode> = FilterField::ALL.into_iter().map(FilterNode::new).collect();
        let first = FilterField::ALL[0];
        nodes[0]
            .refresh(relation, &FilterSelection::new(), false)
            .map_err(|cause| refresh_error(first, cause))?;

        let mut session = Self {
            nodes,
            gate: SubmissionGate::new(),
            pending: first.next(),
            last_result: None,
        };
        session.settle(relation)?;
        Ok(session)
    }

    #[cfg(test)]
    pub fn node(&self, field: FilterField) -> &FilterNode {
        &self.nodes[field.index()]
    }

    pub fn selection(&self) -> FilterSelection {
        let mut sel = FilterSelection::new();
        for n in &self.nodes {
            sel.set(n.field, n.value.clone());
        }
        sel
    }

    pub fn can_submit(&self) -> bool {
        SubmissionGate::can_submit(&self.nodes)
    }

    pub fn has_ever_submitted(&self) -> bool {
        self.gate.has_ever_submitted()
    }

    /// Next node waiting for its refresh, if any.
    #[cfg(test)]
    pub fn pending(&self) -> Option<FilterField> {
        self.pending
    }

    /// Applies a value change and marks every downstream node stale. No query
    /// is issued here.
    pub fn begin(&mut self, event: FilterEvent) -> Result<(), SessionError> {
        let FilterEvent { field, value } = event;
        let node = &mut self.nodes[field.index()];
        if !node.enabled() {
            return Err(SessionError::StaleControl(field));
        }
        node.value = normalize_values(value);
        self.last_result = None;

        for f in field.downstream() {
            self.nodes[f.index()].mark_stale(field);
        }
        self.pending = field.next();
        self.gate.observe(&self.nodes);
        Ok(())
    }

    /// Refreshes the next pending node. Returns the field refreshed, or `None`
    /// once the chain has settled. A failed refresh leaves the node pending so
    /// a later call retries it.
    pub fn step(
        &mut self,
        relation: &dyn RelationAccessor,
    ) -> Result<Option<FilterField>, SessionError> {
        let Some(field) = self.pending else {
            return Ok(None);
        };
        let selection = self.selection();
        let has_ever_submitted = self.gate.has_ever_submitted();
        self.nodes[field.index()]
            .refresh(relation, &selection, has_ever_submitted)
            .map_err(|cause| refresh_error(field, cause))?;

        // The reset value is itself an upstream change for the rest of the chain.
        for f in field.downstream() {
            self.nodes[f.index()].mark_stale(field);
        }
        self.pending = field.next();
        self.gate.observe(&self.nodes);
        Ok(Some(field))
    }

    pub fn settle(&mut self, relation: &dyn RelationAccessor) -> Result<(), SessionError> {
        while self.step(relation)?.is_some() {}
        Ok(())
    }

    pub fn dispatch(
        &mut self,
        relation: &dyn RelationAccessor,
        event: FilterEvent,
    ) -> Result<(), SessionError> {
        self.begin(event)?;
        self.settle(relation)
    }

    pub fn submit(
        &self,
        rank_position: Option<&str>,
        rank_by: Option<&str>,
    ) -> Result<Submission, SessionError> {
        if !self.can_submit() {
            return Err(SessionError::GateClosed);
        }
        let (rank, advisory) = RankSpec::normalize(rank_position, rank_by);
        Ok(Submission {
            inputs: ResultInputs {
                selection: self.selection(),
                rank,
            },
            advisory,
        })
    }

    /// Remembers the result now on screen; cleared by the next filter change.
    pub fn record_result(&mut self, key: ResultKey) {
        self.last_result = Some(key);
    }

    pub fn export_key(&self) -> Option<&ResultKey> {
        self.last_result.as_ref()
    }

    pub fn hcpcs_descriptions(
        &self,
        relation: &dyn RelationAccessor,
    ) -> anyhow::Result<Vec<HcpcsDescription>> {
        relation.hcpcs_descriptions(&self.selection().predicates())
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            filters: self
                .nodes
                .iter()
                .map(|n| NodeView {
                    field: n.field,
                    label: n.field.label(),
                    options: n.options.clone(),
                    value: n.value.clone(),
                    enabled: n.enabled(),
                })
                .collect(),
            can_submit: self.can_submit(),
            has_ever_submitted: self.has_ever_submitted(),
            export_key: self.export_key().cloned(),
        }
    }
}

fn refresh_error(field: FilterField, cause: anyhow::Error) -> SessionError {
    tracing::warn!("refresh of {} failed: {:#}", field, cause);
    SessionError::Refresh { field, cause }
}

struct SessionSlot {
    session: Arc<Mutex<FilterSession>>,
    last_seen: Instant,
}

/// Live sessions by opaque id. Idle sessions are dropped after `ttl`.
pub struct SessionStore {
    slots: Mutex<HashMap<String, SessionSlot>>,
    ttl: Duration,
    counter: AtomicU64,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl,
            counter: AtomicU64::new(0),
        }
    }

    pub fn insert(&self, session: FilterSession) -> String {
        let id = self.next_id();
        let mut slots = self.slots.lock();
        let ttl = self.ttl;
        slots.retain(|_, s| s.last_seen.elapsed() <= ttl);
        slots.insert(
            id.clone(),
            SessionSlot {
                session: Arc::new(Mutex::new(session)),
                last_seen: Instant::now(),
            },
        );
        id
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mutex<FilterSession>>> {
        let mut slots = self.slots.lock();
        let expired = slots.get(id)?.last_seen.elapsed() > self.ttl;
        if expired {
            slots.remove(id);
            return None;
        }
        let slot = slots.get_mut(id)?;
        slot.last_seen = Instant::now();
        Some(Arc::clone(&slot.session))
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let mut hasher = Sha256::new();
        hasher.update(n.to_le_bytes());
        hasher.update(nanos.to_le_bytes());
        hasher.update(std::process::id().to_le_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..32].to_string()
    }
}
