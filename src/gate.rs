use crate::node::FilterNode;

/// Decides whether the run action is available, and remembers whether it has
/// ever been. One gate per session.
#[derive(Debug, Clone, Default)]
pub struct SubmissionGate {
    has_ever_submitted: bool,
}

impl SubmissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open only when every node has finished refreshing.
    pub fn can_submit<'a>(nodes: impl IntoIterator<Item = &'a FilterNode>) -> bool {
        nodes.into_iter().all(FilterNode::enabled)
    }

    /// Re-evaluates the gate after a pipeline step. The first time it opens the
    /// flag latches, and later resets clear fields instead of restoring defaults.
    pub fn observe<'a>(&mut self, nodes: impl IntoIterator<Item = &'a FilterNode>) -> bool {
        let open = Self::can_submit(nodes);
        if open && !self.has_ever_submitted {
            tracing::debug!("submission gate opened for the first time");
            self.has_ever_submitted = true;
        }
        open
    }

    pub fn has_ever_submitted(&self) -> bool {
        self.has_ever_submitted
    }
}
