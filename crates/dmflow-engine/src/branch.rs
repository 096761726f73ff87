//! Branch-target resolution.
//!
//! A node that is the target of any explicit edge (next, condition branch,
//! button target, quick-reply option target) must not auto-advance by
//! linear order when it has no successor of its own: the branch it ends is
//! done, so the flow completes. This set is computed once per flow load
//! and passed into the traversal, so an edited flow definition is picked
//! up on the next entry.

use std::collections::HashSet;

use dmflow_core::types::{ButtonSpec, FlowDefinition, NodeId, NodeKind};

#[derive(Debug, Clone)]
pub struct BranchTargets {
    targets: HashSet<NodeId>,
}

impl BranchTargets {
    pub fn compute(flow: &FlowDefinition) -> Self {
        let mut targets = HashSet::new();

        for node in &flow.nodes {
            if let Some(next) = node.next_node {
                targets.insert(next);
            }

            match &node.kind {
                NodeKind::MessageQuickReply { options, .. } => {
                    for opt in options {
                        if let Some(target) = opt.target_node {
                            targets.insert(target);
                        }
                    }
                }
                NodeKind::MessageButtonTemplate { buttons, .. } => {
                    for button in buttons {
                        if let ButtonSpec::Postback {
                            target_node: Some(target),
                            ..
                        } = button
                        {
                            targets.insert(*target);
                        }
                    }
                }
                NodeKind::ConditionFollower {
                    true_node,
                    false_node,
                } => {
                    targets.extend(true_node.iter().chain(false_node.iter()));
                }
                NodeKind::ConditionUserInteracted {
                    true_node,
                    false_node,
                    ..
                } => {
                    targets.extend(true_node.iter().chain(false_node.iter()));
                }
                NodeKind::AiConversation { fallback_node } => {
                    targets.extend(fallback_node.iter());
                }
                _ => {}
            }
        }

        Self { targets }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.targets.contains(&node)
    }
}
