use crate::tree::{Node, Slot, Tree};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// How far past the requested depth the builder may go when a slot offers no
/// terminals (an ADF-defining slot, for instance) before giving up.
const DEPTH_OVERSHOOT: usize = 16;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GrammarError {
    #[error("No grammar rule for node `{0}`")]
    MissingRule(String),
    #[error("Rule for `{name}` has {slots} slots but the node has arity {arity}")]
    SlotMismatch {
        name: String,
        slots: usize,
        arity: usize,
    },
    #[error("Slot {index} of `{parent}` allows neither functions nor terminals")]
    EmptySlot { parent: String, index: usize },
    #[error("Could not close the tree below depth {0}")]
    DepthExhausted(usize),
}

/// Allowed node heads for one child position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotRule {
    pub functions: Vec<Node>,
    pub terminals: Vec<Node>,
}

impl SlotRule {
    pub fn new(functions: Vec<Node>, terminals: Vec<Node>) -> Self {
        SlotRule {
            functions,
            terminals,
        }
    }

    pub fn allows(&self, node: &Node) -> bool {
        self.functions.contains(node) || self.terminals.contains(node)
    }
}

/// Node name to ordered child slots; list position is the child index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrammarRules {
    rules: HashMap<String, Vec<SlotRule>>,
}

impl GrammarRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, name: impl Into<String>, slots: Vec<SlotRule>) -> Self {
        self.rules.insert(name.into(), slots);
        self
    }

    pub fn slots(&self, name: &str) -> Option<&[SlotRule]> {
        self.rules.get(name).map(Vec::as_slice)
    }

    pub fn slot(&self, slot: &Slot) -> Option<&SlotRule> {
        self.slots(&slot.parent).and_then(|slots| slots.get(slot.index))
    }

    /// Every node head that the grammar can ever place, across all slots.
    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.rules
            .values()
            .flatten()
            .flat_map(|slot| slot.functions.iter().chain(slot.terminals.iter()))
    }

    /// Whether every child of every node sits in a slot that allows it.
    pub fn accepts(&self, tree: &Tree) -> bool {
        if tree.children().is_empty() {
            return true;
        }
        let Some(slots) = self.slots(&tree.node().name) else {
            return false;
        };
        slots.len() == tree.children().len()
            && slots
                .iter()
                .zip(tree.children())
                .all(|(slot, child)| slot.allows(child.node()) && self.accepts(child))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildMethod {
    #[default]
    RampedHalfAndHalf,
    Full,
    GrowMinimum,
}

/// Grammar-constrained random tree construction.
pub struct GrammarBuilder<'a> {
    rules: &'a GrammarRules,
}

impl<'a> GrammarBuilder<'a> {
    pub fn new(rules: &'a GrammarRules) -> Self {
        GrammarBuilder { rules }
    }

    /// Builds `count` trees under `root`. Ramped half-and-half spreads the
    /// target depth over `min_depth..=max_depth` and alternates full and grow.
    pub fn build_population<R: Rng>(
        &self,
        root: &Node,
        method: BuildMethod,
        min_depth: usize,
        max_depth: usize,
        count: usize,
        rng: &mut R,
    ) -> Result<Vec<Tree>, GrammarError> {
        let depths: Vec<usize> = (min_depth.max(1)..=max_depth.max(min_depth.max(1))).collect();
        (0..count)
            .map(|i| match method {
                BuildMethod::RampedHalfAndHalf => {
                    let depth = depths[i % depths.len()];
                    let full = (i / depths.len()) % 2 == 0;
                    self.build(root, full, min_depth, depth, rng)
                }
                BuildMethod::Full => self.build(root, true, max_depth, max_depth, rng),
                BuildMethod::GrowMinimum => self.build(root, false, min_depth, max_depth, rng),
            })
            .collect()
    }

    /// Builds one tree. Functions are forced above `min_depth`; with `full`
    /// they are forced all the way down to `max_depth`.
    pub fn build<R: Rng>(
        &self,
        root: &Node,
        full: bool,
        min_depth: usize,
        max_depth: usize,
        rng: &mut R,
    ) -> Result<Tree, GrammarError> {
        self.expand(root, 1, full, min_depth, max_depth, rng)
    }

    /// Grows a replacement subtree for one slot, starting at `level`.
    pub fn grow_in_slot<R: Rng>(
        &self,
        slot: &SlotRule,
        parent: &Slot,
        level: usize,
        max_depth: usize,
        rng: &mut R,
    ) -> Result<Tree, GrammarError> {
        let head = self.pick(slot, parent, level, false, 0, max_depth, rng)?;
        self.expand(&head, level, false, 0, max_depth, rng)
    }

    fn expand<R: Rng>(
        &self,
        node: &Node,
        level: usize,
        full: bool,
        min_depth: usize,
        max_depth: usize,
        rng: &mut R,
    ) -> Result<Tree, GrammarError> {
        if node.is_leaf() {
            return Ok(Tree::leaf(node.kind, node.name.clone()));
        }
        if level > max_depth + DEPTH_OVERSHOOT {
            return Err(GrammarError::DepthExhausted(max_depth));
        }
        let slots = self
            .rules
            .slots(&node.name)
            .ok_or_else(|| GrammarError::MissingRule(node.name.clone()))?;
        if slots.len() != node.arity {
            return Err(GrammarError::SlotMismatch {
                name: node.name.clone(),
                slots: slots.len(),
                arity: node.arity,
            });
        }

        let mut children = Vec::with_capacity(node.arity);
        for (index, slot) in slots.iter().enumerate() {
            let parent = Slot {
                parent: node.name.clone(),
                index,
            };
            let head = self.pick(slot, &parent, level + 1, full, min_depth, max_depth, rng)?;
            children.push(self.expand(&head, level + 1, full, min_depth, max_depth, rng)?);
        }
        Tree::branch(node.clone(), children).map_err(|_| GrammarError::SlotMismatch {
            name: node.name.clone(),
            slots: slots.len(),
            arity: node.arity,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn pick<R: Rng>(
        &self,
        slot: &SlotRule,
        parent: &Slot,
        level: usize,
        full: bool,
        min_depth: usize,
        max_depth: usize,
        rng: &mut R,
    ) -> Result<Node, GrammarError> {
        let choose_terminal = match (slot.functions.is_empty(), slot.terminals.is_empty()) {
            (true, true) => {
                return Err(GrammarError::EmptySlot {
                    parent: parent.parent.clone(),
                    index: parent.index,
                })
            }
            (true, false) => true,
            (false, true) => false,
            (false, false) => {
                if level >= max_depth {
                    true
                } else if full || level < min_depth {
                    false
                } else {
                    let ratio = slot.terminals.len() as f64
                        / (slot.terminals.len() + slot.functions.len()) as f64;
                    rng.gen_bool(ratio)
                }
            }
        };
        let pool = if choose_terminal {
            &slot.terminals
        } else {
            &slot.functions
        };
        pool.choose(rng).cloned().ok_or_else(|| GrammarError::EmptySlot {
            parent: parent.parent.clone(),
            index: parent.index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::NodeKind;
    use rand::rngs::StdRng;

    fn arithmetic_rules() -> (GrammarRules, Node) {
        let functions = vec![
            Node::new(NodeKind::Function, 2, "+"),
            Node::new(NodeKind::Function, 2, "*"),
            Node::new(NodeKind::Function, 1, "neg"),
        ];
        let terminals = vec![Node::new(NodeKind::Variable, 0, "x")];
        let slot = SlotRule::new(functions, terminals);
        let rules = GrammarRules::new()
            .with_rule("root", vec![slot.clone()])
            .with_rule("+", vec![slot.clone(), slot.clone()])
            .with_rule("*", vec![slot.clone(), slot.clone()])
            .with_rule("neg", vec![slot]);
        (rules, Node::new(NodeKind::Root, 1, "root"))
    }

    #[test]
    fn test_full_trees_reach_exact_depth() {
        let (rules, root) = arithmetic_rules();
        let builder = GrammarBuilder::new(&rules);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let tree = builder.build(&root, true, 4, 4, &mut rng).unwrap();
            assert_eq!(tree.depth(), 4);
            assert!(rules.accepts(&tree));
        }
    }

    #[test]
    fn test_ramped_population_respects_bounds() {
        let (rules, root) = arithmetic_rules();
        let builder = GrammarBuilder::new(&rules);
        let mut rng = StdRng::seed_from_u64(11);
        let trees = builder
            .build_population(&root, BuildMethod::RampedHalfAndHalf, 2, 6, 50, &mut rng)
            .unwrap();
        assert_eq!(trees.len(), 50);
        for tree in &trees {
            assert!(tree.depth() >= 2 && tree.depth() <= 6, "depth {}", tree.depth());
            assert!(rules.accepts(tree));
        }
    }

    #[test]
    fn test_grow_minimum_forces_functions_above_min_depth() {
        let (rules, root) = arithmetic_rules();
        let builder = GrammarBuilder::new(&rules);
        let mut rng = StdRng::seed_from_u64(3);
        let trees = builder
            .build_population(&root, BuildMethod::GrowMinimum, 4, 7, 30, &mut rng)
            .unwrap();
        assert!(trees.iter().all(|t| t.depth() >= 4 && t.depth() <= 7));
    }

    #[test]
    fn test_missing_rule_is_reported() {
        let rules = GrammarRules::new();
        let builder = GrammarBuilder::new(&rules);
        let mut rng = StdRng::seed_from_u64(1);
        let err = builder
            .build(&Node::new(NodeKind::Root, 1, "root"), true, 2, 2, &mut rng)
            .unwrap_err();
        assert_eq!(err, GrammarError::MissingRule("root".into()));
    }
}
