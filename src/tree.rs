use serde::de::{self, Deserializer};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TreeError {
    #[error("Unknown node type code `{0}`")]
    UnknownNodeType(u8),
    #[error("Malformed tree: {0}")]
    Malformed(String),
}

/// What a node means to the evaluator. The integer codes are part of the
/// persisted encoding and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum NodeKind {
    Root = 0,
    Function = 1,
    AdfDefining = 2,
    Variable = 3,
    Constant = 4,
    AdfLeaf = 5,
    KozaAdfDefining = 6,
    KozaAdfCall = 7,
    KozaAdfParameter = 8,
}

impl TryFrom<u8> for NodeKind {
    type Error = TreeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => NodeKind::Root,
            1 => NodeKind::Function,
            2 => NodeKind::AdfDefining,
            3 => NodeKind::Variable,
            4 => NodeKind::Constant,
            5 => NodeKind::AdfLeaf,
            6 => NodeKind::KozaAdfDefining,
            7 => NodeKind::KozaAdfCall,
            8 => NodeKind::KozaAdfParameter,
            other => return Err(TreeError::UnknownNodeType(other)),
        })
    }
}

impl From<NodeKind> for u8 {
    fn from(kind: NodeKind) -> Self {
        kind as u8
    }
}

/// A node head: `(node_type, arity, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(NodeKind, usize, String)", into = "(NodeKind, usize, String)")]
pub struct Node {
    pub kind: NodeKind,
    pub arity: usize,
    pub name: String,
}

impl Node {
    pub fn new(kind: NodeKind, arity: usize, name: impl Into<String>) -> Self {
        Node {
            kind,
            arity,
            name: name.into(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.arity == 0
    }
}

impl From<(NodeKind, usize, String)> for Node {
    fn from((kind, arity, name): (NodeKind, usize, String)) -> Self {
        Node { kind, arity, name }
    }
}

impl From<Node> for (NodeKind, usize, String) {
    fn from(node: Node) -> Self {
        (node.kind, node.arity, node.name)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, '{}')", self.kind as u8, self.arity, self.name)
    }
}

/// A program tree. Every node owns exactly `arity` children; the only way to
/// build a tree is through constructors that check this, so a `Tree` value is
/// always well formed.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    node: Node,
    children: Vec<Tree>,
}

impl Tree {
    pub fn leaf(kind: NodeKind, name: impl Into<String>) -> Self {
        Tree {
            node: Node::new(kind, 0, name),
            children: Vec::new(),
        }
    }

    pub fn branch(node: Node, children: Vec<Tree>) -> Result<Self, TreeError> {
        if node.arity != children.len() {
            return Err(TreeError::Malformed(format!(
                "node {} declares {} children but has {}",
                node,
                node.arity,
                children.len()
            )));
        }
        Ok(Tree { node, children })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn children(&self) -> &[Tree] {
        &self.children
    }

    /// Number of nodes on the longest root-to-leaf path; a lone leaf has depth 1.
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(Tree::depth).max().unwrap_or(0)
    }

    pub fn size(&self) -> usize {
        1 + self.children.iter().map(Tree::size).sum::<usize>()
    }

    /// Re-checks the arity invariant on the whole tree.
    pub fn validate(&self) -> Result<(), TreeError> {
        if self.node.arity != self.children.len() {
            return Err(TreeError::Malformed(format!(
                "node {} has {} children",
                self.node,
                self.children.len()
            )));
        }
        self.children.iter().try_for_each(Tree::validate)
    }

    /// Pre-order walk yielding each subtree with its level (the root is level 1).
    pub fn preorder(&self) -> Vec<(&Tree, usize)> {
        let mut out = Vec::with_capacity(self.size());
        let mut stack = vec![(self, 1)];
        while let Some((tree, level)) = stack.pop() {
            out.push((tree, level));
            for child in tree.children.iter().rev() {
                stack.push((child, level + 1));
            }
        }
        out
    }

    /// Subtree at a pre-order position.
    pub fn subtree(&self, position: usize) -> Option<&Tree> {
        self.preorder().get(position).map(|(tree, _)| *tree)
    }

    /// Swaps the subtree at a pre-order position for `replacement` and returns
    /// the old one. Whole subtrees are exchanged, so the arity invariant holds.
    pub fn replace_subtree(&mut self, position: usize, replacement: Tree) -> Option<Tree> {
        fn walk(tree: &mut Tree, remaining: &mut usize, replacement: &mut Option<Tree>) -> Option<Tree> {
            if *remaining == 0 {
                let new = replacement.take()?;
                return Some(std::mem::replace(tree, new));
            }
            for child in tree.children.iter_mut() {
                *remaining -= 1;
                let size = child.size();
                if *remaining < size {
                    return walk(child, remaining, replacement);
                }
                *remaining -= size - 1;
            }
            None
        }
        let mut remaining = position;
        let mut replacement = Some(replacement);
        walk(self, &mut remaining, &mut replacement)
    }

    pub fn contains_kind(&self, kind: NodeKind) -> bool {
        self.node.kind == kind || self.children.iter().any(|c| c.contains_kind(kind))
    }
}

impl Serialize for Tree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // leaves are the bare node triple, branches are [node, child...]
        if self.children.is_empty() {
            return self.node.serialize(serializer);
        }
        let mut seq = serializer.serialize_seq(Some(self.children.len() + 1))?;
        seq.serialize_element(&self.node)?;
        for child in &self.children {
            seq.serialize_element(child)?;
        }
        seq.end()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Encoded {
    Leaf(Node),
    Branch(Vec<Encoded>),
}

impl TryFrom<Encoded> for Tree {
    type Error = TreeError;

    fn try_from(encoded: Encoded) -> Result<Self, Self::Error> {
        match encoded {
            Encoded::Leaf(node) if node.arity == 0 => Ok(Tree {
                node,
                children: Vec::new(),
            }),
            Encoded::Leaf(node) => Err(TreeError::Malformed(format!(
                "leaf {} declares arity {}",
                node, node.arity
            ))),
            Encoded::Branch(items) => {
                let mut items = items.into_iter();
                let node = match items.next() {
                    Some(Encoded::Leaf(node)) => node,
                    Some(Encoded::Branch(_)) => {
                        return Err(TreeError::Malformed(
                            "branch must start with a node triple".into(),
                        ))
                    }
                    None => return Err(TreeError::Malformed("empty branch".into())),
                };
                let children = items.map(Tree::try_from).collect::<Result<Vec<_>, _>>()?;
                Tree::branch(node, children)
            }
        }
    }
}

impl<'de> Deserialize<'de> for Tree {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = Encoded::deserialize(deserializer)?;
        Tree::try_from(encoded).map_err(de::Error::custom)
    }
}

/// Grammar slot a node was generated in: the parent's name and the child index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub parent: String,
    pub index: usize,
}

/// Pre-order list of the slot occupied by each node; the root has none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMapping(pub Vec<Option<Slot>>);

impl TypeMapping {
    pub fn of(tree: &Tree) -> Self {
        fn walk(tree: &Tree, slot: Option<Slot>, out: &mut Vec<Option<Slot>>) {
            out.push(slot);
            for (index, child) in tree.children.iter().enumerate() {
                let slot = Slot {
                    parent: tree.node.name.clone(),
                    index,
                };
                walk(child, Some(slot), out);
            }
        }
        let mut out = Vec::with_capacity(tree.size());
        walk(tree, None, &mut out);
        TypeMapping(out)
    }

    pub fn slot(&self, position: usize) -> Option<&Slot> {
        self.0.get(position).and_then(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Tree {
        // root( +(x, 1.5) )
        let plus = Tree::branch(
            Node::new(NodeKind::Function, 2, "+"),
            vec![
                Tree::leaf(NodeKind::Variable, "x"),
                Tree::leaf(NodeKind::Constant, "1.5"),
            ],
        )
        .unwrap();
        Tree::branch(Node::new(NodeKind::Root, 1, "root"), vec![plus]).unwrap()
    }

    #[test]
    fn test_positional_encoding_matches_wire_format() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert_eq!(json, r#"[[0,1,"root"],[[1,2,"+"],[3,0,"x"],[4,0,"1.5"]]]"#);
        let back: Tree = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn test_malformed_trees_are_rejected() {
        // '+' declares two children but only has one
        let bad = r#"[[0,1,"root"],[[1,2,"+"],[3,0,"x"]]]"#;
        assert!(serde_json::from_str::<Tree>(bad).is_err());
        // leaf claiming children
        assert!(serde_json::from_str::<Tree>(r#"[1,2,"+"]"#).is_err());
        // unknown node type
        assert!(serde_json::from_str::<Tree>(r#"[9,0,"x"]"#).is_err());

        let err = Tree::branch(Node::new(NodeKind::Function, 2, "+"), vec![]);
        assert!(matches!(err, Err(TreeError::Malformed(_))));
    }

    #[test]
    fn test_depth_size_and_preorder() {
        let tree = sample();
        assert_eq!(tree.depth(), 3);
        assert_eq!(tree.size(), 4);
        let names: Vec<_> = tree
            .preorder()
            .iter()
            .map(|(t, level)| (t.node().name.clone(), *level))
            .collect();
        assert_eq!(
            names,
            vec![
                ("root".to_string(), 1),
                ("+".to_string(), 2),
                ("x".to_string(), 3),
                ("1.5".to_string(), 3)
            ]
        );
    }

    #[test]
    fn test_replace_subtree_keeps_structure() {
        let mut tree = sample();
        let old = tree
            .replace_subtree(3, Tree::leaf(NodeKind::Variable, "y"))
            .unwrap();
        assert_eq!(old.node().name, "1.5");
        assert_eq!(tree.subtree(3).unwrap().node().name, "y");
        assert!(tree.validate().is_ok());
        assert!(tree.replace_subtree(10, Tree::leaf(NodeKind::Variable, "z")).is_none());
    }

    #[test]
    fn test_type_mapping_follows_preorder() {
        let mapping = TypeMapping::of(&sample());
        assert_eq!(mapping.len(), 4);
        assert!(mapping.slot(0).is_none());
        assert_eq!(
            mapping.slot(3),
            Some(&Slot {
                parent: "+".into(),
                index: 1
            })
        );
    }
}
