//! Tree evaluation against bound terminals and functions.
//!
//! Bindings live in an [`EvalContext`] created per call, so a single
//! [`TreeEvaluator`] can be shared across threads and evaluate many trees at
//! once. ADF handling sits in [`adf`].

pub mod adf;
pub mod fitness;
pub mod primitives;

use crate::grammar::GrammarRules;
use crate::tree::{NodeKind, Tree};
use adf::{evaluate_adf, AdfDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("Terminal `{0}` is not bound")]
    UnboundTerminal(String),
    #[error("Function `{0}` is not bound")]
    UnboundFunction(String),
    #[error("`{name}` expects {expected} inputs, got {got}")]
    ArityMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("Malformed ADF: {0}")]
    MalformedAdf(String),
    #[error("ADF calls nested deeper than {0}")]
    RecursionLimit(usize),
    #[error("Wrong values sent to function node: {0}")]
    WrongValues(String),
}

/// Values flowing through a tree: a number, or a list of values (one entry per
/// fitness case, per output, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Scalar(f64),
    List(Vec<Value>),
}

impl Value {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(x) => Some(*x),
            Value::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            Value::Scalar(_) => None,
        }
    }

    /// All scalars in depth-first order.
    pub fn flatten(&self) -> Vec<f64> {
        match self {
            Value::Scalar(x) => vec![*x],
            Value::List(items) => items.iter().flat_map(Value::flatten).collect(),
        }
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Scalar(x)
    }
}

impl From<Vec<f64>> for Value {
    fn from(xs: Vec<f64>) -> Self {
        Value::List(xs.into_iter().map(Value::Scalar).collect())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

/// A function node implementation; receives the already evaluated children.
pub type Primitive = Arc<dyn Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync>;

/// Base terminal and function tables. Never mutated by evaluation.
#[derive(Clone, Default)]
pub struct TreeEvaluator {
    functions: HashMap<String, Primitive>,
    terminals: HashMap<String, Value>,
}

impl TreeEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.set_function(name, function);
        self
    }

    pub fn with_terminal(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_terminal(name, value);
        self
    }

    pub fn set_function<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn set_terminal(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.terminals.insert(name.into(), value.into());
    }

    pub fn terminals(&self) -> &HashMap<String, Value> {
        &self.terminals
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registers `<name>_PARAM0 .. <name>_PARAM{count-1}` placeholders so the
    /// ADF called `name` picks up `count` parameters.
    pub fn declare_adf_parameters(&mut self, name: &str, count: usize) {
        for k in 0..count {
            self.terminals
                .insert(format!("{name}_PARAM{k}"), Value::Scalar(f64::NAN));
        }
    }

    /// Checks that every function and variable the grammar can emit is bound.
    /// ADF heads, calls and parameters are resolved per tree and are skipped.
    pub fn check_configuration(&self, rules: &GrammarRules) -> Result<(), EvalError> {
        for node in rules.all_nodes() {
            match node.kind {
                NodeKind::Function if !self.functions.contains_key(&node.name) => {
                    return Err(EvalError::UnboundFunction(node.name.clone()))
                }
                NodeKind::Variable if !self.terminals.contains_key(&node.name) => {
                    return Err(EvalError::UnboundTerminal(node.name.clone()))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Plain evaluation: no ADF definitions are in scope.
    pub fn evaluate(&self, tree: &Tree) -> Result<Value, EvalError> {
        let no_adfs = HashMap::new();
        EvalContext::new(&self.functions, &self.terminals, &no_adfs).evaluate(tree)
    }

    /// Evaluates a tree whose root holds `arity - 1` ADF definitions followed by
    /// the main program.
    pub fn eval_with_adf(&self, tree: &Tree) -> Result<Value, EvalError> {
        let children = tree.children();
        let Some((main, definitions)) = children.split_last() else {
            return Err(EvalError::MalformedAdf(format!(
                "root `{}` has no main program",
                tree.node().name
            )));
        };

        let mut adfs = HashMap::with_capacity(definitions.len());
        for (i, subtree) in definitions.iter().enumerate() {
            debug!("Build ADF {}", i);
            let definition = self.build_adf(subtree)?;
            adfs.insert(definition.call_name(), definition);
        }

        debug!("Eval main program");
        EvalContext::new(&self.functions, &self.terminals, &adfs).evaluate(main)
    }

    /// Turns an ADF-defining subtree into a callable definition. Parameters
    /// are the terminal-table keys `<name>_PARAM<k>`, ordered by `k`.
    pub fn build_adf(&self, subtree: &Tree) -> Result<AdfDefinition, EvalError> {
        AdfDefinition::from_subtree(subtree, self.terminals.keys().map(String::as_str))
    }
}

/// Bindings for one evaluation: base tables borrowed from the evaluator, ADF
/// definitions of the tree being evaluated, and local overrides (ADF
/// parameters, results of non-Koza ADF branches).
pub struct EvalContext<'a> {
    functions: &'a HashMap<String, Primitive>,
    terminals: &'a HashMap<String, Value>,
    adfs: &'a HashMap<String, AdfDefinition>,
    locals: HashMap<String, Value>,
    depth: usize,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        functions: &'a HashMap<String, Primitive>,
        terminals: &'a HashMap<String, Value>,
        adfs: &'a HashMap<String, AdfDefinition>,
    ) -> Self {
        EvalContext {
            functions,
            terminals,
            adfs,
            locals: HashMap::new(),
            depth: 0,
        }
    }

    /// Context for an ADF body: same tables, fresh locals, one level deeper.
    pub fn nested(&self, locals: HashMap<String, Value>) -> EvalContext<'a> {
        EvalContext {
            functions: self.functions,
            terminals: self.terminals,
            adfs: self.adfs,
            locals,
            depth: self.depth + 1,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.locals.get(name).or_else(|| self.terminals.get(name))
    }

    pub fn evaluate(&self, tree: &Tree) -> Result<Value, EvalError> {
        let node = tree.node();
        match node.kind {
            NodeKind::Variable | NodeKind::KozaAdfParameter | NodeKind::AdfLeaf => self
                .lookup(&node.name)
                .cloned()
                .ok_or_else(|| EvalError::UnboundTerminal(node.name.clone())),
            NodeKind::Constant => match self.lookup(&node.name) {
                Some(value) => Ok(value.clone()),
                None => node
                    .name
                    .parse::<f64>()
                    .map(Value::Scalar)
                    .map_err(|_| EvalError::UnboundTerminal(node.name.clone())),
            },
            NodeKind::Function | NodeKind::KozaAdfCall => {
                let inputs = self.evaluate_children(tree.children())?;
                self.apply(&node.name, inputs)
            }
            NodeKind::Root => self.evaluate_root(tree),
            NodeKind::AdfDefining | NodeKind::KozaAdfDefining => match tree.children() {
                [body] => self.evaluate(body),
                _ => Err(EvalError::MalformedAdf(format!(
                    "`{}` must have exactly one body",
                    node.name
                ))),
            },
        }
    }

    fn evaluate_children(&self, children: &[Tree]) -> Result<Vec<Value>, EvalError> {
        children.iter().map(|child| self.evaluate(child)).collect()
    }

    /// A root evaluates its non-Koza ADF branches first, binding each result
    /// under the branch name, then feeds the remaining children to the
    /// function bound to its own name (if any).
    fn evaluate_root(&self, tree: &Tree) -> Result<Value, EvalError> {
        let mut scope = EvalContext {
            functions: self.functions,
            terminals: self.terminals,
            adfs: self.adfs,
            locals: self.locals.clone(),
            depth: self.depth,
        };
        let mut values = Vec::with_capacity(tree.children().len());
        for child in tree.children() {
            if child.node().kind == NodeKind::AdfDefining {
                let result = scope.evaluate(child)?;
                scope.locals.insert(child.node().name.clone(), result);
            } else {
                values.push(scope.evaluate(child)?);
            }
        }

        let name = &tree.node().name;
        if self.adfs.contains_key(name) || self.functions.contains_key(name) {
            return scope.apply(name, values);
        }
        match values.len() {
            1 => Ok(values.remove(0)),
            _ => Ok(Value::List(values)),
        }
    }

    /// Calls an ADF definition if one is in scope under `name`, else the
    /// primitive bound to `name`.
    pub fn apply(&self, name: &str, inputs: Vec<Value>) -> Result<Value, EvalError> {
        if let Some(definition) = self.adfs.get(name) {
            return evaluate_adf(definition, inputs, self);
        }
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| EvalError::UnboundFunction(name.to_string()))?;
        function(&inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::primitives;
    use crate::tree::Node;

    fn evaluator() -> TreeEvaluator {
        TreeEvaluator::new()
            .with_function("+", primitives::add)
            .with_function("*", primitives::mul)
            .with_terminal("x", vec![1.0, 2.0])
            .with_terminal("y", vec![3.0, 4.0])
    }

    fn binary(name: &str, left: Tree, right: Tree) -> Tree {
        Tree::branch(Node::new(NodeKind::Function, 2, name), vec![left, right]).unwrap()
    }

    #[test]
    fn test_plain_evaluation_applies_functions_bottom_up() {
        let tree = Tree::branch(
            Node::new(NodeKind::Root, 1, "root"),
            vec![binary(
                "+",
                Tree::leaf(NodeKind::Variable, "x"),
                binary(
                    "*",
                    Tree::leaf(NodeKind::Variable, "y"),
                    Tree::leaf(NodeKind::Constant, "2"),
                ),
            )],
        )
        .unwrap();
        let result = evaluator().evaluate(&tree).unwrap();
        assert_eq!(result, Value::from(vec![7.0, 10.0]));
    }

    #[test]
    fn test_unbound_names_are_errors() {
        let tree = Tree::leaf(NodeKind::Variable, "z");
        assert_eq!(
            evaluator().evaluate(&tree),
            Err(EvalError::UnboundTerminal("z".into()))
        );
        let tree = binary(
            "-",
            Tree::leaf(NodeKind::Variable, "x"),
            Tree::leaf(NodeKind::Variable, "x"),
        );
        assert_eq!(
            evaluator().evaluate(&tree),
            Err(EvalError::UnboundFunction("-".into()))
        );
    }

    #[test]
    fn test_adf_branch_result_is_visible_to_adf_leaves() {
        // root( ADF(x + y), ADF * x )
        let adf = Tree::branch(
            Node::new(NodeKind::AdfDefining, 1, "ADF"),
            vec![binary(
                "+",
                Tree::leaf(NodeKind::Variable, "x"),
                Tree::leaf(NodeKind::Variable, "y"),
            )],
        )
        .unwrap();
        let main = binary(
            "*",
            Tree::leaf(NodeKind::AdfLeaf, "ADF"),
            Tree::leaf(NodeKind::Variable, "x"),
        );
        let tree = Tree::branch(Node::new(NodeKind::Root, 2, "root"), vec![adf, main]).unwrap();
        let result = evaluator().evaluate(&tree).unwrap();
        assert_eq!(result, Value::from(vec![4.0, 12.0]));
    }

    #[test]
    fn test_check_configuration_reports_missing_bindings() {
        use crate::grammar::SlotRule;
        let rules = GrammarRules::new().with_rule(
            "root",
            vec![SlotRule::new(
                vec![Node::new(NodeKind::Function, 2, "-")],
                vec![Node::new(NodeKind::Variable, 0, "x")],
            )],
        );
        assert_eq!(
            evaluator().check_configuration(&rules),
            Err(EvalError::UnboundFunction("-".into()))
        );
    }

    #[test]
    fn test_evaluator_is_shareable_across_threads() {
        let evaluator = Arc::new(evaluator());
        let tree = binary(
            "+",
            Tree::leaf(NodeKind::Variable, "x"),
            Tree::leaf(NodeKind::Variable, "y"),
        );
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let evaluator = Arc::clone(&evaluator);
                let tree = tree.clone();
                std::thread::spawn(move || evaluator.evaluate(&tree))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), Value::from(vec![4.0, 6.0]));
        }
    }
}
