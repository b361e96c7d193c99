//! Built-in problems a run or a worker can be configured with by name.

use crate::evaluation::fitness::{FitnessFunction, TargetError};
use crate::evaluation::{primitives, EvalError, TreeEvaluator, Value};
use crate::grammar::{GrammarRules, SlotRule};
use crate::tree::{Node, NodeKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProblemKind {
    /// Fit `x^3 + x^2 + cos(x)` on 20 points of `[-1, 1)`.
    #[default]
    SymbolicRegression,
    /// Produce `(x + y, (x + y)^3)` per sample, with one two-parameter ADF.
    KozaAdfPair,
}

/// Grammar, fitness and root shape of one problem.
pub struct Problem {
    pub grammar: GrammarRules,
    pub fitness: Arc<dyn FitnessFunction>,
    pub root: Node,
}

impl ProblemKind {
    pub fn build(self) -> Result<Problem, EvalError> {
        match self {
            ProblemKind::SymbolicRegression => symbolic_regression(),
            ProblemKind::KozaAdfPair => koza_adf_pair(),
        }
    }
}

fn symbolic_regression() -> Result<Problem, EvalError> {
    let xs: Vec<f64> = (0..20).map(|i| -1.0 + 0.1 * i as f64).collect();
    let targets: Vec<f64> = xs.iter().map(|x| x.powi(3) + x.powi(2) + x.cos()).collect();

    let mut evaluator = TreeEvaluator::new().with_terminal("x", xs);
    primitives::install_arithmetic(&mut evaluator);

    let slot = SlotRule::new(
        vec![
            Node::new(NodeKind::Function, 2, "+"),
            Node::new(NodeKind::Function, 2, "-"),
            Node::new(NodeKind::Function, 2, "*"),
            Node::new(NodeKind::Function, 1, "cos"),
        ],
        vec![
            Node::new(NodeKind::Variable, 0, "x"),
            Node::new(NodeKind::Constant, 0, "1"),
        ],
    );
    let grammar = GrammarRules::new()
        .with_rule("root", vec![slot.clone()])
        .with_rule("+", vec![slot.clone(), slot.clone()])
        .with_rule("-", vec![slot.clone(), slot.clone()])
        .with_rule("*", vec![slot.clone(), slot.clone()])
        .with_rule("cos", vec![slot]);
    evaluator.check_configuration(&grammar)?;

    Ok(Problem {
        grammar,
        fitness: Arc::new(TargetError::new(evaluator, targets)),
        root: Node::new(NodeKind::Root, 1, "root"),
    })
}

fn koza_adf_pair() -> Result<Problem, EvalError> {
    let xs: Vec<f64> = vec![0.0, 0.5, 1.0, 1.5, 2.0];
    let ys: Vec<f64> = vec![1.0, 0.25, -0.5, 2.0, 0.75];
    let targets: Vec<Value> = xs
        .iter()
        .zip(&ys)
        .map(|(x, y)| Value::from(vec![x + y, (x + y).powi(3)]))
        .collect();

    let mut evaluator = TreeEvaluator::new()
        .with_terminal("x", xs)
        .with_terminal("y", ys)
        .with_function("adf+", primitives::add)
        .with_function("adf*", primitives::mul)
        .with_function("_root", primitives::zip_outputs);
    primitives::install_arithmetic(&mut evaluator);
    evaluator.declare_adf_parameters("ADF0", 2);

    let body = SlotRule::new(
        vec![
            Node::new(NodeKind::Function, 2, "adf+"),
            Node::new(NodeKind::Function, 2, "adf*"),
        ],
        vec![
            Node::new(NodeKind::KozaAdfParameter, 0, "ADF0_PARAM0"),
            Node::new(NodeKind::KozaAdfParameter, 0, "ADF0_PARAM1"),
        ],
    );
    let main = SlotRule::new(
        vec![
            Node::new(NodeKind::Function, 2, "+"),
            Node::new(NodeKind::Function, 2, "*"),
            Node::new(NodeKind::KozaAdfCall, 2, "_ADF0"),
        ],
        vec![
            Node::new(NodeKind::Variable, 0, "x"),
            Node::new(NodeKind::Variable, 0, "y"),
        ],
    );
    let grammar = GrammarRules::new()
        .with_rule(
            "root",
            vec![
                SlotRule::new(vec![Node::new(NodeKind::KozaAdfDefining, 1, "ADF0")], vec![]),
                SlotRule::new(vec![Node::new(NodeKind::Root, 2, "_root")], vec![]),
            ],
        )
        .with_rule("ADF0", vec![body.clone()])
        .with_rule("adf+", vec![body.clone(), body.clone()])
        .with_rule("adf*", vec![body.clone(), body])
        .with_rule("_root", vec![main.clone(), main.clone()])
        .with_rule("+", vec![main.clone(), main.clone()])
        .with_rule("*", vec![main.clone(), main.clone()])
        .with_rule("_ADF0", vec![main.clone(), main]);
    evaluator.check_configuration(&grammar)?;

    Ok(Problem {
        grammar,
        fitness: Arc::new(TargetError::new(evaluator, targets).with_adf()),
        root: Node::new(NodeKind::Root, 2, "root"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{BuildMethod, GrammarBuilder};
    use crate::tree::Tree;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_exact_regression_program_scores_zero() {
        let problem = ProblemKind::SymbolicRegression.build().unwrap();
        let x = || Tree::leaf(NodeKind::Variable, "x");
        let mul = |a, b| Tree::branch(Node::new(NodeKind::Function, 2, "*"), vec![a, b]).unwrap();
        let add = |a, b| Tree::branch(Node::new(NodeKind::Function, 2, "+"), vec![a, b]).unwrap();
        let cos = Tree::branch(Node::new(NodeKind::Function, 1, "cos"), vec![x()]).unwrap();
        let cube = mul(mul(x(), x()), x());
        let body = add(add(cube, mul(x(), x())), cos);
        let tree = Tree::branch(problem.root.clone(), vec![body]).unwrap();

        assert!(problem.grammar.accepts(&tree));
        assert!(problem.fitness.fitness(&tree).unwrap() < 1e-9);
    }

    #[test]
    fn test_adf_problem_builds_scorable_trees() {
        let problem = ProblemKind::KozaAdfPair.build().unwrap();
        let mut rng = StdRng::seed_from_u64(13);
        let trees = GrammarBuilder::new(&problem.grammar)
            .build_population(&problem.root, BuildMethod::RampedHalfAndHalf, 3, 6, 20, &mut rng)
            .unwrap();
        for tree in trees {
            assert!(problem.grammar.accepts(&tree));
            assert!(problem.fitness.fitness(&tree).is_ok());
        }
    }
}
