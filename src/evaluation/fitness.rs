use super::{EvalError, TreeEvaluator, Value};
use crate::tree::Tree;

/// Scores a tree; lower is better.
pub trait FitnessFunction: Send + Sync {
    fn fitness(&self, tree: &Tree) -> Result<f64, EvalError>;
}

impl<F> FitnessFunction for F
where
    F: Fn(&Tree) -> Result<f64, EvalError> + Send + Sync,
{
    fn fitness(&self, tree: &Tree) -> Result<f64, EvalError> {
        self(tree)
    }
}

/// Sum of absolute differences between what a tree computes and the ideal
/// outputs, compared scalar by scalar after flattening.
pub struct TargetError {
    evaluator: TreeEvaluator,
    targets: Value,
    with_adf: bool,
}

impl TargetError {
    pub fn new(evaluator: TreeEvaluator, targets: impl Into<Value>) -> Self {
        TargetError {
            evaluator,
            targets: targets.into(),
            with_adf: false,
        }
    }

    /// Evaluate through `eval_with_adf` (trees carrying Koza ADFs).
    pub fn with_adf(mut self) -> Self {
        self.with_adf = true;
        self
    }

    pub fn evaluator(&self) -> &TreeEvaluator {
        &self.evaluator
    }
}

impl FitnessFunction for TargetError {
    fn fitness(&self, tree: &Tree) -> Result<f64, EvalError> {
        let output = if self.with_adf {
            self.evaluator.eval_with_adf(tree)?
        } else {
            self.evaluator.evaluate(tree)?
        };
        let computed = output.flatten();
        let ideal = self.targets.flatten();
        if computed.len() != ideal.len() {
            return Err(EvalError::WrongValues(format!(
                "tree produced {} outputs, expected {}",
                computed.len(),
                ideal.len()
            )));
        }
        Ok(computed
            .iter()
            .zip(&ideal)
            .map(|(c, i)| (c - i).abs())
            .sum())
    }
}
