use super::{EvalContext, EvalError, Value};
use crate::tree::{NodeKind, Tree};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum nesting of ADF calls inside one evaluation.
pub const MAX_ADF_DEPTH: usize = 64;

/// A Koza ADF reduced to data: its name, its parameter names in call order,
/// and the body evaluated with those parameters bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdfDefinition {
    pub name: String,
    pub parameters: Vec<String>,
    pub body: Tree,
}

impl AdfDefinition {
    /// Reads the ADF name from the defining node and picks its parameters out of
    /// `terminal_names`.
    pub fn from_subtree<'t>(
        subtree: &Tree,
        terminal_names: impl IntoIterator<Item = &'t str>,
    ) -> Result<Self, EvalError> {
        let head = subtree.node();
        if head.kind != NodeKind::KozaAdfDefining {
            return Err(EvalError::MalformedAdf(format!(
                "expected an ADF-defining node, found {}",
                head
            )));
        }
        let body = match subtree.children() {
            [body] => body.clone(),
            children => {
                return Err(EvalError::MalformedAdf(format!(
                    "`{}` must have exactly one body, found {}",
                    head.name,
                    children.len()
                )))
            }
        };
        Ok(AdfDefinition {
            name: head.name.clone(),
            parameters: parameters_for(&head.name, terminal_names),
            body,
        })
    }

    /// Function-table key under which calls reach this ADF.
    pub fn call_name(&self) -> String {
        format!("_{}", self.name)
    }
}

/// Keys of the form `<adf_name>_PARAM<k>`, sorted by the numeric `k` so that
/// `PARAM10` follows `PARAM9`. Keys whose suffix is not a number are ignored.
pub fn parameters_for<'t>(
    adf_name: &str,
    terminal_names: impl IntoIterator<Item = &'t str>,
) -> Vec<String> {
    let prefix = format!("{adf_name}_PARAM");
    let mut indexed: Vec<(usize, String)> = terminal_names
        .into_iter()
        .filter_map(|name| {
            let k = name.strip_prefix(&prefix)?.parse::<usize>().ok()?;
            Some((k, name.to_string()))
        })
        .collect();
    indexed.sort_by_key(|(k, _)| *k);
    indexed.into_iter().map(|(_, name)| name).collect()
}

/// Calls an ADF: binds `inputs` to its parameters in a nested context and
/// evaluates the body there.
pub fn evaluate_adf(
    definition: &AdfDefinition,
    inputs: Vec<Value>,
    context: &EvalContext<'_>,
) -> Result<Value, EvalError> {
    if inputs.len() != definition.parameters.len() {
        return Err(EvalError::ArityMismatch {
            name: definition.call_name(),
            expected: definition.parameters.len(),
            got: inputs.len(),
        });
    }
    if context.depth() >= MAX_ADF_DEPTH {
        return Err(EvalError::RecursionLimit(MAX_ADF_DEPTH));
    }
    let bindings: HashMap<String, Value> = definition
        .parameters
        .iter()
        .cloned()
        .zip(inputs)
        .collect();
    context.nested(bindings).evaluate(&definition.body)
}
