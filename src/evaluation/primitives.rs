//! A small element-wise kernel: enough arithmetic for the built-in problems
//! and for tests. Scalars broadcast against lists; lists zip pairwise.

use super::{EvalError, TreeEvaluator, Value};

fn zip_with(a: &Value, b: &Value, op: fn(f64, f64) -> f64) -> Result<Value, EvalError> {
    match (a, b) {
        (Value::Scalar(x), Value::Scalar(y)) => Ok(Value::Scalar(op(*x, *y))),
        (Value::Scalar(_), Value::List(ys)) => ys
            .iter()
            .map(|y| zip_with(a, y, op))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        (Value::List(xs), Value::Scalar(_)) => xs
            .iter()
            .map(|x| zip_with(x, b, op))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        (Value::List(xs), Value::List(ys)) => {
            if xs.len() != ys.len() {
                return Err(EvalError::WrongValues(format!(
                    "length {} against length {}",
                    xs.len(),
                    ys.len()
                )));
            }
            xs.iter()
                .zip(ys)
                .map(|(x, y)| zip_with(x, y, op))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List)
        }
    }
}

fn map_with(a: &Value, op: fn(f64) -> f64) -> Value {
    match a {
        Value::Scalar(x) => Value::Scalar(op(*x)),
        Value::List(xs) => Value::List(xs.iter().map(|x| map_with(x, op)).collect()),
    }
}

fn binary(inputs: &[Value], op: fn(f64, f64) -> f64) -> Result<Value, EvalError> {
    match inputs {
        [a, b] => zip_with(a, b, op),
        _ => Err(EvalError::WrongValues(format!(
            "expected 2 inputs, got {}",
            inputs.len()
        ))),
    }
}

fn unary(inputs: &[Value], op: fn(f64) -> f64) -> Result<Value, EvalError> {
    match inputs {
        [a] => Ok(map_with(a, op)),
        _ => Err(EvalError::WrongValues(format!(
            "expected 1 input, got {}",
            inputs.len()
        ))),
    }
}

pub fn add(inputs: &[Value]) -> Result<Value, EvalError> {
    binary(inputs, |x, y| x + y)
}

pub fn sub(inputs: &[Value]) -> Result<Value, EvalError> {
    binary(inputs, |x, y| x - y)
}

pub fn mul(inputs: &[Value]) -> Result<Value, EvalError> {
    binary(inputs, |x, y| x * y)
}

/// Protected division: dividing by (near) zero yields 1.
pub fn div(inputs: &[Value]) -> Result<Value, EvalError> {
    binary(inputs, |x, y| if y.abs() < 1e-12 { 1.0 } else { x / y })
}

pub fn neg(inputs: &[Value]) -> Result<Value, EvalError> {
    unary(inputs, |x| -x)
}

pub fn square(inputs: &[Value]) -> Result<Value, EvalError> {
    unary(inputs, |x| x * x)
}

pub fn cos(inputs: &[Value]) -> Result<Value, EvalError> {
    unary(inputs, f64::cos)
}

pub fn sin(inputs: &[Value]) -> Result<Value, EvalError> {
    unary(inputs, f64::sin)
}

/// One input passes through; several are gathered into a list.
pub fn identity(inputs: &[Value]) -> Result<Value, EvalError> {
    match inputs {
        [single] => Ok(single.clone()),
        many => Ok(Value::List(many.to_vec())),
    }
}

/// Merges equally long lists into one list of tuples:
/// `[a0, a1], [b0, b1]` becomes `[[a0, b0], [a1, b1]]`.
pub fn zip_outputs(inputs: &[Value]) -> Result<Value, EvalError> {
    let lists = inputs
        .iter()
        .map(|v| {
            v.as_list()
                .ok_or_else(|| EvalError::WrongValues("zip expects list inputs".into()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let Some(len) = lists.first().map(|l| l.len()) else {
        return Ok(Value::List(Vec::new()));
    };
    if lists.iter().any(|l| l.len() != len) {
        return Err(EvalError::WrongValues("zip expects equal lengths".into()));
    }
    Ok(Value::List(
        (0..len)
            .map(|i| Value::List(lists.iter().map(|l| l[i].clone()).collect()))
            .collect(),
    ))
}

/// Binds `+ - * / neg ^2 cos sin` on an evaluator.
pub fn install_arithmetic(evaluator: &mut TreeEvaluator) {
    evaluator.set_function("+", add);
    evaluator.set_function("-", sub);
    evaluator.set_function("*", mul);
    evaluator.set_function("/", div);
    evaluator.set_function("neg", neg);
    evaluator.set_function("^2", square);
    evaluator.set_function("cos", cos);
    evaluator.set_function("sin", sin);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_and_zip() {
        let xs = Value::from(vec![1.0, 2.0]);
        assert_eq!(
            add(&[xs.clone(), Value::Scalar(1.0)]).unwrap(),
            Value::from(vec![2.0, 3.0])
        );
        assert_eq!(
            mul(&[xs.clone(), xs.clone()]).unwrap(),
            Value::from(vec![1.0, 4.0])
        );
        assert!(add(&[xs, Value::from(vec![1.0])]).is_err());
    }

    #[test]
    fn test_protected_division() {
        assert_eq!(
            div(&[Value::Scalar(3.0), Value::Scalar(0.0)]).unwrap(),
            Value::Scalar(1.0)
        );
    }

    #[test]
    fn test_zip_outputs_pairs_entries() {
        let merged = zip_outputs(&[Value::from(vec![4.0, 6.0]), Value::from(vec![3.0, 8.0])]).unwrap();
        assert_eq!(
            merged,
            Value::List(vec![
                Value::from(vec![4.0, 3.0]),
                Value::from(vec![6.0, 8.0])
            ])
        );
    }
}
