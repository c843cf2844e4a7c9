//! Operator semantics for the interpreter.
//!
//! Numeric rules: `i32` arithmetic wraps on overflow; any `f32` operand
//! promotes the operation to `f32`. `ADD` additionally handles strings: if
//! either side is a string the result is the concatenation of both sides'
//! display forms, allocated (interned) on the heap. Division and modulo by
//! zero are runtime errors, catchable by an enclosing `try`.

use crate::{heap::ValuePool, value::Value};

/// Failure modes of an operator: a catchable runtime error message, or heap
/// exhaustion (fatal for the current `execute` call).
#[derive(Debug)]
pub(crate) enum OpError {
    Runtime(String),
    OutOfMemory,
}

pub(crate) type OpResult = Result<Value, OpError>;

/// Comparison selector for [`compare`].
#[derive(Debug, Clone, Copy)]
pub(crate) enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

fn as_f32(value: Value) -> Option<f32> {
    match value {
        Value::I32(i) => Some(i as f32),
        Value::F32(f) => Some(f),
        _ => None,
    }
}

fn type_mismatch(op: &str, a: Value, b: Value) -> OpError {
    OpError::Runtime(format!("Type mismatch in {op}: {} and {}", a.type_name(), b.type_name()))
}

pub(crate) fn add(pool: &mut ValuePool, a: Value, b: Value) -> OpResult {
    if matches!(a, Value::Str(_)) || matches!(b, Value::Str(_)) {
        return str_concat(pool, a, b);
    }
    match (a, b) {
        (Value::I32(x), Value::I32(y)) => Ok(Value::I32(x.wrapping_add(y))),
        _ => match (as_f32(a), as_f32(b)) {
            (Some(x), Some(y)) => Ok(Value::F32(x + y)),
            _ => Err(type_mismatch("ADD", a, b)),
        },
    }
}

pub(crate) fn subtract(a: Value, b: Value) -> OpResult {
    match (a, b) {
        (Value::I32(x), Value::I32(y)) => Ok(Value::I32(x.wrapping_sub(y))),
        _ => match (as_f32(a), as_f32(b)) {
            (Some(x), Some(y)) => Ok(Value::F32(x - y)),
            _ => Err(type_mismatch("SUB", a, b)),
        },
    }
}

pub(crate) fn multiply(a: Value, b: Value) -> OpResult {
    match (a, b) {
        (Value::I32(x), Value::I32(y)) => Ok(Value::I32(x.wrapping_mul(y))),
        _ => match (as_f32(a), as_f32(b)) {
            (Some(x), Some(y)) => Ok(Value::F32(x * y)),
            _ => Err(type_mismatch("MUL", a, b)),
        },
    }
}

pub(crate) fn divide(a: Value, b: Value) -> OpResult {
    match (a, b) {
        (Value::I32(x), Value::I32(y)) => {
            if y == 0 {
                return Err(OpError::Runtime("Division by zero".to_owned()));
            }
            // wrapping_div: i32::MIN / -1 wraps instead of trapping
            Ok(Value::I32(x.wrapping_div(y)))
        }
        _ => match (as_f32(a), as_f32(b)) {
            (Some(x), Some(y)) => {
                if y == 0.0 {
                    return Err(OpError::Runtime("Division by zero".to_owned()));
                }
                Ok(Value::F32(x / y))
            }
            _ => Err(type_mismatch("DIV", a, b)),
        },
    }
}

pub(crate) fn modulo(a: Value, b: Value) -> OpResult {
    match (a, b) {
        (Value::I32(x), Value::I32(y)) => {
            if y == 0 {
                return Err(OpError::Runtime("Division by zero".to_owned()));
            }
            Ok(Value::I32(x.wrapping_rem(y)))
        }
        _ => Err(type_mismatch("MOD", a, b)),
    }
}

pub(crate) fn negate(value: Value) -> OpResult {
    match value {
        Value::I32(i) => Ok(Value::I32(i.wrapping_neg())),
        Value::F32(f) => Ok(Value::F32(-f)),
        _ => Err(OpError::Runtime(format!("Type mismatch in NEG: {}", value.type_name()))),
    }
}

/// Coerces both sides to strings and allocates the interned concatenation.
pub(crate) fn str_concat(pool: &mut ValuePool, a: Value, b: Value) -> OpResult {
    let mut combined = a.to_display(pool);
    combined.push_str(&b.to_display(pool));
    pool.allocate_string(&combined).ok_or(OpError::OutOfMemory)
}

/// Ordered comparison; numeric only, with `f32` promotion when either side
/// is a float.
pub(crate) fn compare(op: CmpOp, a: Value, b: Value) -> OpResult {
    let result = match (a, b) {
        (Value::I32(x), Value::I32(y)) => match op {
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
            CmpOp::Gt => x > y,
            CmpOp::Ge => x >= y,
        },
        _ => match (as_f32(a), as_f32(b)) {
            (Some(x), Some(y)) => match op {
                CmpOp::Lt => x < y,
                CmpOp::Le => x <= y,
                CmpOp::Gt => x > y,
                CmpOp::Ge => x >= y,
            },
            _ => return Err(type_mismatch("comparison", a, b)),
        },
    };
    Ok(Value::Bool(result))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn pool() -> ValuePool {
        ValuePool::new(4096)
    }

    #[test]
    fn test_int_add_wraps() {
        let mut pool = pool();
        let result = add(&mut pool, Value::I32(i32::MAX), Value::I32(1)).expect("add");
        assert_eq!(result, Value::I32(i32::MIN));
    }

    #[test]
    fn test_float_promotion() {
        let mut pool = pool();
        let result = add(&mut pool, Value::I32(1), Value::F32(0.5)).expect("add");
        assert_eq!(result, Value::F32(1.5));
        let result = compare(CmpOp::Lt, Value::I32(1), Value::F32(1.5)).expect("cmp");
        assert_eq!(result, Value::Bool(true));
    }

    #[test]
    fn test_string_add_concatenates() {
        let mut pool = pool();
        let s = pool.allocate_string("n=").expect("alloc");
        let result = add(&mut pool, s, Value::I32(3)).expect("add");
        let Value::Str(id) = result else { panic!("expected string") };
        assert_eq!(pool.string(id), "n=3");
    }

    #[test]
    fn test_division_by_zero() {
        let err = divide(Value::I32(1), Value::I32(0)).unwrap_err();
        assert!(matches!(err, OpError::Runtime(msg) if msg == "Division by zero"));
        let err = divide(Value::F32(1.0), Value::F32(0.0)).unwrap_err();
        assert!(matches!(err, OpError::Runtime(msg) if msg == "Division by zero"));
        let err = modulo(Value::I32(1), Value::I32(0)).unwrap_err();
        assert!(matches!(err, OpError::Runtime(msg) if msg == "Division by zero"));
    }

    #[test]
    fn test_int_division_truncates() {
        assert_eq!(divide(Value::I32(7), Value::I32(2)).expect("div"), Value::I32(3));
        assert_eq!(divide(Value::I32(-7), Value::I32(2)).expect("div"), Value::I32(-3));
    }

    #[test]
    fn test_min_div_negative_one_wraps() {
        assert_eq!(
            divide(Value::I32(i32::MIN), Value::I32(-1)).expect("div"),
            Value::I32(i32::MIN)
        );
    }

    #[test]
    fn test_modulo_is_integer_only() {
        let err = modulo(Value::F32(1.0), Value::F32(2.0)).unwrap_err();
        assert!(matches!(err, OpError::Runtime(_)));
    }

    #[test]
    fn test_non_numeric_rejected() {
        let mut pool = pool();
        assert!(add(&mut pool, Value::Bool(true), Value::I32(1)).is_err());
        assert!(subtract(Value::Null, Value::I32(1)).is_err());
        assert!(negate(Value::Bool(true)).is_err());
    }
}
