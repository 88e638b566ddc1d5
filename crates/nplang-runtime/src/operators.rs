//! Binary, comparison, and equality operators.
//!
//! Arithmetic only accepts numbers; `+` additionally accepts a pair of
//! strings, concatenating them into a freshly interned string. Equality
//! is defined over every value kind and never raises a type error.

use crate::error::RuntimeError;
use crate::object::{Heap, Obj};
use crate::value::Value;

pub fn add(heap: &mut Heap, left: Value, right: Value) -> Result<Value, RuntimeError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
        (Value::Obj(a), Value::Obj(b)) => match (heap.get(a), heap.get(b)) {
            (Obj::String(sa), Obj::String(sb)) => {
                let concatenated = format!("{}{}", sa.chars, sb.chars);
                Ok(Value::Obj(heap.intern_string(&concatenated)))
            }
            _ => Err(type_error("number or string", left, right)),
        },
        _ => Err(type_error("number or string", left, right)),
    }
}

pub fn subtract(left: Value, right: Value) -> Result<Value, RuntimeError> {
    numeric(left, right, |a, b| a - b)
}

pub fn multiply(left: Value, right: Value) -> Result<Value, RuntimeError> {
    numeric(left, right, |a, b| a * b)
}

pub fn divide(left: Value, right: Value) -> Result<Value, RuntimeError> {
    numeric(left, right, |a, b| a / b)
}

pub fn negate(value: Value) -> Result<Value, RuntimeError> {
    Ok(Value::Number(-expect_number(value)?))
}

pub fn greater(left: Value, right: Value) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(expect_number(left)? > expect_number(right)?))
}

pub fn less(left: Value, right: Value) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(expect_number(left)? < expect_number(right)?))
}

/// Structural equality by value for scalars, identity for heap objects
/// (two distinct instances are never equal even with identical fields).
#[must_use]
pub fn values_equal(left: Value, right: Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Boolean(a), Value::Boolean(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Obj(a), Value::Obj(b)) => a == b,
        _ => false,
    }
}

fn numeric(left: Value, right: Value, f: impl Fn(f64, f64) -> f64) -> Result<Value, RuntimeError> {
    Ok(Value::Number(f(expect_number(left)?, expect_number(right)?)))
}

fn expect_number(value: Value) -> Result<f64, RuntimeError> {
    value.as_number().ok_or(RuntimeError::TypeMismatch { expected: "number", got: value.type_name() })
}

fn type_error(expected: &'static str, left: Value, right: Value) -> RuntimeError {
    let got = if left.is_number() { right.type_name() } else { left.type_name() };
    RuntimeError::TypeMismatch { expected, got }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_numbers() {
        assert_eq!(add(&mut Heap::new(), Value::Number(1.0), Value::Number(2.0)).unwrap(), Value::Number(3.0));
    }

    #[test]
    fn concatenates_strings() {
        let mut heap = Heap::new();
        let a = Value::Obj(heap.intern_string("foo"));
        let b = Value::Obj(heap.intern_string("bar"));
        let result = add(&mut heap, a, b).unwrap();
        let Value::Obj(r) = result else { panic!("expected string result") };
        assert_eq!(heap.string_contents(r), "foobar");
    }

    #[test]
    fn division_by_zero_yields_infinity() {
        assert_eq!(divide(Value::Number(1.0), Value::Number(0.0)).unwrap(), Value::Number(f64::INFINITY));
    }

    #[test]
    fn equality_is_identity_for_objects() {
        let mut heap = Heap::new();
        let class_name = heap.intern_string("C");
        let a = heap.alloc_instance(class_name);
        let b = heap.alloc_instance(class_name);
        assert!(!values_equal(Value::Obj(a), Value::Obj(b)));
        assert!(values_equal(Value::Obj(a), Value::Obj(a)));
    }
}
