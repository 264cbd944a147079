use std::fmt;
use std::rc::Rc;

use crate::error::RuntimeError;
use crate::object::Obj;

/// A runtime value. Scalars are copied; composites are shared by reference
/// through `ObjRef`.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Obj(ObjRef),
}

#[derive(Clone, Debug)]
pub struct ObjRef(Rc<Obj>);

impl ObjRef {
    pub fn new(obj: Obj) -> Self {
        Self(Rc::new(obj))
    }

    pub fn as_obj(&self) -> &Obj {
        &self.0
    }

    pub fn ptr_eq(a: &ObjRef, b: &ObjRef) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }
}

impl From<ObjRef> for Value {
    fn from(obj: ObjRef) -> Self {
        Value::Obj(obj)
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Obj(obj) => match obj.as_obj() {
                Obj::String(s) => !s.is_empty(),
                _ => true,
            },
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Bool(_) => "Bool",
            Value::Obj(obj) => obj.as_obj().type_name(),
        }
    }

    pub fn as_int(&self) -> Result<i64, RuntimeError> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Float(f) => Ok(*f as i64),
            _ => Err(RuntimeError::new(&format!(
                "Expected Int, got {}",
                self.type_name()
            ))),
        }
    }

    pub fn as_float(&self) -> Result<f64, RuntimeError> {
        match self {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            _ => Err(RuntimeError::new(&format!(
                "Expected Float, got {}",
                self.type_name()
            ))),
        }
    }

    pub fn as_str(&self) -> Result<&str, RuntimeError> {
        if let Value::Obj(obj) = self {
            if let Obj::String(s) = obj.as_obj() {
                return Ok(s);
            }
        }
        Err(RuntimeError::new(&format!(
            "Expected String, got {}",
            self.type_name()
        )))
    }

    fn numeric(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        values_equal(self, other)
    }
}

/// Structural equality: null, booleans, cross-type numerics, string
/// contents, arrays element-wise; every other composite compares by
/// identity.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Obj(x), Value::Obj(y)) => match (x.as_obj(), y.as_obj()) {
            (Obj::String(s), Obj::String(t)) => s == t,
            (Obj::Array(s), Obj::Array(t)) => {
                if ObjRef::ptr_eq(x, y) {
                    return true;
                }
                let s = s.borrow();
                let t = t.borrow();
                s.len() == t.len() && s.iter().zip(t.iter()).all(|(a, b)| values_equal(a, b))
            }
            _ => ObjRef::ptr_eq(x, y),
        },
        _ => match (a.numeric(), b.numeric()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

// ---- arithmetic --------------------------------------------------------
//
// Int op Int stays Int; mixed numerics promote to Float. `+` with a string
// operand stringifies, `+` on two arrays concatenates, `*` repeats an array
// or string by an integer count. Division and modulo by zero are fatal.

pub fn add(a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        return Ok(Value::Int(x.wrapping_add(*y)));
    }
    if let (Some(x), Some(y)) = (a.numeric(), b.numeric()) {
        return Ok(Value::Float(x + y));
    }
    if is_string(a) || is_string(b) {
        return Ok(crate::object::string_value(&format!("{}{}", a, b)));
    }
    if let (Value::Obj(x), Value::Obj(y)) = (a, b) {
        if let (Obj::Array(x), Obj::Array(y)) = (x.as_obj(), y.as_obj()) {
            let mut joined = x.borrow().clone();
            joined.extend(y.borrow().iter().cloned());
            return Ok(crate::object::array_value(joined));
        }
    }
    Err(binary_type_error("+", a, b))
}

pub fn sub(a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    numeric_op(a, b, "-", i64::wrapping_sub, |x, y| x - y)
}

pub fn mul(a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    if let (Value::Obj(x), Value::Int(count)) = (a, b) {
        let count = (*count).max(0) as usize;
        match x.as_obj() {
            Obj::String(s) => {
                return Ok(crate::object::string_value(&s.repeat(count)));
            }
            Obj::Array(elements) => {
                let elements = elements.borrow();
                let mut repeated = Vec::with_capacity(elements.len() * count);
                for _ in 0..count {
                    repeated.extend(elements.iter().cloned());
                }
                return Ok(crate::object::array_value(repeated));
            }
            _ => {}
        }
    }
    numeric_op(a, b, "*", i64::wrapping_mul, |x, y| x * y)
}

pub fn div(a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        if *y == 0 {
            return Err(RuntimeError::new("Division by zero"));
        }
        return Ok(Value::Int(x.wrapping_div(*y)));
    }
    if let (Some(x), Some(y)) = (a.numeric(), b.numeric()) {
        if y == 0.0 {
            return Err(RuntimeError::new("Division by zero"));
        }
        return Ok(Value::Float(x / y));
    }
    Err(binary_type_error("/", a, b))
}

pub fn modulo(a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        if *y == 0 {
            return Err(RuntimeError::new("Modulo by zero"));
        }
        return Ok(Value::Int(x.wrapping_rem(*y)));
    }
    Err(binary_type_error("%", a, b))
}

pub fn negate(v: &Value) -> Result<Value, RuntimeError> {
    match v {
        Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
        Value::Float(f) => Ok(Value::Float(-f)),
        _ => Err(RuntimeError::new(&format!(
            "Unary '-' requires a numeric value, got {}",
            v.type_name()
        ))),
    }
}

pub fn bit_not(v: &Value) -> Result<Value, RuntimeError> {
    match v {
        Value::Int(i) => Ok(Value::Int(!i)),
        _ => Err(RuntimeError::new(&format!(
            "Unary '~' requires an Int, got {}",
            v.type_name()
        ))),
    }
}

pub fn bit_and(a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    int_op(a, b, "&", |x, y| x & y)
}

pub fn bit_or(a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    int_op(a, b, "|", |x, y| x | y)
}

pub fn bit_xor(a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    int_op(a, b, "^", |x, y| x ^ y)
}

pub fn shift_left(a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    shift_op(a, b, "<<", i64::wrapping_shl)
}

pub fn shift_right(a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    shift_op(a, b, ">>", i64::wrapping_shr)
}

/// `<`. The other comparisons derive from this and equality, matching the
/// runtime's ordering rules (numerics and strings).
pub fn less_than(a: &Value, b: &Value) -> Result<bool, RuntimeError> {
    if let (Some(x), Some(y)) = (a.numeric(), b.numeric()) {
        return Ok(x < y);
    }
    if let (Value::Obj(x), Value::Obj(y)) = (a, b) {
        if let (Obj::String(s), Obj::String(t)) = (x.as_obj(), y.as_obj()) {
            return Ok(s < t);
        }
    }
    Err(binary_type_error("<", a, b))
}

pub fn less_equal(a: &Value, b: &Value) -> Result<bool, RuntimeError> {
    Ok(less_than(a, b)? || values_equal(a, b))
}

pub fn greater_than(a: &Value, b: &Value) -> Result<bool, RuntimeError> {
    Ok(!less_equal(a, b)?)
}

pub fn greater_equal(a: &Value, b: &Value) -> Result<bool, RuntimeError> {
    Ok(!less_than(a, b)?)
}

fn numeric_op(
    a: &Value,
    b: &Value,
    op: &str,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, RuntimeError> {
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        return Ok(Value::Int(int_op(*x, *y)));
    }
    if let (Some(x), Some(y)) = (a.numeric(), b.numeric()) {
        return Ok(Value::Float(float_op(x, y)));
    }
    Err(binary_type_error(op, a, b))
}

fn int_op(a: &Value, b: &Value, op: &str, f: fn(i64, i64) -> i64) -> Result<Value, RuntimeError> {
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        return Ok(Value::Int(f(*x, *y)));
    }
    Err(binary_type_error(op, a, b))
}

fn shift_op(
    a: &Value,
    b: &Value,
    op: &str,
    f: fn(i64, u32) -> i64,
) -> Result<Value, RuntimeError> {
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        if !(0..64).contains(y) {
            return Err(RuntimeError::new("Shift amount out of range"));
        }
        return Ok(Value::Int(f(*x, *y as u32)));
    }
    Err(binary_type_error(op, a, b))
}

fn is_string(v: &Value) -> bool {
    matches!(v, Value::Obj(obj) if matches!(obj.as_obj(), Obj::String(_)))
}

fn binary_type_error(op: &str, a: &Value, b: &Value) -> RuntimeError {
    RuntimeError::new(&format!(
        "Unsupported types for '{}': {} and {}",
        op,
        a.type_name(),
        b.type_name()
    ))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Obj(obj) => obj.as_obj().fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{array_value, string_value};

    #[test]
    fn int_arithmetic_stays_int() {
        assert_eq!(add(&Value::Int(2), &Value::Int(3)).unwrap(), Value::Int(5));
        assert_eq!(div(&Value::Int(7), &Value::Int(2)).unwrap(), Value::Int(3));
        assert_eq!(
            modulo(&Value::Int(7), &Value::Int(3)).unwrap(),
            Value::Int(1)
        );
    }

    #[test]
    fn mixed_numerics_promote_to_float() {
        assert_eq!(
            add(&Value::Int(1), &Value::Float(0.5)).unwrap(),
            Value::Float(1.5)
        );
    }

    #[test]
    fn string_operand_stringifies_addition() {
        let v = add(&string_value("n="), &Value::Int(3)).unwrap();
        assert_eq!(v.as_str().unwrap(), "n=3");
    }

    #[test]
    fn array_addition_concatenates() {
        let a = array_value(vec![Value::Int(1)]);
        let b = array_value(vec![Value::Int(2), Value::Int(3)]);
        let joined = add(&a, &b).unwrap();
        assert_eq!(
            joined,
            array_value(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn repetition_by_int() {
        let v = mul(&string_value("ab"), &Value::Int(3)).unwrap();
        assert_eq!(v.as_str().unwrap(), "ababab");
        let a = mul(&array_value(vec![Value::Int(1)]), &Value::Int(2)).unwrap();
        assert_eq!(a, array_value(vec![Value::Int(1), Value::Int(1)]));
    }

    #[test]
    fn division_and_modulo_by_zero_error() {
        assert!(div(&Value::Int(1), &Value::Int(0)).is_err());
        assert!(div(&Value::Float(1.0), &Value::Int(0)).is_err());
        assert!(modulo(&Value::Int(1), &Value::Int(0)).is_err());
    }

    #[test]
    fn modulo_requires_ints() {
        assert!(modulo(&Value::Float(1.0), &Value::Int(2)).is_err());
    }

    #[test]
    fn cross_type_numeric_equality() {
        assert!(values_equal(&Value::Int(1), &Value::Float(1.0)));
        assert!(!values_equal(&Value::Int(1), &Value::Bool(true)));
    }

    #[test]
    fn truthiness_follows_the_value_model() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(!string_value("").is_truthy());
        assert!(string_value("x").is_truthy());
    }

    #[test]
    fn bitwise_requires_ints() {
        assert!(bit_and(&Value::Float(1.0), &Value::Int(1)).is_err());
        assert_eq!(
            shift_left(&Value::Int(1), &Value::Int(4)).unwrap(),
            Value::Int(16)
        );
        assert!(shift_left(&Value::Int(1), &Value::Int(-1)).is_err());
    }
}
