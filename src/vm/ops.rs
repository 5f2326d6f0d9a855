//! Arithmetic, comparison and subscript semantics of agent values.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::bytecode::Comparison;

use super::value::{HashKey, Range, Value, MAX_NESTING};
use super::{ExcKind, Host, Unwind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl Arith {
    pub fn symbol(self) -> &'static str {
        match self {
            Arith::Add => "+",
            Arith::Sub => "-",
            Arith::Mul => "*",
            Arith::Div => "/",
            Arith::FloorDiv => "//",
            Arith::Mod => "%",
            Arith::Pow => "**",
        }
    }
}

fn overflow() -> Unwind {
    Unwind::raise(ExcKind::OverflowError, "integer overflow")
}

pub fn too_long() -> Unwind {
    Unwind::raise(ExcKind::MemoryError, "collection too large")
}

/// Elements (or string bytes) native code builds per unit of budget.
pub const ELEMENTS_PER_UNIT: usize = 8;

/// Charges the agent for `n` elements a native operation is about to build.
pub fn charge_growth(host: &mut dyn Host, n: usize) -> Result<(), Unwind> {
    let cost = n / ELEMENTS_PER_UNIT;
    if cost > 0 {
        host.charge(i64::try_from(cost).unwrap_or(i64::MAX))?;
    }
    Ok(())
}

/// Fails with `MemoryError` past the host's collection limit, then charges for `n` elements.
pub fn grow(host: &mut dyn Host, n: usize) -> Result<(), Unwind> {
    if n > host.max_collection_len() {
        return Err(too_long());
    }
    charge_growth(host, n)
}

/// `a <op> b`. Sequences built by `+` and `*` are bounded by the host's collection limit and
/// charged by length before they are built.
pub fn arith(host: &mut dyn Host, op: Arith, a: &Value, b: &Value) -> Result<Value, Unwind> {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return int_arith(op, x, y);
    }
    if let (Some(x), Some(y)) = (a.as_float(), b.as_float()) {
        return float_arith(op, x, y);
    }
    match (op, a, b) {
        (Arith::Add, Value::Str(x), Value::Str(y)) => {
            grow(host, x.len() + y.len())?;
            Ok(Value::str(&format!("{x}{y}")))
        }
        (Arith::Add, Value::List(x), Value::List(y)) => {
            let len = x.borrow().len() + y.borrow().len();
            grow(host, len)?;
            let mut items = Vec::with_capacity(len);
            items.extend(x.borrow().iter().cloned());
            items.extend(y.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        (Arith::Add, Value::Tuple(x), Value::Tuple(y)) => {
            grow(host, x.len() + y.len())?;
            Ok(Value::tuple(x.iter().chain(y.iter()).cloned().collect()))
        }
        (Arith::Mul, seq, Value::Int(n)) | (Arith::Mul, Value::Int(n), seq)
            if matches!(seq, Value::Str(_) | Value::List(_) | Value::Tuple(_)) =>
        {
            repeat(host, seq, *n)
        }
        _ => Err(Unwind::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn int_arith(op: Arith, x: i64, y: i64) -> Result<Value, Unwind> {
    let zero = || Unwind::raise(ExcKind::ZeroDivisionError, "integer division or modulo by zero");
    Ok(match op {
        Arith::Add => Value::Int(x.checked_add(y).ok_or_else(overflow)?),
        Arith::Sub => Value::Int(x.checked_sub(y).ok_or_else(overflow)?),
        Arith::Mul => Value::Int(x.checked_mul(y).ok_or_else(overflow)?),
        Arith::Div => {
            if y == 0 {
                return Err(Unwind::raise(ExcKind::ZeroDivisionError, "division by zero"));
            }
            Value::Float(x as f64 / y as f64)
        }
        Arith::FloorDiv => {
            if y == 0 {
                return Err(zero());
            }
            let q = x.checked_div(y).ok_or_else(overflow)?;
            if x % y != 0 && ((x < 0) != (y < 0)) {
                Value::Int(q - 1)
            } else {
                Value::Int(q)
            }
        }
        Arith::Mod => {
            if y == 0 {
                return Err(zero());
            }
            let r = x.wrapping_rem(y);
            if r != 0 && ((r < 0) != (y < 0)) {
                Value::Int(r + y)
            } else {
                Value::Int(r)
            }
        }
        Arith::Pow => {
            if y < 0 {
                if x == 0 {
                    return Err(Unwind::raise(
                        ExcKind::ZeroDivisionError,
                        "0.0 cannot be raised to a negative power",
                    ));
                }
                Value::Float((x as f64).powf(y as f64))
            } else {
                let exp = u32::try_from(y).map_err(|_| overflow())?;
                Value::Int(x.checked_pow(exp).ok_or_else(overflow)?)
            }
        }
    })
}

fn float_arith(op: Arith, x: f64, y: f64) -> Result<Value, Unwind> {
    let zero = || Unwind::raise(ExcKind::ZeroDivisionError, "float division by zero");
    Ok(Value::Float(match op {
        Arith::Add => x + y,
        Arith::Sub => x - y,
        Arith::Mul => x * y,
        Arith::Div if y == 0.0 => return Err(zero()),
        Arith::Div => x / y,
        Arith::FloorDiv if y == 0.0 => return Err(zero()),
        Arith::FloorDiv => (x / y).floor(),
        Arith::Mod if y == 0.0 => return Err(zero()),
        Arith::Mod => {
            let r = x % y;
            if r != 0.0 && ((r < 0.0) != (y < 0.0)) {
                r + y
            } else {
                r
            }
        }
        Arith::Pow => {
            let r = x.powf(y);
            if r.is_nan() && !x.is_nan() && !y.is_nan() {
                return Err(Unwind::value_error("math domain error"));
            }
            r
        }
    }))
}

fn repeat(host: &mut dyn Host, seq: &Value, n: i64) -> Result<Value, Unwind> {
    let n = usize::try_from(n).unwrap_or(0);
    let len = match seq {
        Value::Str(s) => s.len(),
        Value::List(l) => l.borrow().len(),
        Value::Tuple(t) => t.len(),
        _ => 0,
    };
    let total = len.saturating_mul(n);
    grow(host, total)?;
    Ok(match seq {
        Value::Str(s) => Value::str(&s.repeat(n)),
        Value::List(l) => Value::list(cycled(&l.borrow(), total)),
        Value::Tuple(t) => Value::tuple(cycled(t, total)),
        other => other.clone(),
    })
}

fn cycled(items: &[Value], total: usize) -> Vec<Value> {
    items.iter().cycle().take(total).cloned().collect()
}

pub fn negate(value: &Value) -> Result<Value, Unwind> {
    match value {
        Value::Float(f) => Ok(Value::Float(-f)),
        other => match other.as_int() {
            Some(i) => Ok(Value::Int(i.checked_neg().ok_or_else(overflow)?)),
            None => Err(Unwind::type_error(format!(
                "bad operand type for unary -: '{}'",
                value.type_name()
            ))),
        },
    }
}

pub fn positive(value: &Value) -> Result<Value, Unwind> {
    match value {
        Value::Float(_) | Value::Int(_) => Ok(value.clone()),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        _ => Err(Unwind::type_error(format!(
            "bad operand type for unary +: '{}'",
            value.type_name()
        ))),
    }
}

/// `a == b`
pub fn equal(a: &Value, b: &Value) -> Result<bool, Unwind> {
    equal_at(a, b, 0)
}

fn equal_at(a: &Value, b: &Value, depth: usize) -> Result<bool, Unwind> {
    if depth > MAX_NESTING {
        return Err(nesting());
    }
    let seq = |x: &[Value], y: &[Value]| -> Result<bool, Unwind> {
        if x.len() != y.len() {
            return Ok(false);
        }
        for (x, y) in x.iter().zip(y) {
            if !equal_at(x, y, depth + 1)? {
                return Ok(false);
            }
        }
        Ok(true)
    };
    Ok(match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Float(_), _) | (_, Value::Float(_)) => match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        (Value::Int(_) | Value::Bool(_), Value::Int(_) | Value::Bool(_)) => a.as_int() == b.as_int(),
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            Rc::ptr_eq(x, y) || seq(&x.borrow(), &y.borrow())?
        }
        (Value::Tuple(x), Value::Tuple(y)) => seq(x, y)?,
        (Value::Dict(x), Value::Dict(y)) => {
            if Rc::ptr_eq(x, y) {
                return Ok(true);
            }
            let (x, y) = (x.borrow(), y.borrow());
            if x.len() != y.len() {
                return Ok(false);
            }
            for (key, value) in &x.entries {
                let other = HashKey::of(key).and_then(|k| y.get(&k).cloned());
                match other {
                    Some(other) if equal_at(value, &other, depth + 1)? => {}
                    _ => return Ok(false),
                }
            }
            true
        }
        (Value::Range(x), Value::Range(y)) => {
            x.len() == y.len() && (x.len() == 0 || (x.start == y.start && (x.len() == 1 || x.step == y.step)))
        }
        _ => identical(a, b),
    })
}

/// `a is b`
pub fn identical(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
        (Value::Str(x), Value::Str(y)) => Rc::ptr_eq(x, y) || x == y,
        (Value::List(x), Value::List(y)) => Rc::ptr_eq(x, y),
        (Value::Tuple(x), Value::Tuple(y)) => Rc::ptr_eq(x, y),
        (Value::Dict(x), Value::Dict(y)) => Rc::ptr_eq(x, y),
        (Value::Iter(x), Value::Iter(y)) => Rc::ptr_eq(x, y),
        (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(x, y),
        (Value::Native(x), Value::Native(y)) => Rc::ptr_eq(x, y),
        (Value::Module(x), Value::Module(y)) => Rc::ptr_eq(x, y),
        (Value::Variant(x), Value::Variant(y)) => x == y,
        (Value::ExcClass(x), Value::ExcClass(y)) => x == y,
        (Value::Exception(x), Value::Exception(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

fn nesting() -> Unwind {
    Unwind::raise(ExcKind::RecursionError, "maximum recursion depth exceeded in comparison")
}

/// Ordering of `a` and `b`, `None` for unordered floats.
pub fn order(a: &Value, b: &Value) -> Result<Option<Ordering>, Unwind> {
    order_at(a, b, 0)
}

fn order_at(a: &Value, b: &Value, depth: usize) -> Result<Option<Ordering>, Unwind> {
    if depth > MAX_NESTING {
        return Err(nesting());
    }
    let seq = |x: &[Value], y: &[Value]| -> Result<Option<Ordering>, Unwind> {
        for (x, y) in x.iter().zip(y) {
            if !equal_at(x, y, depth + 1)? {
                return order_at(x, y, depth + 1);
            }
        }
        Ok(Some(x.len().cmp(&y.len())))
    };
    match (a, b) {
        (Value::Int(_) | Value::Bool(_), Value::Int(_) | Value::Bool(_)) => {
            Ok(Some(a.as_int().cmp(&b.as_int())))
        }
        (Value::Str(x), Value::Str(y)) => Ok(Some(x.cmp(y))),
        (Value::List(x), Value::List(y)) => {
            let (x, y) = (x.borrow().clone(), y.borrow().clone());
            seq(&x, &y)
        }
        (Value::Tuple(x), Value::Tuple(y)) => seq(x, y),
        _ => match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => Ok(x.partial_cmp(&y)),
            _ => Err(Unwind::type_error(format!(
                "'<' not supported between instances of '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ))),
        },
    }
}

/// `item in container`
pub fn contains(container: &Value, item: &Value) -> Result<bool, Unwind> {
    let any = |items: &[Value]| -> Result<bool, Unwind> {
        for candidate in items {
            if equal(candidate, item)? {
                return Ok(true);
            }
        }
        Ok(false)
    };
    match container {
        Value::List(l) => {
            let items = l.borrow().clone();
            any(&items)
        }
        Value::Tuple(t) => any(t),
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(&**needle)),
            other => Err(Unwind::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::Dict(d) => Ok(HashKey::of(item).is_some_and(|k| d.borrow().get(&k).is_some())),
        Value::Range(r) => Ok(match item.as_int() {
            Some(i) => range_index(r, i).is_some(),
            None => false,
        }),
        other => Err(Unwind::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn range_index(r: &Range, value: i64) -> Option<usize> {
    let offset = value.checked_sub(r.start)?;
    if offset % r.step != 0 {
        return None;
    }
    let index = offset / r.step;
    (index >= 0 && (index as usize) < r.len()).then_some(index as usize)
}

pub fn compare(op: Comparison, a: &Value, b: &Value) -> Result<Value, Unwind> {
    let ordered = |accept: fn(Ordering) -> bool| -> Result<Value, Unwind> {
        Ok(Value::Bool(order(a, b)?.is_some_and(accept)))
    };
    match op {
        Comparison::Eq => Ok(Value::Bool(equal(a, b)?)),
        Comparison::NotEq => Ok(Value::Bool(!equal(a, b)?)),
        Comparison::Lt => ordered(Ordering::is_lt),
        Comparison::LtE => ordered(Ordering::is_le),
        Comparison::Gt => ordered(Ordering::is_gt),
        Comparison::GtE => ordered(Ordering::is_ge),
        Comparison::In => Ok(Value::Bool(contains(b, a)?)),
        Comparison::NotIn => Ok(Value::Bool(!contains(b, a)?)),
        Comparison::Is => Ok(Value::Bool(identical(a, b))),
        Comparison::IsNot => Ok(Value::Bool(!identical(a, b))),
        Comparison::ExceptionMatch => Err(Unwind::type_error("invalid comparison")),
    }
}

/// Resolves a possibly negative index against `len`.
pub fn index(len: usize, key: &Value, what: &str) -> Result<usize, Unwind> {
    let Some(i) = key.as_int() else {
        return Err(Unwind::type_error(format!(
            "{what} indices must be integers, not {}",
            key.type_name()
        )));
    };
    let resolved = if i < 0 { i + len as i64 } else { i };
    if resolved < 0 || resolved >= len as i64 {
        return Err(Unwind::raise(
            ExcKind::IndexError,
            format!("{what} index out of range"),
        ));
    }
    Ok(resolved as usize)
}

/// Indices selected by `slice` on a sequence of length `len`.
pub fn slice_indices(len: usize, slice: &[Value; 3]) -> Result<Vec<usize>, Unwind> {
    let len = len as i64;
    let bound = |value: &Value| -> Result<Option<i64>, Unwind> {
        match value {
            Value::None => Ok(None),
            other => other.as_int().map(Some).ok_or_else(|| {
                Unwind::type_error("slice indices must be integers or None")
            }),
        }
    };
    let step = bound(&slice[2])?.unwrap_or(1);
    if step == 0 {
        return Err(Unwind::value_error("slice step cannot be zero"));
    }
    let clamp = |value: Option<i64>, default: i64| match value {
        None => default,
        Some(mut v) => {
            if v < 0 {
                v += len;
                if v < 0 {
                    v = if step < 0 { -1 } else { 0 };
                }
            } else if v >= len {
                v = if step < 0 { len - 1 } else { len };
            }
            v
        }
    };
    let (start, stop) = if step > 0 {
        (clamp(bound(&slice[0])?, 0), clamp(bound(&slice[1])?, len))
    } else {
        (clamp(bound(&slice[0])?, len - 1), clamp(bound(&slice[1])?, -1))
    };
    let mut indices = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        indices.push(i as usize);
        i += step;
    }
    Ok(indices)
}

/// `container[key]`
pub fn get_item(container: &Value, key: &Value) -> Result<Value, Unwind> {
    match (container, key) {
        (Value::List(l), Value::Slice(s)) => {
            let items = l.borrow();
            let picked = slice_indices(items.len(), s)?
                .into_iter()
                .map(|i| items[i].clone())
                .collect();
            Ok(Value::list(picked))
        }
        (Value::List(l), _) => {
            let items = l.borrow();
            Ok(items[index(items.len(), key, "list")?].clone())
        }
        (Value::Tuple(t), Value::Slice(s)) => Ok(Value::tuple(
            slice_indices(t.len(), s)?
                .into_iter()
                .map(|i| t[i].clone())
                .collect(),
        )),
        (Value::Tuple(t), _) => Ok(t[index(t.len(), key, "tuple")?].clone()),
        (Value::Str(s), Value::Slice(slice)) => {
            let chars: Vec<char> = s.chars().collect();
            let picked: String = slice_indices(chars.len(), slice)?
                .into_iter()
                .map(|i| chars[i])
                .collect();
            Ok(Value::str(&picked))
        }
        (Value::Str(s), _) => {
            let chars: Vec<char> = s.chars().collect();
            let c = chars[index(chars.len(), key, "string")?];
            Ok(Value::str(c.encode_utf8(&mut [0; 4])))
        }
        (Value::Range(r), _) => Ok(Value::Int(r.get(index(r.len(), key, "range object")?))),
        (Value::Dict(d), _) => {
            let hash = hash_key(key)?;
            d.borrow()
                .get(&hash)
                .cloned()
                .ok_or_else(|| Unwind::raise(ExcKind::KeyError, key.repr()))
        }
        _ => Err(Unwind::type_error(format!(
            "'{}' object is not subscriptable",
            container.type_name()
        ))),
    }
}

/// `container[key] = value`
pub fn set_item(container: &Value, key: &Value, value: Value, limit: usize) -> Result<(), Unwind> {
    match container {
        Value::List(l) => {
            let mut items = l.borrow_mut();
            let i = index(items.len(), key, "list assignment")?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(d) => {
            let hash = hash_key(key)?;
            let mut d = d.borrow_mut();
            if d.get(&hash).is_none() && d.len() >= limit {
                return Err(too_long());
            }
            d.insert(hash, key.clone(), value);
            Ok(())
        }
        _ => Err(Unwind::type_error(format!(
            "'{}' object does not support item assignment",
            container.type_name()
        ))),
    }
}

pub fn hash_key(key: &Value) -> Result<HashKey, Unwind> {
    HashKey::of(key)
        .ok_or_else(|| Unwind::type_error(format!("unhashable type: '{}'", key.type_name())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::testing::TestHost;

    fn int(v: &Value) -> i64 {
        v.as_int().unwrap()
    }

    fn host(limit: usize) -> TestHost {
        let mut host = TestHost::new(&[]);
        host.limit = limit;
        host
    }

    fn arith(op: Arith, a: &Value, b: &Value, limit: usize) -> Result<Value, Unwind> {
        super::arith(&mut host(limit), op, a, b)
    }

    #[test]
    fn integer_division_floors() {
        assert_eq!(int(&arith(Arith::FloorDiv, &Value::Int(-7), &Value::Int(2), 10).unwrap()), -4);
        assert_eq!(int(&arith(Arith::Mod, &Value::Int(-7), &Value::Int(2), 10).unwrap()), 1);
        assert_eq!(int(&arith(Arith::Mod, &Value::Int(7), &Value::Int(-2), 10).unwrap()), -1);
    }

    #[test]
    fn overflow_is_an_exception() {
        let err = arith(Arith::Mul, &Value::Int(i64::MAX), &Value::Int(2), 10).unwrap_err();
        assert!(matches!(err, Unwind::Raise(e) if e.kind == ExcKind::OverflowError));
    }

    #[test]
    fn repetition_respects_the_limit() {
        let s = Value::str("ab");
        assert_eq!(arith(Arith::Mul, &s, &Value::Int(3), 10).unwrap().to_text(), "ababab");
        let err = arith(Arith::Mul, &s, &Value::Int(6), 10).unwrap_err();
        assert!(matches!(err, Unwind::Raise(e) if e.kind == ExcKind::MemoryError));
    }

    #[test]
    fn lists_and_tuples_repeat() {
        let list = Value::list(vec![Value::Int(1), Value::str("x")]);
        assert_eq!(arith(Arith::Mul, &list, &Value::Int(3), 10).unwrap().repr(), "[1, 'x', 1, 'x', 1, 'x']");
        let tuple = Value::tuple(vec![Value::None]);
        assert_eq!(arith(Arith::Mul, &Value::Int(2), &tuple, 10).unwrap().repr(), "(None, None)");
        assert_eq!(arith(Arith::Mul, &list, &Value::Int(-1), 10).unwrap().repr(), "[]");
        if let Value::List(l) = &list {
            assert_eq!(l.borrow().len(), 2);
        }
    }

    #[test]
    fn building_collections_is_charged_by_length() {
        let mut h = host(100_000);
        let before = h.budget;
        let seq = Value::list(vec![Value::Int(0)]);
        let big = super::arith(&mut h, Arith::Mul, &seq, &Value::Int(80_000)).unwrap();
        assert_eq!(before - h.budget, (80_000 / ELEMENTS_PER_UNIT) as i64);

        let before = h.budget;
        super::arith(&mut h, Arith::Add, &big, &big).unwrap_err();
        assert_eq!(h.budget, before);
        super::arith(&mut h, Arith::Add, &big, &seq).unwrap();
        assert_eq!(before - h.budget, (80_001 / ELEMENTS_PER_UNIT) as i64);
    }

    #[test]
    fn mixed_numbers_compare() {
        assert!(equal(&Value::Int(1), &Value::Float(1.0)).unwrap());
        assert!(equal(&Value::Bool(true), &Value::Int(1)).unwrap());
        assert_eq!(order(&Value::Int(1), &Value::Float(1.5)).unwrap(), Some(Ordering::Less));
        assert!(order(&Value::Int(1), &Value::str("a")).is_err());
    }

    #[test]
    fn slices_follow_python_rules() {
        let s = |a: Value, b: Value, c: Value| [a, b, c];
        assert_eq!(slice_indices(5, &s(Value::None, Value::None, Value::None)).unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(slice_indices(5, &s(Value::Int(-2), Value::None, Value::None)).unwrap(), vec![3, 4]);
        assert_eq!(slice_indices(5, &s(Value::None, Value::None, Value::Int(-2))).unwrap(), vec![4, 2, 0]);
        assert_eq!(slice_indices(5, &s(Value::Int(1), Value::Int(100), Value::Int(2))).unwrap(), vec![1, 3]);
    }

    #[test]
    fn membership() {
        let r = Value::Range(Range { start: 0, stop: 10, step: 3 });
        assert!(contains(&r, &Value::Int(9)).unwrap());
        assert!(!contains(&r, &Value::Int(4)).unwrap());
        assert!(contains(&Value::str("pawn"), &Value::str("aw")).unwrap());
    }

    #[test]
    fn self_referencing_lists_do_not_recurse_forever() {
        let a = Value::list(vec![]);
        if let Value::List(l) = &a {
            l.borrow_mut().push(a.clone());
        }
        assert!(equal(&a, &a).unwrap());
        assert!(a.repr().contains("..."));
        if let Value::List(l) = &a {
            l.borrow_mut().clear();
        }
    }
}
