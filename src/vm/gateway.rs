//! Capability gateway: the checks standing between agent code and every object it touches.
//!
//! Attribute reads, item reads and writes, in-place operators, iteration and unpacking all go
//! through here. Anything outside these allowances fails with a confinement error, which agent
//! code cannot catch.

use std::cell::RefCell;
use std::rc::Rc;

use super::ops::{self, Arith};
use super::value::{IterState, Method, Range, Value};
use super::{ExcKind, Host, Unwind};

pub const LIST_METHODS: &[&str] = &[
    "append", "clear", "copy", "count", "extend", "index", "insert", "pop", "remove", "reverse",
    "sort",
];
pub const DICT_METHODS: &[&str] = &[
    "clear", "copy", "get", "items", "keys", "pop", "setdefault", "update", "values",
];
pub const STR_METHODS: &[&str] = &[
    "count", "endswith", "find", "format", "isdigit", "join", "lower", "replace", "split",
    "startswith", "strip", "upper",
];
pub const VARIANT_METHODS: &[&str] = &["opponent"];

/// Rejects names reserved for the host.
pub fn check_name(name: &str) -> Result<(), Unwind> {
    if name.starts_with('_') {
        return Err(Unwind::confine(format!(
            "\"{name}\" is an invalid attribute name because it starts with \"_\""
        )));
    }
    Ok(())
}

fn method(receiver: &Value, name: &str, table: &[&'static str]) -> Option<Value> {
    table.iter().find(|m| **m == name).map(|m| {
        Value::Method(Rc::new(Method {
            receiver: receiver.clone(),
            name: *m,
        }))
    })
}

fn no_attribute(obj: &Value, name: &str) -> Unwind {
    Unwind::raise(
        ExcKind::AttributeError,
        format!("'{}' object has no attribute '{name}'", obj.type_name()),
    )
}

/// `obj.name`
pub fn get_attr(obj: &Value, name: &str) -> Result<Value, Unwind> {
    check_name(name)?;
    let found = match obj {
        Value::Module(module) => {
            return module.get(name).ok_or_else(|| {
                Unwind::raise(
                    ExcKind::AttributeError,
                    format!("module '{}' has no attribute '{name}'", module.name),
                )
            })
        }
        Value::List(_) => method(obj, name, LIST_METHODS),
        Value::Dict(_) => method(obj, name, DICT_METHODS),
        Value::Str(_) => method(obj, name, STR_METHODS),
        Value::Variant(v) => match name {
            "name" => Some(Value::str(v.name)),
            "value" => Some(Value::Int(v.value as i64)),
            _ if v.family == "Team" => method(obj, name, VARIANT_METHODS),
            _ => None,
        },
        Value::Exception(e) if name == "args" => Some(Value::tuple(vec![Value::str(&e.message)])),
        _ => None,
    };
    found.ok_or_else(|| no_attribute(obj, name))
}

/// `obj.name = value`
pub fn set_attr(obj: &Value, name: &str, _value: Value) -> Result<(), Unwind> {
    check_name(name)?;
    write(obj)?;
    Err(no_attribute(obj, name))
}

/// Guard for every mutation of `target`.
pub fn write(target: &Value) -> Result<(), Unwind> {
    if target.is_module_or_callable() {
        return Err(Unwind::confine(format!(
            "Cannot write to {}",
            target.type_name()
        )));
    }
    Ok(())
}

/// `container[key]`
pub fn get_item(host: &mut dyn Host, container: &Value, key: &Value) -> Result<Value, Unwind> {
    if let (Value::Module(_), Value::Str(key)) = (container, key) {
        check_name(key)?;
    }
    if container.is_module_or_callable() {
        return Err(Unwind::confine(format!(
            "Cannot subscript {}",
            container.type_name()
        )));
    }
    if let Value::Slice(_) = key {
        ops::charge_growth(host, length(container).unwrap_or(0))?;
    }
    ops::get_item(container, key)
}

/// Number of items a materialized `value` would hold, when known without walking it.
fn length(value: &Value) -> Option<usize> {
    match value {
        Value::List(l) => Some(l.borrow().len()),
        Value::Tuple(t) => Some(t.len()),
        Value::Str(s) => Some(s.len()),
        Value::Dict(d) => Some(d.borrow().len()),
        Value::Range(r) => Some(r.len()),
        _ => None,
    }
}

/// `container[key] = value`
pub fn set_item(container: &Value, key: &Value, value: Value, limit: usize) -> Result<(), Unwind> {
    write(container)?;
    ops::set_item(container, key, value, limit)
}

/// `a <op>= b`. Only `+=`, `-=`, `*=` and `/=` are allowed.
pub fn inplace(host: &mut dyn Host, op: Arith, a: &Value, b: &Value) -> Result<Value, Unwind> {
    if !matches!(op, Arith::Add | Arith::Sub | Arith::Mul | Arith::Div) {
        return Err(Unwind::confine(format!(
            "Operator {}= is not allowed",
            op.symbol()
        )));
    }
    match (op, a) {
        (Arith::Add, Value::List(list)) => {
            let extra = materialize(host, b)?;
            let mut items = list.borrow_mut();
            if items.len() + extra.len() > host.max_collection_len() {
                return Err(ops::too_long());
            }
            items.extend(extra);
            drop(items);
            Ok(a.clone())
        }
        (Arith::Mul, Value::List(list)) => {
            let repeated = ops::arith(host, op, a, b)?;
            if let Value::List(repeated) = repeated {
                let repeated = repeated.borrow().clone();
                *list.borrow_mut() = repeated;
            }
            Ok(a.clone())
        }
        _ => ops::arith(host, op, a, b),
    }
}

/// `iter(value)`
pub fn iterate(host: &mut dyn Host, value: &Value) -> Result<Value, Unwind> {
    let state = match value {
        Value::Iter(_) => return Ok(value.clone()),
        Value::List(list) => IterState::List {
            list: list.clone(),
            index: 0,
        },
        Value::Range(range) => IterState::Range {
            range: *range,
            index: 0,
        },
        Value::Tuple(items) => IterState::Items {
            items: items.clone(),
            index: 0,
        },
        Value::Str(_) | Value::Dict(_) => IterState::Items {
            items: {
                ops::charge_growth(host, length(value).unwrap_or(0))?;
                Rc::new(items_of(value, usize::MAX)?)
            },
            index: 0,
        },
        other => {
            return Err(Unwind::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            )))
        }
    };
    Ok(Value::Iter(Rc::new(RefCell::new(state))))
}

/// Items of an iterable, collected without running agent code and charged by count. Fails
/// with `MemoryError` past the host's collection limit.
pub fn materialize(host: &mut dyn Host, value: &Value) -> Result<Vec<Value>, Unwind> {
    let limit = host.max_collection_len();
    match length(value) {
        Some(n) => {
            if n > limit && !matches!(value, Value::Str(_)) {
                return Err(ops::too_long());
            }
            ops::charge_growth(host, n)?;
            items_of(value, limit)
        }
        None => {
            let items = items_of(value, limit)?;
            ops::charge_growth(host, items.len())?;
            Ok(items)
        }
    }
}

fn items_of(value: &Value, limit: usize) -> Result<Vec<Value>, Unwind> {
    if let Some(n) = length(value) {
        if n > limit && !matches!(value, Value::Str(_)) {
            return Err(ops::too_long());
        }
    }
    let items: Vec<Value> = match value {
        Value::List(list) => list.borrow().clone(),
        Value::Tuple(items) => items.to_vec(),
        Value::Str(s) => s
            .chars()
            .map(|c| Value::str(c.encode_utf8(&mut [0; 4])))
            .collect(),
        Value::Dict(d) => d.borrow().entries.iter().map(|(k, _)| k.clone()).collect(),
        Value::Range(r) => range_items(r),
        Value::Iter(state) => {
            let mut state = state.borrow_mut();
            std::iter::from_fn(|| state.next_value())
                .take(limit.saturating_add(1))
                .collect()
        }
        other => {
            return Err(Unwind::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            )))
        }
    };
    if items.len() > limit {
        return Err(ops::too_long());
    }
    Ok(items)
}

fn range_items(r: &Range) -> Vec<Value> {
    (0..r.len()).map(|i| Value::Int(r.get(i))).collect()
}

/// `a, b, c = value`. Only materialized sequences can be unpacked.
pub fn unpack(value: &Value, n: usize) -> Result<Vec<Value>, Unwind> {
    let too_many = || Unwind::value_error(format!("too many values to unpack (expected {n})"));
    let items = match value {
        Value::List(_) | Value::Tuple(_) | Value::Str(_) | Value::Dict(_) | Value::Range(_) => {
            items_of(value, n).map_err(|_| too_many())?
        }
        other => {
            return Err(Unwind::type_error(format!(
                "cannot unpack non-sequence {}",
                other.type_name()
            )))
        }
    };
    if items.len() < n {
        return Err(Unwind::value_error(format!(
            "not enough values to unpack (expected {n}, got {})",
            items.len()
        )));
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::testing::TestHost;
    use crate::vm::value::ModuleScope;

    fn confined<T>(result: Result<T, Unwind>) -> bool {
        matches!(result, Err(e) if e.is_confinement())
    }

    #[test]
    fn underscore_attributes_are_confined() {
        let module = Value::Module(ModuleScope::new("helper"));
        assert!(confined(get_attr(&module, "__dict__")));
        assert!(confined(get_attr(&Value::list(vec![]), "_x")));
        let mut host = TestHost::new(&[]);
        assert!(confined(get_item(&mut host, &module, &Value::str("_secret"))));
    }

    #[test]
    fn modules_cannot_be_written() {
        let module = Value::Module(ModuleScope::new("helper"));
        assert!(confined(set_attr(&module, "x", Value::Int(1))));
        assert!(confined(set_item(&module, &Value::str("x"), Value::Int(1), 10)));
    }

    #[test]
    fn only_four_inplace_operators() {
        let (a, b) = (Value::Int(7), Value::Int(2));
        let mut host = TestHost::new(&[]);
        assert_eq!(inplace(&mut host, Arith::Add, &a, &b).unwrap().as_int(), Some(9));
        assert!(confined(inplace(&mut host, Arith::FloorDiv, &a, &b)));
        assert!(confined(inplace(&mut host, Arith::Mod, &a, &b)));
        assert!(confined(inplace(&mut host, Arith::Pow, &a, &b)));
    }

    #[test]
    fn list_plus_equals_extends_in_place() {
        let a = Value::list(vec![Value::Int(1)]);
        let mut host = TestHost::new(&[]);
        let out = inplace(&mut host, Arith::Add, &a, &Value::tuple(vec![Value::Int(2)])).unwrap();
        assert!(ops::identical(&a, &out));
        assert_eq!(a.repr(), "[1, 2]");
    }

    #[test]
    fn unpacking_checks_counts() {
        let t = Value::tuple(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(unpack(&t, 2).unwrap().len(), 2);
        assert!(unpack(&t, 3).is_err());
        assert!(unpack(&Value::Int(3), 1).is_err());
    }

    #[test]
    fn materializing_is_charged_and_bounded() {
        let mut host = TestHost::new(&[]);
        let before = host.budget;
        let range = Value::Range(Range { start: 0, stop: 800, step: 1 });
        assert_eq!(materialize(&mut host, &range).unwrap().len(), 800);
        assert_eq!(before - host.budget, (800 / ops::ELEMENTS_PER_UNIT) as i64);

        let before = host.budget;
        let huge = Value::Range(Range { start: 0, stop: 1 << 40, step: 1 });
        let err = materialize(&mut host, &huge).unwrap_err();
        assert!(matches!(err, Unwind::Raise(e) if e.kind == ExcKind::MemoryError));
        assert_eq!(host.budget, before);
        assert_eq!(unpack(&huge, 2).map(|v| v.len()).ok(), None);
    }

    #[test]
    fn methods_are_allow_listed() {
        let list = Value::list(vec![]);
        assert!(get_attr(&list, "append").is_ok());
        let err = get_attr(&list, "mro").unwrap_err();
        assert!(matches!(err, Unwind::Raise(e) if e.kind == ExcKind::AttributeError));
    }
}
