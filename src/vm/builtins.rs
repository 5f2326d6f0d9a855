//! Builtin functions, methods of builtin types and the allow-listed standard modules.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::gateway::{self, materialize};
use super::ops::{self, Arith};
use super::value::{Dict, ModuleScope, Native, Range, Value, Variant};
use super::{Args, ExcKind, Host, Unwind};

type Builtin = fn(&mut dyn Host, Args) -> Result<Value, Unwind>;

const FUNCTIONS: &[(&str, Builtin)] = &[
    ("abs", abs),
    ("all", all),
    ("any", any),
    ("bool", bool_),
    ("chr", chr),
    ("dict", dict),
    ("enumerate", enumerate),
    ("float", float),
    ("get_budget", get_budget),
    ("getattr", getattr),
    ("hasattr", hasattr),
    ("int", int),
    ("len", len),
    ("list", list),
    ("log", log),
    ("max", max),
    ("min", min),
    ("ord", ord),
    ("print", print),
    ("range", range),
    ("repr", repr),
    ("reversed", reversed),
    ("round", round),
    ("sorted", sorted),
    ("str", str_),
    ("sum", sum),
    ("tuple", tuple),
    ("zip", zip),
];

/// Builtins every agent sees, before the game adds its own.
pub fn standard() -> HashMap<Rc<str>, Value> {
    let mut builtins: HashMap<Rc<str>, Value> = FUNCTIONS
        .iter()
        .map(|&(name, func)| (Rc::from(name), Native::value(name, func)))
        .collect();
    for kind in ExcKind::CATCHABLE {
        builtins.insert(Rc::from(kind.name()), Value::ExcClass(kind));
    }
    builtins
}

fn first(args: &Args) -> &Value {
    args.positional.first().unwrap_or(&Value::None)
}

fn abs(_: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("abs", 1, 1)?;
    match first(&args) {
        Value::Float(f) => Ok(Value::Float(f.abs())),
        v => match v.as_int() {
            Some(i) => i
                .checked_abs()
                .map(Value::Int)
                .ok_or_else(|| Unwind::raise(ExcKind::OverflowError, "integer overflow")),
            None => Err(Unwind::type_error(format!(
                "bad operand type for abs(): '{}'",
                v.type_name()
            ))),
        },
    }
}

fn all(host: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("all", 1, 1)?;
    let items = materialize(host, first(&args))?;
    Ok(Value::Bool(items.iter().all(Value::truthy)))
}

fn any(host: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("any", 1, 1)?;
    let items = materialize(host, first(&args))?;
    Ok(Value::Bool(items.iter().any(Value::truthy)))
}

fn bool_(_: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("bool", 0, 1)?;
    Ok(Value::Bool(first(&args).truthy()))
}

fn chr(_: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("chr", 1, 1)?;
    let code = args.int("chr", 0)?;
    let c = u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| Unwind::value_error("chr() arg not in range"))?;
    Ok(Value::str(c.encode_utf8(&mut [0; 4])))
}

fn dict(host: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("dict", 0, 1)?;
    let mut out = Dict::default();
    match first(&args) {
        Value::None => {}
        Value::Dict(d) => {
            ops::charge_growth(host, d.borrow().len())?;
            out = d.borrow().clone();
        }
        other => {
            for pair in materialize(host, other)? {
                let kv = gateway::unpack(&pair, 2)?;
                out.insert(ops::hash_key(&kv[0])?, kv[0].clone(), kv[1].clone());
            }
        }
    }
    Ok(Value::Dict(Rc::new(RefCell::new(out))))
}

fn enumerate(host: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("enumerate", 1, 2)?;
    let start = if args.positional.len() > 1 {
        args.int("enumerate", 1)?
    } else {
        0
    };
    let items = materialize(host, first(&args))?;
    Ok(Value::list(
        items
            .into_iter()
            .zip(start..)
            .map(|(v, i)| Value::tuple(vec![Value::Int(i), v]))
            .collect(),
    ))
}

fn float(_: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("float", 0, 1)?;
    match first(&args) {
        Value::None => Ok(Value::Float(0.0)),
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| Unwind::value_error(format!("could not convert string to float: '{s}'"))),
        v => v.as_float().map(Value::Float).ok_or_else(|| {
            Unwind::type_error(format!(
                "float() argument must be a string or a number, not '{}'",
                v.type_name()
            ))
        }),
    }
}

fn get_budget(host: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("get_budget", 0, 0)?;
    Ok(Value::Int(host.budget()))
}

fn attribute_name(args: &Args, function: &str) -> Result<Rc<str>, Unwind> {
    match args.positional.get(1) {
        Some(Value::Str(name)) => Ok(name.clone()),
        _ => Err(Unwind::type_error(format!(
            "{function}(): attribute name must be string"
        ))),
    }
}

fn getattr(_: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("getattr", 2, 3)?;
    let name = attribute_name(&args, "getattr")?;
    match gateway::get_attr(first(&args), &name) {
        Err(Unwind::Raise(e)) if e.kind == ExcKind::AttributeError && args.positional.len() == 3 => {
            Ok(args.positional[2].clone())
        }
        other => other,
    }
}

fn hasattr(_: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("hasattr", 2, 2)?;
    let name = attribute_name(&args, "hasattr")?;
    match gateway::get_attr(first(&args), &name) {
        Ok(_) => Ok(Value::Bool(true)),
        Err(Unwind::Raise(e)) if e.kind == ExcKind::AttributeError => Ok(Value::Bool(false)),
        Err(e) => Err(e),
    }
}

fn int(_: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("int", 0, 1)?;
    match first(&args) {
        Value::None => Ok(Value::Int(0)),
        Value::Float(f) if f.is_nan() => Err(Unwind::value_error("cannot convert float NaN to integer")),
        Value::Float(f) if f.abs() >= 9.2e18 => Err(Unwind::raise(
            ExcKind::OverflowError,
            "cannot convert float to integer",
        )),
        Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
        Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
            Unwind::value_error(format!("invalid literal for int() with base 10: '{s}'"))
        }),
        v => v.as_int().map(Value::Int).ok_or_else(|| {
            Unwind::type_error(format!(
                "int() argument must be a string or a number, not '{}'",
                v.type_name()
            ))
        }),
    }
}

fn len(_: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("len", 1, 1)?;
    let n = match first(&args) {
        Value::Str(s) => s.chars().count(),
        Value::List(l) => l.borrow().len(),
        Value::Tuple(t) => t.len(),
        Value::Dict(d) => d.borrow().len(),
        Value::Range(r) => r.len(),
        other => {
            return Err(Unwind::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    };
    Ok(Value::Int(n as i64))
}

fn list(host: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("list", 0, 1)?;
    if args.positional.is_empty() {
        return Ok(Value::list(Vec::new()));
    }
    Ok(Value::list(materialize(host, first(&args))?))
}

fn log(host: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("log", 1, 1)?;
    host.log(first(&args).to_text());
    Ok(Value::None)
}

fn print(host: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("print", 0, usize::MAX)?;
    let line: Vec<String> = args.positional.iter().map(Value::to_text).collect();
    host.log(line.join(" "));
    Ok(Value::None)
}

fn extreme(host: &mut dyn Host, args: Args, name: &str, keep: std::cmp::Ordering) -> Result<Value, Unwind> {
    args.arity(name, 1, usize::MAX)?;
    let items = if args.positional.len() == 1 {
        materialize(host, first(&args))?
    } else {
        args.positional
    };
    let mut items = items.into_iter();
    let mut best = items
        .next()
        .ok_or_else(|| Unwind::value_error(format!("{name}() arg is an empty sequence")))?;
    for item in items {
        if ops::order(&item, &best)? == Some(keep) {
            best = item;
        }
    }
    Ok(best)
}

fn max(host: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    extreme(host, args, "max", std::cmp::Ordering::Greater)
}

fn min(host: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    extreme(host, args, "min", std::cmp::Ordering::Less)
}

fn ord(_: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("ord", 1, 1)?;
    if let Value::Str(s) = first(&args) {
        let mut chars = s.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            return Ok(Value::Int(c as i64));
        }
    }
    Err(Unwind::type_error("ord() expected a character"))
}

fn range(_: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("range", 1, 3)?;
    let (start, stop) = if args.positional.len() == 1 {
        (0, args.int("range", 0)?)
    } else {
        (args.int("range", 0)?, args.int("range", 1)?)
    };
    let step = if args.positional.len() == 3 {
        args.int("range", 2)?
    } else {
        1
    };
    if step == 0 {
        return Err(Unwind::value_error("range() arg 3 must not be zero"));
    }
    Ok(Value::Range(Range { start, stop, step }))
}

fn repr(host: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("repr", 1, 1)?;
    built(host, first(&args).repr())
}

fn reversed(host: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("reversed", 1, 1)?;
    let mut items = materialize(host, first(&args))?;
    items.reverse();
    Ok(Value::list(items))
}

fn round(_: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("round", 1, 2)?;
    let value = first(&args);
    if let (Some(i), 1) = (value.as_int(), args.positional.len()) {
        return Ok(Value::Int(i));
    }
    let x = value
        .as_float()
        .ok_or_else(|| Unwind::type_error(format!("type {} doesn't define __round__", value.type_name())))?;
    if args.positional.len() == 1 {
        if !x.is_finite() {
            return Err(Unwind::raise(ExcKind::OverflowError, "cannot convert float to integer"));
        }
        return Ok(Value::Int(x.round_ties_even() as i64));
    }
    let digits = args.int("round", 1)?.clamp(-308, 308) as i32;
    let scale = 10f64.powi(digits);
    Ok(Value::Float((x * scale).round_ties_even() / scale))
}

/// Extra cost of sorting `n` items, on top of the call itself.
pub fn sort_cost(n: usize) -> i64 {
    if n < 2 {
        return 0;
    }
    let n = n as f64;
    (n * n.ln().floor()) as i64
}

/// Stable merge sort with a comparison that may raise.
pub fn sort_values(items: &mut Vec<Value>, reverse: bool) -> Result<(), Unwind> {
    let n = items.len();
    let mut buffer = items.clone();
    let mut width = 1;
    while width < n {
        let mut start = 0;
        while start < n {
            let mid = (start + width).min(n);
            let end = (start + 2 * width).min(n);
            let (mut left, mut right) = (start, mid);
            for slot in buffer.iter_mut().take(end).skip(start) {
                let take_right = if left >= mid {
                    true
                } else if right >= end {
                    false
                } else if reverse {
                    ops::order(&items[left], &items[right])? == Some(std::cmp::Ordering::Less)
                } else {
                    ops::order(&items[right], &items[left])? == Some(std::cmp::Ordering::Less)
                };
                if take_right {
                    *slot = items[right].clone();
                    right += 1;
                } else {
                    *slot = items[left].clone();
                    left += 1;
                }
            }
            start = end;
        }
        std::mem::swap(items, &mut buffer);
        width *= 2;
    }
    Ok(())
}

fn reverse_flag(args: &mut Args, function: &str) -> Result<bool, Unwind> {
    let reverse = args.take_keyword("reverse").is_some_and(|v| v.truthy());
    if let Some((key, _)) = args.keywords.first() {
        return Err(Unwind::type_error(format!(
            "{function}() got an unexpected keyword argument '{key}'"
        )));
    }
    Ok(reverse)
}

fn sorted(host: &mut dyn Host, mut args: Args) -> Result<Value, Unwind> {
    let reverse = reverse_flag(&mut args, "sorted")?;
    args.arity("sorted", 1, 1)?;
    let mut items = materialize(host, first(&args))?;
    host.charge(sort_cost(items.len()))?;
    sort_values(&mut items, reverse)?;
    Ok(Value::list(items))
}

fn str_(host: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("str", 0, 1)?;
    if args.positional.is_empty() {
        return Ok(Value::str(""));
    }
    built(host, first(&args).to_text())
}

/// A string native code has already rendered, bounded and charged by length.
fn built(host: &mut dyn Host, out: String) -> Result<Value, Unwind> {
    ops::grow(host, out.len())?;
    Ok(Value::str(&out))
}

fn sum(host: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("sum", 1, 2)?;
    let mut total = args.positional.get(1).cloned().unwrap_or(Value::Int(0));
    for item in materialize(host, first(&args))? {
        total = ops::arith(host, Arith::Add, &total, &item)?;
    }
    Ok(total)
}

fn tuple(host: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("tuple", 0, 1)?;
    if args.positional.is_empty() {
        return Ok(Value::tuple(Vec::new()));
    }
    Ok(Value::tuple(materialize(host, first(&args))?))
}

fn zip(host: &mut dyn Host, args: Args) -> Result<Value, Unwind> {
    args.arity("zip", 0, usize::MAX)?;
    let columns = args
        .positional
        .iter()
        .map(|v| materialize(host, v))
        .collect::<Result<Vec<_>, _>>()?;
    let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
    Ok(Value::list(
        (0..rows)
            .map(|i| Value::tuple(columns.iter().map(|c| c[i].clone()).collect()))
            .collect(),
    ))
}

/// Calls method `name` of a builtin value, looked up through the gateway.
pub fn call_method(
    host: &mut dyn Host,
    receiver: &Value,
    name: &str,
    args: Args,
) -> Result<Value, Unwind> {
    match receiver {
        Value::List(list) => list_method(host, list, name, args),
        Value::Dict(dict) => dict_method(host, dict, name, args),
        Value::Str(s) => str_method(host, s, name, args),
        Value::Variant(v) if v.family == "Team" && name == "opponent" => {
            args.arity("opponent", 0, 0)?;
            Ok(Value::Variant(Variant {
                family: v.family,
                name: if v.value == 0 { "BLACK" } else { "WHITE" },
                value: 1 - v.value.min(1),
            }))
        }
        other => Err(Unwind::raise(
            ExcKind::AttributeError,
            format!("'{}' object has no attribute '{name}'", other.type_name()),
        )),
    }
}

fn list_method(
    host: &mut dyn Host,
    list: &Rc<RefCell<Vec<Value>>>,
    name: &str,
    mut args: Args,
) -> Result<Value, Unwind> {
    let limit = host.max_collection_len();
    match name {
        "append" => {
            args.arity("append", 1, 1)?;
            let mut items = list.borrow_mut();
            if items.len() >= limit {
                return Err(ops::too_long());
            }
            items.push(first(&args).clone());
        }
        "extend" => {
            args.arity("extend", 1, 1)?;
            let extra = materialize(host, first(&args))?;
            let mut items = list.borrow_mut();
            if items.len() + extra.len() > limit {
                return Err(ops::too_long());
            }
            items.extend(extra);
        }
        "insert" => {
            args.arity("insert", 2, 2)?;
            let at = args.int("insert", 0)?;
            let mut items = list.borrow_mut();
            if items.len() >= limit {
                return Err(ops::too_long());
            }
            let len = items.len() as i64;
            let at = if at < 0 { (at + len).max(0) } else { at.min(len) };
            items.insert(at as usize, args.positional[1].clone());
        }
        "pop" => {
            args.arity("pop", 0, 1)?;
            let mut items = list.borrow_mut();
            if items.is_empty() {
                return Err(Unwind::raise(ExcKind::IndexError, "pop from empty list"));
            }
            let at = match args.positional.first() {
                Some(key) => ops::index(items.len(), key, "pop")?,
                None => items.len() - 1,
            };
            return Ok(items.remove(at));
        }
        "remove" | "index" | "count" => {
            args.arity(name, 1, 1)?;
            let items = list.borrow().clone();
            let needle = first(&args);
            let mut found = Vec::new();
            for (i, item) in items.iter().enumerate() {
                if ops::equal(item, needle)? {
                    found.push(i);
                }
            }
            return match (name, found.first()) {
                ("count", _) => Ok(Value::Int(found.len() as i64)),
                ("index", Some(&i)) => Ok(Value::Int(i as i64)),
                ("remove", Some(&i)) => {
                    list.borrow_mut().remove(i);
                    Ok(Value::None)
                }
                _ => Err(Unwind::value_error(format!(
                    "{} is not in list",
                    needle.repr()
                ))),
            };
        }
        "sort" => {
            let reverse = reverse_flag(&mut args, "sort")?;
            args.arity("sort", 0, 0)?;
            let mut items = list.borrow().clone();
            host.charge(sort_cost(items.len()))?;
            sort_values(&mut items, reverse)?;
            *list.borrow_mut() = items;
        }
        "reverse" => {
            args.arity("reverse", 0, 0)?;
            list.borrow_mut().reverse();
        }
        "copy" => {
            args.arity("copy", 0, 0)?;
            ops::charge_growth(host, list.borrow().len())?;
            return Ok(Value::list(list.borrow().clone()));
        }
        "clear" => {
            args.arity("clear", 0, 0)?;
            list.borrow_mut().clear();
        }
        _ => return Err(no_method("list", name)),
    }
    Ok(Value::None)
}

fn no_method(type_name: &str, name: &str) -> Unwind {
    Unwind::raise(
        ExcKind::AttributeError,
        format!("'{type_name}' object has no attribute '{name}'"),
    )
}

fn dict_method(
    host: &mut dyn Host,
    dict: &Rc<RefCell<Dict>>,
    name: &str,
    args: Args,
) -> Result<Value, Unwind> {
    match name {
        "get" => {
            args.arity("get", 1, 2)?;
            let key = ops::hash_key(first(&args))?;
            let default = args.positional.get(1).cloned().unwrap_or(Value::None);
            Ok(dict.borrow().get(&key).cloned().unwrap_or(default))
        }
        "setdefault" => {
            args.arity("setdefault", 1, 2)?;
            let raw = first(&args).clone();
            let key = ops::hash_key(&raw)?;
            if let Some(existing) = dict.borrow().get(&key) {
                return Ok(existing.clone());
            }
            let default = args.positional.get(1).cloned().unwrap_or(Value::None);
            ops::set_item(&Value::Dict(dict.clone()), &raw, default.clone(), host.max_collection_len())?;
            Ok(default)
        }
        "keys" | "values" | "items" => {
            args.arity(name, 0, 0)?;
            ops::charge_growth(host, dict.borrow().len())?;
            let d = dict.borrow();
            Ok(Value::list(
                d.entries
                    .iter()
                    .map(|(k, v)| match name {
                        "keys" => k.clone(),
                        "values" => v.clone(),
                        _ => Value::tuple(vec![k.clone(), v.clone()]),
                    })
                    .collect(),
            ))
        }
        "pop" => {
            args.arity("pop", 1, 2)?;
            let key = ops::hash_key(first(&args))?;
            let removed = dict.borrow_mut().remove(&key);
            match (removed, args.positional.get(1)) {
                (Some(value), _) => Ok(value),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(Unwind::raise(ExcKind::KeyError, first(&args).repr())),
            }
        }
        "update" => {
            args.arity("update", 1, 1)?;
            let Value::Dict(other) = first(&args) else {
                return Err(Unwind::type_error("update() argument must be a dict"));
            };
            let entries = other.borrow().entries.clone();
            let target = Value::Dict(dict.clone());
            for (k, v) in entries {
                ops::set_item(&target, &k, v, host.max_collection_len())?;
            }
            Ok(Value::None)
        }
        "copy" => {
            args.arity("copy", 0, 0)?;
            ops::charge_growth(host, dict.borrow().len())?;
            Ok(Value::Dict(Rc::new(RefCell::new(dict.borrow().clone()))))
        }
        "clear" => {
            args.arity("clear", 0, 0)?;
            dict.borrow_mut().clear();
            Ok(Value::None)
        }
        _ => Err(no_method("dict", name)),
    }
}

fn str_arg<'a>(args: &'a Args, index: usize, function: &str) -> Result<&'a str, Unwind> {
    match args.positional.get(index) {
        Some(Value::Str(s)) => Ok(s),
        Some(other) => Err(Unwind::type_error(format!(
            "{function}() argument must be str, not {}",
            other.type_name()
        ))),
        None => Err(Unwind::type_error(format!("{function}() missing argument"))),
    }
}

fn str_method(host: &mut dyn Host, s: &Rc<str>, name: &str, args: Args) -> Result<Value, Unwind> {
    let text = |out: &str| Ok(Value::str(out));
    match name {
        "upper" => {
            args.arity(name, 0, 0)?;
            built(host, s.to_uppercase())
        }
        "lower" => {
            args.arity(name, 0, 0)?;
            built(host, s.to_lowercase())
        }
        "isdigit" => {
            args.arity(name, 0, 0)?;
            Ok(Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit())))
        }
        "strip" => {
            args.arity(name, 0, 1)?;
            if args.positional.is_empty() {
                return text(s.trim());
            }
            let chars = str_arg(&args, 0, name)?;
            text(s.trim_matches(|c| chars.contains(c)))
        }
        "split" => {
            args.arity(name, 0, 1)?;
            let parts: Vec<Value> = if args.positional.is_empty() {
                s.split_whitespace().map(Value::str).collect()
            } else {
                let sep = str_arg(&args, 0, name)?;
                if sep.is_empty() {
                    return Err(Unwind::value_error("empty separator"));
                }
                s.split(sep).map(Value::str).collect()
            };
            ops::charge_growth(host, parts.len())?;
            Ok(Value::list(parts))
        }
        "join" => {
            args.arity(name, 1, 1)?;
            let mut parts = Vec::new();
            let mut total = 0usize;
            for item in materialize(host, first(&args))? {
                match item {
                    Value::Str(part) => {
                        total = total.saturating_add(part.len()).saturating_add(s.len());
                        parts.push(part);
                    }
                    other => {
                        return Err(Unwind::type_error(format!(
                            "sequence item: expected str instance, {} found",
                            other.type_name()
                        )))
                    }
                }
            }
            ops::grow(host, total.saturating_sub(s.len()))?;
            text(&parts.join(s))
        }
        "startswith" | "endswith" => {
            args.arity(name, 1, 1)?;
            let affix = str_arg(&args, 0, name)?;
            Ok(Value::Bool(if name == "startswith" {
                s.starts_with(affix)
            } else {
                s.ends_with(affix)
            }))
        }
        "replace" => {
            args.arity(name, 2, 2)?;
            let (from, to) = (str_arg(&args, 0, name)?, str_arg(&args, 1, name)?);
            let hits = s.matches(from).count();
            let len = (s.len() - hits * from.len()).saturating_add(hits.saturating_mul(to.len()));
            ops::grow(host, len)?;
            text(&s.replace(from, to))
        }
        "find" => {
            args.arity(name, 1, 1)?;
            let needle = str_arg(&args, 0, name)?;
            Ok(Value::Int(match s.find(needle) {
                Some(byte) => s[..byte].chars().count() as i64,
                None => -1,
            }))
        }
        "count" => {
            args.arity(name, 1, 1)?;
            Ok(Value::Int(s.matches(str_arg(&args, 0, name)?).count() as i64))
        }
        "format" => {
            args.arity(name, 0, usize::MAX)?;
            let out = format_str(s, &args.positional, host.max_collection_len())?;
            ops::charge_growth(host, out.len())?;
            Ok(Value::Str(out))
        }
        _ => Err(no_method("str", name)),
    }
}

/// `"{} and {0}".format(...)`, positional fields only.
fn format_str(template: &str, values: &[Value], limit: usize) -> Result<Rc<str>, Unwind> {
    let mut out = String::new();
    let mut next = 0;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => field.push(c),
                        None => return Err(Unwind::value_error("unmatched '{' in format string")),
                    }
                }
                let index = if field.is_empty() {
                    next += 1;
                    next - 1
                } else {
                    field
                        .parse::<usize>()
                        .map_err(|_| Unwind::value_error(format!("unsupported format field '{field}'")))?
                };
                let value = values.get(index).ok_or_else(|| {
                    Unwind::raise(ExcKind::IndexError, "format index out of range")
                })?;
                out.push_str(&value.to_text());
                if out.len() > limit {
                    return Err(ops::too_long());
                }
            }
            c => out.push(c),
        }
    }
    Ok(Rc::from(out))
}

/// The `random` module of one agent, seeded for reproducible matches.
pub fn random_module(seed: u64) -> Value {
    let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(seed)));
    let (r1, r2, r3, r4) = (rng.clone(), rng.clone(), rng.clone(), rng);
    Value::Module(ModuleScope::with(
        "random",
        [
            (
                "random",
                Native::value("random", move |_, args| {
                    args.arity("random", 0, 0)?;
                    Ok(Value::Float(r1.borrow_mut().gen::<f64>()))
                }),
            ),
            (
                "randint",
                Native::value("randint", move |_, args| {
                    args.arity("randint", 2, 2)?;
                    let (a, b) = (args.int("randint", 0)?, args.int("randint", 1)?);
                    if a > b {
                        return Err(Unwind::value_error("empty range for randint()"));
                    }
                    Ok(Value::Int(r2.borrow_mut().gen_range(a..=b)))
                }),
            ),
            (
                "choice",
                Native::value("choice", move |host, args| {
                    args.arity("choice", 1, 1)?;
                    let items = materialize(host, first(&args))?;
                    if items.is_empty() {
                        return Err(Unwind::raise(
                            ExcKind::IndexError,
                            "Cannot choose from an empty sequence",
                        ));
                    }
                    let at = r3.borrow_mut().gen_range(0..items.len());
                    Ok(items[at].clone())
                }),
            ),
            (
                "shuffle",
                Native::value("shuffle", move |_, args| {
                    args.arity("shuffle", 1, 1)?;
                    let Value::List(list) = first(&args) else {
                        return Err(Unwind::type_error("shuffle() argument must be a list"));
                    };
                    list.borrow_mut().shuffle(&mut *r4.borrow_mut());
                    Ok(Value::None)
                }),
            ),
        ],
    ))
}

/// The `math` module.
pub fn math_module() -> Value {
    fn rounding(name: &'static str, op: fn(f64) -> f64) -> Value {
        Native::value(name, move |_, args| {
            args.arity(name, 1, 1)?;
            let value = first(&args);
            if let Some(i) = value.as_int() {
                return Ok(Value::Int(i));
            }
            let x = value
                .as_float()
                .ok_or_else(|| Unwind::type_error("must be real number"))?;
            if !x.is_finite() || x.abs() >= 9.2e18 {
                return Err(Unwind::raise(ExcKind::OverflowError, "cannot convert float to integer"));
            }
            Ok(Value::Int(op(x) as i64))
        })
    }
    Value::Module(ModuleScope::with(
        "math",
        [
            ("floor", rounding("floor", f64::floor)),
            ("ceil", rounding("ceil", f64::ceil)),
            (
                "sqrt",
                Native::value("sqrt", |_, args| {
                    args.arity("sqrt", 1, 1)?;
                    let x = first(&args)
                        .as_float()
                        .ok_or_else(|| Unwind::type_error("must be real number"))?;
                    if x < 0.0 {
                        return Err(Unwind::value_error("math domain error"));
                    }
                    Ok(Value::Float(x.sqrt()))
                }),
            ),
            ("inf", Value::Float(f64::INFINITY)),
            ("pi", Value::Float(std::f64::consts::PI)),
        ],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::testing::eval;

    fn text(source: &str) -> String {
        eval(source, "out").unwrap().to_text()
    }

    #[test]
    fn sorting_is_stable_and_reversible() {
        assert_eq!(text("out = str(sorted([3, 1, 2]))\n"), "[1, 2, 3]");
        assert_eq!(text("out = str(sorted([3, 1, 2], reverse=True))\n"), "[3, 2, 1]");
        assert_eq!(
            text("xs = [(1, 'b'), (0, 'z'), (1, 'a')]\nxs.sort()\nout = str(xs)\n"),
            "[(0, 'z'), (1, 'a'), (1, 'b')]"
        );
    }

    #[test]
    fn sorting_mixed_types_raises() {
        let err = eval("out = sorted([1, 'a'])\n", "out").unwrap_err();
        assert!(matches!(err, Unwind::Raise(e) if e.kind == ExcKind::TypeError));
    }

    #[test]
    fn sort_charge_grows_like_n_log_n() {
        assert_eq!(sort_cost(1), 0);
        assert_eq!(sort_cost(10), 20);
        assert_eq!(sort_cost(100), 400);
    }

    #[test]
    fn common_builtins() {
        assert_eq!(text("out = str(len('pawn') + len([1, 2]))\n"), "6");
        assert_eq!(text("out = str(max(3, 9, 4)) + str(min([5, 2]))\n"), "92");
        assert_eq!(text("out = str(sum(range(5)))\n"), "10");
        assert_eq!(text("out = str(list(zip([1, 2], 'ab')))\n"), "[(1, 'a'), (2, 'b')]");
        assert_eq!(text("out = str(int('42') + int(3.9))\n"), "45");
        assert_eq!(text("out = str(round(2.5)) + str(round(3.5))\n"), "24");
    }

    #[test]
    fn string_methods() {
        assert_eq!(text("out = '-'.join('a b c'.split())\n"), "a-b-c");
        assert_eq!(text("out = '{} at {}'.format('pawn', (1, 2))\n"), "pawn at (1, 2)");
        assert_eq!(text("out = 'Pawn'.upper().lower()\n"), "pawn");
    }

    #[test]
    fn dict_methods() {
        assert_eq!(
            text("d = {'a': 1}\nd.update({'b': 2})\nout = str(d.get('b')) + str(d.get('c', 0)) + str(d.keys())\n"),
            "20['a', 'b']"
        );
    }

    #[test]
    fn huge_ranges_are_not_materialized() {
        let err = eval("out = list(range(10 ** 9))\n", "out").unwrap_err();
        assert!(matches!(err, Unwind::Raise(e) if e.kind == ExcKind::MemoryError));
    }

    #[test]
    fn strings_are_bounded_before_they_are_built() {
        for source in [
            "s = 'x' * 900\nout = s.replace('x', s)\n",
            "out = '-'.join(['ab'] * 600)\n",
            "s = 'x' * 600\nout = '{}{}'.format(s, s)\n",
            "out = str(list(range(900)))\n",
        ] {
            let err = eval(source, "out").unwrap_err();
            assert!(matches!(err, Unwind::Raise(e) if e.kind == ExcKind::MemoryError), "{source}");
        }
        assert_eq!(text("out = 'abab'.replace('b', 'xyz')\n"), "axyzaxyz");
        assert_eq!(text("out = 'ab'.replace('', '-')\n"), "-a-b-");
    }

    #[test]
    fn random_is_reproducible() {
        let draw = || {
            let module = random_module(7);
            let Value::Module(m) = module else { unreachable!() };
            let Some(Value::Native(f)) = m.get("randint") else { unreachable!() };
            let mut host = crate::vm::testing::TestHost::new(&[]);
            (0..5)
                .map(|_| {
                    (f.func)(&mut host, Args::new(vec![Value::Int(0), Value::Int(100)]))
                        .unwrap()
                        .as_int()
                        .unwrap()
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(), draw());
    }
}
