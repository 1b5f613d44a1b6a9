//! Where-clause evaluation.

use serde_json::Value;
use std::cmp::Ordering;
use tessel_sync_types::EntityId;

use super::{Condition, Op, Terminal, WhereClause};
use crate::pagination::compare_values;
use crate::store::Store;

/// SQL `LIKE` match: `%` matches any run of characters, `_` exactly one.
pub fn like(value: &str, pattern: &str) -> bool {
    let v: Vec<char> = value.chars().collect();
    let p: Vec<char> = pattern.chars().collect();

    let (mut vi, mut pi) = (0, 0);
    // last `%` seen and the value position it is currently absorbing up to
    let mut star: Option<(usize, usize)> = None;
    while vi < v.len() {
        if pi < p.len() && (p[pi] == '_' || p[pi] == v[vi]) {
            vi += 1;
            pi += 1;
        } else if pi < p.len() && p[pi] == '%' {
            star = Some((pi, vi));
            pi += 1;
        } else if let Some((sp, sv)) = star {
            pi = sp + 1;
            vi = sv + 1;
            star = Some((sp, sv + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '%')
}

pub(super) fn matches(clause: &WhereClause, store: &Store, e: &EntityId) -> bool {
    match clause {
        WhereClause::And(parts) => parts.iter().all(|c| matches(c, store, e)),
        WhereClause::Or(parts) => parts.iter().any(|c| matches(c, store, e)),
        WhereClause::Cond(cond) => condition(cond, store, e),
    }
}

fn condition(cond: &Condition, store: &Store, e: &EntityId) -> bool {
    let mut frontier = vec![*e];
    for (attr, dir) in &cond.hops {
        let mut next: Vec<EntityId> = frontier
            .iter()
            .flat_map(|id| store.linked(id, attr, *dir))
            .collect();
        next.sort();
        next.dedup();
        frontier = next;
    }

    let values: Vec<Value> = frontier
        .iter()
        .flat_map(|id| terminal_values(cond.terminal, store, id))
        .collect();
    test(&cond.op, &values)
}

fn terminal_values(terminal: Terminal, store: &Store, e: &EntityId) -> Vec<Value> {
    match terminal {
        Terminal::Id => vec![Value::String(e.to_string())],
        Terminal::Attr(attr) => store
            .entity(e)
            .map(|ent| ent.values(&attr).cloned().collect())
            .unwrap_or_default(),
        Terminal::Link(attr, dir) => store
            .linked(e, &attr, dir)
            .into_iter()
            .map(|id| Value::String(id.to_string()))
            .collect(),
    }
}

fn test(op: &Op, values: &[Value]) -> bool {
    let cmp = |target: &Value, accept: fn(Ordering) -> bool| {
        values
            .iter()
            .filter(|v| !v.is_null() && same_kind(v, target))
            .any(|v| accept(compare_values(v, target)))
    };
    match op {
        Op::Eq(target) => values.iter().any(|v| v == target),
        Op::Ne(target) => !values.iter().any(|v| v == target),
        Op::Gt(target) => cmp(target, |o| o == Ordering::Greater),
        Op::Gte(target) => cmp(target, |o| o != Ordering::Less),
        Op::Lt(target) => cmp(target, |o| o == Ordering::Less),
        Op::Lte(target) => cmp(target, |o| o != Ordering::Greater),
        Op::In(targets) => values.iter().any(|v| targets.contains(v)),
        Op::Like {
            pattern,
            case_insensitive,
        } => values.iter().filter_map(Value::as_str).any(|s| {
            if *case_insensitive {
                like(&s.to_lowercase(), &pattern.to_lowercase())
            } else {
                like(s, pattern)
            }
        }),
        Op::IsNull(expected) => values.iter().all(Value::is_null) == *expected,
    }
}

/// Range comparisons only hold between values of the same JSON kind.
fn same_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn like_wildcards() {
        assert!(like("hello", "h%o"));
        assert!(like("hello", "%ell%"));
        assert!(like("hello", "h_llo"));
        assert!(like("", "%"));
        assert!(!like("hello", "h_lo"));
        assert!(!like("hello", "world%"));
        assert!(like("a%b", "a%b"));
        assert!(like("mississippi", "%iss%pi"));
    }

    #[test]
    fn ne_is_true_when_no_value_matches() {
        assert!(test(&Op::Ne(json!(1)), &[json!(2), json!(3)]));
        assert!(!test(&Op::Ne(json!(1)), &[json!(2), json!(1)]));
        assert!(test(&Op::Ne(json!(1)), &[]));
    }

    #[test]
    fn ranges_skip_other_kinds() {
        assert!(!test(&Op::Gt(json!(1)), &[json!("z")]));
        assert!(test(&Op::Gt(json!(1)), &[json!("z"), json!(5)]));
        assert!(test(&Op::Lte(json!("b")), &[json!("a")]));
    }

    #[test]
    fn is_null_semantics() {
        assert!(test(&Op::IsNull(true), &[]));
        assert!(test(&Op::IsNull(true), &[Value::Null]));
        assert!(!test(&Op::IsNull(true), &[json!(1)]));
        assert!(test(&Op::IsNull(false), &[json!(1)]));
    }

    #[test]
    fn ilike_ignores_case() {
        let op = Op::Like {
            pattern: "%FIT%".into(),
            case_insensitive: true,
        };
        assert!(test(&op, &[json!("Get fit")]));
        let strict = Op::Like {
            pattern: "%FIT%".into(),
            case_insensitive: false,
        };
        assert!(!test(&strict, &[json!("Get fit")]));
    }
}
