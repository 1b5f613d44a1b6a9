//! Query evaluation over a store snapshot.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tessel_sync_types::{Cardinality, EntityId};

use super::filter::matches;
use super::{OrderField, Query, QueryNode};
use crate::pagination::{compare_keys, resolve_window, PageCursor, PageInfo, SortKey};
use crate::store::Store;

/// Result of evaluating a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// `{namespace: [entity, ...]}` tree.
    pub data: Value,
    /// Page metadata per top-level namespace.
    pub page_info: BTreeMap<String, PageInfo>,
}

/// Evaluate a compiled query against a snapshot.
///
/// Rows are sorted by the order field, ties broken by ascending entity id.
pub fn evaluate(query: &Query, store: &Store) -> QueryResult {
    let mut data = Map::new();
    let mut page_info = BTreeMap::new();
    for node in &query.nodes {
        let candidates: Vec<EntityId> = if node.resolved {
            store.entities_of(&node.etype).collect()
        } else {
            Vec::new()
        };
        let (rows, info) = window(node, store, candidates);
        data.insert(node.label.clone(), Value::Array(rows));
        page_info.insert(node.label.clone(), info);
    }
    QueryResult {
        data: Value::Object(data),
        page_info,
    }
}

/// Filter, sort and window candidates, then project each row.
fn window(node: &QueryNode, store: &Store, candidates: Vec<EntityId>) -> (Vec<Value>, PageInfo) {
    let opts = &node.opts;
    let mut keyed: Vec<SortKey> = candidates
        .into_iter()
        .filter(|e| store.is_of(e, &node.etype))
        .filter(|e| {
            opts.where_clause
                .as_ref()
                .map(|w| matches(w, store, e))
                .unwrap_or(true)
        })
        .map(|e| SortKey::new(sort_value(&opts.order.field, store, &e), e))
        .collect();
    let direction = opts.order.direction;
    keyed.sort_by(|a, b| compare_keys(a, b, direction));

    let page = resolve_window(&keyed, direction, &opts.window);
    let selected = &keyed[page.range.clone()];
    let field = opts.order.field.name();
    let cursor = |k: &SortKey| PageCursor::new(k.id, field, k.value.clone()).encode();

    let info = PageInfo {
        start_cursor: selected.first().map(cursor),
        end_cursor: selected.last().map(cursor),
        has_next_page: page.has_next_page,
        has_previous_page: page.has_previous_page,
    };
    let rows = selected
        .iter()
        .map(|k| project(node, store, &k.id))
        .collect();
    (rows, info)
}

fn sort_value(field: &OrderField, store: &Store, e: &EntityId) -> Value {
    match field {
        OrderField::CreatedAt => store
            .entity(e)
            .map(|ent| Value::from(ent.created_at()))
            .unwrap_or(Value::Null),
        OrderField::Attr { attr: Some(attr), .. } => {
            store.value(e, attr).cloned().unwrap_or(Value::Null)
        }
        OrderField::Attr { attr: None, .. } => Value::Null,
    }
}

fn project(node: &QueryNode, store: &Store, e: &EntityId) -> Value {
    let mut obj = Map::new();
    obj.insert("id".to_string(), Value::String(e.to_string()));

    let wanted = |label: &str| {
        node.opts
            .fields
            .as_ref()
            .map(|f| f.iter().any(|x| x == label))
            .unwrap_or(true)
    };

    if let Some(entity) = store.entity(e) {
        for attr in node.projection.iter().filter(|a| wanted(&a.label)) {
            let facts = entity.facts(&attr.attr);
            if facts.is_empty() {
                continue;
            }
            let value = match attr.cardinality {
                Cardinality::One => facts[0].value.clone(),
                Cardinality::Many => Value::Array(facts.iter().map(|f| f.value.clone()).collect()),
            };
            obj.insert(attr.label.clone(), value);
        }
    }

    for child in &node.children {
        let Some(link) = child.link else {
            continue;
        };
        let targets = store.linked(e, &link.attr, link.direction);
        let (rows, _) = window(child, store, targets);
        let value = if link.single {
            rows.into_iter().next().unwrap_or(Value::Null)
        } else {
            Value::Array(rows)
        };
        obj.insert(child.label.clone(), value);
    }

    Value::Object(obj)
}
