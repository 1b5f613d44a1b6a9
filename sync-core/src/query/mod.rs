//! Declarative nested queries.
//!
//! A query is a JSON tree of namespaces:
//!
//! ```text
//! { "goals": { "$": { "where": { "title": { "$like": "%fit%" } },
//!                     "order": { "serverCreatedAt": "desc" },
//!                     "first": 10 },
//!              "todos": {} } }
//! ```
//!
//! [`Query::compile`] parses the tree and resolves every namespace, link and
//! field against the schema dictionary. Compilation either succeeds
//! completely or fails with a [`SchemaError`] naming the offending path;
//! evaluation of a compiled query cannot fail.

mod eval;
mod filter;

pub use eval::{evaluate, QueryResult};
pub use filter::like;

use serde_json::{Map, Value};
use tessel_sync_types::{AttrId, Cardinality, DataType};

use crate::coerce::date_millis;
use crate::error::SchemaError;
use crate::pagination::{Direction, PageCursor, Window};
use crate::schema::{LinkDirection, Schema};

/// Name of the implicit creation-time order field.
pub const CREATED_AT_FIELD: &str = "serverCreatedAt";

/// A compiled query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Top-level namespaces.
    pub nodes: Vec<QueryNode>,
}

/// One namespace (top-level) or relation (nested) of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryNode {
    /// Key in the query tree and in the result.
    pub label: String,
    /// Dotted path from the root, for error reporting.
    pub path: String,
    /// Namespace of the entities at this node.
    pub etype: String,
    /// How this node is reached from its parent (nested nodes only).
    pub link: Option<LinkRef>,
    /// `$` options.
    pub opts: QueryOpts,
    /// Blob attributes projected onto each entity.
    pub projection: Vec<ProjectedAttr>,
    /// Nested relations.
    pub children: Vec<QueryNode>,
    /// False when the schema was unknown at compile time; such nodes
    /// evaluate to nothing.
    pub resolved: bool,
}

/// A link followed from a parent node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkRef {
    /// The ref attribute.
    pub attr: AttrId,
    /// Direction relative to the parent.
    pub direction: LinkDirection,
    /// The relation yields one entity (or null) instead of a list.
    pub single: bool,
}

/// A blob attribute emitted in results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedAttr {
    /// Result key.
    pub label: String,
    /// Attribute id.
    pub attr: AttrId,
    /// Single value or list.
    pub cardinality: Cardinality,
}

/// Options from a node's `$` block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOpts {
    /// Filter.
    pub where_clause: Option<WhereClause>,
    /// Sort order.
    pub order: Order,
    /// Pagination window.
    pub window: Window,
    /// Restrict projected attributes (`id` always kept).
    pub fields: Option<Vec<String>>,
    /// Permission rule parameters, forwarded untouched.
    pub rule_params: Option<Value>,
}

/// Sort order of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Order {
    /// Field to sort by.
    pub field: OrderField,
    /// Direction of the primary key.
    pub direction: Direction,
}

/// What rows are sorted by.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OrderField {
    /// Entity creation time.
    #[default]
    CreatedAt,
    /// A blob attribute of the namespace.
    Attr {
        /// Label, also used in cursors.
        label: String,
        /// Attribute id (absent for unresolved nodes).
        attr: Option<AttrId>,
    },
}

impl OrderField {
    /// Field name as it appears in the query and in cursors.
    pub fn name(&self) -> &str {
        match self {
            OrderField::CreatedAt => CREATED_AT_FIELD,
            OrderField::Attr { label, .. } => label,
        }
    }
}

/// Compiled where clause.
#[derive(Debug, Clone, PartialEq)]
pub enum WhereClause {
    /// All must hold.
    And(Vec<WhereClause>),
    /// Any must hold.
    Or(Vec<WhereClause>),
    /// A single condition.
    Cond(Condition),
}

/// Condition on a (possibly dotted) path.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Links followed before reaching the terminal.
    pub hops: Vec<(AttrId, LinkDirection)>,
    /// What is compared.
    pub terminal: Terminal,
    /// The comparison.
    pub op: Op,
}

/// End of a where path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// The entity id.
    Id,
    /// A blob attribute's values.
    Attr(AttrId),
    /// Ids of linked entities.
    Link(AttrId, LinkDirection),
}

/// Comparison operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Equal to.
    Eq(Value),
    /// Not equal to (`$not`, `$ne`).
    Ne(Value),
    /// Greater than.
    Gt(Value),
    /// Greater than or equal.
    Gte(Value),
    /// Less than.
    Lt(Value),
    /// Less than or equal.
    Lte(Value),
    /// One of.
    In(Vec<Value>),
    /// SQL-style pattern (`%`, `_`).
    Like {
        /// Pattern.
        pattern: String,
        /// `$ilike`.
        case_insensitive: bool,
    },
    /// Value missing or null (`true`), or present (`false`).
    IsNull(bool),
}

impl Query {
    /// Parse a query tree and resolve it against the schema.
    ///
    /// When the schema is empty (never loaded) names cannot be checked; the
    /// structure is still parsed and the nodes evaluate to empty results.
    pub fn compile(tree: &Value, schema: &Schema) -> Result<Query, SchemaError> {
        let Value::Object(namespaces) = tree else {
            return Err(SchemaError::invalid("", "query must be an object"));
        };
        let compiler = Compiler {
            schema,
            strict: !schema.is_empty(),
        };
        let mut nodes = Vec::with_capacity(namespaces.len());
        for (label, body) in namespaces {
            nodes.push(compiler.node(label, label, body, None)?);
        }
        Ok(Query { nodes })
    }

    /// Every namespace the query reads, including nested relations.
    pub fn etypes(&self) -> std::collections::BTreeSet<String> {
        fn walk(node: &QueryNode, out: &mut std::collections::BTreeSet<String>) {
            out.insert(node.etype.clone());
            for child in &node.children {
                walk(child, out);
            }
        }
        let mut out = std::collections::BTreeSet::new();
        for node in &self.nodes {
            walk(node, &mut out);
        }
        out
    }
}

struct Compiler<'a> {
    schema: &'a Schema,
    strict: bool,
}

impl Compiler<'_> {
    fn node(
        &self,
        label: &str,
        path: &str,
        body: &Value,
        parent: Option<&str>,
    ) -> Result<QueryNode, SchemaError> {
        let Value::Object(body) = body else {
            return Err(SchemaError::invalid(path, "expected an object"));
        };

        let (etype, link, resolved) = match parent {
            None if !self.strict => (label.to_string(), None, false),
            None => {
                if !self.schema.has_namespace(label) {
                    return Err(SchemaError::UnknownNamespace {
                        path: path.to_string(),
                    });
                }
                (label.to_string(), None, true)
            }
            Some(_) if !self.strict => (label.to_string(), None, false),
            Some(parent_etype) => {
                let (attr, direction, target) =
                    self.schema
                        .link(parent_etype, label)
                        .ok_or_else(|| SchemaError::UnknownLink {
                            path: path.to_string(),
                        })?;
                let single = match direction {
                    LinkDirection::Forward => attr.cardinality == Cardinality::One,
                    LinkDirection::Reverse => attr.reverse_is_single(),
                };
                (
                    target.to_string(),
                    Some(LinkRef {
                        attr: attr.id,
                        direction,
                        single,
                    }),
                    true,
                )
            }
        };

        let opts = match body.get("$") {
            Some(Value::Object(opts)) => self.opts(&etype, path, opts, resolved)?,
            Some(_) => return Err(SchemaError::invalid(path, "`$` must be an object")),
            None => QueryOpts::default(),
        };

        let mut children = Vec::new();
        for (key, child) in body.iter().filter(|(k, _)| k.as_str() != "$") {
            let child_path = format!("{path}.{key}");
            children.push(self.node(key, &child_path, child, Some(&etype))?);
        }

        let projection = if resolved {
            self.projection(&etype)
        } else {
            Vec::new()
        };

        Ok(QueryNode {
            label: label.to_string(),
            path: path.to_string(),
            etype,
            link,
            opts,
            projection,
            children,
            resolved,
        })
    }

    fn projection(&self, etype: &str) -> Vec<ProjectedAttr> {
        let mut attrs: Vec<ProjectedAttr> = self
            .schema
            .attrs()
            .filter(|a| a.forward_identity.etype == etype && !a.is_ref())
            .filter(|a| a.forward_identity.label != "id")
            .map(|a| ProjectedAttr {
                label: a.forward_identity.label.clone(),
                attr: a.id,
                cardinality: a.cardinality,
            })
            .collect();
        attrs.sort_by(|a, b| a.label.cmp(&b.label));
        attrs
    }

    fn opts(
        &self,
        etype: &str,
        path: &str,
        opts: &Map<String, Value>,
        resolved: bool,
    ) -> Result<QueryOpts, SchemaError> {
        let mut out = QueryOpts::default();
        for (key, value) in opts {
            let opt_path = format!("{path}.$.{key}");
            match key.as_str() {
                "where" => {
                    let Value::Object(clause) = value else {
                        return Err(SchemaError::invalid(&opt_path, "where must be an object"));
                    };
                    if resolved {
                        out.where_clause = Some(self.where_clause(etype, &opt_path, clause)?);
                    }
                }
                "order" => out.order = self.order(etype, &opt_path, value, resolved)?,
                "limit" => out.window.limit = Some(count(&opt_path, value)?),
                "offset" => out.window.offset = Some(count(&opt_path, value)?),
                "first" => out.window.first = Some(count(&opt_path, value)?),
                "last" => out.window.last = Some(count(&opt_path, value)?),
                "after" | "before" | "fields" | "ruleParams" => {}
                other => {
                    return Err(SchemaError::invalid(
                        &opt_path,
                        format!("unknown option `{other}`"),
                    ))
                }
            }
        }

        // cursors depend on the order, so resolve them last
        if let Some(value) = opts.get("after") {
            out.window.after = Some(cursor(&format!("{path}.$.after"), value, &out.order)?);
        }
        if let Some(value) = opts.get("before") {
            out.window.before = Some(cursor(&format!("{path}.$.before"), value, &out.order)?);
        }

        if let Some(value) = opts.get("fields") {
            let fields_path = format!("{path}.$.fields");
            let Value::Array(items) = value else {
                return Err(SchemaError::invalid(&fields_path, "fields must be an array"));
            };
            let mut fields = Vec::with_capacity(items.len());
            for item in items {
                let Some(name) = item.as_str() else {
                    return Err(SchemaError::invalid(&fields_path, "fields must be strings"));
                };
                if resolved && name != "id" && self.blob_attr(etype, name).is_none() {
                    return Err(SchemaError::UnknownAttribute {
                        path: format!("{path}.{name}"),
                    });
                }
                fields.push(name.to_string());
            }
            out.fields = Some(fields);
        }

        out.rule_params = opts.get("ruleParams").cloned();
        Ok(out)
    }

    fn blob_attr(&self, etype: &str, label: &str) -> Option<&tessel_sync_types::Attribute> {
        self.schema.forward(etype, label).filter(|a| !a.is_ref())
    }

    fn order(
        &self,
        etype: &str,
        path: &str,
        value: &Value,
        resolved: bool,
    ) -> Result<Order, SchemaError> {
        let Some((field, dir)) = value.as_object().and_then(|m| {
            if m.len() == 1 {
                m.iter().next()
            } else {
                None
            }
        }) else {
            return Err(SchemaError::invalid(path, "order takes exactly one field"));
        };
        let direction = match dir.as_str() {
            Some("asc") => Direction::Asc,
            Some("desc") => Direction::Desc,
            _ => return Err(SchemaError::invalid(path, "direction must be asc or desc")),
        };
        if field == CREATED_AT_FIELD {
            return Ok(Order {
                field: OrderField::CreatedAt,
                direction,
            });
        }
        let attr = if resolved {
            let attr = self
                .blob_attr(etype, field)
                .ok_or_else(|| SchemaError::UnknownAttribute {
                    path: format!("{path}.{field}"),
                })?;
            Some(attr.id)
        } else {
            None
        };
        Ok(Order {
            field: OrderField::Attr {
                label: field.clone(),
                attr,
            },
            direction,
        })
    }

    fn where_clause(
        &self,
        etype: &str,
        path: &str,
        clause: &Map<String, Value>,
    ) -> Result<WhereClause, SchemaError> {
        let mut parts = Vec::new();
        for (key, value) in clause {
            match key.as_str() {
                "and" | "or" => {
                    let Value::Array(items) = value else {
                        return Err(SchemaError::invalid(
                            &format!("{path}.{key}"),
                            "expected an array of clauses",
                        ));
                    };
                    let mut subs = Vec::with_capacity(items.len());
                    for (i, item) in items.iter().enumerate() {
                        let sub_path = format!("{path}.{key}[{i}]");
                        let Value::Object(item) = item else {
                            return Err(SchemaError::invalid(&sub_path, "expected an object"));
                        };
                        subs.push(self.where_clause(etype, &sub_path, item)?);
                    }
                    parts.push(if key == "and" {
                        WhereClause::And(subs)
                    } else {
                        WhereClause::Or(subs)
                    });
                }
                field => parts.extend(self.conditions(etype, path, field, value)?),
            }
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            WhereClause::And(parts)
        })
    }

    fn conditions(
        &self,
        etype: &str,
        path: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<WhereClause>, SchemaError> {
        let field_path = format!("{path}.{field}");
        let (hops, terminal, date_typed) = self.resolve_path(etype, &field_path, field)?;
        let operand = |v: &Value| -> Value {
            if date_typed {
                date_millis(v).map(Value::from).unwrap_or_else(|| v.clone())
            } else {
                v.clone()
            }
        };

        let ops = match value {
            Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => {
                let mut ops = Vec::with_capacity(map.len());
                for (op, arg) in map {
                    let op_path = format!("{field_path}.{op}");
                    ops.push(match op.as_str() {
                        "$gt" => Op::Gt(operand(arg)),
                        "$gte" => Op::Gte(operand(arg)),
                        "$lt" => Op::Lt(operand(arg)),
                        "$lte" => Op::Lte(operand(arg)),
                        "$not" | "$ne" => Op::Ne(operand(arg)),
                        "$in" => match arg {
                            Value::Array(items) => Op::In(items.iter().map(operand).collect()),
                            _ => return Err(SchemaError::invalid(&op_path, "$in takes an array")),
                        },
                        "$like" | "$ilike" => match arg {
                            Value::String(pattern) => Op::Like {
                                pattern: pattern.clone(),
                                case_insensitive: op == "$ilike",
                            },
                            _ => return Err(SchemaError::invalid(&op_path, "pattern must be a string")),
                        },
                        "$isNull" => match arg {
                            Value::Bool(b) => Op::IsNull(*b),
                            _ => return Err(SchemaError::invalid(&op_path, "$isNull takes a boolean")),
                        },
                        other => {
                            return Err(SchemaError::invalid(
                                &op_path,
                                format!("unknown operator `{other}`"),
                            ))
                        }
                    });
                }
                ops
            }
            Value::Null => vec![Op::IsNull(true)],
            other => vec![Op::Eq(operand(other))],
        };

        Ok(ops
            .into_iter()
            .map(|op| {
                WhereClause::Cond(Condition {
                    hops: hops.clone(),
                    terminal,
                    op,
                })
            })
            .collect())
    }

    /// Resolve `a.b.c` from `etype`: every segment but the last is a link.
    #[allow(clippy::type_complexity)]
    fn resolve_path(
        &self,
        etype: &str,
        path: &str,
        field: &str,
    ) -> Result<(Vec<(AttrId, LinkDirection)>, Terminal, bool), SchemaError> {
        let segments: Vec<&str> = field.split('.').collect();
        let (last, links) = segments
            .split_last()
            .ok_or_else(|| SchemaError::invalid(path, "empty field"))?;
        let mut current = etype.to_string();
        let mut hops = Vec::with_capacity(links.len());
        for seg in links {
            let (attr, dir, target) =
                self.schema
                    .link(&current, seg)
                    .ok_or_else(|| SchemaError::UnknownLink {
                        path: path.to_string(),
                    })?;
            hops.push((attr.id, dir));
            current = target.to_string();
        }

        if *last == "id" {
            return Ok((hops, Terminal::Id, false));
        }
        if let Some(attr) = self.blob_attr(&current, last) {
            let date_typed = attr.checked_data_type == Some(DataType::Date);
            return Ok((hops, Terminal::Attr(attr.id), date_typed));
        }
        if let Some((attr, dir, _)) = self.schema.link(&current, last) {
            return Ok((hops, Terminal::Link(attr.id, dir), false));
        }
        Err(SchemaError::UnknownAttribute {
            path: path.to_string(),
        })
    }
}

fn count(path: &str, value: &Value) -> Result<usize, SchemaError> {
    value
        .as_u64()
        .map(|n| usize::try_from(n).unwrap_or(usize::MAX))
        .ok_or_else(|| SchemaError::invalid(path, "expected a non-negative integer"))
}

fn cursor(
    path: &str,
    value: &Value,
    order: &Order,
) -> Result<crate::pagination::SortKey, SchemaError> {
    let invalid = |reason: String| SchemaError::InvalidCursor {
        path: path.to_string(),
        reason,
    };
    let encoded = value
        .as_str()
        .ok_or_else(|| invalid("cursor must be a string".into()))?;
    let cursor = PageCursor::decode(encoded).map_err(|e| invalid(e.to_string()))?;
    if cursor.attr != order.field.name() {
        return Err(invalid(format!(
            "cursor was issued for order `{}`, query orders by `{}`",
            cursor.attr,
            order.field.name()
        )));
    }
    Ok(cursor.sort_key())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessel_sync_types::{Attribute, EntityId, Identity};

    fn schema() -> Schema {
        Schema::from_attrs(vec![
            Attribute::id_attr("goals"),
            Attribute::blob("goals", "title"),
            Attribute::id_attr("todos"),
            Attribute::blob("todos", "title"),
            Attribute::blob("todos", "due").with_data_type(DataType::Date),
            Attribute::link(
                Identity::new("todos", "goal"),
                Identity::new("goals", "todos"),
                Cardinality::One,
            ),
        ])
    }

    #[test]
    fn compiles_nested_query() {
        let q = Query::compile(&json!({"goals": {"todos": {}}}), &schema()).unwrap();
        let goals = &q.nodes[0];
        assert_eq!(goals.etype, "goals");
        let todos = &goals.children[0];
        assert_eq!(todos.etype, "todos");
        let link = todos.link.unwrap();
        assert_eq!(link.direction, LinkDirection::Reverse);
        assert!(!link.single);
    }

    #[test]
    fn forward_card_one_link_is_single() {
        let q = Query::compile(&json!({"todos": {"goal": {}}}), &schema()).unwrap();
        assert!(q.nodes[0].children[0].link.unwrap().single);
    }

    #[test]
    fn unknown_namespace_names_path() {
        let err = Query::compile(&json!({"goalz": {}}), &schema()).unwrap_err();
        assert_eq!(
            err,
            SchemaError::UnknownNamespace {
                path: "goalz".into()
            }
        );
    }

    #[test]
    fn unknown_link_names_path() {
        let err = Query::compile(&json!({"goals": {"tasks": {}}}), &schema()).unwrap_err();
        assert_eq!(err.path(), "goals.tasks");
    }

    #[test]
    fn unknown_where_field_names_path() {
        let err = Query::compile(
            &json!({"goals": {"$": {"where": {"titel": "x"}}}}),
            &schema(),
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownAttribute { .. }));
        assert_eq!(err.path(), "goals.$.where.titel");
    }

    #[test]
    fn unknown_order_field_fails() {
        let err = Query::compile(
            &json!({"goals": {"$": {"order": {"rank": "asc"}}}}),
            &schema(),
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownAttribute { .. }));
    }

    #[test]
    fn unknown_operator_fails() {
        let err = Query::compile(
            &json!({"goals": {"$": {"where": {"title": {"$regex": "x"}}}}}),
            &schema(),
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidQuery { .. }));
    }

    #[test]
    fn dotted_where_path_resolves_links() {
        let q = Query::compile(
            &json!({"goals": {"$": {"where": {"todos.title": "x"}}}}),
            &schema(),
        )
        .unwrap();
        match &q.nodes[0].opts.where_clause {
            Some(WhereClause::Cond(c)) => {
                assert_eq!(c.hops.len(), 1);
                assert!(matches!(c.terminal, Terminal::Attr(_)));
            }
            other => panic!("unexpected clause {other:?}"),
        }
    }

    #[test]
    fn date_operands_are_normalized() {
        let q = Query::compile(
            &json!({"todos": {"$": {"where": {"due": {"$gt": "1970-01-02"}}}}}),
            &schema(),
        )
        .unwrap();
        match &q.nodes[0].opts.where_clause {
            Some(WhereClause::Cond(c)) => assert_eq!(c.op, Op::Gt(json!(86_400_000))),
            other => panic!("unexpected clause {other:?}"),
        }
    }

    #[test]
    fn cursor_must_match_order() {
        let cursor = PageCursor::new(EntityId::new(), "title", json!("a")).encode();
        let err = Query::compile(
            &json!({"goals": {"$": {"after": cursor, "first": 2}}}),
            &schema(),
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidCursor { .. }));

        let ok = Query::compile(
            &json!({"goals": {"$": {"after": cursor, "first": 2, "order": {"title": "asc"}}}}),
            &schema(),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn empty_schema_compiles_unresolved() {
        let q = Query::compile(&json!({"anything": {"nested": {}}}), &Schema::new()).unwrap();
        assert!(!q.nodes[0].resolved);
        assert!(!q.nodes[0].children[0].resolved);
    }

    #[test]
    fn projection_skips_links_and_id() {
        let q = Query::compile(&json!({"todos": {}}), &schema()).unwrap();
        let labels: Vec<&str> = q.nodes[0]
            .projection
            .iter()
            .map(|p| p.label.as_str())
            .collect();
        assert_eq!(labels, vec!["due", "title"]);
    }

    #[test]
    fn etypes_cover_nested_nodes() {
        let q = Query::compile(&json!({"goals": {"todos": {}}}), &schema()).unwrap();
        let etypes: Vec<String> = q.etypes().into_iter().collect();
        assert_eq!(etypes, vec!["goals".to_string(), "todos".to_string()]);
    }
}
