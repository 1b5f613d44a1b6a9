//! Pagination windows over sorted query results.
//!
//! Rows are ordered by `(sort value, entity id)`: the sort value follows the
//! requested direction, the entity id always ascends. Cursors capture that
//! pair, so they re-resolve by value instead of by position and stay
//! meaningful while rows are inserted or deleted around them.
//!
//! - `after` keeps rows strictly greater than the boundary, `before` rows
//!   strictly less.
//! - `first`/`limit` and `last` trim the window; the next or previous page
//!   exists when one more row is present beyond the trimmed edge.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::ops::Range;
use tessel_sync_types::{EntityId, SyncError};

/// Sort direction of the primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Smallest first.
    #[default]
    Asc,
    /// Largest first.
    Desc,
}

/// Position of a row in sort order.
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    /// Primary sort value.
    pub value: Value,
    /// Tie-break.
    pub id: EntityId,
}

impl SortKey {
    /// Create a sort key.
    pub fn new(value: Value, id: EntityId) -> Self {
        Self { value, id }
    }
}

/// Total order over JSON values: null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = x.as_f64().unwrap_or(0.0);
                    let y = y.as_f64().unwrap_or(0.0);
                    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                }
            }
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Compare two rows in result order.
pub fn compare_keys(a: &SortKey, b: &SortKey, direction: Direction) -> Ordering {
    let primary = match direction {
        Direction::Asc => compare_values(&a.value, &b.value),
        Direction::Desc => compare_values(&b.value, &a.value),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

/// Opaque pagination boundary.
///
/// Encoded as URL-safe base64 of the JSON array `[id, attr, value]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PageCursor {
    /// Entity id of the boundary row.
    pub id: EntityId,
    /// Order field the value was taken from.
    pub attr: String,
    /// Sort value of the boundary row.
    pub value: Value,
}

#[derive(Serialize, Deserialize)]
struct CursorRepr(EntityId, String, Value);

impl PageCursor {
    /// Cursor for a row.
    pub fn new(id: EntityId, attr: impl Into<String>, value: Value) -> Self {
        Self {
            id,
            attr: attr.into(),
            value,
        }
    }

    /// Encode to the opaque string form.
    pub fn encode(&self) -> String {
        let repr = CursorRepr(self.id, self.attr.clone(), self.value.clone());
        let json = serde_json::to_vec(&repr).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode the opaque string form.
    pub fn decode(s: &str) -> Result<Self, SyncError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s.as_bytes())
            .map_err(|e| SyncError::InvalidCursor(e.to_string()))?;
        let CursorRepr(id, attr, value) = serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::InvalidCursor(e.to_string()))?;
        Ok(Self { id, attr, value })
    }

    /// The boundary as a sort key.
    pub fn sort_key(&self) -> SortKey {
        SortKey::new(self.value.clone(), self.id)
    }
}

/// Window requested by a query's `$` block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Window {
    /// Rows to skip.
    pub offset: Option<usize>,
    /// Maximum rows (same as `first`).
    pub limit: Option<usize>,
    /// Maximum rows from the start of the window.
    pub first: Option<usize>,
    /// Keep rows strictly after this boundary.
    pub after: Option<SortKey>,
    /// Maximum rows from the end of the window.
    pub last: Option<usize>,
    /// Keep rows strictly before this boundary.
    pub before: Option<SortKey>,
}

/// A resolved window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Selected rows.
    pub range: Range<usize>,
    /// Rows exist after the window.
    pub has_next_page: bool,
    /// Rows exist before the window.
    pub has_previous_page: bool,
}

/// Resolve a window against rows already sorted by [`compare_keys`].
pub fn resolve_window(keys: &[SortKey], direction: Direction, window: &Window) -> Page {
    let mut start = 0;
    let mut end = keys.len();

    if let Some(after) = &window.after {
        start = keys.partition_point(|k| compare_keys(k, after, direction) != Ordering::Greater);
    }
    if let Some(before) = &window.before {
        end = keys.partition_point(|k| compare_keys(k, before, direction) == Ordering::Less);
    }
    end = end.max(start);

    // Counts come straight from the query; they may be arbitrarily large.
    if let Some(offset) = window.offset {
        start = start.saturating_add(offset).min(end);
    }
    if let Some(n) = window.first.or(window.limit) {
        if n < end - start {
            end = start + n;
        }
    }
    if let Some(n) = window.last {
        if end - start > n {
            start = end - n;
        }
    }

    Page {
        range: start..end,
        has_next_page: end < keys.len(),
        has_previous_page: start > 0,
    }
}

/// Page metadata reported alongside query results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// Cursor of the first row in the window.
    pub start_cursor: Option<String>,
    /// Cursor of the last row in the window.
    pub end_cursor: Option<String>,
    /// Rows exist after the window.
    pub has_next_page: bool,
    /// Rows exist before the window.
    pub has_previous_page: bool,
}

/// Accumulates successive windows into one list for infinite scrolling.
///
/// Each window keeps its latest rows; [`PageAccumulator::items`] concatenates
/// them in window order and drops rows whose id was already seen.
#[derive(Debug, Clone, Default)]
pub struct PageAccumulator {
    windows: Vec<Vec<Value>>,
}

impl PageAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new window and return its index.
    pub fn push_window(&mut self, rows: Vec<Value>) -> usize {
        self.windows.push(rows);
        self.windows.len() - 1
    }

    /// Replace the rows of an existing window.
    pub fn set_window(&mut self, index: usize, rows: Vec<Value>) {
        if let Some(slot) = self.windows.get_mut(index) {
            *slot = rows;
        }
    }

    /// All rows, deduplicated by `id`.
    pub fn items(&self) -> Vec<Value> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for row in self.windows.iter().flatten() {
            let key = row.get("id").map(Value::to_string).unwrap_or_else(|| row.to_string());
            if seen.insert(key) {
                out.push(row.clone());
            }
        }
        out
    }
}
