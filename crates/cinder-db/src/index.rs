//! Incrementally maintained indexes.
//!
//! An index maps each live document through a key function and keeps the
//! results sorted by emitted key, then document key. It remembers the head
//! it last saw and, on refresh, re-maps only the documents changed since
//! then. When that cursor has been invalidated by compaction the index is
//! rebuilt from `all_docs`.

use crate::crdt::Crdt;
use crate::document::{new_doc_id, ChangesOptions, Document};
use crate::error::{DbError, Result};
use cinder_merkle::ClockHead;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Key function: the emitted key for a document, or `None` to skip it.
pub type MapFn = Arc<dyn Fn(&Document) -> Option<Value> + Send + Sync>;

/// What an index is built from.
#[derive(Clone)]
pub enum IndexSource {
    /// A top-level document field; the index is named after it.
    Field(String),
    /// A caller-named key function.
    Named { name: String, map: MapFn },
    /// An unnamed key function. Gets a generated name and is never shared.
    Anonymous(MapFn),
}

impl IndexSource {
    pub fn field(name: impl Into<String>) -> Self {
        IndexSource::Field(name.into())
    }

    pub fn named<F>(name: impl Into<String>, map: F) -> Self
    where
        F: Fn(&Document) -> Option<Value> + Send + Sync + 'static,
    {
        IndexSource::Named {
            name: name.into(),
            map: Arc::new(map),
        }
    }

    pub fn anonymous<F>(map: F) -> Self
    where
        F: Fn(&Document) -> Option<Value> + Send + Sync + 'static,
    {
        IndexSource::Anonymous(Arc::new(map))
    }

    /// The cache name, if this source may be shared.
    pub fn cache_name(&self) -> Option<&str> {
        match self {
            IndexSource::Field(name) | IndexSource::Named { name, .. } => Some(name),
            IndexSource::Anonymous(_) => None,
        }
    }

    pub(crate) fn into_parts(self) -> (String, MapFn) {
        match self {
            IndexSource::Field(field) => {
                let key = field.clone();
                let map: MapFn = Arc::new(move |doc: &Document| doc.get(&key).cloned());
                (field, map)
            }
            IndexSource::Named { name, map } => (name, map),
            IndexSource::Anonymous(map) => (format!("anon-{}", new_doc_id()), map),
        }
    }
}

impl fmt::Debug for IndexSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexSource::Field(name) => write!(f, "Field({})", name),
            IndexSource::Named { name, .. } => write!(f, "Named({})", name),
            IndexSource::Anonymous(_) => write!(f, "Anonymous"),
        }
    }
}

/// Options for index queries.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    /// Maximum rows (default: unbounded).
    pub limit: Option<usize>,
    /// Reverse order.
    pub descending: bool,
    /// Inclusive bounds on the emitted key.
    pub range: Option<(Value, Value)>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IndexRow {
    /// Emitted key.
    pub key: Value,
    /// Document key.
    pub id: String,
    pub value: Document,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct IndexResponse {
    pub rows: Vec<IndexRow>,
    /// Head the rows were computed at.
    pub clock: ClockHead,
}

/// An emitted key under index collation:
/// null < booleans < numbers < strings < arrays < objects.
#[derive(Clone, Debug)]
pub struct IndexKey(pub Value);

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        collate(&self.0, &other.0)
    }
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

pub fn collate(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => collate_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(l, r)| collate(l, r))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x
            .iter()
            .zip(y)
            .map(|((lk, lv), (rk, rv))| lk.cmp(rk).then_with(|| collate(lv, rv)))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Integers compare exactly; a float on either side compares as `f64`.
fn collate_numbers(x: &Number, y: &Number) -> Ordering {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a.cmp(&b);
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a.cmp(&b);
    }
    match (x.is_f64() || y.is_f64(), x.as_i64(), y.as_i64()) {
        // Both integers: one is negative, the other above i64::MAX.
        (false, Some(_), None) => Ordering::Less,
        (false, None, Some(_)) => Ordering::Greater,
        _ => match (x.as_f64(), y.as_f64()) {
            (Some(a), Some(b)) => a.total_cmp(&b),
            _ => x.to_string().cmp(&y.to_string()),
        },
    }
}

#[derive(Default)]
struct IndexState {
    cursor: ClockHead,
    built: bool,
    entries: BTreeMap<(IndexKey, String), Document>,
    by_doc: HashMap<String, IndexKey>,
}

impl IndexState {
    fn apply(&mut self, map: &MapFn, doc: Document) {
        if let Some(old) = self.by_doc.remove(&doc.id) {
            self.entries.remove(&(old, doc.id.clone()));
        }
        if doc.deleted {
            return;
        }
        if let Some(key) = map(&doc) {
            let key = IndexKey(key);
            self.by_doc.insert(doc.id.clone(), key.clone());
            self.entries.insert((key, doc.id.clone()), doc);
        }
    }
}

pub struct Index {
    name: String,
    map: MapFn,
    crdt: Arc<Crdt>,
    state: RwLock<IndexState>,
    /// One refresh at a time.
    refreshing: tokio::sync::Mutex<()>,
}

impl Index {
    pub(crate) fn new(source: IndexSource, crdt: Arc<Crdt>) -> Self {
        let (name, map) = source.into_parts();
        Index {
            name,
            map,
            crdt,
            state: RwLock::new(IndexState::default()),
            refreshing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Head the materialized rows reflect.
    pub fn cursor(&self) -> ClockHead {
        self.state.read().cursor.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Catch up with the database head.
    pub async fn refresh(&self) -> Result<ClockHead> {
        let _refreshing = self.refreshing.lock().await;
        let (cursor, built) = {
            let state = self.state.read();
            (state.cursor.clone(), state.built)
        };
        if !built {
            return Ok(self.rebuild());
        }
        if cursor == self.crdt.head() {
            return Ok(cursor);
        }

        match self.crdt.changes(&cursor, &ChangesOptions::default()).await {
            Ok(changes) => {
                let rows = changes.rows.len();
                let mut state = self.state.write();
                for row in changes.rows {
                    state.apply(&self.map, row.value);
                }
                state.cursor = changes.clock.clone();
                debug!(index = %self.name, rows, entries = state.entries.len(), "index refreshed");
                Ok(changes.clock)
            }
            Err(DbError::StaleCursor) => {
                info!(index = %self.name, "index cursor stale, rebuilding");
                Ok(self.rebuild())
            }
            Err(e) => Err(e),
        }
    }

    fn rebuild(&self) -> ClockHead {
        let all = self.crdt.all_docs();
        let mut next = IndexState {
            cursor: all.clock.clone(),
            built: true,
            ..Default::default()
        };
        for row in all.rows {
            next.apply(&self.map, row.value);
        }
        debug!(index = %self.name, entries = next.entries.len(), "index rebuilt");
        *self.state.write() = next;
        all.clock
    }

    /// Refresh, then read. A failed refresh is logged and the last good
    /// rows are served; the next refresh retries.
    pub async fn query(&self, opts: &QueryOptions) -> IndexResponse {
        if let Err(e) = self.refresh().await {
            warn!(index = %self.name, error = %e, "index refresh failed");
        }
        self.read(opts)
    }

    /// Read the materialized rows without refreshing.
    pub fn read(&self, opts: &QueryOptions) -> IndexResponse {
        let state = self.state.read();
        let in_range = |key: &IndexKey| match &opts.range {
            Some((low, high)) => collate(&key.0, low).is_ge() && collate(&key.0, high).is_le(),
            None => true,
        };
        let to_row = |((key, id), doc): (&(IndexKey, String), &Document)| IndexRow {
            key: key.0.clone(),
            id: id.clone(),
            value: doc.clone(),
        };
        let limit = opts.limit.unwrap_or(usize::MAX);

        let rows = if opts.descending {
            state
                .entries
                .iter()
                .rev()
                .filter(|((key, _), _)| in_range(key))
                .take(limit)
                .map(to_row)
                .collect()
        } else {
            state
                .entries
                .iter()
                .filter(|((key, _), _)| in_range(key))
                .take(limit)
                .map(to_row)
                .collect()
        };

        IndexResponse {
            rows,
            clock: state.cursor.clone(),
        }
    }
}
