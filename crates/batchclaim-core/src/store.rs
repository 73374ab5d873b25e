//! Store-facing contract: filtered reads and guarded bulk writes.
//!
//! The claimer and lease monitor drive; the store executes. Connectivity,
//! pooling and wire protocol live behind this boundary.
//!
//! Every write is conditional. The guard filter is re-evaluated by the store
//! at write time, and the store reports which documents actually matched, so
//! callers never act on documents another actor advanced in the meantime.
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored document: one JSON object.
pub type Document = serde_json::Map<String, Value>;

/// Identifier of a stored document.
///
/// Store-assigned and opaque to the core. Integers are normalized so that a
/// non-negative number always maps to [`DocumentId::Unsigned`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DocumentId {
    Signed(i64),
    Unsigned(u64),
    Str(String),
}

impl DocumentId {
    /// Read an identifier from a JSON value. Returns `None` for values that
    /// are not identifier-like (floats, objects, null, ...).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Number(n) => n
                .as_u64()
                .map(Self::Unsigned)
                .or_else(|| n.as_i64().map(Self::Signed)),
            _ => None,
        }
    }

    /// JSON form used when matching the id field in the store.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Signed(v) => Value::from(*v),
            Self::Unsigned(v) => Value::from(*v),
            Self::Str(s) => Value::from(s.as_str()),
        }
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signed(v) => v.fmt(f),
            Self::Unsigned(v) => v.fmt(f),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<u64> for DocumentId {
    fn from(value: u64) -> Self {
        Self::Unsigned(value)
    }
}

impl From<i64> for DocumentId {
    fn from(value: i64) -> Self {
        u64::try_from(value)
            .map(Self::Unsigned)
            .unwrap_or(Self::Signed(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Field equals the value.
    Eq,
    /// Field is strictly less than the value. Only numbers and strings are
    /// ordered; a missing field never matches.
    Lt,
}

/// One predicate on a top-level document field.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: Comparison,
    pub value: Value,
}

/// Conjunction of [`Condition`]s. The empty filter matches every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            op: Comparison::Eq,
            value: value.into(),
        });
        self
    }

    pub fn less_than(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            op: Comparison::Lt,
            value: value.into(),
        });
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Evaluate the filter against a document held in memory.
    pub fn matches(&self, document: &Document) -> bool {
        self.conditions.iter().all(|condition| {
            let Some(actual) = document.get(&condition.field) else {
                return false;
            };
            match condition.op {
                Comparison::Eq => *actual == condition.value,
                Comparison::Lt => {
                    compare_scalars(actual, &condition.value) == Some(std::cmp::Ordering::Less)
                }
            }
        })
    }
}

impl From<&serde_json::Map<String, Value>> for Filter {
    /// Equality conditions, one per entry.
    fn from(query: &serde_json::Map<String, Value>) -> Self {
        query
            .iter()
            .fold(Filter::new(), |filter, (field, value)| {
                filter.equals(field.clone(), value.clone())
            })
    }
}

fn compare_scalars(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    #[serde(alias = "asc")]
    Ascending,
    #[serde(alias = "desc")]
    Descending,
}

/// One ordering key for candidate selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub direction: Direction,
}

impl SortKey {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Ascending,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Descending,
        }
    }

    /// Order two documents by this key, for stores that sort in memory.
    ///
    /// Missing and null values sort first, then booleans, numbers and
    /// strings; anything else compares equal.
    pub fn compare(&self, lhs: &Document, rhs: &Document) -> std::cmp::Ordering {
        fn rank(value: Option<&Value>) -> u8 {
            match value {
                None | Some(Value::Null) => 0,
                Some(Value::Bool(_)) => 1,
                Some(Value::Number(_)) => 2,
                Some(Value::String(_)) => 3,
                Some(_) => 4,
            }
        }

        let a = lhs.get(&self.field);
        let b = rhs.get(&self.field);
        let ordering = rank(a).cmp(&rank(b)).then_with(|| match (a, b) {
            (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
            (Some(a), Some(b)) => compare_scalars(a, b).unwrap_or(std::cmp::Ordering::Equal),
            _ => std::cmp::Ordering::Equal,
        });
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

/// A guarded bulk write.
///
/// Applies `set` to every document whose `id_field` is one of `ids` and which
/// still satisfies `guard` when the store executes the write.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalUpdate {
    pub id_field: String,
    pub ids: Vec<DocumentId>,
    pub guard: Filter,
    pub set: Document,
}

/// Read and conditionally update documents in one collection.
#[trait_variant::make(DocumentStore: Send)]
pub trait LocalDocumentStore {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Documents matching `filter`, ordered by `sort` (store order when
    /// empty), at most `limit` of them when given.
    async fn find(
        &self,
        filter: &Filter,
        sort: &[SortKey],
        limit: Option<usize>,
    ) -> Result<Vec<Document>, Self::Error>;

    /// Execute `update` and return the ids it actually matched. Ids that were
    /// requested but failed the guard are absent from the result.
    async fn conditional_update(
        &self,
        update: &ConditionalUpdate,
    ) -> Result<Vec<DocumentId>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("fixture must be an object"),
        }
    }

    #[test]
    fn ids_normalize_integers() {
        assert_eq!(
            DocumentId::from_value(&json!(7)),
            Some(DocumentId::Unsigned(7))
        );
        assert_eq!(DocumentId::from(7_i64), DocumentId::Unsigned(7));
        assert_eq!(
            DocumentId::from_value(&json!(-3)),
            Some(DocumentId::Signed(-3))
        );
        assert_eq!(DocumentId::from_value(&json!(1.5)), None);
        assert_eq!(DocumentId::from("a").to_value(), json!("a"));
    }

    #[test]
    fn filter_combines_conditions() {
        let document = doc(json!({"state": "processing", "processing_time": 100}));
        let expired = Filter::new()
            .equals("state", "processing")
            .less_than("processing_time", 200);
        let fresh = Filter::new()
            .equals("state", "processing")
            .less_than("processing_time", 50);
        assert!(expired.matches(&document));
        assert!(!fresh.matches(&document));
        assert!(!Filter::new().less_than("missing", 1).matches(&document));
        assert!(Filter::new().matches(&document));
    }

    #[test]
    fn sort_places_missing_values_first() {
        let key = SortKey::ascending("priority");
        let a = doc(json!({"priority": 2}));
        let b = doc(json!({"priority": 10}));
        let none = doc(json!({}));
        assert_eq!(key.compare(&a, &b), std::cmp::Ordering::Less);
        assert_eq!(key.compare(&none, &a), std::cmp::Ordering::Less);
        assert_eq!(
            SortKey::descending("priority").compare(&a, &b),
            std::cmp::Ordering::Greater
        );
    }

    #[test]
    fn sort_key_accepts_short_direction_names() {
        let key: SortKey = serde_json::from_value(json!({"field": "n", "direction": "desc"}))
            .expect("valid sort key");
        assert_eq!(key, SortKey::descending("n"));
    }
}
