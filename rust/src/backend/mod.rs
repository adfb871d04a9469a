//! The hosted backend seam: record queries, inserts, change feeds, identity and blobs.
//!
//! The core never talks to a process-wide client. Every component receives a
//! [`SharedBackend`] at construction; tests inject a [`memory::MemoryBackend`].

pub mod memory;
pub mod realtime;
pub mod records;
pub mod rest;

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use flume::Sender;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use crate::error::BackendError;

pub type SharedBackend = Arc<dyn Backend>;

/// Authenticated user as reported by the identity accessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub email: Option<String>,
}

/// `column = value` equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnEq {
    pub column: String,
    pub value: String,
}

impl ColumnEq {
    pub fn new(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    fn matches(&self, row: &Value) -> bool {
        match row.get(&self.column) {
            Some(Value::String(s)) => s == &self.value,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

/// Disjunction of conjunctions over column equalities. No clauses means "every row".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Predicate {
    pub any_of: Vec<Vec<ColumnEq>>,
}

impl Predicate {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            any_of: vec![vec![ColumnEq::new(column, value)]],
        }
    }

    pub fn any_of(clauses: Vec<Vec<ColumnEq>>) -> Self {
        Self { any_of: clauses }
    }

    pub fn is_all(&self) -> bool {
        self.any_of.is_empty()
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.is_all()
            || self
                .any_of
                .iter()
                .any(|clause| clause.iter().all(|eq| eq.matches(row)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }
}

/// `select(table, predicate, orderBy)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Select {
    pub table: String,
    pub predicate: Predicate,
    pub order: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Select {
    pub fn from_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            predicate: Predicate::all(),
            order: None,
            limit: None,
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn order(mut self, order: OrderBy) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// Filter wildcard; never carried by an event.
    Any,
    /// Last event of a feed the backend ended without [`Backend::unsubscribe`].
    /// Carries no rows and is never used as a filter.
    Closed,
}

impl ChangeKind {
    pub fn as_wire(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
            ChangeKind::Any | ChangeKind::Closed => "*",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            "*" => Some(ChangeKind::Any),
            _ => None,
        }
    }
}

/// What a change subscription listens for: an event kind plus at most one column equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub kind: ChangeKind,
    pub column_eq: Option<ColumnEq>,
}

impl ChangeFilter {
    pub fn inserts_where(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Insert,
            column_eq: Some(ColumnEq::new(column, value)),
        }
    }

    pub fn all_where(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Any,
            column_eq: Some(ColumnEq::new(column, value)),
        }
    }

    pub fn matches(&self, kind: ChangeKind, row: &Value) -> bool {
        let kind_ok = self.kind == ChangeKind::Any || self.kind == kind;
        kind_ok && self.column_eq.as_ref().map_or(true, |eq| eq.matches(row))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(pub u64);

/// One pushed row change, delivered on the sink passed to [`Backend::subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub subscription: SubscriptionHandle,
    pub table: String,
    pub kind: ChangeKind,
    pub new: Option<Value>,
    pub old: Option<Value>,
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Resolve the identity behind the current access token, if any.
    async fn current_identity(&self) -> Result<Option<Identity>, BackendError>;

    /// Install (or clear) the bearer token used for subsequent calls.
    fn set_access_token(&self, token: Option<String>);

    async fn select(&self, query: Select) -> Result<Vec<Value>, BackendError>;

    /// Insert one row; returns the stored row with server-assigned fields.
    async fn insert(&self, table: &str, row: Value) -> Result<Value, BackendError>;

    /// Merge `patch` into every row matching `predicate`; returns the updated rows.
    async fn update(
        &self,
        table: &str,
        predicate: &Predicate,
        patch: Value,
    ) -> Result<Vec<Value>, BackendError>;

    /// Start pushing matching changes onto `sink` until [`Backend::unsubscribe`].
    /// A feed that ends on the backend side sends one [`ChangeKind::Closed`] event first.
    async fn subscribe(
        &self,
        table: &str,
        filter: ChangeFilter,
        sink: Sender<ChangeEvent>,
    ) -> Result<SubscriptionHandle, BackendError>;

    /// Stop a subscription and drop its sink. Unknown handles are ignored.
    async fn unsubscribe(&self, handle: SubscriptionHandle);

    /// Store `bytes` at `bucket/path`; returns the stored path.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BackendError>;

    fn public_url(&self, bucket: &str, path: &str) -> String;
}

pub fn decode_row<T: DeserializeOwned>(row: Value) -> Result<T, BackendError> {
    Ok(serde_json::from_value(row)?)
}

pub fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, BackendError> {
    rows.into_iter().map(decode_row).collect()
}

/// Ordering used for `order by` over JSON cells: nulls first, then numbers,
/// RFC 3339 timestamps by instant, other strings by text.
pub(crate) fn compare_cells(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => {
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn predicate_is_disjunction_of_conjunctions() {
        let p = Predicate::any_of(vec![
            vec![ColumnEq::new("sender_id", "a"), ColumnEq::new("receiver_id", "b")],
            vec![ColumnEq::new("sender_id", "b"), ColumnEq::new("receiver_id", "a")],
        ]);
        assert!(p.matches(&json!({"sender_id": "a", "receiver_id": "b"})));
        assert!(p.matches(&json!({"sender_id": "b", "receiver_id": "a"})));
        assert!(!p.matches(&json!({"sender_id": "a", "receiver_id": "c"})));
        assert!(!p.matches(&json!({"sender_id": "a"})));
        assert!(Predicate::all().matches(&json!({})));
    }

    #[test]
    fn non_string_cells_compare_by_text() {
        let p = Predicate::eq("age", "30");
        assert!(p.matches(&json!({"age": 30})));
        assert!(!p.matches(&json!({"age": null})));
    }

    #[test]
    fn change_filter_checks_kind_and_column() {
        let f = ChangeFilter::inserts_where("receiver_id", "me");
        assert!(f.matches(ChangeKind::Insert, &json!({"receiver_id": "me"})));
        assert!(!f.matches(ChangeKind::Update, &json!({"receiver_id": "me"})));
        assert!(!f.matches(ChangeKind::Insert, &json!({"receiver_id": "you"})));
        let any = ChangeFilter::all_where("receiver_id", "me");
        assert!(any.matches(ChangeKind::Delete, &json!({"receiver_id": "me"})));
    }

    #[test]
    fn cells_order_nulls_first() {
        assert_eq!(
            compare_cells(None, Some(&json!("a"))),
            Ordering::Less
        );
        assert_eq!(
            compare_cells(Some(&json!(2)), Some(&json!(10))),
            Ordering::Less
        );
        assert_eq!(
            compare_cells(Some(&json!("b")), Some(&json!("a"))),
            Ordering::Greater
        );
    }

    #[test]
    fn timestamps_compare_by_instant() {
        let whole = json!("2024-05-01T10:00:03Z");
        let fraction = json!("2024-05-01T10:00:03.000001Z");
        let offset = json!("2024-05-01T12:00:02+02:00");
        assert_eq!(compare_cells(Some(&whole), Some(&fraction)), Ordering::Less);
        assert_eq!(compare_cells(Some(&offset), Some(&whole)), Ordering::Less);
        assert_eq!(
            compare_cells(Some(&json!("2024-05-01T10:00:03+00:00")), Some(&whole)),
            Ordering::Equal
        );
    }
}
