//! Table query descriptions.
//!
//! A `QueryDescription` is the structured form of a table query: a filter
//! tree, an ordering, and skip/top paging. Remote implementations translate
//! it to their wire format; the in-memory store evaluates it directly.

use crate::row::{columns, is_tombstone, parse_timestamp, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Comparison operator in a filter clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
}

impl CompareOp {
    fn accepts(self, ordering: Option<Ordering>) -> bool {
        match (self, ordering) {
            (CompareOp::Ne, None) => true,
            (_, None) => false,
            (CompareOp::Eq, Some(o)) => o == Ordering::Equal,
            (CompareOp::Ne, Some(o)) => o != Ordering::Equal,
            (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
            (CompareOp::Ge, Some(o)) => o != Ordering::Less,
            (CompareOp::Lt, Some(o)) => o == Ordering::Less,
            (CompareOp::Le, Some(o)) => o != Ordering::Greater,
        }
    }
}

/// A filter expression over row columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// `field <op> value`.
    Compare {
        /// Column name.
        field: String,
        /// Operator.
        op: CompareOp,
        /// Right-hand operand.
        value: Value,
    },
    /// Both sides must match.
    And(Box<Filter>, Box<Filter>),
    /// Either side must match.
    Or(Box<Filter>, Box<Filter>),
    /// Negation.
    Not(Box<Filter>),
}

impl Filter {
    /// Builds a comparison clause.
    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Filter::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// `field == value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    /// `field >= value`.
    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ge, value)
    }

    /// `field < value`.
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Lt, value)
    }

    /// Conjunction with another filter.
    pub fn and(self, other: Filter) -> Self {
        Filter::And(Box::new(self), Box::new(other))
    }

    /// Disjunction with another filter.
    pub fn or(self, other: Filter) -> Self {
        Filter::Or(Box::new(self), Box::new(other))
    }

    /// Negation of this filter.
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Evaluates the filter against a row. Missing columns compare as `null`.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::Compare { field, op, value } => {
                let actual = row.get(field).unwrap_or(&Value::Null);
                op.accepts(compare_values(actual, value))
            }
            Filter::And(left, right) => left.matches(row) && right.matches(row),
            Filter::Or(left, right) => left.matches(row) || right.matches(row),
            Filter::Not(inner) => !inner.matches(row),
        }
    }
}

/// Compares two JSON values.
///
/// Numbers compare numerically. Two strings that both parse as RFC 3339
/// timestamps compare as instants, otherwise lexically. Values of different
/// types are unordered.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => match (parse_timestamp(a), parse_timestamp(b)) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => Some(a.cmp(b)),
        },
        _ => None,
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// One ordering clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Column name.
    pub field: String,
    /// Direction.
    pub direction: SortDirection,
}

/// A structured query against one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescription {
    /// Table name.
    pub table: String,
    /// Optional filter.
    pub filter: Option<Filter>,
    /// Ordering clauses, applied in order.
    pub ordering: Vec<OrderBy>,
    /// Rows to skip.
    pub skip: Option<u64>,
    /// Maximum rows to return.
    pub top: Option<u64>,
    /// Whether tombstoned rows are returned.
    pub include_deleted: bool,
    /// Projected columns (empty means all).
    pub selection: Vec<String>,
}

impl QueryDescription {
    /// Creates a query over every row of a table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
            ordering: Vec::new(),
            skip: None,
            top: None,
            include_deleted: false,
            selection: Vec::new(),
        }
    }

    /// Sets the filter, combining with any existing one by conjunction.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    /// Appends an ordering clause.
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.ordering.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// Sets the skip count.
    #[must_use]
    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Sets the top count.
    #[must_use]
    pub fn with_top(mut self, top: u64) -> Self {
        self.top = Some(top);
        self
    }

    /// Includes tombstoned rows.
    #[must_use]
    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Restricts the returned columns. `id` is always returned.
    #[must_use]
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selection = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Returns true if the row passes the filter and tombstone rules.
    pub fn matches(&self, row: &Row) -> bool {
        if !self.include_deleted && is_tombstone(row) {
            return false;
        }
        self.filter.as_ref().map_or(true, |f| f.matches(row))
    }

    /// Evaluates the whole query (filter, ordering, paging, projection) over rows.
    pub fn apply<'a, I>(&self, rows: I) -> Vec<Row>
    where
        I: IntoIterator<Item = &'a Row>,
    {
        let mut matched: Vec<&Row> = rows.into_iter().filter(|r| self.matches(r)).collect();

        if !self.ordering.is_empty() {
            matched.sort_by(|a, b| self.compare_rows(a, b));
        }

        let skip = self.skip.unwrap_or(0) as usize;
        let top = self.top.map_or(usize::MAX, |t| t as usize);

        matched
            .into_iter()
            .skip(skip)
            .take(top)
            .map(|row| self.project(row))
            .collect()
    }

    fn compare_rows(&self, a: &Row, b: &Row) -> Ordering {
        for clause in &self.ordering {
            let left = a.get(&clause.field).unwrap_or(&Value::Null);
            let right = b.get(&clause.field).unwrap_or(&Value::Null);
            let ordering = compare_values(left, right).unwrap_or(Ordering::Equal);
            let ordering = match clause.direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    fn project(&self, row: &Row) -> Row {
        if self.selection.is_empty() {
            return row.clone();
        }
        row.iter()
            .filter(|(name, _)| {
                name.as_str() == columns::ID || self.selection.iter().any(|s| s == *name)
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}
