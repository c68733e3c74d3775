//! Remote table service abstraction.
//!
//! The engine never builds URLs or speaks HTTP itself. It hands structured
//! requests to a [`RemoteService`] and classifies the [`RemoteError`]s that
//! come back.

use crate::error::RemoteError;
use crate::operation::OperationKind;
use async_trait::async_trait;
use mobisync_core::{columns, QueryDescription, Row};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

/// Extra query-string parameters passed through to the service.
pub type Parameters = BTreeMap<String, String>;

/// System columns the service should include in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SystemProperties(u8);

impl SystemProperties {
    /// No system columns.
    pub const NONE: Self = Self(0);
    /// `createdAt`.
    pub const CREATED_AT: Self = Self(1);
    /// `updatedAt`.
    pub const UPDATED_AT: Self = Self(1 << 1);
    /// `version`.
    pub const VERSION: Self = Self(1 << 2);
    /// `deleted`.
    pub const DELETED: Self = Self(1 << 3);
    /// Every system column.
    pub const ALL: Self = Self(0b1111);

    /// Returns true if every flag of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the column names of the set flags.
    pub fn columns(self) -> Vec<&'static str> {
        [
            (Self::CREATED_AT, columns::CREATED_AT),
            (Self::UPDATED_AT, columns::UPDATED_AT),
            (Self::VERSION, columns::VERSION),
            (Self::DELETED, columns::DELETED),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect()
    }
}

impl BitOr for SystemProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Optional capabilities of a remote table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteFeatures {
    /// Honors `skip` and `top`.
    pub skip_top: bool,
    /// Honors ordering clauses.
    pub ordering: bool,
    /// Returns next-page links.
    pub next_links: bool,
}

impl Default for RemoteFeatures {
    fn default() -> Self {
        Self {
            skip_top: true,
            ordering: true,
            next_links: true,
        }
    }
}

/// A read against a remote table.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    /// The query to run.
    pub query: QueryDescription,
    /// Caller-supplied parameters.
    pub parameters: Parameters,
    /// System columns to include.
    pub system_properties: SystemProperties,
}

/// One page of results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadResponse {
    /// Rows of this page.
    pub rows: Vec<Row>,
    /// Link to the next page, if the service paginates.
    pub next_link: Option<String>,
}

impl ReadResponse {
    /// A response with no next link.
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows,
            next_link: None,
        }
    }

    /// Sets the next-page link.
    #[must_use]
    pub fn with_next_link(mut self, link: impl Into<String>) -> Self {
        self.next_link = Some(link.into());
        self
    }
}

/// The remote table service.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Runs a query.
    async fn read(&self, table: &str, request: &ReadRequest) -> Result<ReadResponse, RemoteError>;

    /// Follows a next-page link returned by an earlier read.
    async fn read_link(&self, table: &str, link: &str) -> Result<ReadResponse, RemoteError>;

    /// Creates an item and returns the server copy.
    async fn insert(&self, table: &str, item: &Row) -> Result<Row, RemoteError>;

    /// Replaces an item and returns the server copy.
    async fn update(&self, table: &str, item: &Row) -> Result<Row, RemoteError>;

    /// Deletes an item.
    async fn delete(&self, table: &str, item: &Row) -> Result<Option<Row>, RemoteError>;

    /// Capabilities of a table.
    fn features(&self, _table: &str) -> RemoteFeatures {
        RemoteFeatures::default()
    }
}

/// A handle on one table of a remote service.
#[derive(Clone)]
pub struct RemoteTable {
    name: String,
    service: Arc<dyn RemoteService>,
    system_properties: SystemProperties,
}

impl RemoteTable {
    /// Creates a handle.
    pub fn new(name: impl Into<String>, service: Arc<dyn RemoteService>) -> Self {
        Self {
            name: name.into(),
            service,
            system_properties: SystemProperties::NONE,
        }
    }

    /// Requests additional system columns on reads.
    #[must_use]
    pub fn with_system_properties(mut self, properties: SystemProperties) -> Self {
        self.system_properties = self.system_properties | properties;
        self
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requested system columns.
    pub fn system_properties(&self) -> SystemProperties {
        self.system_properties
    }

    /// Capabilities of this table.
    pub fn features(&self) -> RemoteFeatures {
        self.service.features(&self.name)
    }

    /// Runs a query.
    pub async fn read(
        &self,
        query: &QueryDescription,
        parameters: &Parameters,
    ) -> Result<ReadResponse, RemoteError> {
        let request = ReadRequest {
            query: query.clone(),
            parameters: parameters.clone(),
            system_properties: self.system_properties,
        };
        self.service.read(&self.name, &request).await
    }

    /// Follows a next-page link.
    pub async fn read_link(&self, link: &str) -> Result<ReadResponse, RemoteError> {
        self.service.read_link(&self.name, link).await
    }

    /// Creates an item.
    pub async fn insert(&self, item: &Row) -> Result<Row, RemoteError> {
        self.service.insert(&self.name, item).await
    }

    /// Replaces an item.
    pub async fn update(&self, item: &Row) -> Result<Row, RemoteError> {
        self.service.update(&self.name, item).await
    }

    /// Deletes an item.
    pub async fn delete(&self, item: &Row) -> Result<Option<Row>, RemoteError> {
        self.service.delete(&self.name, item).await
    }

    /// Sends a mutation of the given kind.
    pub async fn execute(&self, kind: OperationKind, item: &Row) -> Result<Option<Row>, RemoteError> {
        match kind {
            OperationKind::Insert => self.insert(item).await.map(Some),
            OperationKind::Update => self.update(item).await.map(Some),
            OperationKind::Delete => self.delete(item).await,
        }
    }
}

impl fmt::Debug for RemoteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTable")
            .field("name", &self.name)
            .field("system_properties", &self.system_properties)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_property_flags() {
        let props = SystemProperties::UPDATED_AT | SystemProperties::VERSION;
        assert!(props.contains(SystemProperties::UPDATED_AT));
        assert!(!props.contains(SystemProperties::DELETED));
        assert_eq!(props.columns(), vec!["updatedAt", "version"]);
        assert_eq!(SystemProperties::ALL.columns().len(), 4);
        assert!(SystemProperties::NONE.columns().is_empty());
    }

    #[test]
    fn features_default_to_full_support() {
        let features = RemoteFeatures::default();
        assert!(features.skip_top && features.ordering && features.next_links);
    }
}
