//! Pull-based query pipelines over the tables of a storage location.
//!
//! A pipeline is a tree of operators. Leaves scan a table, inner nodes
//! filter or join the output of their parents. Every operator yields
//! [`MultiTuple`]s: a scan yields single tuples, a join one tuple per joined
//! table.

pub mod filter;
pub mod join;
pub mod scan;

use std::sync::Arc;

pub use filter::{
    BoundingBoxSelectOperator, TemporalFilterOperator, TimeField, UserDefinedFilter,
    UserDefinedFilterOperator, UserDefinedFilterRegistry, ValueContainsFilter,
};
pub use join::SpatialJoinOperator;
pub use scan::{FullTableScanOperator, SpatialIndexReadOperator};

use crate::entity::{Hyperrectangle, MultiTuple, TableName, Tuple};
use crate::error::Result;
use crate::store::registry::Storage;

/// A lazy, single-pass source of query results.
///
/// `close` releases every run held by the operator and its parents. It may
/// be called any number of times, dropping an operator closes it as well.
pub trait Operator: Iterator<Item = Result<MultiTuple>> + Send {
    fn close(&mut self);
}

pub type BoxedOperator = Box<dyn Operator>;

/// Description of a pipeline, turned into operators by
/// [`QueryProcessor::open_pipeline`].
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorSpec {
    FullTableScan {
        table: TableName,
    },
    SpatialIndexRead {
        table: TableName,
        region: Hyperrectangle,
    },
    TemporalFilter {
        parent: Box<OperatorSpec>,
        field: TimeField,
        threshold: u64,
    },
    BoundingBoxSelect {
        parent: Box<OperatorSpec>,
        region: Hyperrectangle,
    },
    /// Joins the output of `left` with the tuples of `right` intersecting
    /// each left bounding box.
    SpatialJoin {
        left: Box<OperatorSpec>,
        right: TableName,
    },
    UserDefinedFilter {
        parent: Box<OperatorSpec>,
        name: String,
        state: Vec<u8>,
    },
}

impl OperatorSpec {
    pub fn full_scan(table: TableName) -> Self {
        OperatorSpec::FullTableScan { table }
    }

    pub fn spatial_scan(table: TableName, region: Hyperrectangle) -> Self {
        OperatorSpec::SpatialIndexRead { table, region }
    }

    pub fn newer_than(self, field: TimeField, threshold: u64) -> Self {
        OperatorSpec::TemporalFilter {
            parent: Box::new(self),
            field,
            threshold,
        }
    }

    pub fn select(self, region: Hyperrectangle) -> Self {
        OperatorSpec::BoundingBoxSelect {
            parent: Box::new(self),
            region,
        }
    }

    pub fn join(self, right: TableName) -> Self {
        OperatorSpec::SpatialJoin {
            left: Box::new(self),
            right,
        }
    }

    pub fn filter(self, name: impl Into<String>, state: Vec<u8>) -> Self {
        OperatorSpec::UserDefinedFilter {
            parent: Box::new(self),
            name: name.into(),
            state,
        }
    }
}

/// Entry point for reads against one storage location.
#[derive(Debug)]
pub struct QueryProcessor {
    storage: Arc<Storage>,
    filters: UserDefinedFilterRegistry,
}

impl QueryProcessor {
    pub fn new(storage: Arc<Storage>, filters: UserDefinedFilterRegistry) -> Self {
        Self { storage, filters }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Builds the operator tree. Unknown tables and filters are reported
    /// here, before any run is acquired.
    pub fn open_pipeline(&self, spec: &OperatorSpec) -> Result<BoxedOperator> {
        let operator: BoxedOperator = match spec {
            OperatorSpec::FullTableScan { table } => {
                Box::new(FullTableScanOperator::new(self.storage.get_table(table)?))
            }
            OperatorSpec::SpatialIndexRead { table, region } => Box::new(
                SpatialIndexReadOperator::new(self.storage.get_table(table)?, region.clone()),
            ),
            OperatorSpec::TemporalFilter {
                parent,
                field,
                threshold,
            } => Box::new(TemporalFilterOperator::new(
                self.open_pipeline(parent)?,
                *field,
                *threshold,
            )),
            OperatorSpec::BoundingBoxSelect { parent, region } => Box::new(
                BoundingBoxSelectOperator::new(self.open_pipeline(parent)?, region.clone()),
            ),
            OperatorSpec::SpatialJoin { left, right } => {
                let right = self.storage.get_table(right)?;
                Box::new(SpatialJoinOperator::new(
                    self.open_pipeline(left)?,
                    SpatialIndexReadOperator::new(right, Hyperrectangle::FULL_SPACE),
                ))
            }
            OperatorSpec::UserDefinedFilter {
                parent,
                name,
                state,
            } => {
                let filter = self.filters.get(name)?;
                Box::new(UserDefinedFilterOperator::new(
                    self.open_pipeline(parent)?,
                    name.clone(),
                    filter,
                    state.clone(),
                ))
            }
        };
        Ok(operator)
    }

    /// The visible versions of a key, newest first.
    pub fn get(&self, table: &TableName, key: &str) -> Result<Vec<Tuple>> {
        let table = self.storage.get_table(table)?;
        let runs = table.acquire_runs()?;

        let mut versions = Vec::new();
        for run in runs.iter() {
            versions.extend(run.get_all_versions(key)?);
        }

        table.resolver().resolve(&mut versions);
        versions.retain(|t| !t.is_tombstone());
        versions.sort_by(|a, b| b.version_timestamp().cmp(&a.version_timestamp()));
        Ok(versions)
    }
}
