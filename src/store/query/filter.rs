//! Operators filtering the output of another operator.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use itertools::Itertools;

use super::{BoxedOperator, Operator};
use crate::entity::{Hyperrectangle, MultiTuple, Tuple};
use crate::error::Result;
use crate::store::predicate::{
    NewerAsInsertedTimePredicate, NewerAsVersionTimePredicate, OverlapsBoundingBoxPredicate,
    Predicate,
};
use crate::Error;

/// Timestamp checked by a [`TemporalFilterOperator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeField {
    Version,
    Received,
}

/// Passes multi-tuples whose constituents are all strictly newer than a
/// threshold.
pub struct TemporalFilterOperator {
    parent: BoxedOperator,
    predicate: Box<dyn Predicate>,
}

impl TemporalFilterOperator {
    pub fn new(parent: BoxedOperator, field: TimeField, threshold: u64) -> Self {
        let predicate: Box<dyn Predicate> = match field {
            TimeField::Version => Box::new(NewerAsVersionTimePredicate(threshold)),
            TimeField::Received => Box::new(NewerAsInsertedTimePredicate(threshold)),
        };
        Self { parent, predicate }
    }
}

impl Iterator for TemporalFilterOperator {
    type Item = Result<MultiTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.parent.next()? {
                Ok(tuple) if tuple.tuples().all(|t| self.predicate.matches(t)) => {
                    return Some(Ok(tuple))
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl Operator for TemporalFilterOperator {
    fn close(&mut self) {
        self.parent.close();
    }
}

/// Passes multi-tuples whose bounding box intersects a region.
pub struct BoundingBoxSelectOperator {
    parent: BoxedOperator,
    predicate: OverlapsBoundingBoxPredicate,
}

impl BoundingBoxSelectOperator {
    pub fn new(parent: BoxedOperator, region: Hyperrectangle) -> Self {
        Self {
            parent,
            predicate: OverlapsBoundingBoxPredicate(region),
        }
    }
}

impl Iterator for BoundingBoxSelectOperator {
    type Item = Result<MultiTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.parent.next()? {
                Ok(tuple) => {
                    let matches = tuple
                        .bounding_box()
                        .is_some_and(|bbox| self.predicate.overlaps(&bbox));
                    if matches {
                        return Some(Ok(tuple));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl Operator for BoundingBoxSelectOperator {
    fn close(&mut self) {
        self.parent.close();
    }
}

/// A filter supplied by the embedding application. `state` is the opaque
/// filter argument of the query.
pub trait UserDefinedFilter: Send + Sync {
    fn filter_tuple(&self, tuple: &Tuple, state: &[u8]) -> Result<bool>;
}

/// Passes tuples whose value contains the filter state as a byte sequence.
#[derive(Debug, Default)]
pub struct ValueContainsFilter;

impl UserDefinedFilter for ValueContainsFilter {
    fn filter_tuple(&self, tuple: &Tuple, state: &[u8]) -> Result<bool> {
        if state.is_empty() {
            return Ok(true);
        }
        Ok(tuple.value().windows(state.len()).any(|w| w == state))
    }
}

/// Filters known by name.
#[derive(Default, Clone)]
pub struct UserDefinedFilterRegistry {
    filters: HashMap<String, Arc<dyn UserDefinedFilter>>,
}

impl std::fmt::Debug for UserDefinedFilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.filters.keys().sorted().collect_vec();
        f.debug_struct("UserDefinedFilterRegistry")
            .field("filters", &names)
            .finish()
    }
}

impl UserDefinedFilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the filters shipped with the crate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("value-contains", Arc::new(ValueContainsFilter));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, filter: Arc<dyn UserDefinedFilter>) {
        self.filters.insert(name.into(), filter);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn UserDefinedFilter>> {
        self.filters.get(name).cloned().ok_or_else(|| {
            Error::InvalidConfiguration(format!("Unknown user defined filter {:?}", name))
        })
    }
}

/// Applies a user defined filter to every constituent of a multi-tuple.
///
/// A failing or panicking filter ends the stream: the failure is reported
/// once as [`Error::FilterFailed`] and the parent is closed.
pub struct UserDefinedFilterOperator {
    parent: BoxedOperator,
    name: String,
    filter: Arc<dyn UserDefinedFilter>,
    state: Vec<u8>,
    failed: bool,
}

impl UserDefinedFilterOperator {
    pub fn new(
        parent: BoxedOperator,
        name: impl Into<String>,
        filter: Arc<dyn UserDefinedFilter>,
        state: Vec<u8>,
    ) -> Self {
        Self {
            parent,
            name: name.into(),
            filter,
            state,
            failed: false,
        }
    }

    fn apply(&self, tuple: &MultiTuple) -> Result<bool> {
        for constituent in tuple.tuples() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.filter.filter_tuple(constituent, &self.state)
            }));
            match outcome {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => return Ok(false),
                Ok(Err(e)) => return Err(Error::FilterFailed(format!("{}: {}", self.name, e))),
                Err(_) => return Err(Error::FilterFailed(format!("{} panicked", self.name))),
            }
        }
        Ok(true)
    }
}

impl Iterator for UserDefinedFilterOperator {
    type Item = Result<MultiTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            let tuple = match self.parent.next()? {
                Ok(tuple) => tuple,
                Err(e) => return Some(Err(e)),
            };

            match self.apply(&tuple) {
                Ok(true) => return Some(Ok(tuple)),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(filter = %self.name, error = %e, "User defined filter failed");
                    self.failed = true;
                    self.parent.close();
                    return Some(Err(e));
                }
            }
        }
    }
}

impl Operator for UserDefinedFilterOperator {
    fn close(&mut self) {
        self.parent.close();
    }
}
