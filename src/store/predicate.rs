//! Tuple predicates and the iterator adapter applying them.

use crate::entity::{Hyperrectangle, Tuple};
use crate::error::Result;

pub trait Predicate: Send + Sync {
    fn matches(&self, tuple: &Tuple) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Tuple) -> bool + Send + Sync,
{
    fn matches(&self, tuple: &Tuple) -> bool {
        self(tuple)
    }
}

/// Version timestamp strictly newer than the given one.
#[derive(Debug, Clone, Copy)]
pub struct NewerAsVersionTimePredicate(pub u64);

impl Predicate for NewerAsVersionTimePredicate {
    fn matches(&self, tuple: &Tuple) -> bool {
        tuple.version_timestamp() > self.0
    }
}

/// Received timestamp strictly newer than the given one.
#[derive(Debug, Clone, Copy)]
pub struct NewerAsInsertedTimePredicate(pub u64);

impl Predicate for NewerAsInsertedTimePredicate {
    fn matches(&self, tuple: &Tuple) -> bool {
        tuple.received_timestamp() > self.0
    }
}

#[derive(Debug, Clone)]
pub struct OverlapsBoundingBoxPredicate(pub Hyperrectangle);

impl OverlapsBoundingBoxPredicate {
    /// Same check for boxes not owned by a single tuple, e.g. the box of a
    /// joined record.
    pub fn overlaps(&self, bbox: &Hyperrectangle) -> bool {
        bbox.intersects(&self.0)
    }
}

impl Predicate for OverlapsBoundingBoxPredicate {
    fn matches(&self, tuple: &Tuple) -> bool {
        self.overlaps(tuple.bounding_box())
    }
}

pub struct AndPredicate<A, B>(pub A, pub B);

impl<A: Predicate, B: Predicate> Predicate for AndPredicate<A, B> {
    fn matches(&self, tuple: &Tuple) -> bool {
        self.0.matches(tuple) && self.1.matches(tuple)
    }
}

/// Passes on the tuples of `inner` matching the predicate. Errors are
/// passed on unchanged.
pub struct PredicateFilterIterator<I, P>
where
    I: Iterator<Item = Result<Tuple>>,
    P: Predicate,
{
    inner: I,
    predicate: P,
}

impl<I, P> PredicateFilterIterator<I, P>
where
    I: Iterator<Item = Result<Tuple>>,
    P: Predicate,
{
    pub fn new(inner: I, predicate: P) -> Self {
        Self { inner, predicate }
    }
}

impl<I, P> Iterator for PredicateFilterIterator<I, P>
where
    I: Iterator<Item = Result<Tuple>>,
    P: Predicate,
{
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok(tuple) if self.predicate.matches(&tuple) => return Some(Ok(tuple)),
                Ok(_) => {}
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
