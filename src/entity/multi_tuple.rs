use super::{Hyperrectangle, Tuple};

/// An ordered list of `(table, tuple)` pairs produced by scans and joins.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiTuple {
    entries: Vec<(String, Tuple)>,
}

impl MultiTuple {
    pub fn single(table: impl Into<String>, tuple: Tuple) -> Self {
        Self {
            entries: vec![(table.into(), tuple)],
        }
    }

    /// Appends the constituents of `other`.
    pub fn join(mut self, other: MultiTuple) -> Self {
        self.entries.extend(other.entries);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tuple(&self, position: usize) -> Option<&Tuple> {
        self.entries.get(position).map(|(_, tuple)| tuple)
    }

    pub fn table(&self, position: usize) -> Option<&str> {
        self.entries.get(position).map(|(table, _)| table.as_str())
    }

    pub fn tuples(&self) -> impl Iterator<Item = &Tuple> {
        self.entries.iter().map(|(_, tuple)| tuple)
    }

    pub fn into_tuples(self) -> Vec<Tuple> {
        self.entries.into_iter().map(|(_, tuple)| tuple).collect()
    }

    /// The region shared by all constituents. A box intersecting it
    /// intersects every constituent.
    pub fn bounding_box(&self) -> Option<Hyperrectangle> {
        self.tuples().try_fold(Hyperrectangle::FULL_SPACE, |acc, tuple| {
            acc.intersection(tuple.bounding_box())
        })
    }

    /// Highest version timestamp of all constituents.
    pub fn version_timestamp(&self) -> u64 {
        self.tuples()
            .map(Tuple::version_timestamp)
            .max()
            .unwrap_or_default()
    }

    /// True if the boxes of all constituents intersect each other.
    pub fn pairwise_intersecting(&self) -> bool {
        let boxes: Vec<_> = self.tuples().map(Tuple::bounding_box).collect();
        boxes
            .iter()
            .enumerate()
            .all(|(i, a)| boxes[i + 1..].iter().all(|b| a.intersects(b)))
    }
}
