use super::scan::SpatialIndexReadOperator;
use super::{BoxedOperator, Operator};
use crate::entity::MultiTuple;
use crate::error::Result;

/// Nested loop spatial join. For every multi-tuple of the left input the
/// right table is searched with the left bounding box and one joined
/// multi-tuple is emitted per match.
///
/// The box of a multi-tuple is the intersection of its constituents, so
/// every emitted record has pairwise intersecting boxes. Joins over more
/// than two tables nest: the left input of a join is another join.
pub struct SpatialJoinOperator {
    left: BoxedOperator,
    right: SpatialIndexReadOperator,
    current: Option<MultiTuple>,
}

impl SpatialJoinOperator {
    pub fn new(left: BoxedOperator, right: SpatialIndexReadOperator) -> Self {
        Self {
            left,
            right,
            current: None,
        }
    }
}

impl Iterator for SpatialJoinOperator {
    type Item = Result<MultiTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(left) = &self.current {
                match self.right.next() {
                    Some(Ok(right)) => {
                        let joined = left.clone().join(right);
                        if !joined.pairwise_intersecting() {
                            tracing::error!(
                                table = %self.right.table().name(),
                                "Joined tuples do not intersect, skipping"
                            );
                            continue;
                        }
                        return Some(Ok(joined));
                    }
                    Some(Err(e)) => return Some(Err(e)),
                    None => self.current = None,
                }
            }

            let left = match self.left.next()? {
                Ok(left) => left,
                Err(e) => return Some(Err(e)),
            };

            // Disjoint constituents cannot match anything
            if let Some(bbox) = left.bounding_box() {
                self.right.set_bounding_box(bbox);
                self.current = Some(left);
            }
        }
    }
}

impl Operator for SpatialJoinOperator {
    fn close(&mut self) {
        self.current = None;
        self.left.close();
        self.right.close();
    }
}
