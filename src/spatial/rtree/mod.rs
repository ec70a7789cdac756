//! R-tree implementation of the spatial index.
//!
//! Nodes live in an arena and refer to each other by position. Leaf nodes
//! hold index entries, directory nodes hold child nodes. Every node carries
//! the covering box of its content, which is used to prune region queries.
//!
//! ```text
//!                    ┌──────────────┐
//!                    │ root (dir)   │
//!                    └──────┬───────┘
//!               ┌───────────┴───────────┐
//!        ┌──────┴──────┐         ┌──────┴──────┐
//!        │ leaf        │         │ leaf        │
//!        │ e0 e1 .. eN │         │ e0 e1 .. eN │
//!        └─────────────┘         └─────────────┘
//! ```

mod builder;
mod reader;
mod serializer;

pub use builder::RTreeBuilder;
pub use reader::{RTreeFileReader, RTreeMemoryReader};

use crate::entity::Hyperrectangle;

use super::SpatialIndexEntry;

/// Default maximum number of entries (or children) per node.
pub const DEFAULT_NODE_SIZE: i32 = 64;

/// Slot marker for an empty entry or child slot.
pub(crate) const NOT_EXISTING: [u8; 4] = [0xff, 0, 0, 0];

/// Slot marker preceding a serialized entry.
pub(crate) const FOLLOWING: [u8; 4] = [1, 0, 0, 0];

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) id: i32,
    pub(crate) bounding_box: Hyperrectangle,
    pub(crate) entries: Vec<SpatialIndexEntry>,
    pub(crate) children: Vec<usize>,
    pub(crate) parent: Option<usize>,
}

impl Node {
    pub(crate) fn new(id: i32, parent: Option<usize>) -> Self {
        Self {
            id,
            bounding_box: Hyperrectangle::FULL_SPACE,
            entries: Vec::new(),
            children: Vec::new(),
            parent,
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Walks the arena from `root` and collects every entry intersecting `region`.
pub(crate) fn search(
    nodes: &[Node],
    root: usize,
    region: &Hyperrectangle,
) -> Vec<SpatialIndexEntry> {
    let mut result = Vec::new();
    let mut pending = vec![root];

    while let Some(position) = pending.pop() {
        let Some(node) = nodes.get(position) else {
            continue;
        };

        if !node.bounding_box.intersects(region) {
            continue;
        }

        result.extend(
            node.entries
                .iter()
                .filter(|entry| entry.bounding_box().intersects(region))
                .cloned(),
        );
        pending.extend(node.children.iter().copied());
    }

    result
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Ten rectangles of the canonical node-size-4 test tree.
    pub(crate) fn canonical_entries() -> Vec<SpatialIndexEntry> {
        let boxes: [[f64; 4]; 10] = [
            [0.0, 1.0, 0.0, 1.0],
            [1.0, 2.0, 1.0, 3.0],
            [2.0, 3.0, 0.0, 1.0],
            [3.0, 4.0, 3.0, 7.0],
            [1.2, 2.2, 0.0, 1.0],
            [4.6, 9.0, 0.0, 1.0],
            [5.0, 8.0, 0.0, 1.0],
            [4.0, 5.0, 4.0, 9.0],
            [15.0, 18.0, 15.0, 18.0],
            [15.0, 18.0, 25.0, 28.0],
        ];

        boxes
            .iter()
            .enumerate()
            .map(|(i, b)| {
                SpatialIndexEntry::new(Hyperrectangle::new(b.to_vec()).unwrap(), i as u32)
            })
            .collect()
    }

    /// Deterministic pseudo random boxes in `dimension` dimensions.
    pub(crate) fn random_entries(
        count: usize,
        dimension: usize,
        seed: u64,
    ) -> Vec<SpatialIndexEntry> {
        let mut state = seed.max(1);
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state % 10_000) as f64 / 100.0
        };

        (0..count)
            .map(|i| {
                let bounds = (0..dimension)
                    .flat_map(|_| {
                        let low = next();
                        let extent = next() / 10.0;
                        [low, low + extent]
                    })
                    .collect::<Vec<_>>();
                SpatialIndexEntry::new(Hyperrectangle::new(bounds).unwrap(), i as u32)
            })
            .collect()
    }
}
