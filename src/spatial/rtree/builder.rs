use std::io::Write;

use super::{search, serializer, Node};
use crate::entity::Hyperrectangle;
use crate::error::Result;
use crate::spatial::{SpatialIndexBuilder, SpatialIndexEntry};
use crate::Error;

/// Builds an R-tree in memory. Entries are inserted one at a time into the
/// leaf needing the least enlargement, overflowing nodes are split with the
/// quadratic split algorithm.
#[derive(Debug)]
pub struct RTreeBuilder {
    max_node_size: usize,
    nodes: Vec<Node>,
    root: usize,
    dimension: Option<usize>,
}

impl RTreeBuilder {
    /// Creates an empty tree. A node size `<= 0` is rejected.
    pub fn new(max_node_size: i32) -> Result<Self> {
        if max_node_size <= 0 {
            return Err(Error::InvalidConfiguration(format!(
                "R-tree node size must be positive, got {}",
                max_node_size
            )));
        }

        Ok(Self {
            max_node_size: max_node_size as usize,
            nodes: vec![Node::new(0, None)],
            root: 0,
            dimension: None,
        })
    }

    pub fn max_node_size(&self) -> usize {
        self.max_node_size
    }

    pub fn is_empty(&self) -> bool {
        self.nodes[self.root].is_leaf() && self.nodes[self.root].entries.is_empty()
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn root(&self) -> usize {
        self.root
    }

    fn allocate(&mut self, parent: Option<usize>) -> usize {
        let id = self.nodes.len() as i32;
        self.nodes.push(Node::new(id, parent));
        self.nodes.len() - 1
    }

    fn choose_leaf(&self, bbox: &Hyperrectangle) -> usize {
        let mut position = self.root;

        while !self.nodes[position].is_leaf() {
            position = self.nodes[position]
                .children
                .iter()
                .copied()
                .min_by(|a, b| {
                    let (a, b) = (&self.nodes[*a].bounding_box, &self.nodes[*b].bounding_box);
                    a.enlargement(bbox)
                        .total_cmp(&b.enlargement(bbox))
                        .then_with(|| a.volume().total_cmp(&b.volume()))
                })
                .unwrap_or(position);
        }

        position
    }

    fn recalculate_box(&mut self, position: usize) -> Result<()> {
        let node = &self.nodes[position];
        let covering = {
            let boxes = node
                .entries
                .iter()
                .map(SpatialIndexEntry::bounding_box)
                .chain(node.children.iter().map(|c| &self.nodes[*c].bounding_box));
            Hyperrectangle::covering_box(boxes)?
        };
        self.nodes[position].bounding_box = covering;
        Ok(())
    }

    /// Fixes boxes from `position` up to the root and splits overflowing nodes.
    fn adjust_tree(&mut self, mut position: usize) -> Result<()> {
        loop {
            self.recalculate_box(position)?;

            let node = &self.nodes[position];
            if node.entries.len().max(node.children.len()) > self.max_node_size {
                let sibling = self.split(position)?;

                match self.nodes[position].parent {
                    Some(parent) => self.nodes[parent].children.push(sibling),
                    None => {
                        let new_root = self.allocate(None);
                        self.nodes[new_root].children = vec![position, sibling];
                        self.nodes[position].parent = Some(new_root);
                        self.nodes[sibling].parent = Some(new_root);
                        self.root = new_root;
                    }
                }
            }

            match self.nodes[position].parent {
                Some(parent) => position = parent,
                None => return Ok(()),
            }
        }
    }

    /// Moves part of the content of `position` into a new sibling node.
    fn split(&mut self, position: usize) -> Result<usize> {
        let parent = self.nodes[position].parent;
        let sibling = self.allocate(parent);
        let min_fill = (self.max_node_size / 2).max(1);

        if self.nodes[position].is_leaf() {
            let entries = std::mem::take(&mut self.nodes[position].entries);
            let boxes: Vec<_> = entries.iter().map(|e| e.bounding_box().clone()).collect();
            let (keep, moved) = quadratic_split(&boxes, min_fill);

            let mut entries: Vec<_> = entries.into_iter().map(Some).collect();
            self.nodes[position].entries = keep.iter().filter_map(|i| entries[*i].take()).collect();
            self.nodes[sibling].entries = moved.iter().filter_map(|i| entries[*i].take()).collect();
        } else {
            let children = std::mem::take(&mut self.nodes[position].children);
            let boxes: Vec<_> = children
                .iter()
                .map(|c| self.nodes[*c].bounding_box.clone())
                .collect();
            let (keep, moved) = quadratic_split(&boxes, min_fill);

            self.nodes[position].children = keep.iter().map(|i| children[*i]).collect();
            self.nodes[sibling].children = moved.iter().map(|i| children[*i]).collect();
            for child in moved.iter().map(|i| children[*i]) {
                self.nodes[child].parent = Some(sibling);
            }
        }

        self.recalculate_box(position)?;
        self.recalculate_box(sibling)?;
        Ok(sibling)
    }
}

/// Quadratic split: seed both groups with the pair wasting the most space,
/// then hand every other box to the group it enlarges least.
fn quadratic_split(boxes: &[Hyperrectangle], min_fill: usize) -> (Vec<usize>, Vec<usize>) {
    let (mut seed_a, mut seed_b, mut worst) = (0, 1, f64::NEG_INFINITY);
    for i in 0..boxes.len() {
        for j in i + 1..boxes.len() {
            let waste = Hyperrectangle::covering_box([&boxes[i], &boxes[j]])
                .map(|c| c.volume() - boxes[i].volume() - boxes[j].volume())
                .unwrap_or(f64::INFINITY);
            if waste > worst {
                (seed_a, seed_b, worst) = (i, j, waste);
            }
        }
    }

    let mut group_a = vec![seed_a];
    let mut group_b = vec![seed_b];
    let mut box_a = boxes[seed_a].clone();
    let mut box_b = boxes[seed_b].clone();

    let remaining: Vec<usize> = (0..boxes.len())
        .filter(|i| *i != seed_a && *i != seed_b)
        .collect();

    for (done, i) in remaining.iter().copied().enumerate() {
        let left = remaining.len() - done;
        let to_a = if group_a.len() + left <= min_fill {
            true
        } else if group_b.len() + left <= min_fill {
            false
        } else {
            let (grow_a, grow_b) = (box_a.enlargement(&boxes[i]), box_b.enlargement(&boxes[i]));
            grow_a < grow_b || (grow_a == grow_b && box_a.volume() <= box_b.volume())
        };

        let (group, group_box) = if to_a {
            (&mut group_a, &mut box_a)
        } else {
            (&mut group_b, &mut box_b)
        };
        group.push(i);
        if let Ok(covering) = Hyperrectangle::covering_box([&*group_box, &boxes[i]]) {
            *group_box = covering;
        }
    }

    (group_a, group_b)
}

impl SpatialIndexBuilder for RTreeBuilder {
    fn bulk_insert(&mut self, entries: Vec<SpatialIndexEntry>) -> Result<()> {
        for entry in entries {
            self.insert(entry)?;
        }
        Ok(())
    }

    /// Full space boxes carry no spatial information and are not indexed.
    fn insert(&mut self, entry: SpatialIndexEntry) -> Result<()> {
        if entry.bounding_box().is_full_space() {
            return Ok(());
        }

        let dimension = entry.bounding_box().dimension();
        match self.dimension {
            None => self.dimension = Some(dimension),
            Some(expected) if expected != dimension => {
                return Err(Error::InvalidData(format!(
                    "Entry has dimension {}, index has dimension {}",
                    dimension, expected
                )))
            }
            Some(_) => {}
        }

        let leaf = self.choose_leaf(entry.bounding_box());
        self.nodes[leaf].entries.push(entry);
        self.adjust_tree(leaf)
    }

    fn get_entries_for_region(&self, region: &Hyperrectangle) -> Vec<SpatialIndexEntry> {
        search(&self.nodes, self.root, region)
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        serializer::write_tree(self, writer)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::{canonical_entries, random_entries};
    use super::*;

    #[test]
    fn test_invalid_node_size() {
        assert!(matches!(
            RTreeBuilder::new(0),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(RTreeBuilder::new(-5).is_err());
        assert!(RTreeBuilder::new(1).is_ok());
    }

    #[test]
    fn test_empty_tree() {
        let tree = RTreeBuilder::new(4).unwrap();
        assert!(tree.is_empty());
        let region = Hyperrectangle::new(vec![0.0, 1.0, 0.0, 1.0]).unwrap();
        assert!(tree.get_entries_for_region(&region).is_empty());
    }

    #[test]
    fn test_canonical_fixture() {
        let mut tree = RTreeBuilder::new(4).unwrap();
        let entries = canonical_entries();
        tree.bulk_insert(entries.clone()).unwrap();

        for entry in &entries {
            let result = tree.get_entries_for_region(entry.bounding_box());
            assert!(result.contains(entry));
            assert!(result
                .iter()
                .all(|e| e.bounding_box().intersects(entry.bounding_box())));
        }

        // Isolated boxes only find themselves
        for entry in &entries[8..] {
            assert_eq!(tree.get_entries_for_region(entry.bounding_box()).len(), 1);
        }
    }

    #[test]
    fn test_random_exactness() {
        for dimension in 1..=4 {
            let entries = random_entries(500, dimension, 42 + dimension as u64);
            let mut tree = RTreeBuilder::new(8).unwrap();
            tree.bulk_insert(entries.clone()).unwrap();

            for entry in entries.iter().step_by(7) {
                let mut result: Vec<u32> = tree
                    .get_entries_for_region(entry.bounding_box())
                    .iter()
                    .map(SpatialIndexEntry::value)
                    .collect();
                result.sort_unstable();

                let mut expected: Vec<u32> = entries
                    .iter()
                    .filter(|e| e.bounding_box().intersects(entry.bounding_box()))
                    .map(SpatialIndexEntry::value)
                    .collect();
                expected.sort_unstable();

                assert_eq!(result, expected);
            }
        }
    }

    #[test]
    fn test_node_size_respected() {
        let mut tree = RTreeBuilder::new(3).unwrap();
        tree.bulk_insert(random_entries(200, 2, 7)).unwrap();

        for node in tree.nodes() {
            assert!(node.entries.len() <= 3);
            assert!(node.children.len() <= 3);
        }
        assert!(!tree.nodes()[tree.root()].is_leaf());
    }

    #[test]
    fn test_full_space_and_dimension_mismatch() {
        let mut tree = RTreeBuilder::new(4).unwrap();
        tree.insert(SpatialIndexEntry::new(Hyperrectangle::FULL_SPACE, 1))
            .unwrap();
        assert!(tree.is_empty());

        tree.insert(SpatialIndexEntry::new(
            Hyperrectangle::new(vec![0.0, 1.0]).unwrap(),
            2,
        ))
        .unwrap();
        let result = tree.insert(SpatialIndexEntry::new(
            Hyperrectangle::new(vec![0.0, 1.0, 0.0, 1.0]).unwrap(),
            3,
        ));
        assert!(result.is_err());
    }
}
