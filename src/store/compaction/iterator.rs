use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::entity::Tuple;
use crate::error::Result;

pub type TupleIterator = Box<dyn Iterator<Item = Result<Tuple>> + Send>;

struct HeapEntry {
    tuple: Tuple,
    source: usize,
    iterator: TupleIterator,
}

impl std::fmt::Debug for HeapEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapEntry")
            .field("key", &self.tuple.key())
            .field("version", &self.tuple.version_timestamp())
            .field("source", &self.source)
            .finish()
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max heap: the lowest key has to compare greatest
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tuple
            .key()
            .cmp(other.tuple.key())
            .reverse()
            .then_with(|| self.source.cmp(&other.source).reverse())
    }
}

/// Merges sorted tuple streams into groups of equal keys.
///
/// Each call to `next` yields every version of the lowest remaining key
/// found in any source, so the versions of one key are never split across
/// two groups. Within a group the order is unspecified.
#[derive(Debug)]
pub struct KeyGroupIterator {
    heap: BinaryHeap<HeapEntry>,
    failed: bool,
}

impl KeyGroupIterator {
    pub fn new(iterators: Vec<TupleIterator>) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(iterators.len());

        for (source, mut iterator) in iterators.into_iter().enumerate() {
            if let Some(tuple) = iterator.next().transpose()? {
                heap.push(HeapEntry {
                    tuple,
                    source,
                    iterator,
                });
            }
        }

        Ok(Self {
            heap,
            failed: false,
        })
    }

    fn advance(&mut self, mut entry: HeapEntry) -> Result<Tuple> {
        match entry.iterator.next().transpose()? {
            Some(next) => {
                let tuple = std::mem::replace(&mut entry.tuple, next);
                self.heap.push(entry);
                Ok(tuple)
            }
            None => Ok(entry.tuple),
        }
    }
}

impl Iterator for KeyGroupIterator {
    type Item = Result<Vec<Tuple>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let first = self.heap.pop()?;
        let key = first.tuple.key().to_string();
        let mut group = Vec::new();

        let mut next = Some(first);
        while let Some(entry) = next {
            match self.advance(entry) {
                Ok(tuple) => group.push(tuple),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }

            next = match self.heap.peek() {
                Some(top) if top.tuple.key() == key => self.heap.pop(),
                _ => None,
            };
        }

        Some(Ok(group))
    }
}
