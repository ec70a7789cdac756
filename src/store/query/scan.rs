//! Table scans.
//!
//! A scan walks the runs of a table newest first. The first time a key
//! shows up, every version of that key is gathered from all acquired runs
//! and handed to the table's duplicate resolver. Whatever survives (minus
//! tombstones) is emitted and the key is marked as seen, so older copies in
//! later runs are skipped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::Operator;
use crate::entity::{Hyperrectangle, MultiTuple, Tuple};
use crate::error::Result;
use crate::store::predicate::{AndPredicate, OverlapsBoundingBoxPredicate, Predicate};
use crate::store::registry::{AcquiredRuns, TupleStore};

type TupleIterator = Box<dyn Iterator<Item = Result<Tuple>> + Send>;

struct Cursor {
    runs: AcquiredRuns,
    position: usize,
    current: Option<TupleIterator>,
    // key -> version the key had in the run where it was first met
    seen: HashMap<String, u64>,
    pending: VecDeque<Tuple>,
    // resolved versions that are emitted
    visible: Box<dyn Predicate>,
}

impl Cursor {
    fn new(runs: AcquiredRuns, region: Option<&Hyperrectangle>) -> Self {
        let not_deleted = |tuple: &Tuple| !tuple.is_tombstone();
        let visible: Box<dyn Predicate> = match region {
            Some(region) => Box::new(AndPredicate(
                not_deleted,
                OverlapsBoundingBoxPredicate(region.clone()),
            )),
            None => Box::new(not_deleted),
        };

        Self {
            runs,
            position: 0,
            current: None,
            seen: HashMap::new(),
            pending: VecDeque::new(),
            visible,
        }
    }

    fn next_tuple(
        &mut self,
        table: &TupleStore,
        region: Option<&Hyperrectangle>,
        anomalies: &mut u64,
    ) -> Option<Result<Tuple>> {
        loop {
            if let Some(tuple) = self.pending.pop_front() {
                return Some(Ok(tuple));
            }

            if self.current.is_none() {
                let run = self.runs.get(self.position)?;
                let iterator: Result<TupleIterator> = match region {
                    Some(region) => run
                        .get_all_tuples_in_bbox(region)
                        .map(|i| Box::new(i) as TupleIterator),
                    None => run.iter().map(|i| Box::new(i) as TupleIterator),
                };
                match iterator {
                    Ok(iterator) => self.current = Some(iterator),
                    Err(e) => return Some(Err(e)),
                }
            }

            let next = self.current.as_mut().and_then(|current| current.next());
            let tuple = match next {
                Some(Ok(tuple)) => tuple,
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    self.current = None;
                    self.position += 1;
                    continue;
                }
            };

            // Runs are visited newest first, a key met again in a later run
            // must not carry a newer version than at its first sighting
            if let Some(first) = self.seen.get_mut(tuple.key()) {
                if tuple.version_timestamp() > *first {
                    tracing::warn!(
                        table = %table.name(),
                        key = tuple.key(),
                        version = tuple.version_timestamp(),
                        seen = *first,
                        "Found a newer version of an already processed key"
                    );
                    *anomalies += 1;
                    *first = tuple.version_timestamp();
                }
                continue;
            }
            self.seen
                .insert(tuple.key().to_string(), tuple.version_timestamp());

            let mut versions = Vec::new();
            for run in self.runs.iter() {
                match run.get_all_versions(tuple.key()) {
                    Ok(found) => versions.extend(found),
                    Err(e) => return Some(Err(e)),
                }
            }
            if versions.is_empty() {
                versions.push(tuple);
            }

            table.resolver().resolve(&mut versions);
            versions.retain(|t| self.visible.matches(t));
            self.pending.extend(versions);
        }
    }
}

enum ScanState {
    Unprepared,
    Acquired(AcquiredRuns),
    Streaming(Box<Cursor>),
    Closed,
}

pub(crate) struct TableScan {
    table: Arc<TupleStore>,
    table_name: String,
    region: Option<Hyperrectangle>,
    state: ScanState,
    anomalies: u64,
}

impl TableScan {
    pub(crate) fn new(table: Arc<TupleStore>, region: Option<Hyperrectangle>) -> Self {
        Self {
            table_name: table.name().fullname(),
            table,
            region,
            state: ScanState::Unprepared,
            anomalies: 0,
        }
    }

    pub(crate) fn table(&self) -> &Arc<TupleStore> {
        &self.table
    }

    /// Keys met with a newer version after they were already emitted.
    pub(crate) fn ordering_anomalies(&self) -> u64 {
        self.anomalies
    }

    /// Restarts the scan with a new region. Acquired runs are kept.
    pub(crate) fn rebind(&mut self, region: Hyperrectangle) {
        self.region = Some(region);
        self.state = match std::mem::replace(&mut self.state, ScanState::Closed) {
            ScanState::Streaming(cursor) => ScanState::Acquired(cursor.runs),
            ScanState::Closed => ScanState::Closed,
            other => other,
        };
    }

    pub(crate) fn close(&mut self) {
        // Dropping the acquired runs releases them
        self.state = ScanState::Closed;
    }

    fn prepare(&mut self) -> Result<()> {
        loop {
            match self.state {
                ScanState::Unprepared => {
                    self.state = ScanState::Acquired(self.table.acquire_runs()?);
                }
                ScanState::Acquired(_) => {
                    if let ScanState::Acquired(runs) =
                        std::mem::replace(&mut self.state, ScanState::Closed)
                    {
                        let cursor = Cursor::new(runs, self.region.as_ref());
                        self.state = ScanState::Streaming(Box::new(cursor));
                    }
                }
                ScanState::Streaming(_) | ScanState::Closed => return Ok(()),
            }
        }
    }

    /// Yields at most one error, the scan is closed right after it.
    fn next_tuple(&mut self) -> Option<Result<Tuple>> {
        let next = match self.prepare() {
            Ok(()) => match &mut self.state {
                ScanState::Streaming(cursor) => {
                    cursor.next_tuple(&self.table, self.region.as_ref(), &mut self.anomalies)
                }
                _ => None,
            },
            Err(e) => Some(Err(e)),
        };

        if let Some(Err(e)) = &next {
            tracing::error!(table = %self.table.name(), error = %e, "Scan failed, closing it");
            self.close();
        }
        next
    }
}

impl Iterator for TableScan {
    type Item = Result<MultiTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        let tuple = self.next_tuple()?;
        Some(tuple.map(|t| MultiTuple::single(self.table_name.clone(), t)))
    }
}

impl Drop for TableScan {
    fn drop(&mut self) {
        self.close();
    }
}

/// Every visible tuple of a table.
pub struct FullTableScanOperator {
    scan: TableScan,
}

impl FullTableScanOperator {
    pub fn new(table: Arc<TupleStore>) -> Self {
        Self {
            scan: TableScan::new(table, None),
        }
    }
}

impl Iterator for FullTableScanOperator {
    type Item = Result<MultiTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        self.scan.next()
    }
}

impl Operator for FullTableScanOperator {
    fn close(&mut self) {
        self.scan.close();
    }
}

/// Visible tuples of a table intersecting a region, found through the
/// spatial indexes of the runs.
pub struct SpatialIndexReadOperator {
    scan: TableScan,
}

impl SpatialIndexReadOperator {
    pub fn new(table: Arc<TupleStore>, region: Hyperrectangle) -> Self {
        Self {
            scan: TableScan::new(table, Some(region)),
        }
    }

    /// Starts over with another region. The runs stay acquired.
    pub fn set_bounding_box(&mut self, region: Hyperrectangle) {
        self.scan.rebind(region);
    }

    pub fn table(&self) -> &Arc<TupleStore> {
        self.scan.table()
    }
}

impl Iterator for SpatialIndexReadOperator {
    type Item = Result<MultiTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        self.scan.next()
    }
}

impl Operator for SpatialIndexReadOperator {
    fn close(&mut self) {
        self.scan.close();
    }
}
