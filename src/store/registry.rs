//! Tables and the storage location holding them.
//!
//! A [`TupleStore`] owns the run list of one table. The list is an
//! immutable snapshot behind a lock: readers clone the current `Arc`,
//! writers build a new list and swap it in, so a reader sees either the old
//! or the new list, never a mix.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::{StorageConfig, TupleStoreConfig};
use crate::encoding::bincode;
use crate::entity::{TableName, Tuple};
use crate::error::Result;
use crate::flock::DirLock;
use crate::store::resolver::{resolver_for, DuplicateResolver};
use crate::store::sstable::{self, RunFiles, SSTableWriter, SortedRun, META_SUFFIX};
use crate::Error;

/// Attempts to acquire a consistent run list before giving up.
const MAX_ACQUIRE_ATTEMPTS: usize = 10;

/// Table settings file inside a table directory.
const TABLE_CONFIG_FILE: &str = "tuplestore.conf";

pub type RunList = Arc<Vec<Arc<SortedRun>>>;

/// Runs acquired for reading, released on drop. Sorted newest version
/// first.
#[derive(Debug, Default)]
pub struct AcquiredRuns {
    runs: Vec<Arc<SortedRun>>,
}

impl AcquiredRuns {
    pub fn runs(&self) -> &[Arc<SortedRun>] {
        &self.runs
    }

    /// Releases all runs. Calling it again does nothing.
    pub fn release(&mut self) {
        for run in self.runs.drain(..) {
            run.release();
        }
    }
}

impl Deref for AcquiredRuns {
    type Target = [Arc<SortedRun>];

    fn deref(&self) -> &Self::Target {
        &self.runs
    }
}

impl Drop for AcquiredRuns {
    fn drop(&mut self) {
        self.release();
    }
}

/// One table.
pub struct TupleStore {
    name: TableName,
    dir: PathBuf,
    storage_config: Arc<StorageConfig>,
    config: TupleStoreConfig,
    resolver: Box<dyn DuplicateResolver<Tuple>>,
    runs: RwLock<RunList>,
    read_only: AtomicBool,
    generation: AtomicU64,
}

impl std::fmt::Debug for TupleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleStore")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("resolver", &self.resolver)
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

impl TupleStore {
    /// Opens the table in `storage_config.dir`, creating its directory if
    /// needed. Complete runs found on disk are loaded, incomplete ones are
    /// removed.
    pub fn open(
        name: TableName,
        storage_config: Arc<StorageConfig>,
        config: TupleStoreConfig,
    ) -> Result<Self> {
        // Fail early on settings that would only surface on the first flush
        crate::spatial::rtree::RTreeBuilder::new(config.spatial_index_node_size)?;

        let dir = storage_config.dir.join(name.fullname());
        fs::create_dir_all(&dir)?;

        let (runs, max_generation) = Self::recover(&name, &dir, &storage_config)?;
        tracing::info!(
            table = %name,
            runs = runs.len(),
            next_generation = max_generation + 1,
            "Opened table"
        );

        Ok(Self {
            resolver: resolver_for(&config),
            name,
            dir,
            storage_config,
            config,
            runs: RwLock::new(Arc::new(runs)),
            read_only: AtomicBool::new(false),
            generation: AtomicU64::new(max_generation),
        })
    }

    fn recover(
        name: &TableName,
        dir: &Path,
        storage_config: &StorageConfig,
    ) -> Result<(Vec<Arc<SortedRun>>, u64)> {
        // generation -> has metadata
        let mut found: BTreeMap<u64, bool> = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let file_name = entry?.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some((generation, suffix)) = sstable::parse_file_name(name, file_name) {
                *found.entry(generation).or_default() |= suffix == META_SUFFIX;
            }
        }

        let max_generation = found.keys().next_back().copied().unwrap_or(0);
        let mut runs = Vec::new();
        for (generation, complete) in found {
            let files = RunFiles::new(dir, name.clone(), generation);
            if !complete {
                tracing::warn!(
                    table = %name,
                    generation,
                    "Removing incomplete sorted run"
                );
                files.delete()?;
                continue;
            }
            runs.push(Arc::new(SortedRun::open(files, storage_config)?));
        }

        runs.sort_by_key(|run| std::cmp::Reverse(run.generation()));
        Ok((runs, max_generation))
    }

    pub fn name(&self) -> &TableName {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &TupleStoreConfig {
        &self.config
    }

    pub fn storage_config(&self) -> &StorageConfig {
        &self.storage_config
    }

    pub fn resolver(&self) -> &dyn DuplicateResolver<Tuple> {
        self.resolver.as_ref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Switches the read-only flag. Taken under the run list lock so that a
    /// concurrent [`TupleStore::replace_runs`] sees either state, never both.
    pub fn set_read_only(&self, read_only: bool) {
        let _runs = match self.runs.write() {
            Ok(runs) => runs,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Current run list, not acquired.
    pub fn runs(&self) -> RunList {
        match self.runs.read() {
            Ok(runs) => runs.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn run_count(&self) -> usize {
        self.runs().len()
    }

    /// Combined file size of all runs.
    pub fn size(&self) -> u64 {
        self.runs().iter().map(|r| r.size()).sum()
    }

    pub fn tuple_count(&self) -> u64 {
        self.runs().iter().map(|r| r.tuple_count()).sum()
    }

    /// Files for a run with a fresh generation number.
    pub fn next_run_files(&self) -> RunFiles {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        RunFiles::new(&self.dir, self.name.clone(), generation)
    }

    pub fn open_run(&self, files: RunFiles) -> Result<SortedRun> {
        SortedRun::open(files, &self.storage_config)
    }

    /// Acquires every run of the current list. If a run is being deleted
    /// meanwhile the list is outdated: everything is released and a fresh
    /// list is tried.
    pub fn acquire_runs(&self) -> Result<AcquiredRuns> {
        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            let snapshot = self.runs();
            let mut acquired = AcquiredRuns::default();

            let complete = snapshot.iter().all(|run| {
                if run.acquire() {
                    acquired.runs.push(run.clone());
                    true
                } else {
                    false
                }
            });

            if complete {
                acquired.runs.sort_by(|a, b| {
                    b.newest_version_timestamp()
                        .cmp(&a.newest_version_timestamp())
                        .then_with(|| b.generation().cmp(&a.generation()))
                });
                return Ok(acquired);
            }

            tracing::debug!(
                table = %self.name,
                attempt,
                "Run list changed during acquire, retrying"
            );
            drop(acquired);
            std::thread::yield_now();
        }

        Err(Error::RunUnavailable(format!(
            "Unable to acquire the runs of {} after {} attempts",
            self.name, MAX_ACQUIRE_ATTEMPTS
        )))
    }

    /// Atomically replaces `old` by `new` in the run list. Fails without
    /// changing anything if the table is read only or one of `old` is no
    /// longer installed.
    pub fn replace_runs(&self, old: &[Arc<SortedRun>], new: Vec<Arc<SortedRun>>) -> Result<()> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| Error::InvalidState("Run list lock poisoned".to_string()))?;
        if self.is_read_only() {
            return Err(Error::ReadOnly(self.name.to_string()));
        }

        let installed = |run: &Arc<SortedRun>| runs.iter().any(|r| Arc::ptr_eq(r, run));
        if let Some(missing) = old.iter().find(|run| !installed(run)) {
            return Err(Error::InvalidState(format!(
                "Run {} of {} is not installed",
                missing.generation(),
                self.name
            )));
        }

        let mut replaced: Vec<Arc<SortedRun>> = runs
            .iter()
            .filter(|r| !old.iter().any(|o| Arc::ptr_eq(o, r)))
            .cloned()
            .chain(new)
            .collect();
        replaced.sort_by_key(|run| std::cmp::Reverse(run.generation()));

        *runs = Arc::new(replaced);
        Ok(())
    }

    /// Writes `tuples` as a new run and installs it. This is the entry point
    /// of the write path.
    pub fn flush_run(&self, mut tuples: Vec<Tuple>) -> Result<Option<Arc<SortedRun>>> {
        if self.is_read_only() {
            return Err(Error::ReadOnly(self.name.to_string()));
        }
        if tuples.is_empty() {
            return Ok(None);
        }

        tuples.sort();
        let mut writer = SSTableWriter::create(
            self.next_run_files(),
            tuples.len(),
            self.config.spatial_index_node_size,
            self.storage_config.bloom_false_positive_rate,
        )?;
        for tuple in &tuples {
            writer.add_tuple(tuple)?;
        }
        let files = writer.finish()?;

        let run = match self.open_run(files.clone()) {
            Ok(run) => Arc::new(run),
            Err(e) => {
                let _ = files.delete();
                return Err(e);
            }
        };
        self.replace_runs(&[], vec![run.clone()])?;

        tracing::debug!(
            table = %self.name,
            generation = run.generation(),
            tuples = tuples.len(),
            "Flushed sorted run"
        );
        Ok(Some(run))
    }

    /// Uninstalls every run and removes the table settings. Runs still in
    /// use are deleted on their last release. Returns true once the table
    /// directory is gone, false while readers keep runs alive.
    pub fn delete_persistent_data(&self) -> Result<bool> {
        self.set_read_only(true);

        let runs = {
            let mut runs = self
                .runs
                .write()
                .map_err(|_| Error::InvalidState("Run list lock poisoned".to_string()))?;
            std::mem::replace(&mut *runs, Arc::new(Vec::new()))
        };
        for run in runs.iter() {
            run.delete_on_release();
        }

        match fs::remove_file(self.dir.join(TABLE_CONFIG_FILE)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        if entries.count() > 0 {
            tracing::debug!(table = %self.name, "Table runs still in use, deletion deferred");
            return Ok(false);
        }

        fs::remove_dir(&self.dir)?;
        tracing::info!(table = %self.name, "Deleted table");
        Ok(true)
    }
}

fn write_table_config(dir: &Path, config: &TupleStoreConfig) -> Result<()> {
    let mut writer = BufWriter::new(File::create(dir.join(TABLE_CONFIG_FILE))?);
    bincode::serialize_into(&mut writer, config)?;
    writer.flush()?;
    Ok(())
}

fn read_table_config(dir: &Path) -> Result<TupleStoreConfig> {
    match File::open(dir.join(TABLE_CONFIG_FILE)) {
        Ok(file) => bincode::deserialize_from(&mut BufReader::new(file)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(dir = %dir.display(), "Table settings missing, using defaults");
            Ok(TupleStoreConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}

/// One storage location: a locked directory with one sub directory per
/// table.
#[derive(Debug)]
pub struct Storage {
    config: Arc<StorageConfig>,
    _lock: DirLock,
    tables: RwLock<HashMap<TableName, Arc<TupleStore>>>,
    pending_deletions: Mutex<Vec<Arc<TupleStore>>>,
}

impl Storage {
    /// Locks the directory and opens every table found in it.
    pub fn open(config: StorageConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let lock = DirLock::lock(&config.dir)?;
        let config = Arc::new(config);

        let mut tables = HashMap::new();
        for entry in fs::read_dir(&config.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(Ok(name)) = entry.file_name().to_str().map(TableName::parse) else {
                tracing::warn!(path = %entry.path().display(), "Ignoring unknown directory");
                continue;
            };

            let table_config = read_table_config(&entry.path())?;
            let table = TupleStore::open(name.clone(), config.clone(), table_config)?;
            tables.insert(name, Arc::new(table));
        }

        Ok(Self {
            config,
            _lock: lock,
            tables: RwLock::new(tables),
            pending_deletions: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn create_table(
        &self,
        name: TableName,
        config: TupleStoreConfig,
    ) -> Result<Arc<TupleStore>> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| Error::InvalidState("Table map lock poisoned".to_string()))?;
        if tables.contains_key(&name) {
            return Err(Error::InvalidOperation(format!("Table {} already exists", name)));
        }

        let table = Arc::new(TupleStore::open(name.clone(), self.config.clone(), config)?);
        write_table_config(table.dir(), table.config())?;
        tables.insert(name, table.clone());
        Ok(table)
    }

    pub fn get_table(&self, name: &TableName) -> Result<Arc<TupleStore>> {
        self.tables
            .read()
            .map_err(|_| Error::InvalidState("Table map lock poisoned".to_string()))?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// All tables ordered by name.
    pub fn tables(&self) -> Vec<Arc<TupleStore>> {
        let tables = match self.tables.read() {
            Ok(tables) => tables,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut tables: Vec<_> = tables.values().cloned().collect();
        tables.sort_by(|a, b| a.name().cmp(b.name()));
        tables
    }

    /// Takes the table out of service. Its data is removed by the next
    /// compaction cycle.
    pub fn schedule_deletion(&self, name: &TableName) -> Result<()> {
        let table = self
            .tables
            .write()
            .map_err(|_| Error::InvalidState("Table map lock poisoned".to_string()))?
            .remove(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))?;

        table.set_read_only(true);
        self.pending_deletions
            .lock()
            .map_err(|_| Error::InvalidState("Deletion queue lock poisoned".to_string()))?
            .push(table);
        Ok(())
    }

    /// Deletes the tables scheduled for deletion, returns how many were
    /// removed. Tables with runs still in use and failed deletions stay
    /// queued for the next cycle.
    pub fn process_scheduled_deletions(&self) -> usize {
        let pending = match self.pending_deletions.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        let mut deleted = 0;
        let mut remaining = Vec::new();
        for table in pending {
            match table.delete_persistent_data() {
                Ok(true) => deleted += 1,
                Ok(false) => remaining.push(table),
                Err(e) => {
                    tracing::warn!(table = %table.name(), error = %e, "Failed to delete table");
                    remaining.push(table);
                }
            }
        }

        if !remaining.is_empty() {
            if let Ok(mut pending) = self.pending_deletions.lock() {
                pending.extend(remaining);
            }
        }
        deleted
    }

    pub fn pending_deletions(&self) -> usize {
        self.pending_deletions.lock().map(|p| p.len()).unwrap_or_default()
    }
}
