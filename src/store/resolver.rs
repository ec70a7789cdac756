//! Duplicate resolvers decide which versions of a key stay visible.
//!
//! A resolver receives every version of one key gathered from all runs of a
//! table and reduces the list in place. Resolving an already resolved list
//! never changes it.

use std::fmt::Debug;
use std::time::Duration;

use crate::config::TupleStoreConfig;
use crate::entity::{now_micros, Tuple};

pub trait DuplicateResolver<T>: Send + Sync + Debug {
    fn resolve(&self, versions: &mut Vec<T>);
}

/// Keeps the single version with the highest version timestamp.
#[derive(Debug, Default, Clone, Copy)]
pub struct NewestTupleResolver;

impl DuplicateResolver<Tuple> for NewestTupleResolver {
    fn resolve(&self, versions: &mut Vec<Tuple>) {
        let newest = versions
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| {
                a.version_timestamp()
                    .cmp(&b.version_timestamp())
                    // Equal versions: the first one wins
                    .then_with(|| ib.cmp(ia))
            })
            .map(|(i, _)| i);

        if let Some(newest) = newest {
            let tuple = versions.swap_remove(newest);
            versions.clear();
            versions.push(tuple);
        }
    }
}

/// Keeps every version.
#[derive(Debug, Default, Clone, Copy)]
pub struct DoNothingResolver;

impl<T> DuplicateResolver<T> for DoNothingResolver {
    fn resolve(&self, _versions: &mut Vec<T>) {}
}

/// Keeps up to `versions` versions, newest first, that are not older than
/// `ttl`. Versions older than the newest tombstone are dropped, the
/// tombstone itself stays so it keeps shadowing older runs.
#[derive(Debug, Clone)]
pub struct TtlVersionResolver {
    ttl: Option<Duration>,
    versions: usize,
}

impl TtlVersionResolver {
    pub fn new(ttl: Option<Duration>, versions: usize) -> Self {
        Self { ttl, versions }
    }

    pub fn resolve_at(&self, versions: &mut Vec<Tuple>, now: u64) {
        versions.sort_by(|a, b| b.version_timestamp().cmp(&a.version_timestamp()));

        if let Some(tombstone) = versions.iter().position(Tuple::is_tombstone) {
            versions.truncate(tombstone + 1);
        }

        if let Some(ttl) = self.ttl {
            let oldest = now.saturating_sub(ttl.as_micros() as u64);
            versions.retain(|t| t.version_timestamp() >= oldest);
        }

        if self.versions > 0 {
            versions.truncate(self.versions);
        }
    }
}

impl DuplicateResolver<Tuple> for TtlVersionResolver {
    fn resolve(&self, versions: &mut Vec<Tuple>) {
        self.resolve_at(versions, now_micros());
    }
}

/// Picks the resolver of a table.
pub fn resolver_for(config: &TupleStoreConfig) -> Box<dyn DuplicateResolver<Tuple>> {
    if !config.allow_duplicates {
        return Box::new(NewestTupleResolver);
    }
    if config.ttl.is_none() && config.versions == 0 {
        return Box::new(DoNothingResolver);
    }
    Box::new(TtlVersionResolver::new(config.ttl, config.versions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Hyperrectangle;

    fn version(key: &str, version: u64) -> Tuple {
        Tuple::with_received_timestamp(key, Hyperrectangle::FULL_SPACE, vec![1], version, version)
    }

    fn timestamps(tuples: &[Tuple]) -> Vec<u64> {
        tuples.iter().map(Tuple::version_timestamp).collect()
    }

    #[test]
    fn test_newest_wins() {
        let mut versions = vec![version("a", 10), version("a", 30), version("a", 20)];
        NewestTupleResolver.resolve(&mut versions);
        assert_eq!(timestamps(&versions), vec![30]);

        let mut with_tombstone = vec![version("a", 10), Tuple::tombstone_received_at("a", 40, 40)];
        NewestTupleResolver.resolve(&mut with_tombstone);
        assert!(with_tombstone[0].is_tombstone());

        let mut empty: Vec<Tuple> = Vec::new();
        NewestTupleResolver.resolve(&mut empty);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_do_nothing() {
        let mut versions = vec![version("a", 10), version("a", 30)];
        DoNothingResolver.resolve(&mut versions);
        assert_eq!(timestamps(&versions), vec![10, 30]);
    }

    #[test]
    fn test_ttl_and_versions() {
        let resolver = TtlVersionResolver::new(Some(Duration::from_micros(100)), 2);
        let mut versions = vec![
            version("a", 850),
            version("a", 990),
            version("a", 950),
            version("a", 920),
        ];
        resolver.resolve_at(&mut versions, 1000);
        assert_eq!(timestamps(&versions), vec![990, 950]);

        let mut expired = vec![version("a", 100), version("a", 200)];
        resolver.resolve_at(&mut expired, 1000);
        assert!(expired.is_empty());
    }

    #[test]
    fn test_ttl_cuts_at_tombstone() {
        let resolver = TtlVersionResolver::new(None, 10);
        let mut versions = vec![
            version("a", 10),
            Tuple::tombstone_received_at("a", 20, 20),
            version("a", 30),
        ];
        resolver.resolve_at(&mut versions, 1000);
        assert_eq!(timestamps(&versions), vec![30, 20]);
        assert!(versions[1].is_tombstone());
    }

    #[test]
    fn test_idempotent() {
        let resolvers: Vec<Box<dyn DuplicateResolver<Tuple>>> = vec![
            Box::new(NewestTupleResolver),
            Box::new(DoNothingResolver),
            Box::new(TtlVersionResolver::new(None, 2)),
        ];

        for resolver in resolvers {
            let mut versions = vec![
                version("a", 5),
                version("a", 7),
                Tuple::tombstone_received_at("a", 3, 3),
                version("a", 9),
            ];
            resolver.resolve(&mut versions);
            let once = versions.clone();
            resolver.resolve(&mut versions);
            assert_eq!(versions, once, "{:?}", resolver);
        }
    }

    #[test]
    fn test_resolver_for_config() {
        let newest = resolver_for(&TupleStoreConfig::default());
        assert!(format!("{:?}", newest).contains("NewestTupleResolver"));

        let all = resolver_for(&TupleStoreConfig::default().with_duplicates(0, None));
        assert!(format!("{:?}", all).contains("DoNothingResolver"));

        let ttl = resolver_for(
            &TupleStoreConfig::default().with_duplicates(3, Some(Duration::from_secs(60))),
        );
        assert!(format!("{:?}", ttl).contains("TtlVersionResolver"));
    }
}
