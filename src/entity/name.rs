use std::fmt;

use crate::error::Result;
use crate::Error;

/// Table identity: `<group>_<table>` or `<group>_<table>_<region>`.
///
/// A table with a region id belongs to a distributed group and may be split
/// by the placement layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName {
    group: String,
    table: String,
    region: Option<u64>,
}

impl TableName {
    pub fn new(group: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        let (group, table) = (group.into(), table.into());
        for part in [&group, &table] {
            if part.is_empty() || part.contains('_') || part.contains('/') {
                return Err(Error::InvalidData(format!(
                    "Invalid table name component: {:?}",
                    part
                )));
            }
        }

        Ok(Self {
            group,
            table,
            region: None,
        })
    }

    pub fn with_region(mut self, region: u64) -> Self {
        self.region = Some(region);
        self
    }

    pub fn parse(fullname: &str) -> Result<Self> {
        let parts: Vec<&str> = fullname.split('_').collect();
        match parts.as_slice() {
            [group, table] => Self::new(*group, *table),
            [group, table, region] => {
                let region = region.parse::<u64>().map_err(|_| {
                    Error::InvalidData(format!("Invalid region id in {:?}", fullname))
                })?;
                Ok(Self::new(*group, *table)?.with_region(region))
            }
            _ => Err(Error::InvalidData(format!(
                "Invalid table name: {:?}",
                fullname
            ))),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn region(&self) -> Option<u64> {
        self.region
    }

    pub fn is_distributed(&self) -> bool {
        self.region.is_some()
    }

    pub fn fullname(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.region {
            Some(region) => write!(f, "{}_{}_{}", self.group, self.table, region),
            None => write!(f, "{}_{}", self.group, self.table),
        }
    }
}
