use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::serializer::{read_header, read_node_body, read_node_header};
use super::{search, Node};
use crate::entity::Hyperrectangle;
use crate::error::Result;
use crate::spatial::{SpatialIndexEntry, SpatialIndexReader};
use crate::Error;

/// Decodes the whole tree once and answers queries from memory.
#[derive(Debug)]
pub struct RTreeMemoryReader {
    max_node_size: usize,
    nodes: Vec<Node>,
}

impl RTreeMemoryReader {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| Error::Decode("spatial index", e))?;

        let mut cursor = Cursor::new(data.as_slice());
        let max_node_size = read_header(&mut cursor)?;

        // (file offset, parent position)
        let mut pending = vec![(cursor.position(), None::<usize>)];
        let mut nodes: Vec<Node> = Vec::new();

        while let Some((offset, parent)) = pending.pop() {
            if offset as usize >= data.len() {
                return Err(Error::IndexCorruption(format!(
                    "Node offset {} beyond end of index",
                    offset
                )));
            }

            cursor.set_position(offset);
            let (id, bbox) = read_node_header(&mut cursor)?;
            let stored = read_node_body(&mut cursor, id, bbox, max_node_size)?;

            let position = nodes.len();
            nodes.push(Node {
                id: stored.id,
                bounding_box: stored.bounding_box,
                entries: stored.entries,
                children: Vec::new(),
                parent,
            });
            if let Some(parent) = parent {
                nodes[parent].children.push(position);
            }

            if nodes.len() > data.len() {
                return Err(Error::IndexCorruption(
                    "Cycle in spatial index".to_string(),
                ));
            }

            pending.extend(stored.child_offsets.into_iter().map(|o| (o, Some(position))));
        }

        Ok(Self {
            max_node_size,
            nodes,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::read_from(&mut reader)
    }

    pub fn entry_count(&self) -> usize {
        self.nodes.iter().map(|n| n.entries.len()).sum()
    }
}

impl SpatialIndexReader for RTreeMemoryReader {
    fn get_entries_for_region(&self, region: &Hyperrectangle) -> Result<Vec<SpatialIndexEntry>> {
        if self.nodes.is_empty() {
            return Ok(Vec::new());
        }
        Ok(search(&self.nodes, 0, region))
    }

    fn max_node_size(&self) -> usize {
        self.max_node_size
    }
}

/// Re-reads the nodes it needs from the index file on every query. Nodes
/// whose box does not intersect the query are never decoded past their
/// header.
#[derive(Debug)]
pub struct RTreeFileReader {
    path: PathBuf,
    max_node_size: usize,
    root_offset: u64,
}

impl RTreeFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let max_node_size = read_header(&mut reader)?;
        let root_offset = reader.stream_position()?;

        Ok(Self {
            path: path.to_path_buf(),
            max_node_size,
            root_offset,
        })
    }
}

impl SpatialIndexReader for RTreeFileReader {
    fn get_entries_for_region(&self, region: &Hyperrectangle) -> Result<Vec<SpatialIndexEntry>> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let file_size = reader.get_ref().metadata()?.len();

        let mut result = Vec::new();
        let mut pending = vec![self.root_offset];
        let mut visited = 0usize;

        while let Some(offset) = pending.pop() {
            visited += 1;
            if offset >= file_size || visited as u64 > file_size {
                return Err(Error::IndexCorruption(format!(
                    "Invalid node offset {} in {}",
                    offset,
                    self.path.display()
                )));
            }

            reader.seek(SeekFrom::Start(offset))?;
            let (id, bbox) = read_node_header(&mut reader)?;
            if !bbox.intersects(region) {
                continue;
            }

            let node = read_node_body(&mut reader, id, bbox, self.max_node_size)?;
            result.extend(
                node.entries
                    .into_iter()
                    .filter(|entry| entry.bounding_box().intersects(region)),
            );
            pending.extend(node.child_offsets);
        }

        Ok(result)
    }

    fn max_node_size(&self) -> usize {
        self.max_node_size
    }
}
