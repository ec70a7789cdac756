//! R-tree file format.
//!
//! ```text
//! +-------------+-------------------+
//! | magic bytes | max_node_size:i32 |
//! +-------------+-------------------+
//! node:
//! +------------+--------------+------+
//! | node_id:i32| bbox_len:i32 | bbox |
//! +------------+--------------+------+
//! | max_node_size entry slots: FOLLOWING + entry | NOT_EXISTING |
//! +----------------------------------------------------------------+
//! | max_node_size child slots: offset:i32 | NOT_EXISTING            |
//! +----------------------------------------------------------------+
//! ```
//!
//! Nodes are written depth first. A child slot is written as a placeholder
//! and patched with the child's file offset once the child is written.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{Node, RTreeBuilder, FOLLOWING, NOT_EXISTING};
use crate::entity::Hyperrectangle;
use crate::error::Result;
use crate::spatial::{SpatialIndexEntry, SPATIAL_INDEX_MAGIC};
use crate::Error;

pub(crate) fn write_tree<W: Write>(tree: &RTreeBuilder, writer: &mut W) -> Result<()> {
    let max_node_size = tree.max_node_size();
    let nodes = tree.nodes();

    let mut buffer = Vec::new();
    buffer.extend_from_slice(SPATIAL_INDEX_MAGIC);
    buffer
        .write_i32::<BigEndian>(max_node_size as i32)
        .map_err(|e| Error::Encode("max node size", e))?;

    let mut pending: Vec<(usize, Option<usize>)> = vec![(tree.root(), None)];
    while let Some((position, patch_slot)) = pending.pop() {
        let offset = i32::try_from(buffer.len()).map_err(|_| {
            Error::InvalidOperation("Spatial index exceeds the maximum file size".to_string())
        })?;
        if let Some(slot) = patch_slot {
            buffer[slot..slot + 4].copy_from_slice(&offset.to_be_bytes());
        }

        let node = &nodes[position];
        write_node(&mut buffer, node, max_node_size)?;

        // Child slots
        for slot in 0..max_node_size {
            if let Some(child) = node.children.get(slot) {
                pending.push((*child, Some(buffer.len())));
            }
            buffer.extend_from_slice(&NOT_EXISTING);
        }
    }

    writer
        .write_all(&buffer)
        .map_err(|e| Error::Encode("spatial index", e))
}

fn write_node(buffer: &mut Vec<u8>, node: &Node, max_node_size: usize) -> Result<()> {
    if node.entries.len() > max_node_size || node.children.len() > max_node_size {
        return Err(Error::InvalidState(format!(
            "Node {} exceeds the maximum node size {}",
            node.id, max_node_size
        )));
    }

    let bbox = node.bounding_box.to_bytes();
    buffer
        .write_i32::<BigEndian>(node.id)
        .and_then(|_| buffer.write_i32::<BigEndian>(bbox.len() as i32))
        .map_err(|e| Error::Encode("node header", e))?;
    buffer.extend_from_slice(&bbox);

    for slot in 0..max_node_size {
        match node.entries.get(slot) {
            Some(entry) => {
                buffer.extend_from_slice(&FOLLOWING);
                entry.write_to(buffer)?;
            }
            None => buffer.extend_from_slice(&NOT_EXISTING),
        }
    }

    Ok(())
}

/// Reads and checks the file header, returns the max node size.
pub(crate) fn read_header<R: Read>(reader: &mut R) -> Result<usize> {
    let mut magic = vec![0u8; SPATIAL_INDEX_MAGIC.len()];
    reader
        .read_exact(&mut magic)
        .map_err(|e| Error::Decode("spatial index magic", e))?;
    if magic != SPATIAL_INDEX_MAGIC {
        return Err(Error::InvalidHeader("spatial index"));
    }

    let max_node_size = reader
        .read_i32::<BigEndian>()
        .map_err(|e| Error::Decode("max node size", e))?;
    if max_node_size <= 0 {
        return Err(Error::IndexCorruption(format!(
            "Invalid max node size {}",
            max_node_size
        )));
    }

    Ok(max_node_size as usize)
}

/// A node as stored on disk, children still referenced by file offset.
pub(crate) struct StoredNode {
    pub(crate) id: i32,
    pub(crate) bounding_box: Hyperrectangle,
    pub(crate) entries: Vec<SpatialIndexEntry>,
    pub(crate) child_offsets: Vec<u64>,
}

/// Reads the node header only.
pub(crate) fn read_node_header<R: Read>(reader: &mut R) -> Result<(i32, Hyperrectangle)> {
    let id = reader
        .read_i32::<BigEndian>()
        .map_err(|e| Error::Decode("node id", e))?;
    let bbox_len = reader
        .read_i32::<BigEndian>()
        .map_err(|e| Error::Decode("node bbox length", e))?;
    if bbox_len < 0 {
        return Err(Error::IndexCorruption(format!(
            "Negative bbox length in node {}",
            id
        )));
    }

    let mut bbox = vec![0u8; bbox_len as usize];
    reader
        .read_exact(&mut bbox)
        .map_err(|e| Error::Decode("node bbox", e))?;
    Ok((id, Hyperrectangle::from_bytes(&bbox)?))
}

/// Reads the entry and child slots following a node header.
pub(crate) fn read_node_body<R: Read>(
    reader: &mut R,
    id: i32,
    bounding_box: Hyperrectangle,
    max_node_size: usize,
) -> Result<StoredNode> {
    let mut entries = Vec::new();
    for _ in 0..max_node_size {
        match read_marker(reader)? {
            FOLLOWING => entries.push(SpatialIndexEntry::read_from(reader)?),
            NOT_EXISTING => {}
            other => {
                return Err(Error::IndexCorruption(format!(
                    "Unknown entry marker {:?} in node {}",
                    other, id
                )))
            }
        }
    }

    let mut child_offsets = Vec::new();
    for _ in 0..max_node_size {
        let slot = read_marker(reader)?;
        if slot == NOT_EXISTING {
            continue;
        }

        let offset = i32::from_be_bytes(slot);
        if offset <= 0 {
            return Err(Error::IndexCorruption(format!(
                "Invalid child offset {} in node {}",
                offset, id
            )));
        }
        child_offsets.push(offset as u64);
    }

    Ok(StoredNode {
        id,
        bounding_box,
        entries,
        child_offsets,
    })
}

fn read_marker<R: Read>(reader: &mut R) -> Result<[u8; 4]> {
    let mut marker = [0u8; 4];
    reader
        .read_exact(&mut marker)
        .map_err(|e: io::Error| Error::Decode("node slot", e))?;
    Ok(marker)
}
