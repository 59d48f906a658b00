//! Directory snapshots.
//!
//! A snapshot is the bincode encoding of a [`DirectorySnapshot`]: an entry count
//! followed by one `{address tag, sharer bitset}` record per entry that has at least
//! one sharer, in the order the entries were created. Loading replaces the directory
//! contents and skips records without sharers.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::core::CoherenceResult;

use super::{Directory, SharingVector};

/// One persisted directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub tag: u64,
    pub sharers: SharingVector,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub entries: Vec<SnapshotEntry>,
}

impl DirectorySnapshot {
    /// Capture every entry of `dir` that has at least one sharer.
    pub fn capture(dir: &dyn Directory) -> Self {
        let entries = dir
            .entries()
            .into_iter()
            .filter(|entry| !entry.sharers().is_empty())
            .map(|entry| SnapshotEntry {
                tag: entry.address(),
                sharers: entry.sharers(),
            })
            .collect();
        Self { entries }
    }

    /// Replace the contents of `dir` with this snapshot.
    pub fn restore(&self, dir: &mut dyn Directory) -> CoherenceResult<usize> {
        dir.clear();
        let mut restored = 0;
        for entry in self.entries.iter().filter(|e| !e.sharers.is_empty()) {
            dir.insert_entry(entry.tag, entry.sharers)?;
            restored += 1;
        }
        Ok(restored)
    }
}

/// Write `dir` to `writer`.
pub fn save_snapshot(dir: &dyn Directory, writer: impl Write) -> CoherenceResult<usize> {
    let snapshot = DirectorySnapshot::capture(dir);
    bincode::serialize_into(writer, &snapshot)?;
    log::debug!("{}: saved {} entries", dir.name(), snapshot.entries.len());
    Ok(snapshot.entries.len())
}

/// Replace the contents of `dir` with the snapshot read from `reader`.
pub fn load_snapshot(dir: &mut dyn Directory, reader: impl Read) -> CoherenceResult<usize> {
    let snapshot: DirectorySnapshot = bincode::deserialize_from(reader)?;
    let restored = snapshot.restore(dir)?;
    log::debug!("{}: loaded {} entries", dir.name(), restored);
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{InfiniteDirectory, SetAssociativeDirectory};

    #[test]
    fn test_round_trip_preserves_order_and_drops_empty() {
        let mut dir = InfiniteDirectory::new();
        dir.insert_entry(0x200, SharingVector::from_nodes([1, 4])).unwrap();
        dir.insert_entry(0x100, SharingVector::new()).unwrap();
        dir.insert_entry(0x300, SharingVector::from_nodes([7])).unwrap();

        let mut bytes = Vec::new();
        assert_eq!(save_snapshot(&dir, &mut bytes).unwrap(), 2);

        let mut reloaded = SetAssociativeDirectory::new(8, 2, 64).unwrap();
        assert_eq!(load_snapshot(&mut reloaded, bytes.as_slice()).unwrap(), 2);
        let entries: Vec<_> = reloaded
            .entries()
            .iter()
            .map(|e| (e.address(), e.sharers().to_list()))
            .collect();
        assert_eq!(entries, vec![(0x200, vec![1, 4]), (0x300, vec![7])]);
    }

    #[test]
    fn test_encoding_layout() {
        let snapshot = DirectorySnapshot {
            entries: vec![SnapshotEntry {
                tag: 0x40,
                sharers: SharingVector::from_nodes([0]),
            }],
        };
        let bytes = bincode::serialize(&snapshot).unwrap();
        // u64 count, u64 tag, u128 bitset.
        assert_eq!(bytes.len(), 8 + 8 + 16);
        assert_eq!(&bytes[..8], &1u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &0x40u64.to_le_bytes());
    }

    #[test]
    fn test_restore_skips_empty_records() {
        let snapshot = DirectorySnapshot {
            entries: vec![
                SnapshotEntry { tag: 0x40, sharers: SharingVector::new() },
                SnapshotEntry { tag: 0x80, sharers: SharingVector::from_nodes([2]) },
            ],
        };
        let mut dir = InfiniteDirectory::new();
        dir.insert_entry(0x1000, SharingVector::from_nodes([9])).unwrap();
        assert_eq!(snapshot.restore(&mut dir).unwrap(), 1);
        assert_eq!(dir.len(), 1);
        assert!(dir.find(0x80).is_some());
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let mut dir = InfiniteDirectory::new();
        assert!(load_snapshot(&mut dir, &[1u8, 0, 0][..]).is_err());
    }
}
