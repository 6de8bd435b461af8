//! In-memory tile index: `(level, band, x, y)` → byte location.
//!
//! The index lives in memory for the whole life of a dataset handle. A
//! writer fills it as tiles are appended and flushes it into the trailer at
//! close; a reader rebuilds it from the trailer in one pass and then serves
//! every block lookup from memory, so reading any tile costs one seek.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::error::Result;

/// Identifies one tile in the file. Level 0 is full resolution; overview
/// levels count from 1. Bands count from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TileKey {
    pub level: u64,
    pub band: u64,
    pub x: u64,
    pub y: u64,
}

/// Where a tile's payload lives: absolute offset of its compression byte
/// plus the compressed and uncompressed payload sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLoc {
    pub offset: u64,
    pub size: u64,
    pub uncompressed_size: u64,
}

/// Bytes one serialized index entry occupies in the trailer (seven u64s).
pub const TILE_RECORD_BYTES: u64 = 7 * 8;

#[derive(Debug, Default)]
pub struct TileIndex {
    map: BTreeMap<TileKey, TileLoc>,
}

impl TileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tile location. Re-inserting an existing key replaces the
    /// previous location — the last writer wins.
    pub fn insert(&mut self, key: TileKey, loc: TileLoc) {
        self.map.insert(key, loc);
    }

    pub fn get(&self, key: &TileKey) -> Option<TileLoc> {
        self.map.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TileKey, &TileLoc)> {
        self.map.iter()
    }

    /// Serializes the index: entry count (u64), then per entry
    /// `offset, size, uncompressed_size, level, band, x, y` as u64 each,
    /// in map iteration order.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64::<LittleEndian>(self.map.len() as u64)?;
        for (key, loc) in &self.map {
            w.write_u64::<LittleEndian>(loc.offset)?;
            w.write_u64::<LittleEndian>(loc.size)?;
            w.write_u64::<LittleEndian>(loc.uncompressed_size)?;
            w.write_u64::<LittleEndian>(key.level)?;
            w.write_u64::<LittleEndian>(key.band)?;
            w.write_u64::<LittleEndian>(key.x)?;
            w.write_u64::<LittleEndian>(key.y)?;
        }
        Ok(())
    }

    /// Rebuilds the index from its serialized form, given the entry count
    /// already read by the caller.
    pub fn read_entries<R: Read>(r: &mut R, count: u64) -> Result<Self> {
        let mut index = Self::new();
        for _ in 0..count {
            let offset = r.read_u64::<LittleEndian>()?;
            let size = r.read_u64::<LittleEndian>()?;
            let uncompressed_size = r.read_u64::<LittleEndian>()?;
            let level = r.read_u64::<LittleEndian>()?;
            let band = r.read_u64::<LittleEndian>()?;
            let x = r.read_u64::<LittleEndian>()?;
            let y = r.read_u64::<LittleEndian>()?;
            index.insert(
                TileKey { level, band, x, y },
                TileLoc {
                    offset,
                    size,
                    uncompressed_size,
                },
            );
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;
    use std::io::Cursor;

    fn key(level: u64, band: u64, x: u64, y: u64) -> TileKey {
        TileKey { level, band, x, y }
    }

    #[test]
    fn insert_and_lookup() {
        let mut index = TileIndex::new();
        index.insert(
            key(0, 1, 2, 3),
            TileLoc {
                offset: 100,
                size: 50,
                uncompressed_size: 200,
            },
        );

        let loc = index.get(&key(0, 1, 2, 3)).unwrap();
        assert_eq!(loc.offset, 100);
        assert!(index.get(&key(0, 1, 2, 4)).is_none());
    }

    #[test]
    fn reinsert_replaces() {
        let mut index = TileIndex::new();
        let k = key(1, 1, 0, 0);
        index.insert(
            k,
            TileLoc {
                offset: 10,
                size: 1,
                uncompressed_size: 1,
            },
        );
        index.insert(
            k,
            TileLoc {
                offset: 999,
                size: 2,
                uncompressed_size: 2,
            },
        );

        assert_eq!(index.len(), 1);
        assert_eq!(index.get(&k).unwrap().offset, 999);
    }

    #[test]
    fn serialization_round_trip() {
        let mut index = TileIndex::new();
        for band in 1..=3u64 {
            for y in 0..2u64 {
                for x in 0..2u64 {
                    index.insert(
                        key(0, band, x, y),
                        TileLoc {
                            offset: band * 1000 + y * 10 + x,
                            size: 17,
                            uncompressed_size: 42,
                        },
                    );
                }
            }
        }

        let mut buf = Vec::new();
        index.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, 8 + 12 * TILE_RECORD_BYTES);

        let mut cursor = Cursor::new(&buf);
        let count = cursor.read_u64::<LittleEndian>().unwrap();
        assert_eq!(count, 12);
        let rebuilt = TileIndex::read_entries(&mut cursor, count).unwrap();

        assert_eq!(rebuilt.len(), index.len());
        for (k, loc) in index.iter() {
            assert_eq!(rebuilt.get(k).unwrap(), *loc);
        }
    }
}
