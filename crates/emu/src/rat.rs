//! Per-band Raster Attribute Table with chunked columnar storage.
//!
//! Each column owns an ordered list of chunks; a chunk covers a contiguous
//! row range and is compressed as one payload in the body, so a reader can
//! pull any row range by decoding only the chunks that overlap it. Numeric
//! rows are stored 8 bytes wide (integers widened to i64, reals as f64);
//! string rows are concatenated null-terminated bytes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use codec::Compression;
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;

use crate::dataset::{AccessMode, SharedHandle};
use crate::error::{EmuError, Result};

/// Maximum number of rows one chunk may cover, uncompressed.
pub const RAT_CHUNK_ROWS: u64 = 65536;

/// Column value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatType {
    Integer,
    Real,
    String,
}

impl RatType {
    pub fn code(self) -> u64 {
        match self {
            Self::Integer => 0,
            Self::Real => 1,
            Self::String => 2,
        }
    }

    pub fn from_code(code: u64) -> Result<Self> {
        match code {
            0 => Ok(Self::Integer),
            1 => Ok(Self::Real),
            2 => Ok(Self::String),
            other => Err(EmuError::Format(format!("unknown RAT column type {other}"))),
        }
    }
}

/// What a column is for. Not stored; inferred from the column name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatUsage {
    PixelCount,
    Name,
    Red,
    Green,
    Blue,
    Alpha,
    Generic,
}

/// Maps a column name onto its usage via the fixed well-known-name table.
pub fn usage_for_name(name: &str) -> RatUsage {
    match name {
        "Histogram" => RatUsage::PixelCount,
        "Name" => RatUsage::Name,
        "Red" => RatUsage::Red,
        "Green" => RatUsage::Green,
        "Blue" => RatUsage::Blue,
        "Alpha" => RatUsage::Alpha,
        _ => RatUsage::Generic,
    }
}

/// One compressed run of rows: `[start_row, start_row + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatChunk {
    pub start_row: u64,
    pub length: u64,
    pub offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

#[derive(Debug)]
struct RatColumn {
    name: String,
    col_type: RatType,
    chunks: Vec<RatChunk>,
}

/// The attribute table of one band.
///
/// Holds the same lock handle as the dataset that owns it; every path that
/// touches the file goes through that lock.
#[derive(Debug)]
pub struct Rat {
    shared: SharedHandle,
    compression: Compression,
    columns: Vec<RatColumn>,
    row_count: u64,
}

impl Rat {
    pub(crate) fn new(shared: SharedHandle, compression: Compression) -> Self {
        Self {
            shared,
            compression,
            columns: Vec::new(),
            row_count: 0,
        }
    }

    /// Declares a new column. The usage argument is accepted for interface
    /// parity but the stored table derives usage from the name alone.
    pub fn create_column(
        &mut self,
        name: &str,
        col_type: RatType,
        _usage: RatUsage,
    ) -> Result<usize> {
        if self.shared.lock().unwrap().mode != AccessMode::Write {
            return Err(EmuError::NotSupported(
                "RAT columns can only be created while writing",
            ));
        }
        self.columns.push(RatColumn {
            name: name.to_string(),
            col_type,
            chunks: Vec::new(),
        });
        Ok(self.columns.len() - 1)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Grows the row count. A smaller value is ignored; the count never
    /// shrinks.
    pub fn set_row_count(&mut self, count: u64) {
        if count > self.row_count {
            self.row_count = count;
        }
    }

    pub fn column_name(&self, col: usize) -> Result<&str> {
        Ok(&self.column(col)?.name)
    }

    pub fn column_type(&self, col: usize) -> Result<RatType> {
        Ok(self.column(col)?.col_type)
    }

    pub fn column_usage(&self, col: usize) -> Result<RatUsage> {
        Ok(usage_for_name(&self.column(col)?.name))
    }

    /// First column whose name maps onto `usage`, if any.
    pub fn column_of_usage(&self, usage: RatUsage) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| usage_for_name(&c.name) == usage)
    }

    /// The column's chunk list, in storage order.
    pub fn column_chunks(&self, col: usize) -> Result<&[RatChunk]> {
        Ok(&self.column(col)?.chunks)
    }

    /// True when mutations go straight to the file (write mode).
    pub fn changes_are_written(&self) -> bool {
        self.shared.lock().unwrap().mode == AccessMode::Write
    }

    fn column(&self, col: usize) -> Result<&RatColumn> {
        self.columns
            .get(col)
            .ok_or_else(|| EmuError::NotFound(format!("RAT column {col} out of range")))
    }

    // ---- writes ----

    pub fn write_integer(&mut self, col: usize, start_row: u64, values: &[i64]) -> Result<()> {
        match self.column(col)?.col_type {
            RatType::Integer => self.write_chunks(col, start_row, values.len(), |range, raw| {
                for i in range {
                    raw.extend_from_slice(&values[i].to_le_bytes());
                }
            }),
            RatType::Real => self.write_chunks(col, start_row, values.len(), |range, raw| {
                for i in range {
                    raw.extend_from_slice(&(values[i] as f64).to_le_bytes());
                }
            }),
            RatType::String => Err(EmuError::NotSupported(
                "integer values cannot be written to a string column",
            )),
        }
    }

    pub fn write_real(&mut self, col: usize, start_row: u64, values: &[f64]) -> Result<()> {
        match self.column(col)?.col_type {
            RatType::Real => self.write_chunks(col, start_row, values.len(), |range, raw| {
                for i in range {
                    raw.extend_from_slice(&values[i].to_le_bytes());
                }
            }),
            RatType::Integer => self.write_chunks(col, start_row, values.len(), |range, raw| {
                for i in range {
                    raw.extend_from_slice(&(values[i] as i64).to_le_bytes());
                }
            }),
            RatType::String => Err(EmuError::NotSupported(
                "real values cannot be written to a string column",
            )),
        }
    }

    pub fn write_string(&mut self, col: usize, start_row: u64, values: &[String]) -> Result<()> {
        if self.column(col)?.col_type != RatType::String {
            return Err(EmuError::NotSupported(
                "string values cannot be written to a numeric column",
            ));
        }
        self.write_chunks(col, start_row, values.len(), |range, raw| {
            for i in range {
                raw.extend_from_slice(values[i].as_bytes());
                raw.push(0);
            }
        })
    }

    /// Shared write path: clamps the request to the row count, splits it
    /// into segments of at most [`RAT_CHUNK_ROWS`] rows, and appends one
    /// compressed payload plus chunk record per segment.
    fn write_chunks(
        &mut self,
        col: usize,
        start_row: u64,
        rows: usize,
        serialize: impl Fn(Range<usize>, &mut Vec<u8>),
    ) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        if shared.mode != AccessMode::Write {
            return Err(EmuError::NotSupported(
                "RAT values can only be written while writing",
            ));
        }
        if start_row >= self.row_count {
            return Ok(());
        }
        let rows = rows.min((self.row_count - start_row) as usize);

        let mut done = 0usize;
        while done < rows {
            let segment = (rows - done).min(RAT_CHUNK_ROWS as usize);
            let mut raw = Vec::with_capacity(segment * 8);
            serialize(done..done + segment, &mut raw);

            let offset = shared.file.stream_position()?;
            shared.file.write_u8(self.compression.code())?;
            let packed = codec::compress(self.compression, &raw)?;
            shared.file.write_all(&packed)?;

            self.columns[col].chunks.push(RatChunk {
                start_row: start_row + done as u64,
                length: segment as u64,
                offset,
                compressed_size: packed.len() as u64,
                uncompressed_size: raw.len() as u64,
            });
            done += segment;
        }
        Ok(())
    }

    // ---- reads ----

    pub fn read_integer(&self, col: usize, start_row: u64, out: &mut [i64]) -> Result<()> {
        let col_type = self.column(col)?.col_type;
        if col_type == RatType::String {
            return Err(EmuError::NotSupported(
                "integer values cannot be read from a string column",
            ));
        }
        let raw = self.read_numeric_raw(col, start_row, out.len())?;
        for (value, cell) in out.iter_mut().zip(raw.chunks_exact(8)) {
            let bits = u64::from_le_bytes(cell.try_into().expect("cell length"));
            *value = match col_type {
                RatType::Integer => bits as i64,
                RatType::Real => f64::from_bits(bits) as i64,
                RatType::String => unreachable!(),
            };
        }
        Ok(())
    }

    pub fn read_real(&self, col: usize, start_row: u64, out: &mut [f64]) -> Result<()> {
        let col_type = self.column(col)?.col_type;
        if col_type == RatType::String {
            return Err(EmuError::NotSupported(
                "real values cannot be read from a string column",
            ));
        }
        let raw = self.read_numeric_raw(col, start_row, out.len())?;
        for (value, cell) in out.iter_mut().zip(raw.chunks_exact(8)) {
            let bits = u64::from_le_bytes(cell.try_into().expect("cell length"));
            *value = match col_type {
                RatType::Real => f64::from_bits(bits),
                RatType::Integer => bits as i64 as f64,
                RatType::String => unreachable!(),
            };
        }
        Ok(())
    }

    pub fn read_string(&self, col: usize, start_row: u64, out: &mut [String]) -> Result<()> {
        if self.column(col)?.col_type != RatType::String {
            return Err(EmuError::NotSupported(
                "string values cannot be read from a numeric column",
            ));
        }
        for value in out.iter_mut() {
            value.clear();
        }

        let mut shared = self.shared.lock().unwrap();
        if shared.mode != AccessMode::Read {
            return Err(EmuError::NotSupported(
                "RAT values can only be read after the file is closed and reopened",
            ));
        }

        let end_row = start_row + out.len() as u64;
        for chunk in overlapping_chunks(&self.columns[col].chunks, start_row, end_row) {
            let raw = read_chunk_payload(&mut shared.file, &chunk)?;
            let rows: Vec<&[u8]> = raw.split(|b| *b == 0).take(chunk.length as usize).collect();

            let lo = start_row.max(chunk.start_row);
            let hi = end_row.min(chunk.start_row + chunk.length);
            for row in lo..hi {
                let token = rows
                    .get((row - chunk.start_row) as usize)
                    .copied()
                    .unwrap_or(b"");
                out[(row - start_row) as usize] = String::from_utf8_lossy(token).into_owned();
            }
        }
        Ok(())
    }

    /// Reads `rows` 8-byte cells starting at `start_row` into a zero-filled
    /// buffer. Rows no chunk covers stay zero.
    fn read_numeric_raw(&self, col: usize, start_row: u64, rows: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; rows * 8];
        let mut shared = self.shared.lock().unwrap();
        if shared.mode != AccessMode::Read {
            return Err(EmuError::NotSupported(
                "RAT values can only be read after the file is closed and reopened",
            ));
        }

        let end_row = start_row + rows as u64;
        for chunk in overlapping_chunks(&self.columns[col].chunks, start_row, end_row) {
            let raw = read_chunk_payload(&mut shared.file, &chunk)?;

            let lo = start_row.max(chunk.start_row);
            let hi = end_row.min(chunk.start_row + chunk.length);
            let src = ((lo - chunk.start_row) * 8) as usize;
            let dst = ((lo - start_row) * 8) as usize;
            let len = ((hi - lo) * 8) as usize;
            out[dst..dst + len].copy_from_slice(&raw[src..src + len]);
        }
        Ok(out)
    }

    // ---- trailer index ----

    /// Writes this table's index: row count, column count, then per column
    /// its type, null-terminated name, chunk count, and chunk records.
    /// Chunk lists are sorted by start row before emission.
    pub(crate) fn write_index<W: Write>(&mut self, w: &mut W) -> Result<()> {
        w.write_u64::<LittleEndian>(self.row_count)?;
        w.write_u64::<LittleEndian>(self.columns.len() as u64)?;
        for column in &mut self.columns {
            column.chunks.sort_by_key(|c| c.start_row);

            w.write_u64::<LittleEndian>(column.col_type.code())?;
            w.write_all(column.name.as_bytes())?;
            w.write_all(&[0])?;
            w.write_u64::<LittleEndian>(column.chunks.len() as u64)?;
            for chunk in &column.chunks {
                w.write_u64::<LittleEndian>(chunk.start_row)?;
                w.write_u64::<LittleEndian>(chunk.length)?;
                w.write_u64::<LittleEndian>(chunk.offset)?;
                w.write_u64::<LittleEndian>(chunk.compressed_size)?;
                w.write_u64::<LittleEndian>(chunk.uncompressed_size)?;
            }
        }
        Ok(())
    }

    /// Reads a table index back in the shape [`write_index`] produced.
    pub(crate) fn read_index<R: Read>(
        r: &mut R,
        shared: SharedHandle,
        compression: Compression,
    ) -> Result<Self> {
        let row_count = r.read_u64::<LittleEndian>()?;
        let column_count = r.read_u64::<LittleEndian>()?;

        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let col_type = RatType::from_code(r.read_u64::<LittleEndian>()?)?;
            let name = read_null_terminated(r)?;
            let chunk_count = r.read_u64::<LittleEndian>()?;
            let mut chunks = Vec::with_capacity(chunk_count as usize);
            for _ in 0..chunk_count {
                chunks.push(RatChunk {
                    start_row: r.read_u64::<LittleEndian>()?,
                    length: r.read_u64::<LittleEndian>()?,
                    offset: r.read_u64::<LittleEndian>()?,
                    compressed_size: r.read_u64::<LittleEndian>()?,
                    uncompressed_size: r.read_u64::<LittleEndian>()?,
                });
            }
            columns.push(RatColumn {
                name,
                col_type,
                chunks,
            });
        }

        Ok(Self {
            shared,
            compression,
            columns,
            row_count,
        })
    }
}

/// Chunks of `chunks` (sorted by start row) overlapping `[start, end)`,
/// in row order.
fn overlapping_chunks(chunks: &[RatChunk], start: u64, end: u64) -> Vec<RatChunk> {
    let first = chunks
        .partition_point(|c| c.start_row <= start)
        .saturating_sub(1);
    chunks[first..]
        .iter()
        .filter(|c| c.start_row < end && c.start_row + c.length > start)
        .copied()
        .collect()
}

/// Seeks to a chunk, reads its algorithm byte and payload, decompresses.
fn read_chunk_payload<F: Read + Seek>(file: &mut F, chunk: &RatChunk) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(chunk.offset))?;
    let algo = Compression::from_code(file.read_u8()?)?;
    let mut packed = vec![0u8; chunk.compressed_size as usize];
    file.read_exact(&mut packed)?;

    let mut raw = vec![0u8; chunk.uncompressed_size as usize];
    codec::decompress(algo, &packed, &mut raw)?;
    Ok(raw)
}

fn read_null_terminated<R: Read>(r: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let b = r.read_u8()?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    String::from_utf8(bytes).map_err(|_| EmuError::Format("column name is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Shared;
    use crate::tile_index::TileIndex;
    use anyhow::Result;
    use std::fs::OpenOptions;
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn writable_shared(path: &Path) -> SharedHandle {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)
            .unwrap();
        Arc::new(Mutex::new(Shared {
            file,
            tile_index: TileIndex::new(),
            mode: AccessMode::Write,
        }))
    }

    /// Serializes the index, then rebuilds the RAT against the same file
    /// reopened in read mode, the way the dataset trailer path does.
    fn reopen_for_read(rat: &mut Rat, path: &Path) -> Rat {
        let mut index = Vec::new();
        rat.write_index(&mut index).unwrap();

        let file = OpenOptions::new().read(true).open(path).unwrap();
        let shared = Arc::new(Mutex::new(Shared {
            file,
            tile_index: TileIndex::new(),
            mode: AccessMode::Read,
        }));
        Rat::read_index(&mut Cursor::new(&index), shared, Compression::Zlib).unwrap()
    }

    #[test]
    fn chunk_split_at_65536_rows() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("rat.bin");
        let mut rat = Rat::new(writable_shared(&path), Compression::Zlib);

        let col = rat.create_column("Value", RatType::Integer, RatUsage::Generic)?;
        rat.set_row_count(200_000);
        let values: Vec<i64> = (0..200_000).collect();
        rat.write_integer(col, 0, &values)?;

        let chunks = rat.column_chunks(col)?;
        assert_eq!(chunks.len(), 4);
        let lengths: Vec<u64> = chunks.iter().map(|c| c.length).collect();
        assert_eq!(lengths, vec![65536, 65536, 65536, 3392]);
        let starts: Vec<u64> = chunks.iter().map(|c| c.start_row).collect();
        assert_eq!(starts, vec![0, 65536, 131072, 196608]);

        let rat = reopen_for_read(&mut rat, &path);
        let mut out = [0i64; 10];
        rat.read_integer(col, 100_000, &mut out)?;
        let expected: Vec<i64> = (100_000..100_010).collect();
        assert_eq!(out.to_vec(), expected);
        Ok(())
    }

    #[test]
    fn read_past_written_rows_zero_fills() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("rat.bin");
        let mut rat = Rat::new(writable_shared(&path), Compression::Zlib);

        let col = rat.create_column("Value", RatType::Integer, RatUsage::Generic)?;
        rat.set_row_count(100);
        rat.write_integer(col, 0, &[5i64; 10])?;

        let rat = reopen_for_read(&mut rat, &path);
        let mut out = [7i64; 20];
        rat.read_integer(col, 5, &mut out)?;
        assert_eq!(&out[..5], &[5; 5]);
        assert_eq!(&out[5..], &[0; 15]);
        Ok(())
    }

    #[test]
    fn string_round_trip_including_empty() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("rat.bin");
        let mut rat = Rat::new(writable_shared(&path), Compression::Zlib);

        let col = rat.create_column("Name", RatType::String, RatUsage::Name)?;
        rat.set_row_count(4);
        let values = vec![
            "water".to_string(),
            String::new(),
            "urban".to_string(),
            "forest".to_string(),
        ];
        rat.write_string(col, 0, &values)?;

        let rat = reopen_for_read(&mut rat, &path);
        let mut out = vec![String::new(); 6];
        rat.read_string(col, 0, &mut out)?;
        assert_eq!(&out[..4], &values[..]);
        assert_eq!(out[4], "");
        assert_eq!(out[5], "");
        Ok(())
    }

    #[test]
    fn numeric_coercion_both_ways() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("rat.bin");
        let mut rat = Rat::new(writable_shared(&path), Compression::Zlib);

        let ints = rat.create_column("Counts", RatType::Integer, RatUsage::Generic)?;
        let reals = rat.create_column("Means", RatType::Real, RatUsage::Generic)?;
        rat.set_row_count(3);
        // write real values into the integer column and vice versa
        rat.write_real(ints, 0, &[1.0, 2.0, 3.0])?;
        rat.write_integer(reals, 0, &[10, 20, 30])?;

        let rat = reopen_for_read(&mut rat, &path);
        let mut int_out = [0i64; 3];
        rat.read_integer(ints, 0, &mut int_out)?;
        assert_eq!(int_out, [1, 2, 3]);

        let mut real_out = [0f64; 3];
        rat.read_real(reals, 0, &mut real_out)?;
        assert_eq!(real_out, [10.0, 20.0, 30.0]);

        // and cross-typed reads coerce on the fly
        rat.read_real(ints, 0, &mut real_out)?;
        assert_eq!(real_out, [1.0, 2.0, 3.0]);
        Ok(())
    }

    #[test]
    fn string_numeric_mismatch_fails() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("rat.bin");
        let mut rat = Rat::new(writable_shared(&path), Compression::Zlib);

        let names = rat.create_column("Name", RatType::String, RatUsage::Name)?;
        let counts = rat.create_column("Histogram", RatType::Integer, RatUsage::PixelCount)?;
        rat.set_row_count(5);

        assert!(matches!(
            rat.write_integer(names, 0, &[1]),
            Err(EmuError::NotSupported(_))
        ));
        assert!(matches!(
            rat.write_string(counts, 0, &["x".to_string()]),
            Err(EmuError::NotSupported(_))
        ));
        Ok(())
    }

    #[test]
    fn column_out_of_range_is_not_found() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("rat.bin");
        let rat = Rat::new(writable_shared(&path), Compression::Zlib);

        let mut out = [0i64; 1];
        assert!(matches!(
            rat.read_integer(3, 0, &mut out),
            Err(EmuError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn usage_inferred_from_name() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("rat.bin");
        let mut rat = Rat::new(writable_shared(&path), Compression::Zlib);

        // declared usage is ignored; the name decides
        rat.create_column("Histogram", RatType::Integer, RatUsage::Generic)?;
        rat.create_column("Red", RatType::Integer, RatUsage::Generic)?;
        rat.create_column("ClassArea", RatType::Real, RatUsage::Generic)?;

        assert_eq!(rat.column_usage(0)?, RatUsage::PixelCount);
        assert_eq!(rat.column_usage(1)?, RatUsage::Red);
        assert_eq!(rat.column_usage(2)?, RatUsage::Generic);
        assert_eq!(rat.column_of_usage(RatUsage::Red), Some(1));
        assert_eq!(rat.column_of_usage(RatUsage::Blue), None);
        Ok(())
    }

    #[test]
    fn row_count_only_grows() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("rat.bin");
        let mut rat = Rat::new(writable_shared(&path), Compression::Zlib);

        rat.set_row_count(100);
        rat.set_row_count(50);
        assert_eq!(rat.row_count(), 100);
        rat.set_row_count(150);
        assert_eq!(rat.row_count(), 150);
        Ok(())
    }

    #[test]
    fn writes_clamped_to_row_count() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("rat.bin");
        let mut rat = Rat::new(writable_shared(&path), Compression::Zlib);

        let col = rat.create_column("Value", RatType::Integer, RatUsage::Generic)?;
        rat.set_row_count(5);
        rat.write_integer(col, 3, &[1, 2, 3, 4, 5])?;
        assert_eq!(rat.column_chunks(col)?[0].length, 2);

        // entirely past the end: silently dropped
        rat.write_integer(col, 10, &[9])?;
        assert_eq!(rat.column_chunks(col)?.len(), 1);
        Ok(())
    }
}
