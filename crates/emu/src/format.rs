//! EMU binary format constants and header/footer helpers.
//!
//! An EMU file starts with an 11-byte header and ends with a self-locating
//! trailer:
//!
//! ```text
//! [magic: "EMU"][version: "0001" ASCII][flags: u32 LE]  -- header, offset 0
//! [body: tile + RAT chunk payloads in append order]
//! [trailer: "HDR\0" + full file description]
//! [trailer_start: u64 LE]                               -- last 8 bytes
//! ```
//!
//! A reader needs only the last 8 bytes to find the trailer, and the trailer
//! describes everything else.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use codec::Compression;
use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{EmuError, Result};

/// First three bytes of every EMU file.
pub const MAGIC: [u8; 3] = *b"EMU";

/// Container format revision, written as four zero-padded ASCII digits.
pub const VERSION: u32 = 1;

/// Marker at the start of the trailer.
pub const TRAILER_MARKER: [u8; 4] = *b"HDR\0";

/// Feature flag bit 0: overviews precede full-resolution pixels in the body.
pub const FLAG_CLOUD_OPTIMISED: u32 = 1;

/// Size of the trailing pointer: a u64 holding the trailer start offset.
pub const TRAILER_POINTER_BYTES: u64 = 8;

/// The only filename extension the driver accepts.
pub const EXTENSION: &str = "emu";

/// Returns true if `path` carries the `emu` extension.
pub fn has_emu_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case(EXTENSION))
        .unwrap_or(false)
}

/// Writes the file header: magic, ASCII version, flag word.
pub fn write_header<W: Write>(w: &mut W, flags: u32) -> Result<()> {
    w.write_all(&MAGIC)?;
    w.write_all(format!("{:04}", VERSION).as_bytes())?;
    w.write_u32::<LittleEndian>(flags)?;
    Ok(())
}

/// Reads and validates the file header, returning the flag word.
///
/// Rejects a bad magic, a non-numeric or unsupported version, and any
/// reserved flag bit set.
pub fn read_header<R: Read>(r: &mut R) -> Result<u32> {
    let mut magic = [0u8; 3];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(EmuError::Format("bad magic".to_string()));
    }

    let mut version = [0u8; 4];
    r.read_exact(&mut version)?;
    let version: u32 = std::str::from_utf8(&version)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| EmuError::Format("version is not ASCII digits".to_string()))?;
    if version != VERSION {
        return Err(EmuError::Format(format!("unsupported version: {version}")));
    }

    let flags = r.read_u32::<LittleEndian>()?;
    if flags & !FLAG_CLOUD_OPTIMISED != 0 {
        return Err(EmuError::Format(format!(
            "reserved flag bits set: {flags:#x}"
        )));
    }
    Ok(flags)
}

/// Writes the trailing pointer. Must be the final write before close.
pub fn write_trailer_pointer<W: Write>(w: &mut W, trailer_start: u64) -> Result<()> {
    w.write_u64::<LittleEndian>(trailer_start)?;
    Ok(())
}

/// Seeks to the end of `r`, reads the trailing pointer, seeks to the trailer
/// start and verifies the `HDR\0` marker. Leaves the cursor just past the
/// marker, ready for trailer parsing.
pub fn seek_trailer<R: Read + Seek>(r: &mut R) -> Result<u64> {
    let filesize = r.seek(SeekFrom::End(0))?;
    if filesize < TRAILER_POINTER_BYTES {
        return Err(EmuError::Format("file too small for trailer pointer".to_string()));
    }
    r.seek(SeekFrom::Start(filesize - TRAILER_POINTER_BYTES))?;
    let trailer_start = r.read_u64::<LittleEndian>()?;
    if trailer_start > filesize - TRAILER_POINTER_BYTES {
        return Err(EmuError::Format(format!(
            "trailer pointer {trailer_start} outside file of {filesize} bytes"
        )));
    }

    r.seek(SeekFrom::Start(trailer_start))?;
    let mut marker = [0u8; 4];
    r.read_exact(&mut marker)?;
    if marker != TRAILER_MARKER {
        return Err(EmuError::Format("trailer marker missing".to_string()));
    }
    Ok(trailer_start)
}

/// Writes a metadata mapping in its trailer shape: uncompressed blob size
/// (u64), then — only if nonzero — compressed size (u64) and the
/// zlib-compressed blob. Reserved keys never reach the blob.
pub(crate) fn write_metadata<W: Write>(w: &mut W, items: &BTreeMap<String, String>) -> Result<()> {
    let blob = codec::pack_metadata(items);
    w.write_u64::<LittleEndian>(blob.len() as u64)?;
    if !blob.is_empty() {
        let packed = codec::compress(Compression::Zlib, &blob)?;
        w.write_u64::<LittleEndian>(packed.len() as u64)?;
        w.write_all(&packed)?;
    }
    Ok(())
}

/// Reads a metadata mapping written by [`write_metadata`]. A zero
/// uncompressed size means no metadata.
pub(crate) fn read_metadata<R: Read>(r: &mut R) -> Result<BTreeMap<String, String>> {
    let blob_len = r.read_u64::<LittleEndian>()?;
    if blob_len == 0 {
        return Ok(BTreeMap::new());
    }
    let packed_len = r.read_u64::<LittleEndian>()?;
    let mut packed = vec![0u8; packed_len as usize];
    r.read_exact(&mut packed)?;

    let mut blob = vec![0u8; blob_len as usize];
    codec::decompress(Compression::Zlib, &packed, &mut blob)?;
    Ok(codec::unpack_metadata(&blob))
}

/// Pixel data types a band may hold.
///
/// The container treats pixels as opaque bytes; the type only matters for
/// the size arithmetic of tile packing and for statistics accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl PixelType {
    /// Size of one pixel in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }

    /// Integer types narrow enough for histogram statistics.
    pub fn accumulates_statistics(self) -> bool {
        matches!(self, Self::U8 | Self::I8 | Self::U16 | Self::I16)
    }

    pub fn code(self) -> u64 {
        match self {
            Self::U8 => 0,
            Self::I8 => 1,
            Self::U16 => 2,
            Self::I16 => 3,
            Self::U32 => 4,
            Self::I32 => 5,
            Self::U64 => 6,
            Self::I64 => 7,
            Self::F32 => 8,
            Self::F64 => 9,
        }
    }

    pub fn from_code(code: u64) -> Result<Self> {
        Ok(match code {
            0 => Self::U8,
            1 => Self::I8,
            2 => Self::U16,
            3 => Self::I16,
            4 => Self::U32,
            5 => Self::I32,
            6 => Self::U64,
            7 => Self::I64,
            8 => Self::F32,
            9 => Self::F64,
            other => {
                return Err(EmuError::Format(format!("unknown pixel type code {other}")));
            }
        })
    }
}
