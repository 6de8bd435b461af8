//! Host raster-library integration: identify, open, create, and the
//! object-store upload sizing used when a target lives behind an
//! object-store scheme.

use std::collections::BTreeMap;
use std::path::Path;

use crate::dataset::{AccessMode, Dataset, DEFAULT_TILE_SIZE};
use crate::error::{EmuError, Result};
use crate::format::{self, PixelType, MAGIC};

pub const DRIVER_NAME: &str = "EMU";
pub const DRIVER_LONG_NAME: &str = "UBARSC Streaming Format (.emu)";

/// Returns true iff the filename carries the `emu` extension and the first
/// bytes of the file are the EMU magic.
pub fn identify(path: &Path, header: &[u8]) -> bool {
    format::has_emu_extension(path) && header.len() >= MAGIC.len() && header[..MAGIC.len()] == MAGIC
}

/// Opens a file for the host. Only read access is supported; asking for
/// update fails without consuming the file.
pub fn open(path: &Path, mode: AccessMode) -> Result<Dataset> {
    if mode == AccessMode::Write {
        return Err(EmuError::NotSupported("updating an existing file"));
    }
    Dataset::open(path)
}

/// Creates a writable dataset at the default tile size. The options
/// mapping is accepted for interface parity; no option is recognized.
pub fn create(
    path: &Path,
    width: u64,
    height: u64,
    band_count: usize,
    pixel_type: PixelType,
    _options: &BTreeMap<String, String>,
) -> Result<Dataset> {
    if is_object_store_uri(path) {
        // fail early if the output cannot fit a multipart upload
        upload_part_size(expected_output_size(width, height, band_count, pixel_type))?;
    }
    Dataset::create(path, width, height, band_count, pixel_type, DEFAULT_TILE_SIZE)
}

const MIN_PART_BYTES: u64 = 50 * 1024 * 1024;
const MAX_PART_BYTES: u64 = 5 * 1024 * 1024 * 1024;
const MAX_PARTS: u64 = 1000;

/// True when the target names an object-store scheme rather than a local
/// path.
pub fn is_object_store_uri(path: &Path) -> bool {
    let path = path.to_string_lossy();
    ["s3://", "gs://", "az://", "/vsis3/", "/vsigs/", "/vsiaz/"]
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

/// Approximate output size: raw pixel bytes times a conservative average
/// compression ratio of one half.
pub fn expected_output_size(
    width: u64,
    height: u64,
    band_count: usize,
    pixel_type: PixelType,
) -> u64 {
    width * height * band_count as u64 * pixel_type.size() as u64 / 2
}

/// Multipart upload chunk size for an expected output size: at least
/// 50 MiB so small files use few parts, and large enough that the whole
/// file fits in 1000 parts. A file that cannot fit 1000 parts of 5 GiB is
/// rejected.
pub fn upload_part_size(expected_size: u64) -> Result<u64> {
    if expected_size > MAX_PART_BYTES * MAX_PARTS {
        return Err(EmuError::NotSupported("too large for multipart upload"));
    }
    let per_part = (expected_size + MAX_PARTS - 1) / MAX_PARTS;
    Ok(per_part.max(MIN_PART_BYTES))
}
