//! The dataset: one EMU file, its bands, and the open/create/close
//! lifecycle.
//!
//! A dataset is created writable, tiles and RAT chunks are appended in any
//! order, and a single `close` writes the trailer. From then on the file
//! only ever opens readonly. One mutex — owned here, shared by handle with
//! every band, overview, and RAT — serializes everything that touches the
//! file, because appends must land exactly at the current end of the
//! stream.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use codec::Compression;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::band::Band;
use crate::error::{EmuError, Result};
use crate::format::{self, PixelType, FLAG_CLOUD_OPTIMISED, TRAILER_MARKER};
use crate::tile_index::{TileIndex, TILE_RECORD_BYTES};

/// Block size used when the caller does not pick one.
pub const DEFAULT_TILE_SIZE: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// State guarded by the container-wide lock: the file handle, the tile
/// index, and the access mode every component checks before touching
/// either.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) file: File,
    pub(crate) tile_index: TileIndex,
    pub(crate) mode: AccessMode,
}

pub(crate) type SharedHandle = Arc<Mutex<Shared>>;

/// One open EMU container.
#[derive(Debug)]
pub struct Dataset {
    shared: SharedHandle,
    mode: AccessMode,
    pixel_type: PixelType,
    width: u64,
    height: u64,
    tile_size: u32,
    flags: u32,
    bands: Vec<Band>,
    geo_transform: [f64; 6],
    projection: String,
    metadata: BTreeMap<String, String>,
}

impl Dataset {
    /// Creates a new file for streaming writes (flag word 0).
    pub fn create<P: AsRef<Path>>(
        path: P,
        width: u64,
        height: u64,
        band_count: usize,
        pixel_type: PixelType,
        tile_size: u32,
    ) -> Result<Self> {
        Self::create_with_flags(path, width, height, band_count, pixel_type, tile_size, 0)
    }

    pub(crate) fn create_with_flags<P: AsRef<Path>>(
        path: P,
        width: u64,
        height: u64,
        band_count: usize,
        pixel_type: PixelType,
        tile_size: u32,
        flags: u32,
    ) -> Result<Self> {
        if tile_size == 0 {
            return Err(EmuError::InvalidArgument("tile size must be nonzero"));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        format::write_header(&mut file, flags)?;

        let shared = Arc::new(Mutex::new(Shared {
            file,
            tile_index: TileIndex::new(),
            mode: AccessMode::Write,
        }));

        // cloud-optimised copies carry statistics across from the source
        // instead of accumulating their own
        let carried_stats = flags & FLAG_CLOUD_OPTIMISED != 0;
        let bands = (1..=band_count as u64)
            .map(|band| {
                Band::new(
                    shared.clone(),
                    band,
                    pixel_type,
                    width,
                    height,
                    tile_size,
                    Compression::Zlib,
                    carried_stats,
                )
            })
            .collect();

        Ok(Self {
            shared,
            mode: AccessMode::Write,
            pixel_type,
            width,
            height,
            tile_size,
            flags,
            bands,
            geo_transform: [0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            projection: String::new(),
            metadata: BTreeMap::new(),
        })
    }

    /// Opens an existing file readonly.
    ///
    /// The filename must carry the `emu` extension; the header and trailer
    /// are validated per the format rules, and any inconsistency is a clean
    /// open failure — no handle is produced.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !format::has_emu_extension(path) {
            return Err(EmuError::Format(format!(
                "{} does not carry the emu extension",
                path.display()
            )));
        }

        let mut file = File::open(path)?;
        let flags = format::read_header(&mut file)?;
        format::seek_trailer(&mut file)?;

        // pull the whole trailer into memory, then hand the file over to
        // the shared state the bands read tiles through
        let mut trailer = Vec::new();
        file.read_to_end(&mut trailer)?;
        let mut r = Cursor::new(&trailer[..]);

        let pixel_type = PixelType::from_code(r.read_u64::<LittleEndian>()?)?;
        let band_count = r.read_u64::<LittleEndian>()?;
        let width = r.read_u64::<LittleEndian>()?;
        let height = r.read_u64::<LittleEndian>()?;
        let tile_size = r.read_u32::<LittleEndian>()?;

        let shared = Arc::new(Mutex::new(Shared {
            file,
            tile_index: TileIndex::new(),
            mode: AccessMode::Read,
        }));

        let mut bands = Vec::with_capacity(band_count as usize);
        for band in 1..=band_count {
            bands.push(Band::read_trailer(
                &mut r,
                shared.clone(),
                band,
                pixel_type,
                width,
                height,
                tile_size,
                Compression::Zlib,
            )?);
        }

        let mut geo_transform = [0.0f64; 6];
        for value in &mut geo_transform {
            *value = r.read_f64::<LittleEndian>()?;
        }

        let wkt_len = r.read_u64::<LittleEndian>()? as usize;
        let mut wkt = vec![0u8; wkt_len];
        r.read_exact(&mut wkt)?;
        if wkt.last() == Some(&0) {
            wkt.pop();
        }
        let projection = String::from_utf8_lossy(&wkt).into_owned();

        let mut metadata = format::read_metadata(&mut r)?;
        let cloud = if flags & FLAG_CLOUD_OPTIMISED != 0 { "YES" } else { "NO" };
        metadata.insert("CLOUD_OPTIMISED".to_string(), cloud.to_string());

        let tile_count = r.read_u64::<LittleEndian>()?;
        let remaining = trailer.len() as u64 - r.position();
        if tile_count.checked_mul(TILE_RECORD_BYTES).map_or(true, |b| b > remaining) {
            return Err(EmuError::Format(format!(
                "tile record section of {tile_count} entries does not fit the file"
            )));
        }
        shared.lock().unwrap().tile_index = TileIndex::read_entries(&mut r, tile_count)?;

        Ok(Self {
            shared,
            mode: AccessMode::Read,
            pixel_type,
            width,
            height,
            tile_size,
            flags,
            bands,
            geo_transform,
            projection,
            metadata,
        })
    }

    /// Finalizes a writable dataset: derives statistics, writes the trailer
    /// and the trailing pointer, and syncs. Readonly handles just release
    /// their resources. Consuming `self` is what makes "no writes after
    /// close" hold.
    pub fn close(mut self) -> Result<()> {
        if self.mode != AccessMode::Write {
            return Ok(());
        }

        for band in &mut self.bands {
            band.finalize_statistics();
        }

        let mut guard = self.shared.lock().unwrap();
        let Shared {
            file, tile_index, ..
        } = &mut *guard;

        file.flush()?;
        let trailer_start = file.stream_position()?;

        file.write_all(&TRAILER_MARKER)?;
        file.write_u64::<LittleEndian>(self.pixel_type.code())?;
        file.write_u64::<LittleEndian>(self.bands.len() as u64)?;
        file.write_u64::<LittleEndian>(self.width)?;
        file.write_u64::<LittleEndian>(self.height)?;
        file.write_u32::<LittleEndian>(self.tile_size)?;

        for band in &mut self.bands {
            band.write_trailer(file)?;
        }

        for value in self.geo_transform {
            file.write_f64::<LittleEndian>(value)?;
        }

        file.write_u64::<LittleEndian>(self.projection.len() as u64 + 1)?;
        file.write_all(self.projection.as_bytes())?;
        file.write_all(&[0])?;

        format::write_metadata(file, &self.metadata)?;
        tile_index.write_to(file)?;
        format::write_trailer_pointer(file, trailer_start)?;
        file.sync_all()?;
        Ok(())
    }

    // ---- geometry and identity ----

    pub fn width(&self) -> u64 {
        self.width
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn cloud_optimised(&self) -> bool {
        self.flags & FLAG_CLOUD_OPTIMISED != 0
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// Bands by zero-based position. (Tile keys number bands from 1.)
    pub fn band(&self, index: usize) -> Option<&Band> {
        self.bands.get(index)
    }

    pub fn band_mut(&mut self, index: usize) -> Option<&mut Band> {
        self.bands.get_mut(index)
    }

    pub fn geo_transform(&self) -> [f64; 6] {
        self.geo_transform
    }

    pub fn set_geo_transform(&mut self, transform: [f64; 6]) -> Result<()> {
        if self.mode != AccessMode::Write {
            return Err(EmuError::NotSupported(
                "the geo-transform can only be set while creating",
            ));
        }
        self.geo_transform = transform;
        Ok(())
    }

    pub fn projection(&self) -> &str {
        &self.projection
    }

    pub fn set_projection(&mut self, wkt: &str) -> Result<()> {
        if self.mode != AccessMode::Write {
            return Err(EmuError::NotSupported(
                "the projection can only be set while creating",
            ));
        }
        self.projection = wkt.to_string();
        Ok(())
    }

    // ---- dataset metadata ----

    pub fn metadata_item(&self, key: &str, domain: &str) -> Option<&str> {
        if !domain.is_empty() {
            return None;
        }
        self.metadata.get(key).map(|s| s.as_str())
    }

    pub fn set_metadata_item(&mut self, key: &str, value: &str, domain: &str) -> Result<()> {
        if !domain.is_empty() {
            return Err(EmuError::NotSupported("non-default metadata domains"));
        }
        if self.mode != AccessMode::Write {
            return Err(EmuError::NotSupported(
                "metadata can only be set while creating",
            ));
        }
        self.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn set_metadata(&mut self, items: &BTreeMap<String, String>, domain: &str) -> Result<()> {
        for (key, value) in items {
            self.set_metadata_item(key, value, domain)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &SharedHandle {
        &self.shared
    }
}
