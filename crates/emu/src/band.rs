//! Bands, overviews, and the tile write/read protocol.
//!
//! A [`BaseBand`] is the tile engine for one band at one resolution level:
//! it knows its grid geometry and how to pack, compress, and locate tiles.
//! A [`Band`] is the full-resolution level plus everything that only exists
//! there — nodata, statistics, metadata, the RAT, and the overview list.
//! Overviews are plain `BaseBand`s at levels 1 and up.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use codec::Compression;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::dataset::{AccessMode, SharedHandle};
use crate::error::{EmuError, Result};
use crate::format::PixelType;
use crate::rat::Rat;
use crate::tile_index::{TileKey, TileLoc};

/// Band statistics as stored in the trailer. NaN means "unset".
#[derive(Debug, Clone, Copy)]
pub struct Statistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl Statistics {
    pub fn unset() -> Self {
        Self {
            min: f64::NAN,
            max: f64::NAN,
            mean: f64::NAN,
            std_dev: f64::NAN,
        }
    }
}

/// Geometry of one overview level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverviewShape {
    pub width: u64,
    pub height: u64,
    pub block_size: u16,
}

/// How a band arrives at its statistics.
///
/// The two regimes are mutually exclusive: a streaming writer accumulates a
/// histogram as tiles pass through, while a copy accepts the source's
/// figures verbatim and never accumulates.
#[derive(Debug)]
enum StatsMode {
    /// Ordered histogram of pixel value → count. Keys ascend, which is what
    /// the median derivation walks.
    Computed { histogram: BTreeMap<i64, u64> },
    Carried,
}

/// Tile read/write engine for one `(band, level)` pair.
#[derive(Debug)]
pub struct BaseBand {
    shared: SharedHandle,
    band: u64,
    level: u64,
    pixel_type: PixelType,
    width: u64,
    height: u64,
    block_size: u32,
    compression: Compression,
}

impl BaseBand {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        shared: SharedHandle,
        band: u64,
        level: u64,
        pixel_type: PixelType,
        width: u64,
        height: u64,
        block_size: u32,
        compression: Compression,
    ) -> Self {
        Self {
            shared,
            band,
            level,
            pixel_type,
            width,
            height,
            block_size,
            compression,
        }
    }

    pub fn width(&self) -> u64 {
        self.width
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn level(&self) -> u64 {
        self.level
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn tiles_across(&self) -> u64 {
        let block = self.block_size as u64;
        (self.width + block - 1) / block
    }

    pub fn tiles_down(&self) -> u64 {
        let block = self.block_size as u64;
        (self.height + block - 1) / block
    }

    /// Bytes in one full block buffer.
    pub fn block_bytes(&self) -> usize {
        self.block_size as usize * self.block_size as usize * self.pixel_type.size()
    }

    /// Valid pixel extent of the block at `(x, y)`. Interior blocks are
    /// full; blocks on the right or bottom edge may be smaller.
    fn valid_area(&self, x: u64, y: u64) -> Result<(usize, usize)> {
        if x >= self.tiles_across() || y >= self.tiles_down() {
            return Err(EmuError::InvalidArgument("block coordinates out of range"));
        }
        let block = self.block_size as u64;
        let x_valid = block.min(self.width - x * block) as usize;
        let y_valid = block.min(self.height - y * block) as usize;
        Ok((x_valid, y_valid))
    }

    /// Writes one block. `data` must be a full block buffer; for edge
    /// blocks only the valid area is stored.
    pub fn write_block(&self, x: u64, y: u64, data: &[u8]) -> Result<()> {
        let (tight, _, _) = self.pack_valid(x, y, data)?;
        self.write_packed(x, y, &tight)
    }

    /// Shrinks a full block buffer down to its valid `x_valid × y_valid`
    /// area. Interior blocks borrow the input unchanged.
    pub(crate) fn pack_valid<'a>(
        &self,
        x: u64,
        y: u64,
        data: &'a [u8],
    ) -> Result<(Cow<'a, [u8]>, usize, usize)> {
        if data.len() != self.block_bytes() {
            return Err(EmuError::InvalidArgument(
                "block buffer must be exactly one full block",
            ));
        }
        let (x_valid, y_valid) = self.valid_area(x, y)?;
        let block = self.block_size as usize;
        let pixel = self.pixel_type.size();

        if x_valid == block && y_valid == block {
            return Ok((Cow::Borrowed(data), x_valid, y_valid));
        }

        let mut tight = Vec::with_capacity(x_valid * y_valid * pixel);
        for row in 0..y_valid {
            let src = row * block * pixel;
            tight.extend_from_slice(&data[src..src + x_valid * pixel]);
        }
        Ok((Cow::Owned(tight), x_valid, y_valid))
    }

    /// Appends an already-packed tile payload and registers it in the
    /// index: algorithm byte, compressed bytes, then the index entry with
    /// the tight buffer's size as the uncompressed size.
    pub(crate) fn write_packed(&self, x: u64, y: u64, tight: &[u8]) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        if shared.mode != AccessMode::Write {
            return Err(EmuError::NotSupported(
                "blocks can only be written while creating",
            ));
        }

        let offset = shared.file.stream_position()?;
        shared.file.write_u8(self.compression.code())?;
        let packed = codec::compress(self.compression, tight)?;
        shared.file.write_all(&packed)?;

        shared.tile_index.insert(
            TileKey {
                level: self.level,
                band: self.band,
                x,
                y,
            },
            TileLoc {
                offset,
                size: packed.len() as u64,
                uncompressed_size: tight.len() as u64,
            },
        );
        Ok(())
    }

    /// Reads one block into `out`, which must be a full block buffer. For
    /// edge blocks only the valid area is filled; the padding is left
    /// untouched.
    pub fn read_block(&self, x: u64, y: u64, out: &mut [u8]) -> Result<()> {
        if out.len() != self.block_bytes() {
            return Err(EmuError::InvalidArgument(
                "block buffer must be exactly one full block",
            ));
        }
        let (x_valid, y_valid) = self.valid_area(x, y)?;

        let mut shared = self.shared.lock().unwrap();
        if shared.mode != AccessMode::Read {
            return Err(EmuError::NotSupported(
                "blocks can only be read from a file opened readonly",
            ));
        }

        let key = TileKey {
            level: self.level,
            band: self.band,
            x,
            y,
        };
        let loc = shared.tile_index.get(&key).ok_or_else(|| {
            EmuError::NotFound(format!(
                "no index entry for level {} band {} block {x} {y}",
                self.level, self.band
            ))
        })?;

        shared.file.seek(SeekFrom::Start(loc.offset))?;
        let algo = Compression::from_code(shared.file.read_u8()?)?;
        let mut packed = vec![0u8; loc.size as usize];
        shared.file.read_exact(&mut packed)?;

        let block = self.block_size as usize;
        let pixel = self.pixel_type.size();
        if x_valid == block && y_valid == block {
            codec::decompress(algo, &packed, out)?;
        } else {
            let mut staging = vec![0u8; loc.uncompressed_size as usize];
            codec::decompress(algo, &packed, &mut staging)?;
            for row in 0..y_valid {
                let src = row * x_valid * pixel;
                let dst = row * block * pixel;
                out[dst..dst + x_valid * pixel]
                    .copy_from_slice(&staging[src..src + x_valid * pixel]);
            }
        }
        Ok(())
    }
}

/// A full-resolution band and its per-band state.
#[derive(Debug)]
pub struct Band {
    core: BaseBand,
    overviews: Vec<BaseBand>,
    nodata: Option<i64>,
    stats: Statistics,
    stats_mode: StatsMode,
    metadata: BTreeMap<String, String>,
    rat: Rat,
}

impl Band {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        shared: SharedHandle,
        band: u64,
        pixel_type: PixelType,
        width: u64,
        height: u64,
        block_size: u32,
        compression: Compression,
        carried_stats: bool,
    ) -> Self {
        let stats_mode = if carried_stats {
            StatsMode::Carried
        } else {
            StatsMode::Computed {
                histogram: BTreeMap::new(),
            }
        };
        Self {
            core: BaseBand::new(
                shared.clone(),
                band,
                0,
                pixel_type,
                width,
                height,
                block_size,
                compression,
            ),
            overviews: Vec::new(),
            nodata: None,
            stats: Statistics::unset(),
            stats_mode,
            metadata: BTreeMap::new(),
            rat: Rat::new(shared, compression),
        }
    }

    pub fn width(&self) -> u64 {
        self.core.width()
    }

    pub fn height(&self) -> u64 {
        self.core.height()
    }

    pub fn block_size(&self) -> u32 {
        self.core.block_size()
    }

    pub fn pixel_type(&self) -> PixelType {
        self.core.pixel_type()
    }

    pub fn tiles_across(&self) -> u64 {
        self.core.tiles_across()
    }

    pub fn tiles_down(&self) -> u64 {
        self.core.tiles_down()
    }

    pub fn block_bytes(&self) -> usize {
        self.core.block_bytes()
    }

    fn mode(&self) -> AccessMode {
        self.core.shared.lock().unwrap().mode
    }

    // ---- blocks ----

    /// Writes one full-resolution block, feeding the valid pixels through
    /// histogram accumulation when this band computes its own statistics.
    pub fn write_block(&mut self, x: u64, y: u64, data: &[u8]) -> Result<()> {
        let (tight, _, _) = self.core.pack_valid(x, y, data)?;
        self.accumulate(&tight);
        self.core.write_packed(x, y, &tight)
    }

    pub fn read_block(&self, x: u64, y: u64, out: &mut [u8]) -> Result<()> {
        self.core.read_block(x, y, out)
    }

    // ---- nodata ----

    pub fn nodata(&self) -> Option<i64> {
        self.nodata
    }

    /// Sets nodata from a double. The container only stores integer nodata;
    /// a fractional or non-finite value is rejected.
    pub fn set_nodata(&mut self, value: f64) -> Result<()> {
        if !value.is_finite() || value.fract() != 0.0 {
            return Err(EmuError::NotSupported(
                "nodata must be a whole number for this format",
            ));
        }
        self.set_nodata_i64(value as i64)
    }

    pub fn set_nodata_i64(&mut self, value: i64) -> Result<()> {
        if self.mode() != AccessMode::Write {
            return Err(EmuError::NotSupported("nodata can only be set while creating"));
        }
        self.nodata = Some(value);
        Ok(())
    }

    pub fn delete_nodata(&mut self) -> Result<()> {
        if self.mode() != AccessMode::Write {
            return Err(EmuError::NotSupported(
                "nodata can only be deleted while creating",
            ));
        }
        self.nodata = None;
        Ok(())
    }

    // ---- statistics ----

    /// Returns the band statistics. Only available once the file is closed
    /// and reopened readonly; a writer's figures are not final.
    pub fn statistics(&self) -> Result<Statistics> {
        if self.mode() != AccessMode::Read {
            return Err(EmuError::NotSupported(
                "statistics can only be retrieved from a file opened readonly",
            ));
        }
        Ok(self.stats)
    }

    /// Stores externally computed statistics verbatim. Rejected when this
    /// band accumulates its own histogram.
    pub fn set_statistics(&mut self, stats: Statistics) -> Result<()> {
        if self.mode() != AccessMode::Write {
            return Err(EmuError::NotSupported(
                "statistics can only be set while creating",
            ));
        }
        if matches!(self.stats_mode, StatsMode::Computed { .. }) {
            return Err(EmuError::NotSupported(
                "statistics are computed from the pixel stream for this band",
            ));
        }
        self.stats = stats;
        Ok(())
    }

    fn accumulate(&mut self, tight: &[u8]) {
        let StatsMode::Computed { histogram } = &mut self.stats_mode else {
            return;
        };
        let nodata = self.nodata;
        let mut bump = |value: i64| {
            if nodata == Some(value) {
                return;
            }
            *histogram.entry(value).or_insert(0) += 1;
        };
        match self.core.pixel_type {
            PixelType::U8 => {
                for b in tight {
                    bump(*b as i64);
                }
            }
            PixelType::I8 => {
                for b in tight {
                    bump(*b as i8 as i64);
                }
            }
            PixelType::U16 => {
                for cell in tight.chunks_exact(2) {
                    bump(u16::from_le_bytes(cell.try_into().expect("cell length")) as i64);
                }
            }
            PixelType::I16 => {
                for cell in tight.chunks_exact(2) {
                    bump(i16::from_le_bytes(cell.try_into().expect("cell length")) as i64);
                }
            }
            // wider and floating types never accumulate
            _ => {}
        }
    }

    /// Derives min/max/mean/stddev from the histogram into the typed
    /// fields, and mode/median into the metadata map. Called once at close.
    pub(crate) fn finalize_statistics(&mut self) {
        let StatsMode::Computed { histogram } = &self.stats_mode else {
            return;
        };
        if histogram.is_empty() {
            return;
        }

        let total: u64 = histogram.values().sum();
        let total_f = total as f64;
        let mean = histogram
            .iter()
            .map(|(k, c)| *k as f64 * *c as f64)
            .sum::<f64>()
            / total_f;
        let variance = histogram
            .iter()
            .map(|(k, c)| {
                let d = *k as f64 - mean;
                *c as f64 * d * d
            })
            .sum::<f64>()
            / total_f;

        self.stats = Statistics {
            min: *histogram.keys().next().expect("non-empty") as f64,
            max: *histogram.keys().next_back().expect("non-empty") as f64,
            mean,
            std_dev: variance.sqrt(),
        };

        // mode: largest count, ties to the lowest key; median: first key
        // whose cumulative count exceeds half the total
        let mut mode = (i64::MIN, 0u64);
        let mut median = None;
        let mut cumulative = 0u64;
        for (k, c) in histogram {
            if *c > mode.1 {
                mode = (*k, *c);
            }
            cumulative += *c;
            if median.is_none() && cumulative as f64 > total_f / 2.0 {
                median = Some(*k);
            }
        }
        self.metadata
            .insert("STATISTICS_MODE".to_string(), mode.0.to_string());
        self.metadata.insert(
            "STATISTICS_MEDIAN".to_string(),
            median.expect("non-empty histogram").to_string(),
        );
    }

    /// Mirrors the typed statistics fields into the metadata map, the same
    /// entries a writer would have been refused to serialize.
    pub(crate) fn update_statistics_metadata(&mut self) {
        let stats = self.stats;
        for (key, value) in [
            ("STATISTICS_MINIMUM", stats.min),
            ("STATISTICS_MAXIMUM", stats.max),
            ("STATISTICS_MEAN", stats.mean),
            ("STATISTICS_STDDEV", stats.std_dev),
        ] {
            self.metadata.insert(key.to_string(), format!("{value:.6}"));
        }
    }

    // ---- metadata ----

    /// Default-domain metadata item lookup. Non-default domains hold
    /// nothing.
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
        if self.mode() != AccessMode::Write {
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

    /// Marks the band as thematic (categorical) or athematic (continuous).
    pub fn set_thematic(&mut self, thematic: bool) -> Result<()> {
        let value = if thematic { "thematic" } else { "athematic" };
        self.set_metadata_item("LAYER_TYPE", value, "")
    }

    pub fn thematic(&self) -> bool {
        self.metadata_item("LAYER_TYPE", "") == Some("thematic")
    }

    // ---- overviews ----

    /// Declares reduced-resolution levels by pixel size. Block size is
    /// inherited from the full-resolution level. Overviews are set exactly
    /// once, before any tile is written to them.
    pub fn create_overviews(&mut self, sizes: &[(u64, u64)]) -> Result<()> {
        let shapes: Vec<OverviewShape> = sizes
            .iter()
            .map(|(w, h)| OverviewShape {
                width: *w,
                height: *h,
                block_size: self.core.block_size as u16,
            })
            .collect();
        self.declare_overviews(&shapes)
    }

    /// Declares overviews by integer reduction factor: each level is the
    /// full resolution divided by its factor.
    pub fn create_overviews_from_factors(&mut self, factors: &[u32]) -> Result<()> {
        let sizes: Vec<(u64, u64)> = factors
            .iter()
            .map(|f| (self.core.width / *f as u64, self.core.height / *f as u64))
            .collect();
        self.create_overviews(&sizes)
    }

    pub(crate) fn declare_overviews(&mut self, shapes: &[OverviewShape]) -> Result<()> {
        if self.mode() != AccessMode::Write {
            return Err(EmuError::NotSupported(
                "overviews can only be created while creating",
            ));
        }
        if !self.overviews.is_empty() {
            return Err(EmuError::NotSupported("overviews cannot be changed once set"));
        }
        for (i, shape) in shapes.iter().enumerate() {
            self.overviews.push(BaseBand::new(
                self.core.shared.clone(),
                self.core.band,
                i as u64 + 1,
                self.core.pixel_type,
                shape.width,
                shape.height,
                shape.block_size as u32,
                self.core.compression,
            ));
        }
        Ok(())
    }

    pub fn overview_count(&self) -> usize {
        self.overviews.len()
    }

    pub fn overview(&self, index: usize) -> Option<&BaseBand> {
        self.overviews.get(index)
    }

    pub fn overview_mut(&mut self, index: usize) -> Option<&mut BaseBand> {
        self.overviews.get_mut(index)
    }

    pub fn overview_shapes(&self) -> Vec<OverviewShape> {
        self.overviews
            .iter()
            .map(|o| OverviewShape {
                width: o.width,
                height: o.height,
                block_size: o.block_size as u16,
            })
            .collect()
    }

    // ---- RAT ----

    pub fn rat(&self) -> &Rat {
        &self.rat
    }

    pub fn rat_mut(&mut self) -> &mut Rat {
        &mut self.rat
    }

    /// Replacing the attribute table wholesale is not part of this format;
    /// populate the default table column by column instead.
    pub fn set_default_rat(&mut self, _rat: &Rat) -> Result<()> {
        Err(EmuError::NotSupported("replacing the attribute table"))
    }

    // ---- trailer ----

    /// Writes this band's trailer section: nodata, statistics, overview
    /// shapes, RAT index, metadata blob.
    pub(crate) fn write_trailer<W: Write>(&mut self, w: &mut W) -> Result<()> {
        w.write_u8(self.nodata.is_some() as u8)?;
        w.write_i64::<LittleEndian>(self.nodata.unwrap_or(0))?;

        w.write_f64::<LittleEndian>(self.stats.min)?;
        w.write_f64::<LittleEndian>(self.stats.max)?;
        w.write_f64::<LittleEndian>(self.stats.mean)?;
        w.write_f64::<LittleEndian>(self.stats.std_dev)?;

        w.write_u32::<LittleEndian>(self.overviews.len() as u32)?;
        for overview in &self.overviews {
            w.write_u64::<LittleEndian>(overview.width)?;
            w.write_u64::<LittleEndian>(overview.height)?;
            w.write_u16::<LittleEndian>(overview.block_size as u16)?;
        }

        self.rat.write_index(w)?;
        crate::format::write_metadata(w, &self.metadata)?;
        Ok(())
    }

    /// Rebuilds a band from its trailer section.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn read_trailer<R: Read>(
        r: &mut R,
        shared: SharedHandle,
        band: u64,
        pixel_type: PixelType,
        width: u64,
        height: u64,
        block_size: u32,
        compression: Compression,
    ) -> Result<Self> {
        let mut this = Self::new(
            shared.clone(),
            band,
            pixel_type,
            width,
            height,
            block_size,
            compression,
            true,
        );

        let nodata_set = r.read_u8()? != 0;
        let nodata = r.read_i64::<LittleEndian>()?;
        this.nodata = nodata_set.then_some(nodata);

        this.stats = Statistics {
            min: r.read_f64::<LittleEndian>()?,
            max: r.read_f64::<LittleEndian>()?,
            mean: r.read_f64::<LittleEndian>()?,
            std_dev: r.read_f64::<LittleEndian>()?,
        };

        let overview_count = r.read_u32::<LittleEndian>()?;
        for level in 1..=overview_count as u64 {
            let width = r.read_u64::<LittleEndian>()?;
            let height = r.read_u64::<LittleEndian>()?;
            let block_size = r.read_u16::<LittleEndian>()?;
            this.overviews.push(BaseBand::new(
                shared.clone(),
                band,
                level,
                pixel_type,
                width,
                height,
                block_size as u32,
                compression,
            ));
        }

        this.rat = Rat::read_index(r, shared, compression)?;
        this.metadata = crate::format::read_metadata(r)?;
        this.update_statistics_metadata();
        Ok(this)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Shared;
    use crate::tile_index::TileIndex;
    use std::fs::OpenOptions;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn shared(path: &Path, mode: AccessMode) -> SharedHandle {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .unwrap();
        Arc::new(Mutex::new(Shared {
            file,
            tile_index: TileIndex::new(),
            mode,
        }))
    }

    #[test]
    fn pack_valid_shrinks_edge_blocks() {
        let dir = tempdir().unwrap();
        let handle = shared(&dir.path().join("t.emu"), AccessMode::Write);
        // 700x700 u16 at block 512: block (1,1) is 188x188
        let band = BaseBand::new(handle, 1, 0, PixelType::U16, 700, 700, 512, Compression::Zlib);

        let data = vec![0xABu8; band.block_bytes()];
        let (tight, x_valid, y_valid) = band.pack_valid(1, 1, &data).unwrap();
        assert_eq!((x_valid, y_valid), (188, 188));
        assert_eq!(tight.len(), 188 * 188 * 2);
        assert!(matches!(tight, Cow::Owned(_)));

        let (full, ..) = band.pack_valid(0, 0, &data).unwrap();
        assert!(matches!(full, Cow::Borrowed(_)));
    }

    #[test]
    fn out_of_range_block_rejected() {
        let dir = tempdir().unwrap();
        let handle = shared(&dir.path().join("t.emu"), AccessMode::Write);
        let band = BaseBand::new(handle, 1, 0, PixelType::U8, 100, 100, 64, Compression::Zlib);

        let data = vec![0u8; band.block_bytes()];
        assert!(matches!(
            band.write_block(2, 0, &data),
            Err(EmuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn histogram_statistics_formulas() {
        let dir = tempdir().unwrap();
        let handle = shared(&dir.path().join("t.emu"), AccessMode::Write);
        let mut band = Band::new(
            handle,
            1,
            PixelType::U8,
            4,
            1,
            4,
            Compression::Zlib,
            false,
        );
        band.set_nodata(0.0).unwrap();

        // 4x1 raster in one 4x4 block: valid row is 0 (nodata), 2, 4, 4
        let mut data = vec![0u8; band.core.block_bytes()];
        data[..4].copy_from_slice(&[0, 2, 4, 4]);
        band.write_block(0, 0, &data).unwrap();
        band.finalize_statistics();

        assert_eq!(band.stats.min, 2.0);
        assert_eq!(band.stats.max, 4.0);
        let mean = (2.0 + 4.0 + 4.0) / 3.0;
        assert!((band.stats.mean - mean).abs() < 1e-12);
        let variance =
            ((2.0 - mean).powi(2) + 2.0 * (4.0 - mean).powi(2)) / 3.0;
        assert!((band.stats.std_dev - variance.sqrt()).abs() < 1e-12);
        assert_eq!(band.metadata_item("STATISTICS_MODE", ""), Some("4"));
        assert_eq!(band.metadata_item("STATISTICS_MEDIAN", ""), Some("4"));
    }

    #[test]
    fn float_band_keeps_nan_statistics() {
        let dir = tempdir().unwrap();
        let handle = shared(&dir.path().join("t.emu"), AccessMode::Write);
        let mut band = Band::new(
            handle,
            1,
            PixelType::F32,
            2,
            2,
            2,
            Compression::Zlib,
            false,
        );

        band.write_block(0, 0, &1.5f32.to_le_bytes().repeat(4)).unwrap();
        band.finalize_statistics();
        assert!(band.stats.min.is_nan());
    }

    #[test]
    fn fractional_nodata_rejected() {
        let dir = tempdir().unwrap();
        let handle = shared(&dir.path().join("t.emu"), AccessMode::Write);
        let mut band = Band::new(
            handle,
            1,
            PixelType::U8,
            4,
            4,
            4,
            Compression::Zlib,
            false,
        );

        assert!(matches!(
            band.set_nodata(1.5),
            Err(EmuError::NotSupported(_))
        ));
        assert!(matches!(
            band.set_nodata(f64::NAN),
            Err(EmuError::NotSupported(_))
        ));
        band.set_nodata(3.0).unwrap();
        assert_eq!(band.nodata(), Some(3));
        band.delete_nodata().unwrap();
        assert_eq!(band.nodata(), None);
    }

    #[test]
    fn set_statistics_rejected_while_accumulating() {
        let dir = tempdir().unwrap();
        let handle = shared(&dir.path().join("t.emu"), AccessMode::Write);
        let mut band = Band::new(
            handle,
            1,
            PixelType::U8,
            4,
            4,
            4,
            Compression::Zlib,
            false,
        );

        assert!(matches!(
            band.set_statistics(Statistics::unset()),
            Err(EmuError::NotSupported(_))
        ));
    }

    #[test]
    fn carried_statistics_accepted() {
        let dir = tempdir().unwrap();
        let handle = shared(&dir.path().join("t.emu"), AccessMode::Write);
        let mut band = Band::new(
            handle,
            1,
            PixelType::U8,
            4,
            4,
            4,
            Compression::Zlib,
            true,
        );

        band.set_statistics(Statistics {
            min: 1.0,
            max: 9.0,
            mean: 5.0,
            std_dev: 2.0,
        })
        .unwrap();
        assert_eq!(band.stats.max, 9.0);
    }

    #[test]
    fn overviews_set_once() {
        let dir = tempdir().unwrap();
        let handle = shared(&dir.path().join("t.emu"), AccessMode::Write);
        let mut band = Band::new(
            handle,
            1,
            PixelType::U8,
            1024,
            1024,
            512,
            Compression::Zlib,
            false,
        );

        band.create_overviews_from_factors(&[2, 4]).unwrap();
        assert_eq!(band.overview_count(), 2);
        let first = band.overview(0).unwrap();
        assert_eq!((first.width(), first.height(), first.level()), (512, 512, 1));
        let second = band.overview(1).unwrap();
        assert_eq!((second.width(), second.height(), second.level()), (256, 256, 2));

        assert!(matches!(
            band.create_overviews(&[(100, 100)]),
            Err(EmuError::NotSupported(_))
        ));
    }

    #[test]
    fn metadata_domain_rules() {
        let dir = tempdir().unwrap();
        let handle = shared(&dir.path().join("t.emu"), AccessMode::Write);
        let mut band = Band::new(
            handle,
            1,
            PixelType::U8,
            4,
            4,
            4,
            Compression::Zlib,
            false,
        );

        band.set_metadata_item("FOO", "bar", "").unwrap();
        assert_eq!(band.metadata_item("FOO", ""), Some("bar"));
        assert_eq!(band.metadata_item("FOO", "GEOLOCATION"), None);
        assert!(matches!(
            band.set_metadata_item("X", "1", "GEOLOCATION"),
            Err(EmuError::NotSupported(_))
        ));

        band.set_thematic(true).unwrap();
        assert!(band.thematic());
        assert_eq!(band.metadata_item("LAYER_TYPE", ""), Some("thematic"));
    }

    #[test]
    fn replacing_the_rat_is_not_supported() {
        let dir = tempdir().unwrap();
        let handle = shared(&dir.path().join("t.emu"), AccessMode::Write);
        let mut band = Band::new(
            handle.clone(),
            1,
            PixelType::U8,
            4,
            4,
            4,
            Compression::Zlib,
            false,
        );

        let replacement = Rat::new(handle, Compression::Zlib);
        assert!(matches!(
            band.set_default_rat(&replacement),
            Err(EmuError::NotSupported(_))
        ));
    }
}
