//! Cloud-optimised copy: produce an EMU file whose body holds the
//! coarsest overview tiles first and the full-resolution tiles last, so a
//! streaming reader can render a preview from the front of the file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::band::{OverviewShape, Statistics};
use crate::dataset::Dataset;
use crate::error::{EmuError, Result};
use crate::format::{PixelType, FLAG_CLOUD_OPTIMISED};

/// Read side of a copy. Band indices are zero-based; tile level 0 is full
/// resolution and overview levels count from 1, matching the tile keys of
/// the produced file.
pub trait SourceDataset {
    fn width(&self) -> u64;
    fn height(&self) -> u64;
    fn band_count(&self) -> usize;
    fn pixel_type(&self) -> PixelType;
    fn tile_size(&self) -> u32;
    fn geo_transform(&self) -> [f64; 6];
    fn projection(&self) -> String;
    fn metadata(&self) -> BTreeMap<String, String>;
    fn nodata(&self, band: usize) -> Option<i64>;
    fn statistics(&self, band: usize) -> Option<Statistics>;
    fn band_metadata(&self, band: usize) -> BTreeMap<String, String>;
    fn overviews(&self, band: usize) -> Vec<OverviewShape>;
    /// Reads one full block of `level` into `out`, which is one full block
    /// buffer for that level.
    fn read_tile(&self, level: u64, band: usize, x: u64, y: u64, out: &mut [u8]) -> Result<()>;
}

/// An EMU file opened readonly can seed another copy.
impl SourceDataset for Dataset {
    fn width(&self) -> u64 {
        Dataset::width(self)
    }

    fn height(&self) -> u64 {
        Dataset::height(self)
    }

    fn band_count(&self) -> usize {
        Dataset::band_count(self)
    }

    fn pixel_type(&self) -> PixelType {
        Dataset::pixel_type(self)
    }

    fn tile_size(&self) -> u32 {
        Dataset::tile_size(self)
    }

    fn geo_transform(&self) -> [f64; 6] {
        Dataset::geo_transform(self)
    }

    fn projection(&self) -> String {
        Dataset::projection(self).to_string()
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        Dataset::metadata(self).clone()
    }

    fn nodata(&self, band: usize) -> Option<i64> {
        self.band(band).and_then(|b| b.nodata())
    }

    fn statistics(&self, band: usize) -> Option<Statistics> {
        self.band(band).and_then(|b| b.statistics().ok())
    }

    fn band_metadata(&self, band: usize) -> BTreeMap<String, String> {
        self.band(band)
            .map(|b| b.metadata().clone())
            .unwrap_or_default()
    }

    fn overviews(&self, band: usize) -> Vec<OverviewShape> {
        self.band(band)
            .map(|b| b.overview_shapes())
            .unwrap_or_default()
    }

    fn read_tile(&self, level: u64, band: usize, x: u64, y: u64, out: &mut [u8]) -> Result<()> {
        let band = self
            .band(band)
            .ok_or_else(|| EmuError::NotFound(format!("band {band} out of range")))?;
        if level == 0 {
            band.read_block(x, y, out)
        } else {
            band.overview(level as usize - 1)
                .ok_or_else(|| EmuError::NotFound(format!("overview level {level} out of range")))?
                .read_block(x, y, out)
        }
    }
}

/// Copies `src` into a new cloud-optimised file at `path` and returns the
/// result reopened readonly.
///
/// Overviews are pre-declared from the source's shapes, then tiles are
/// copied coarsest level first and full resolution last; within one level,
/// band by band in row-major tile order. Statistics and nodata carry over
/// verbatim; metadata is copied after all the tiles. The progress callback
/// sees the fraction of tiles done and may cancel by returning false, in
/// which case the partial file is deleted.
pub fn create_copy(
    path: &Path,
    src: &dyn SourceDataset,
    _strict: bool,
    mut progress: Option<&mut dyn FnMut(f64) -> bool>,
    _options: &BTreeMap<String, String>,
) -> Result<Dataset> {
    match copy_tiles(path, src, &mut progress) {
        Ok(()) => Dataset::open(path),
        Err(err) => {
            let _ = fs::remove_file(path);
            Err(err)
        }
    }
}

fn copy_tiles(
    path: &Path,
    src: &dyn SourceDataset,
    progress: &mut Option<&mut dyn FnMut(f64) -> bool>,
) -> Result<()> {
    let mut ds = Dataset::create_with_flags(
        path,
        src.width(),
        src.height(),
        src.band_count(),
        src.pixel_type(),
        src.tile_size(),
        FLAG_CLOUD_OPTIMISED,
    )?;

    let mut max_levels = 0u64;
    for index in 0..src.band_count() {
        let band = ds.band_mut(index).expect("band just created");
        band.declare_overviews(&src.overviews(index))?;
        max_levels = max_levels.max(band.overview_count() as u64);
        if let Some(nodata) = src.nodata(index) {
            band.set_nodata_i64(nodata)?;
        }
        if let Some(stats) = src.statistics(index) {
            band.set_statistics(stats)?;
        }
    }

    // total tile count across every level and band, for progress reporting
    let mut total = 0u64;
    for index in 0..ds.band_count() {
        let band = ds.band(index).expect("band exists");
        total += band.tiles_across() * band.tiles_down();
        for overview in (0..band.overview_count()).filter_map(|i| band.overview(i)) {
            total += overview.tiles_across() * overview.tiles_down();
        }
    }

    let mut done = 0u64;
    // coarsest declared level first, full resolution last
    let levels = (1..=max_levels).rev().chain(std::iter::once(0));
    for level in levels {
        for index in 0..ds.band_count() {
            let band = ds.band_mut(index).expect("band exists");
            let (tiles_across, tiles_down, block_bytes) = if level == 0 {
                (band.tiles_across(), band.tiles_down(), band.block_bytes())
            } else {
                match band.overview(level as usize - 1) {
                    Some(o) => (o.tiles_across(), o.tiles_down(), o.block_bytes()),
                    // bands may carry fewer levels than the deepest one
                    None => continue,
                }
            };

            let mut buf = vec![0u8; block_bytes];
            for y in 0..tiles_down {
                for x in 0..tiles_across {
                    src.read_tile(level, index, x, y, &mut buf)?;
                    if level == 0 {
                        band.write_block(x, y, &buf)?;
                    } else {
                        band.overview_mut(level as usize - 1)
                            .expect("level checked above")
                            .write_block(x, y, &buf)?;
                    }

                    done += 1;
                    if let Some(callback) = progress.as_mut() {
                        if !callback(done as f64 / total.max(1) as f64) {
                            return Err(EmuError::Cancelled);
                        }
                    }
                }
            }
        }
    }

    // metadata travels last, once every tile is on disk
    for index in 0..src.band_count() {
        let items = src.band_metadata(index);
        ds.band_mut(index)
            .expect("band exists")
            .set_metadata(&items, "")?;
    }
    ds.set_metadata(&src.metadata(), "")?;
    ds.set_geo_transform(src.geo_transform())?;
    ds.set_projection(&src.projection())?;
    ds.close()
}
