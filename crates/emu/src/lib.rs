//! # EMU — a write-once, read-many raster container
//!
//! A single `.emu` file holds one multi-band raster: tiled pixels with
//! optional reduced-resolution overviews, per-band attribute tables (RATs),
//! statistics, metadata, and georeferencing. The format is built for
//! sequential streaming writes — append-only, friendly to object storage —
//! followed by selective tile-granular reads.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ HEADER (11 bytes)                             │
//! │ "EMU" | "0001" ASCII | flags (u32 LE)         │
//! ├───────────────────────────────────────────────┤
//! │ BODY (append order)                           │
//! │ per payload: algorithm (u8) | compressed data │
//! │ ... tile and RAT chunk payloads interleave ...│
//! ├───────────────────────────────────────────────┤
//! │ TRAILER (written once, at close)              │
//! │ "HDR\0" | dataset fields | per-band sections  │
//! │ geo-transform | WKT | metadata | tile index   │
//! ├───────────────────────────────────────────────┤
//! │ trailer_start (u64 LE) — always last 8 bytes  │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. A reader locates the trailer from the
//! last 8 bytes alone, rebuilds the tile index in memory, and from then on
//! any tile costs one seek and one decompression.
//!
//! ## Lifecycle
//!
//! [`Dataset::create`] opens a writable container; tiles and RAT chunks are
//! appended in any order; exactly one [`Dataset::close`] writes the
//! trailer. The file afterwards only ever opens readonly via
//! [`Dataset::open`] — updating an existing file is not supported.
//! [`create_copy`] produces the cloud-optimised variant, where the body
//! carries the coarsest overview tiles first.

mod band;
mod copy;
mod dataset;
mod driver;
mod error;
mod format;
mod rat;
mod tile_index;

pub use band::{Band, BaseBand, OverviewShape, Statistics};
pub use codec::{Compression, RESERVED_KEYS};
pub use copy::{create_copy, SourceDataset};
pub use dataset::{AccessMode, Dataset, DEFAULT_TILE_SIZE};
pub use driver::{
    create, expected_output_size, identify, is_object_store_uri, open, upload_part_size,
    DRIVER_LONG_NAME, DRIVER_NAME,
};
pub use error::{EmuError, Result};
pub use format::{PixelType, EXTENSION, FLAG_CLOUD_OPTIMISED, MAGIC, VERSION};
pub use rat::{Rat, RatChunk, RatType, RatUsage, RAT_CHUNK_ROWS};
pub use tile_index::{TileIndex, TileKey, TileLoc};
