//! External raster/AOI collaborator interfaces (spec section 6).
//!
//! `raster_math` treats element storage and typed pixel I/O as someone
//! else's problem: a real host hands the evaluator a `RasterHandle`
//! backed by GeoTIFF, Whitebox binary rasters, or whatever else it reads.
//! The in-memory type at the bottom of this module (`MemRaster`,
//! `MemAoi`) is the one concrete implementation this crate ships, used
//! by the test suite and by any caller happy to hold every band in
//! memory as a flat `Vec<f64>`.

use std::rc::Rc;

use crate::error::{RasterMathError, Result};

/// Pixel-storage encoding of a raster. Mirrors the fixed-width integer
/// and floating-point encodings a GIS raster format commonly supports.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EncodingType {
    Int1SByte,
    Int1UByte,
    Int2SBytes,
    Int2UBytes,
    Int4SBytes,
    Int4UBytes,
    Flt4Bytes,
    Flt8Bytes,
}

impl EncodingType {
    /// The representable range `[min, max]` for this encoding, used to
    /// clamp a computed value before it is written back (spec section 6).
    pub fn range(&self) -> (f64, f64) {
        match self {
            EncodingType::Int1SByte => (i8::MIN as f64, i8::MAX as f64),
            EncodingType::Int1UByte => (u8::MIN as f64, u8::MAX as f64),
            EncodingType::Int2SBytes => (i16::MIN as f64, i16::MAX as f64),
            EncodingType::Int2UBytes => (u16::MIN as f64, u16::MAX as f64),
            EncodingType::Int4SBytes => (i32::MIN as f64, i32::MAX as f64),
            EncodingType::Int4UBytes => (u32::MIN as f64, u32::MAX as f64),
            EncodingType::Flt4Bytes => (-(f32::MAX as f64), f32::MAX as f64),
            EncodingType::Flt8Bytes => (-f64::MAX, f64::MAX),
        }
    }

    /// Clamp `value` into this encoding's representable range.
    pub fn clamp(&self, value: f64) -> f64 {
        if value.is_nan() {
            return value;
        }
        let (lo, hi) = self.range();
        value.max(lo).min(hi)
    }
}

/// An axis-aligned bounding box in raster (column, row) space, inclusive
/// on both ends, matching the AOI contract of spec section 6.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: usize,
    pub y1: usize,
    pub x2: usize,
    pub y2: usize,
}

impl BoundingBox {
    pub fn new(x1: usize, y1: usize, x2: usize, y2: usize) -> BoundingBox {
        BoundingBox { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> usize {
        self.x2 + 1 - self.x1
    }

    pub fn height(&self) -> usize {
        self.y2 + 1 - self.y1
    }
}

/// A read-only view over one raster registered under `r1..r5`.
///
/// Band indices passed to `open_accessor` are 0-based and inclusive on
/// both ends, already range-checked by the builder (spec section 4.3).
/// Implementations are expected to be cheaply cloneable handles (an
/// `Rc`/`Arc` around shared backing storage) since the evaluator may
/// open more than one accessor over the same raster (band-subscripted
/// operands, reducer sub-programs) concurrently with the outer scan.
pub trait RasterHandle {
    fn band_count(&self) -> usize;
    fn row_count(&self) -> usize;
    fn column_count(&self) -> usize;
    fn data_type(&self) -> EncodingType;

    /// Open a read cursor over bands `[start_band, stop_band]` (inclusive).
    fn open_accessor(&self, start_band: usize, stop_band: usize) -> Box<dyn RasterAccessor>;
}

/// A cursor-style read accessor, advanced column-by-column, row-by-row,
/// band-by-band, in that nesting order (spec sections 4.1 and 5).
pub trait RasterAccessor {
    /// The decoded value at the cursor's current position (already run
    /// through `magnitude_of` for complex encodings, per spec section 6).
    fn value(&self) -> f64;
    fn next_column(&mut self) -> bool;
    fn next_row(&mut self) -> bool;
    fn next_band(&mut self) -> bool;
    fn is_valid(&self) -> bool;
}

/// A boolean area-of-interest mask registered under `a1..a5`.
pub trait AoiHandle {
    fn bounding_box(&self) -> BoundingBox;
    fn get_pixel(&self, col: usize, row: usize) -> bool;
}

#[derive(Debug, PartialEq)]
struct MemRasterData {
    rows: usize,
    columns: usize,
    bands: usize,
    data_type: EncodingType,
    data: Vec<f64>,
}

/// A flat, in-memory, row-major `(band, row, column)` raster.
///
/// Grounded on `whitebox-raster::Raster`'s `Vec<f64>` backing store and
/// `RasterConfigs` metadata block, extended to carry more than one band
/// the way `whitebox-common::structures::Array2D` generalizes a single
/// 2-D plane. Cloning a `MemRaster` is cheap (an `Rc` bump) so the same
/// backing storage can be handed to several accessors at once.
#[derive(Debug, Clone, PartialEq)]
pub struct MemRaster(Rc<MemRasterData>);

impl MemRaster {
    pub fn new(rows: usize, columns: usize, bands: usize, data_type: EncodingType) -> MemRaster {
        MemRaster(Rc::new(MemRasterData {
            rows,
            columns,
            bands,
            data_type,
            data: vec![0.0; rows * columns * bands],
        }))
    }

    /// Build a raster from band-major data, one `rows * columns` slice per band.
    pub fn from_bands(rows: usize, columns: usize, data_type: EncodingType, bands: Vec<Vec<f64>>) -> MemRaster {
        let nbands = bands.len();
        let mut data = Vec::with_capacity(rows * columns * nbands);
        for band in bands {
            assert_eq!(band.len(), rows * columns, "band data does not match rows*columns");
            data.extend(band);
        }
        MemRaster(Rc::new(MemRasterData {
            rows,
            columns,
            bands: nbands,
            data_type,
            data,
        }))
    }

    fn index(&self, band: usize, row: usize, col: usize) -> usize {
        (band * self.0.rows + row) * self.0.columns + col
    }

    pub fn get(&self, band: usize, row: usize, col: usize) -> f64 {
        self.0.data[self.index(band, row, col)]
    }

    /// Fails (panics) if this raster's backing storage is currently
    /// shared with an open accessor; mutate before registering/reading.
    pub fn set(&mut self, band: usize, row: usize, col: usize, value: f64) {
        let i = self.index(band, row, col);
        Rc::get_mut(&mut self.0)
            .expect("MemRaster is shared; mutate before opening an accessor")
            .data[i] = value;
    }

    pub fn rows(&self) -> usize {
        self.0.rows
    }

    pub fn columns(&self) -> usize {
        self.0.columns
    }

    pub fn bands(&self) -> usize {
        self.0.bands
    }
}

impl RasterHandle for MemRaster {
    fn band_count(&self) -> usize {
        self.0.bands
    }

    fn row_count(&self) -> usize {
        self.0.rows
    }

    fn column_count(&self) -> usize {
        self.0.columns
    }

    fn data_type(&self) -> EncodingType {
        self.0.data_type
    }

    fn open_accessor(&self, start_band: usize, stop_band: usize) -> Box<dyn RasterAccessor> {
        Box::new(MemRasterAccessor {
            raster: Rc::clone(&self.0),
            band: start_band,
            start_band,
            stop_band,
            row: 0,
            col: 0,
            valid: true,
        })
    }
}

struct MemRasterAccessor {
    raster: Rc<MemRasterData>,
    band: usize,
    start_band: usize,
    stop_band: usize,
    row: usize,
    col: usize,
    valid: bool,
}

impl MemRasterAccessor {
    fn index(&self) -> usize {
        (self.band * self.raster.rows + self.row) * self.raster.columns + self.col
    }
}

impl RasterAccessor for MemRasterAccessor {
    fn value(&self) -> f64 {
        self.raster.data[self.index()]
    }

    fn next_column(&mut self) -> bool {
        if self.col + 1 < self.raster.columns {
            self.col += 1;
            self.valid = true;
            true
        } else {
            self.valid = false;
            false
        }
    }

    fn next_row(&mut self) -> bool {
        if self.row + 1 < self.raster.rows {
            self.row += 1;
            self.col = 0;
            self.valid = true;
            true
        } else {
            self.valid = false;
            false
        }
    }

    fn next_band(&mut self) -> bool {
        if self.band + 1 <= self.stop_band {
            self.band += 1;
            self.row = 0;
            self.col = 0;
            self.valid = true;
            true
        } else {
            self.valid = false;
            false
        }
    }

    fn is_valid(&self) -> bool {
        self.valid && self.band >= self.start_band && self.band <= self.stop_band
    }
}

/// A boolean mask backed by a dense `Vec<bool>` over its bounding box,
/// bounds-checked the same way `Array2D` guards a flat backing `Vec`.
#[derive(Debug, Clone)]
pub struct MemAoi {
    bbox: BoundingBox,
    mask: Vec<bool>,
}

impl MemAoi {
    pub fn new(bbox: BoundingBox) -> MemAoi {
        let mask = vec![false; bbox.width() * bbox.height()];
        MemAoi { bbox, mask }
    }

    pub fn set(&mut self, col: usize, row: usize, value: bool) {
        if let Some(i) = self.local_index(col, row) {
            self.mask[i] = value;
        }
    }

    fn local_index(&self, col: usize, row: usize) -> Option<usize> {
        if col < self.bbox.x1 || col > self.bbox.x2 || row < self.bbox.y1 || row > self.bbox.y2 {
            return None;
        }
        let local_col = col - self.bbox.x1;
        let local_row = row - self.bbox.y1;
        Some(local_row * self.bbox.width() + local_col)
    }
}

impl AoiHandle for MemAoi {
    fn bounding_box(&self) -> BoundingBox {
        self.bbox
    }

    fn get_pixel(&self, col: usize, row: usize) -> bool {
        match self.local_index(col, row) {
            Some(i) => self.mask[i],
            None => false,
        }
    }
}

/// Validate and normalize a 1-based, possibly open-ended band slice from
/// formula text into a 0-based inclusive `(min_band, max_band)` pair.
///
/// `max_band == -1` means "to the last band", per spec section 4.3.
pub fn resolve_band_slice(
    source_band_count: usize,
    min_band_1based: i64,
    max_band_1based: i64,
) -> Result<(usize, usize)> {
    let min_band = min_band_1based - 1;
    let max_band = if max_band_1based == -1 {
        source_band_count as i64 - 1
    } else {
        max_band_1based - 1
    };
    if min_band < 0 {
        return Err(RasterMathError::BadSlice(format!(
            "band slice start {} is out of range",
            min_band_1based
        )));
    }
    if max_band >= source_band_count as i64 {
        return Err(RasterMathError::BadSlice(format!(
            "band slice end {} exceeds band count {}",
            max_band + 1,
            source_band_count
        )));
    }
    if min_band > max_band {
        return Err(RasterMathError::BadSlice(format!(
            "band slice start {} is after end {}",
            min_band_1based,
            max_band + 1
        )));
    }
    Ok((min_band as usize, max_band as usize))
}
