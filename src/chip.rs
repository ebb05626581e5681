//! Detector geometry and the ordered exposure/chip collections.
//!
//! Sparse identifiers (`ExpId`, `ChipId`) come from the surrounding pipeline
//! and are opaque to the fit; the solver densifies them into contiguous
//! matrix-row indices (`jexp`, `jchip`). The newtypes keep the two spaces
//! from being mixed up.

use crate::error::FitError;
use crate::tanplane;

/// Sparse exposure identifier assigned by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExpId(pub i64);

/// Sparse chip (detector) identifier assigned by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChipId(pub i64);

impl std::fmt::Display for ExpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for ChipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Chip geometry ───────────────────────────────────────────────────────────

/// Rigid placement of one detector on the focal plane.
///
/// The chip center is stored in physical focal-plane units (millimeters);
/// `pixel_size` converts to focal-plane pixels, which is the coordinate
/// system the plate polynomial works in. Yaw is the only orientation angle
/// the fit updates; `nquarter`, pitch and roll are carried through
/// untouched.
#[derive(Debug, Clone)]
pub struct Chip {
    center_mm: [f64; 2],
    yaw: f64,
    cos_yaw: f64,
    sin_yaw: f64,
    pixel_size: f64,
    /// Number of quarter turns applied upstream of yaw.
    pub nquarter: i32,
    /// Pitch angle (radians), not refined by the fit.
    pub pitch: f64,
    /// Roll angle (radians), not refined by the fit.
    pub roll: f64,
}

impl Chip {
    /// Create a chip at the given focal-plane center (millimeters) with the
    /// given yaw (radians) and pixel size (millimeters per pixel).
    pub fn new(center_mm: [f64; 2], yaw: f64, pixel_size: f64) -> Self {
        assert!(pixel_size > 0.0, "pixel size must be positive");
        Self {
            center_mm,
            yaw,
            cos_yaw: yaw.cos(),
            sin_yaw: yaw.sin(),
            pixel_size,
            nquarter: 0,
            pitch: 0.0,
            roll: 0.0,
        }
    }

    /// Chip yaw in radians.
    #[inline]
    pub fn yaw(&self) -> f64 {
        self.yaw
    }

    #[inline]
    pub fn cos_yaw(&self) -> f64 {
        self.cos_yaw
    }

    #[inline]
    pub fn sin_yaw(&self) -> f64 {
        self.sin_yaw
    }

    /// Millimeters per pixel.
    #[inline]
    pub fn pixel_size(&self) -> f64 {
        self.pixel_size
    }

    /// Chip center in focal-plane millimeters.
    #[inline]
    pub fn center_mm(&self) -> [f64; 2] {
        self.center_mm
    }

    /// Chip center in focal-plane pixels.
    #[inline]
    pub fn center_px(&self) -> [f64; 2] {
        [
            self.center_mm[0] / self.pixel_size,
            self.center_mm[1] / self.pixel_size,
        ]
    }

    /// Map detector pixel coordinates to focal-plane pixels.
    ///
    /// `(u, v) = center + R(yaw) · (x, y)`; shared by every chip of one
    /// exposure.
    pub fn position_from_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let c = self.center_px();
        (
            c[0] + self.cos_yaw * x - self.sin_yaw * y,
            c[1] + self.sin_yaw * x + self.cos_yaw * y,
        )
    }

    /// Rotate detector pixel coordinates by the chip yaw without applying
    /// the center translation. These feed the rotation gradient of the
    /// joint fit.
    pub fn rotate_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.cos_yaw * x - self.sin_yaw * y,
            self.sin_yaw * x + self.cos_yaw * y,
        )
    }

    /// Translate the chip center by `(dx, dy)` focal-plane pixels.
    ///
    /// The stored center is physical, so the shift is scaled by the pixel
    /// size before it is applied.
    pub fn shift_center(&mut self, dx_px: f64, dy_px: f64) {
        self.center_mm[0] += dx_px * self.pixel_size;
        self.center_mm[1] += dy_px * self.pixel_size;
    }

    /// Set a new yaw, preserving nquarter, pitch and roll.
    pub fn set_yaw(&mut self, yaw: f64) {
        self.yaw = yaw;
        self.cos_yaw = yaw.cos();
        self.sin_yaw = yaw.sin();
    }
}

// ── Ordered collections ─────────────────────────────────────────────────────

/// Initial per-exposure celestial projection: the tangent-point sky origin
/// of the exposure's seed WCS.
#[derive(Debug, Clone, Copy)]
pub struct SkyOrigin {
    /// Right ascension of the tangent point (radians).
    pub ra: f64,
    /// Declination of the tangent point (radians).
    pub dec: f64,
}

/// Ordered mapping `exposure_id → initial projection`.
///
/// Input order is preserved: it defines the dense exposure index `jexp` and
/// the order of the result mapping.
#[derive(Debug, Clone, Default)]
pub struct ExposureSet {
    entries: Vec<(ExpId, SkyOrigin)>,
}

impl ExposureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an exposure. Duplicate identifiers are rejected.
    pub fn insert(&mut self, id: ExpId, origin: SkyOrigin) -> Result<(), FitError> {
        if self.entries.iter().any(|(eid, _)| *eid == id) {
            return Err(FitError::InvalidInput(format!(
                "duplicate exposure id {id}"
            )));
        }
        self.entries.push((id, origin));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dense index of an exposure id, in insertion order.
    pub fn index_of(&self, id: ExpId) -> Option<usize> {
        self.entries.iter().position(|(eid, _)| *eid == id)
    }

    pub fn get(&self, id: ExpId) -> Option<&SkyOrigin> {
        self.entries.iter().find(|(eid, _)| *eid == id).map(|(_, o)| o)
    }

    /// Entry at dense index `jexp`.
    pub fn by_index(&self, jexp: usize) -> &(ExpId, SkyOrigin) {
        &self.entries[jexp]
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ExpId, SkyOrigin)> {
        self.entries.iter()
    }
}

/// Ordered mapping `chip_id → geometry`.
///
/// Input order defines the dense chip index `jchip`; chip placements are
/// updated in place by the joint fit.
#[derive(Debug, Clone, Default)]
pub struct ChipSet {
    entries: Vec<(ChipId, Chip)>,
}

impl ChipSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chip. Duplicate identifiers are rejected.
    pub fn insert(&mut self, id: ChipId, chip: Chip) -> Result<(), FitError> {
        if self.entries.iter().any(|(cid, _)| *cid == id) {
            return Err(FitError::InvalidInput(format!("duplicate chip id {id}")));
        }
        self.entries.push((id, chip));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dense index of a chip id, in insertion order.
    pub fn index_of(&self, id: ChipId) -> Option<usize> {
        self.entries.iter().position(|(cid, _)| *cid == id)
    }

    pub fn get(&self, id: ChipId) -> Option<&Chip> {
        self.entries.iter().find(|(cid, _)| *cid == id).map(|(_, c)| c)
    }

    pub fn get_mut(&mut self, id: ChipId) -> Option<&mut Chip> {
        self.entries
            .iter_mut()
            .find(|(cid, _)| *cid == id)
            .map(|(_, c)| c)
    }

    /// Chip at dense index `jchip`.
    pub fn by_index(&self, jchip: usize) -> &Chip {
        &self.entries[jchip].1
    }

    pub fn by_index_mut(&mut self, jchip: usize) -> &mut Chip {
        &mut self.entries[jchip].1
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ChipId, Chip)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut (ChipId, Chip)> {
        self.entries.iter_mut()
    }
}

/// Convert a sky origin given in degrees.
impl SkyOrigin {
    pub fn from_degrees(ra_deg: f64, dec_deg: f64) -> Self {
        Self {
            ra: ra_deg * tanplane::D2R,
            dec: dec_deg * tanplane::D2R,
        }
    }
}
