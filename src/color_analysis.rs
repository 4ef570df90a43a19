//! HSV conversion and hue-band masks
//!
//! Host-side recomputation of the color masks the device uses for blob
//! detection. Only used for visualisation: the detection results themselves
//! arrive in the [`DetectionRecord`](crate::detection_record::DetectionRecord).
//!
//! # Scales
//!
//! - H: 0-179 (degrees halved, as on the device)
//! - S, V: 0-255
//!
//! # Hue bands
//!
//! A [`HueBand`] with `min_h > max_h` wraps around the 179/0 boundary, so a
//! band from 170 to 10 matches reds on both sides of zero.

use serde::{Deserialize, Serialize};

use crate::image_frame::{pixel_count, Rgb, RgbImage};

/// Number of hue steps (H is always below this)
pub const HUE_SCALE: i32 = 180;

/// Convert one RGB pixel to (H, S, V)
///
/// V is the largest channel. S is `round(255 * (max - min) / max)`, or 0 for
/// black. H uses the 60-degree sector of the largest channel on the halved
/// scale: 30 degrees per unit of channel difference over the range. Ties go
/// to red, then green. Gray pixels get H = 0.
#[inline]
pub fn rgb_to_hsv_pixel(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = i32::from(max - min);
    let v = max;

    if max == 0 {
        return (0, 0, 0);
    }

    let max_i = i32::from(max);
    let s = ((255 * delta + max_i / 2) / max_i) as u8;

    if delta == 0 {
        return (0, s, v);
    }

    let (ri, gi, bi) = (i32::from(r), i32::from(g), i32::from(b));
    let mut h = if max == r {
        30 * (gi - bi) / delta
    } else if max == g {
        60 + 30 * (bi - ri) / delta
    } else {
        120 + 30 * (ri - gi) / delta
    };
    if h < 0 {
        h += HUE_SCALE;
    }

    (h.clamp(0, HUE_SCALE - 1) as u8, s, v)
}

/// Hue, saturation and value planes for an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsvImage {
    width: u32,
    height: u32,
    /// Hue plane, 0-179
    pub h: Vec<u8>,
    /// Saturation plane, 0-255
    pub s: Vec<u8>,
    /// Value plane, 0-255
    pub v: Vec<u8>,
}

impl HsvImage {
    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }
}

/// Convert an RGB image to HSV planes
pub fn rgb_to_hsv(image: &RgbImage) -> HsvImage {
    let n = pixel_count(image.width(), image.height());
    let mut h = Vec::with_capacity(n);
    let mut s = Vec::with_capacity(n);
    let mut v = Vec::with_capacity(n);

    for &Rgb([r, g, b]) in image.pixels() {
        let (ph, ps, pv) = rgb_to_hsv_pixel(r, g, b);
        h.push(ph);
        s.push(ps);
        v.push(pv);
    }

    HsvImage {
        width: image.width(),
        height: image.height(),
        h,
        s,
        v,
    }
}

fn default_channel_max() -> u8 {
    u8::MAX
}

/// Hue range plus saturation/value floors defining a color class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HueBand {
    /// Lowest hue (0-179)
    pub min_h: u8,
    /// Highest hue (0-179); below `min_h` means the band wraps
    pub max_h: u8,
    /// Minimum saturation
    pub min_s: u8,
    /// Minimum value
    pub min_v: u8,
    /// Maximum saturation
    #[serde(default = "default_channel_max")]
    pub max_s: u8,
    /// Maximum value
    #[serde(default = "default_channel_max")]
    pub max_v: u8,
}

impl HueBand {
    /// Band with saturation/value floors and no upper limits
    pub const fn new(min_h: u8, max_h: u8, min_s: u8, min_v: u8) -> Self {
        Self {
            min_h,
            max_h,
            min_s,
            min_v,
            max_s: u8::MAX,
            max_v: u8::MAX,
        }
    }

    /// Yellow primary target band
    pub const PRIMARY: HueBand = HueBand::new(15, 40, 80, 80);

    /// Pink secondary target band, wrapping through red
    pub const SECONDARY: HueBand = HueBand::new(145, 5, 140, 50);

    /// Whether the hue range crosses the 179/0 boundary
    pub fn wraps_around(&self) -> bool {
        self.min_h > self.max_h
    }

    /// Whether an (H, S, V) triple belongs to the band
    #[inline]
    pub fn contains(&self, h: u8, s: u8, v: u8) -> bool {
        let s_match = s >= self.min_s && s <= self.max_s;
        let v_match = v >= self.min_v && v <= self.max_v;
        if !s_match || !v_match {
            return false;
        }

        if self.wraps_around() {
            h >= self.min_h || h <= self.max_h
        } else {
            h >= self.min_h && h <= self.max_h
        }
    }
}

/// A boolean grid with one cell per pixel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorMask {
    width: u32,
    height: u32,
    cells: Vec<bool>,
}

impl ColorMask {
    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Cell at (`x`, `y`); `false` outside the grid
    pub fn get(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.cells[self.index(x, y)]
    }

    /// Cells in row-major order
    pub fn cells(&self) -> &[bool] {
        &self.cells
    }

    /// Number of set cells
    pub fn count(&self) -> usize {
        self.cells.iter().filter(|&&c| c).count()
    }

    /// Fraction of set cells, 0.0 for an empty grid
    pub fn coverage(&self) -> f32 {
        if self.cells.is_empty() {
            return 0.0;
        }
        self.count() as f32 / self.cells.len() as f32
    }

    /// Morphological close with a square `kernel_size` window
    ///
    /// Dilates then erodes, bridging small gaps between nearby clusters.
    /// Neighbours outside the grid are skipped rather than treated as unset.
    /// Kernel sizes below 2 return the mask unchanged.
    pub fn closed(&self, kernel_size: usize) -> ColorMask {
        if kernel_size < 2 {
            return self.clone();
        }
        let dilated = self.morph(kernel_size / 2, true);
        dilated.morph(kernel_size / 2, false)
    }

    /// White-on-black mask-only view
    pub fn to_rgb_image(&self) -> RgbImage {
        RgbImage::from_fn(self.width, self.height, |x, y| {
            if self.get(x, y) {
                Rgb([255; 3])
            } else {
                Rgb([0; 3])
            }
        })
    }

    #[inline]
    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    /// Dilate (`any == true`) or erode (`any == false`) with radius `k`
    fn morph(&self, k: usize, any: bool) -> ColorMask {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut cells = vec![false; self.cells.len()];

        for y in 0..h {
            let y0 = y.saturating_sub(k);
            let y1 = (y + k).min(h - 1);
            for x in 0..w {
                let x0 = x.saturating_sub(k);
                let x1 = (x + k).min(w - 1);
                let mut window = (y0..=y1).flat_map(|ny| (x0..=x1).map(move |nx| ny * w + nx));
                cells[y * w + x] = if any {
                    window.any(|i| self.cells[i])
                } else {
                    window.all(|i| self.cells[i])
                };
            }
        }

        ColorMask {
            width: self.width,
            height: self.height,
            cells,
        }
    }
}

/// Mask of the pixels of `hsv` that fall inside `band`
pub fn mask_for_band(hsv: &HsvImage, band: &HueBand) -> ColorMask {
    let cells = hsv
        .h
        .iter()
        .zip(&hsv.s)
        .zip(&hsv.v)
        .map(|((&h, &s), &v)| band.contains(h, s, v))
        .collect();

    ColorMask {
        width: hsv.width,
        height: hsv.height,
        cells,
    }
}

/// Convenience: convert `image` and mask it with `band`
pub fn compute_mask(image: &RgbImage, band: &HueBand) -> ColorMask {
    mask_for_band(&rgb_to_hsv(image), band)
}

/// A hue band with a display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedBand {
    /// Label used in logs and output file names
    pub name: String,
    /// Thresholds
    #[serde(flatten)]
    pub band: HueBand,
}

impl NamedBand {
    /// Create a named band
    pub fn new(name: impl Into<String>, band: HueBand) -> Self {
        Self {
            name: name.into(),
            band,
        }
    }
}

/// The two standing bands: yellow primary, wrapping pink secondary
pub fn default_bands() -> Vec<NamedBand> {
    vec![
        NamedBand::new("yellow", HueBand::PRIMARY),
        NamedBand::new("pink", HueBand::SECONDARY),
    ]
}

/// Masks an image against a configured list of bands
#[derive(Debug, Clone)]
pub struct ColorAnalyzer {
    bands: Vec<NamedBand>,
    close_kernel: Option<usize>,
}

impl Default for ColorAnalyzer {
    fn default() -> Self {
        Self::new(default_bands())
    }
}

impl ColorAnalyzer {
    /// Analyzer over an arbitrary band list
    pub fn new(bands: Vec<NamedBand>) -> Self {
        Self {
            bands,
            close_kernel: None,
        }
    }

    /// Apply a morphological close of the given kernel size to every mask
    pub fn with_close_kernel(mut self, kernel_size: Option<usize>) -> Self {
        self.close_kernel = kernel_size;
        self
    }

    /// Configured bands
    pub fn bands(&self) -> &[NamedBand] {
        &self.bands
    }

    /// Mask for a single band, honouring the configured close kernel
    pub fn mask(&self, image: &RgbImage, band: &HueBand) -> ColorMask {
        self.post_process(compute_mask(image, band))
    }

    /// Masks for every configured band from one HSV conversion
    pub fn analyze<'a>(&'a self, image: &RgbImage) -> Vec<(&'a str, ColorMask)> {
        let hsv = rgb_to_hsv(image);
        self.bands
            .iter()
            .map(|named| {
                let mask = self.post_process(mask_for_band(&hsv, &named.band));
                (named.name.as_str(), mask)
            })
            .collect()
    }

    fn post_process(&self, mask: ColorMask) -> ColorMask {
        match self.close_kernel {
            Some(k) => mask.closed(k),
            None => mask,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(width: u32, height: u32, set: &[(u32, u32)]) -> ColorMask {
        let mut cells = vec![false; (width * height) as usize];
        for &(x, y) in set {
            cells[(y * width + x) as usize] = true;
        }
        ColorMask {
            width,
            height,
            cells,
        }
    }

    #[test]
    fn test_pure_red() {
        assert_eq!(rgb_to_hsv_pixel(255, 0, 0), (0, 255, 255));
    }

    #[test]
    fn test_pure_green() {
        assert_eq!(rgb_to_hsv_pixel(0, 255, 0), (60, 255, 255));
    }

    #[test]
    fn test_pure_blue() {
        assert_eq!(rgb_to_hsv_pixel(0, 0, 255), (120, 255, 255));
    }

    #[test]
    fn test_secondary_colors() {
        assert_eq!(rgb_to_hsv_pixel(255, 255, 0).0, 30); // yellow
        assert_eq!(rgb_to_hsv_pixel(0, 255, 255).0, 90); // cyan
        assert_eq!(rgb_to_hsv_pixel(255, 0, 255).0, 150); // magenta
    }

    #[test]
    fn test_black_and_gray() {
        assert_eq!(rgb_to_hsv_pixel(0, 0, 0), (0, 0, 0));
        assert_eq!(rgb_to_hsv_pixel(128, 128, 128), (0, 0, 128));
    }

    #[test]
    fn test_saturation_rounds() {
        // 255 * 1 / 2 = 127.5 -> 128
        assert_eq!(rgb_to_hsv_pixel(2, 1, 1).1, 128);
        // 255 * 100 / 200 = 127.5 -> 128
        assert_eq!(rgb_to_hsv_pixel(200, 100, 100).1, 128);
    }

    #[test]
    fn test_negative_hue_wraps() {
        // Red with a little blue: max = R, G < B gives a negative sector
        let (h, _, _) = rgb_to_hsv_pixel(255, 0, 60);
        assert!(h > 170 && h < 180, "h = {}", h);
    }

    #[test]
    fn test_hue_always_in_range() {
        for r in (0..=255).step_by(15) {
            for g in (0..=255).step_by(15) {
                for b in (0..=255).step_by(15) {
                    let (h, _, _) = rgb_to_hsv_pixel(r as u8, g as u8, b as u8);
                    assert!(h < 180);
                }
            }
        }
    }

    #[test]
    fn test_wrap_band_membership() {
        let band = HueBand::new(170, 10, 0, 0);
        assert!(band.wraps_around());
        assert!(band.contains(175, 255, 255));
        assert!(band.contains(5, 255, 255));
        assert!(band.contains(0, 255, 255));
        assert!(!band.contains(90, 255, 255));
    }

    #[test]
    fn test_plain_band_membership() {
        let band = HueBand::PRIMARY;
        assert!(!band.wraps_around());
        assert!(band.contains(15, 80, 80));
        assert!(band.contains(40, 255, 255));
        assert!(!band.contains(41, 255, 255));
        assert!(!band.contains(30, 79, 255));
        assert!(!band.contains(30, 255, 79));
    }

    #[test]
    fn test_band_upper_limits() {
        let band = HueBand {
            max_s: 200,
            ..HueBand::new(0, 179, 0, 0)
        };
        assert!(band.contains(10, 200, 10));
        assert!(!band.contains(10, 201, 10));
    }

    #[test]
    fn test_mask_for_yellow_image() {
        let img = RgbImage::from_pixel(4, 4, Rgb([255, 255, 0]));
        let mask = compute_mask(&img, &HueBand::PRIMARY);
        assert_eq!(mask.count(), 16);
        assert!((mask.coverage() - 1.0).abs() < f32::EPSILON);
        assert_eq!(compute_mask(&img, &HueBand::SECONDARY).count(), 0);
    }

    #[test]
    fn test_secondary_band_catches_magenta_and_red() {
        let magenta = RgbImage::from_pixel(2, 2, Rgb([255, 0, 255]));
        assert_eq!(compute_mask(&magenta, &HueBand::SECONDARY).count(), 4);
        let red = RgbImage::from_pixel(2, 2, Rgb([255, 0, 0]));
        assert_eq!(compute_mask(&red, &HueBand::SECONDARY).count(), 4);
    }

    #[test]
    fn test_mask_geometry() {
        let img = RgbImage::from_pixel(5, 3, Rgb([0, 0, 0]));
        let mask = compute_mask(&img, &HueBand::PRIMARY);
        assert_eq!((mask.width(), mask.height()), (5, 3));
        assert!(!mask.get(4, 2));
        assert!(!mask.get(5, 0));
    }

    #[test]
    fn test_close_bridges_gap() {
        // Two set cells with a one-cell gap on a row
        let mask = mask_from(7, 3, &[(2, 1), (4, 1)]);
        let closed = mask.closed(3);
        assert!(closed.get(3, 1), "gap should be filled");
        assert!(closed.get(2, 1) && closed.get(4, 1));
    }

    #[test]
    fn test_close_small_kernel_is_identity() {
        let mask = mask_from(3, 3, &[(1, 1)]);
        assert_eq!(mask.closed(1), mask);
    }

    #[test]
    fn test_to_rgb_image() {
        let mask = mask_from(2, 1, &[(1, 0)]);
        let img = mask.to_rgb_image();
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(img.get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_analyzer_runs_every_band() {
        let analyzer = ColorAnalyzer::default();
        let img = RgbImage::from_pixel(3, 3, Rgb([255, 255, 0]));
        let masks = analyzer.analyze(&img);
        assert_eq!(masks.len(), 2);
        assert_eq!(masks[0].0, "yellow");
        assert_eq!(masks[0].1.count(), 9);
        assert_eq!(masks[1].0, "pink");
        assert_eq!(masks[1].1.count(), 0);
    }

    #[test]
    fn test_analyzer_accepts_custom_bands() {
        let analyzer = ColorAnalyzer::new(vec![NamedBand::new("green", HueBand::new(50, 70, 50, 50))]);
        let img = RgbImage::from_pixel(2, 2, Rgb([0, 255, 0]));
        let masks = analyzer.analyze(&img);
        assert_eq!(masks[0].1.count(), 4);
    }

    #[test]
    fn test_band_deserialize_defaults_upper_limits() {
        let band: HueBand =
            serde_json::from_str(r#"{"min_h": 170, "max_h": 10, "min_s": 90, "min_v": 60}"#)
                .unwrap();
        assert_eq!(band.max_s, 255);
        assert_eq!(band.max_v, 255);
        assert!(band.wraps_around());
    }
}
