//! Overlay blending of label colors over source pixels.

use image::{Rgb, RgbImage};

/// Weight of the label color in an overlay.
pub const DEFAULT_BLEND_WEIGHT: f32 = 0.3;

/// `weight * label + (1 - weight) * source`, all components in `[0, 1]`.
pub fn blend(label: [f32; 3], source: [f32; 3], weight: f32) -> [f32; 3] {
    let mut out = [0f32; 3];
    for c in 0..3 {
        out[c] = weight * label[c] + (1.0 - weight) * source[c];
    }
    out
}

/// Blend per-pixel label colors over `source`.
///
/// `label_color` gives the unit-range color at each pixel of the tile. The
/// mix is computed in floating point and quantized to 8 bits once.
pub fn blend_tile(
    source: &RgbImage,
    weight: f32,
    mut label_color: impl FnMut(u32, u32) -> [f32; 3],
) -> RgbImage {
    RgbImage::from_fn(source.width(), source.height(), |x, y| {
        let mixed = blend(label_color(x, y), to_unit(source.get_pixel(x, y)), weight);
        Rgb(mixed.map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8))
    })
}

fn to_unit(pixel: &Rgb<u8>) -> [f32; 3] {
    pixel.0.map(|v| v as f32 / 255.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_red_over_grey() {
        let out = blend([1.0, 0.0, 0.0], [0.5, 0.5, 0.5], DEFAULT_BLEND_WEIGHT);
        let expected = [0.65, 0.35, 0.35];
        for c in 0..3 {
            assert!((out[c] - expected[c]).abs() < 1e-6, "{:?}", out);
        }
    }

    #[test]
    fn test_weight_extremes() {
        assert_eq!(blend([1.0, 1.0, 0.0], [0.2, 0.2, 0.2], 1.0), [1.0, 1.0, 0.0]);
        assert_eq!(blend([1.0, 1.0, 0.0], [0.2, 0.2, 0.2], 0.0), [0.2, 0.2, 0.2]);
    }

    #[test]
    fn test_blend_tile() {
        let source = RgbImage::from_pixel(2, 2, Rgb([128, 128, 128]));
        let tile = blend_tile(&source, 0.3, |_, _| [1.0, 0.0, 0.0]);
        // 0.3 * 255 + 0.7 * 128 = 166.1
        assert_eq!(*tile.get_pixel(1, 1), Rgb([166, 90, 90]));
    }

    #[test]
    fn test_blend_tile_quantizes_once() {
        // 0.3 * 0.3 * 255 + 0.7 * 128 = 112.55; an 8-bit label color (76) gives 112.4
        let source = RgbImage::from_pixel(1, 1, Rgb([128, 128, 128]));
        let tile = blend_tile(&source, 0.3, |_, _| [0.3, 0.3, 0.3]);
        assert_eq!(*tile.get_pixel(0, 0), Rgb([113, 113, 113]));

        let full = blend_tile(&source, 1.0, |_, _| [0.3, 0.3, 0.3]);
        assert_eq!(*full.get_pixel(0, 0), Rgb([77, 77, 77]));
    }

    #[test]
    fn test_blend_tile_per_pixel_colors() {
        let source = RgbImage::from_pixel(2, 1, Rgb([0, 0, 0]));
        let tile = blend_tile(&source, 1.0, |x, _| if x == 0 { [0.0, 1.0, 0.0] } else { [1.0, 1.0, 0.0] });
        assert_eq!(*tile.get_pixel(0, 0), Rgb([0, 255, 0]));
        assert_eq!(*tile.get_pixel(1, 0), Rgb([255, 255, 0]));
    }
}
