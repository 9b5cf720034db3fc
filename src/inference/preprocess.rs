//! Tile preprocessing before classification.
//!
//! Steps run in declared order: stain normalization (optional), padding to
//! a square, resize to the model input size.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use palette::{FromColor, Lab, LinSrgb, Srgb};

/// One deterministic image transform.
pub trait Preprocessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn transform(&self, image: RgbImage) -> RgbImage;
}

// =============================================================================
// Stain normalization
// =============================================================================

/// Per-channel mean and standard deviation in CIELAB.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabStatistics {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl LabStatistics {
    /// Population statistics over every pixel of `image`.
    pub fn of(image: &RgbImage) -> Self {
        let count = (image.width() as f64 * image.height() as f64).max(1.0);
        let mut sum = [0f64; 3];
        let mut sum_sq = [0f64; 3];
        for pixel in image.pixels() {
            let [l, a, b] = to_lab(pixel);
            for (c, v) in [l, a, b].into_iter().enumerate() {
                sum[c] += v as f64;
                sum_sq[c] += (v as f64) * (v as f64);
            }
        }

        let mut mean = [0f32; 3];
        let mut std = [0f32; 3];
        for c in 0..3 {
            let m = sum[c] / count;
            mean[c] = m as f32;
            std[c] = (sum_sq[c] / count - m * m).max(0.0).sqrt() as f32;
        }
        Self { mean, std }
    }
}

/// Reinhard color transfer: match LAB mean and deviation to a reference.
#[derive(Debug, Clone)]
pub struct StainNormalization {
    target: LabStatistics,
}

impl StainNormalization {
    pub fn from_reference(reference: &RgbImage) -> Self {
        Self {
            target: LabStatistics::of(reference),
        }
    }

    pub fn target(&self) -> LabStatistics {
        self.target
    }
}

impl Preprocessor for StainNormalization {
    fn name(&self) -> &'static str {
        "stain-normalization"
    }

    fn transform(&self, mut image: RgbImage) -> RgbImage {
        let source = LabStatistics::of(&image);
        let mut scale = [1f32; 3];
        let mut shift = [0f32; 3];
        for c in 0..3 {
            // A flat channel is left untouched
            if source.std[c] > 0.0 {
                scale[c] = self.target.std[c] / source.std[c];
                shift[c] = self.target.mean[c] - source.mean[c] * scale[c];
            }
        }

        for pixel in image.pixels_mut() {
            let lab = to_lab(pixel);
            let mut mapped = [0f32; 3];
            for c in 0..3 {
                mapped[c] = lab[c] * scale[c] + shift[c];
            }
            *pixel = from_lab(mapped);
        }
        image
    }
}

fn to_lab(pixel: &Rgb<u8>) -> [f32; 3] {
    let [r, g, b] = pixel.0;
    let srgb: Srgb<f32> = Srgb::new(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0);
    let lab: Lab = Lab::from_color(srgb.into_linear());
    [lab.l, lab.a, lab.b]
}

fn from_lab([l, a, b]: [f32; 3]) -> Rgb<u8> {
    let lab = Lab::new(l.clamp(0.0, 100.0), a.clamp(-128.0, 127.0), b.clamp(-128.0, 127.0));
    let srgb: Srgb<f32> = Srgb::from_linear(LinSrgb::from_color(lab));
    let byte = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([byte(srgb.red), byte(srgb.green), byte(srgb.blue)])
}

// =============================================================================
// Geometry
// =============================================================================

/// Pads with black to a centred square.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquarePadding;

impl Preprocessor for SquarePadding {
    fn name(&self) -> &'static str {
        "square-padding"
    }

    fn transform(&self, image: RgbImage) -> RgbImage {
        let (width, height) = image.dimensions();
        if width == height {
            return image;
        }
        let side = width.max(height);
        let mut square = RgbImage::new(side, side);
        imageops::replace(
            &mut square,
            &image,
            ((side - width) / 2) as i64,
            ((side - height) / 2) as i64,
        );
        square
    }
}

/// Resizes to a fixed square edge.
#[derive(Debug, Clone, Copy)]
pub struct Resize {
    size: u32,
}

impl Resize {
    pub fn new(size: u32) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

impl Preprocessor for Resize {
    fn name(&self) -> &'static str {
        "resize"
    }

    fn transform(&self, image: RgbImage) -> RgbImage {
        if image.dimensions() == (self.size, self.size) {
            return image;
        }
        imageops::resize(&image, self.size, self.size, FilterType::Triangle)
    }
}

// =============================================================================
// Chain
// =============================================================================

/// Ordered composition of preprocessing steps.
#[derive(Default)]
pub struct PreprocessChain {
    steps: Vec<Box<dyn Preprocessor>>,
}

impl PreprocessChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard chain for a model input edge of `input_size` pixels.
    pub fn standard(stain: Option<StainNormalization>, input_size: u32) -> Self {
        let mut chain = Self::new();
        if let Some(stain) = stain {
            chain = chain.with(stain);
        }
        chain.with(SquarePadding).with(Resize::new(input_size))
    }

    pub fn with(mut self, step: impl Preprocessor + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn apply(&self, image: RgbImage) -> RgbImage {
        self.steps
            .iter()
            .fold(image, |image, step| step.transform(image))
    }
}

impl std::fmt::Debug for PreprocessChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreprocessChain")
            .field("steps", &self.step_names())
            .finish()
    }
}
