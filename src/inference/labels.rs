//! Gleason label set and its visualization colors.

use std::fmt;
use std::str::FromStr;

use image::Rgb;

use crate::error::TableError;

/// Number of classes the model distinguishes.
pub const LABEL_COUNT: usize = 6;

/// Tile classes, in the order of the model's output vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GleasonLabel {
    /// Artefact: sponge or tissue fold
    ArtefactSponge,
    /// Artefact: empty background
    ArtefactEmpty,
    /// Regular tissue
    Regular,
    Grade3,
    Grade4,
    Grade5,
}

impl GleasonLabel {
    /// All labels in output-vector order.
    pub const ALL: [GleasonLabel; LABEL_COUNT] = [
        GleasonLabel::ArtefactSponge,
        GleasonLabel::ArtefactEmpty,
        GleasonLabel::Regular,
        GleasonLabel::Grade3,
        GleasonLabel::Grade4,
        GleasonLabel::Grade5,
    ];

    /// Position in the probability vector.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Short code used in prediction tables.
    pub fn code(self) -> &'static str {
        match self {
            GleasonLabel::ArtefactSponge => "A_S",
            GleasonLabel::ArtefactEmpty => "A_D",
            GleasonLabel::Regular => "R",
            GleasonLabel::Grade3 => "G3",
            GleasonLabel::Grade4 => "G4",
            GleasonLabel::Grade5 => "G5",
        }
    }
}

impl fmt::Display for GleasonLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for GleasonLabel {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|label| label.code() == s)
            .ok_or_else(|| TableError::UnknownLabel(s.to_string()))
    }
}

/// Fixed label to color lookup, components in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorMap {
    colors: [[f32; 3]; LABEL_COUNT],
}

impl ColorMap {
    /// The Gleason palette: grey, black, green, yellow, orange, red.
    pub const GLEASON: ColorMap = ColorMap {
        colors: [
            [0.3, 0.3, 0.3],
            [0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
            [1.0, 0.5, 0.0],
            [1.0, 0.0, 0.0],
        ],
    };

    pub fn color(&self, label: GleasonLabel) -> [f32; 3] {
        self.colors[label.index()]
    }

    /// Color scaled to 8 bits, truncating like a float-to-byte cast.
    pub fn rgb8(&self, label: GleasonLabel) -> Rgb<u8> {
        let [r, g, b] = self.color(label);
        Rgb([to_u8(r), to_u8(g), to_u8(b)])
    }
}

impl Default for ColorMap {
    fn default() -> Self {
        Self::GLEASON
    }
}

fn to_u8(component: f32) -> u8 {
    (component.clamp(0.0, 1.0) * 255.0) as u8
}
