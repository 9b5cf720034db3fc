//! Regular tile grid over a slide.

use super::codec::MAX_COORDINATE;

/// One grid cell, clipped to the slide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCell {
    pub col: u32,
    pub row: u32,
    /// Top-left pixel
    pub x: u32,
    pub y: u32,
    /// Clipped extent; smaller than the tile size on the right and bottom edges
    pub width: u32,
    pub height: u32,
}

/// Grid of stride `tile_size` covering `[0, width) × [0, height)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    width: u32,
    height: u32,
    tile_size: u32,
    columns: u32,
    rows: u32,
}

impl TileGrid {
    /// `tile_size` is clamped to at least one pixel.
    pub fn new(width: u32, height: u32, tile_size: u32) -> Self {
        let tile_size = tile_size.max(1);
        Self {
            width,
            height,
            tile_size,
            columns: width.div_ceil(tile_size),
            rows: height.div_ceil(tile_size),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    /// Number of cells: `ceil(W/T) * ceil(H/T)`.
    pub fn len(&self) -> usize {
        self.columns as usize * self.rows as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cell at a column and row, if inside the grid.
    pub fn cell(&self, col: u32, row: u32) -> Option<TileCell> {
        if col >= self.columns || row >= self.rows {
            return None;
        }
        let x = col * self.tile_size;
        let y = row * self.tile_size;
        Some(TileCell {
            col,
            row,
            x,
            y,
            width: (self.width - x).min(self.tile_size),
            height: (self.height - y).min(self.tile_size),
        })
    }

    /// All cells in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = TileCell> + '_ {
        (0..self.rows).flat_map(move |row| {
            (0..self.columns).filter_map(move |col| self.cell(col, row))
        })
    }

    /// Row-major index of a cell.
    pub fn index(&self, col: u32, row: u32) -> usize {
        row as usize * self.columns as usize + col as usize
    }

    /// Whether every cell origin fits in the six-digit tile name field.
    pub fn is_encodable(&self) -> bool {
        let last_x = self.columns.saturating_sub(1) as u64 * self.tile_size as u64;
        let last_y = self.rows.saturating_sub(1) as u64 * self.tile_size as u64;
        last_x <= MAX_COORDINATE as u64 && last_y <= MAX_COORDINATE as u64
    }
}
