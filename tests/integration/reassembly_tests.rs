//! Class map reassembly into pyramidal TIFF files.

use image::{Rgb, RgbImage};
use std::sync::Arc;

use wsi_gleason::format::tiff::TiffPyramid;
use wsi_gleason::{
    level_dimensions, ClassGrid, ColorMap, FileRangeReader, GleasonLabel, MemorySink,
    OutputCompression, Overlay, PredictionRecord, RasterSource, Reassembler, TileGrid,
    TileName, WriterOptions,
};

use super::test_utils::{
    assert_same_pixels, expected_class_map, expected_overlay, read_output,
    read_with_tiff_decoder,
};

const LABELS: [GleasonLabel; 4] = [
    GleasonLabel::Grade4,
    GleasonLabel::Regular,
    GleasonLabel::ArtefactEmpty,
    GleasonLabel::Grade3,
];

/// One-hot predictions for every cell of a `width` x `height` slide.
fn records(slide: &str, width: u32, height: u32, tile: u32) -> Vec<PredictionRecord> {
    let grid = TileGrid::new(width, height, tile);
    let cols = width.div_ceil(tile);
    grid.cells()
        .map(|cell| {
            let label = LABELS[(cell.row * cols + cell.col) as usize % LABELS.len()];
            let mut probabilities = [0.0; 6];
            probabilities[label.index()] = 1.0;
            let name = TileName::new(slide, cell.x, cell.y).unwrap().to_string();
            PredictionRecord::new(name, &probabilities).unwrap()
        })
        .collect()
}

fn options(tile_size: u32, compression: OutputCompression) -> WriterOptions {
    WriterOptions {
        tile_size,
        compression,
        resolution: None,
        description: Some("class map".to_string()),
    }
}

#[tokio::test]
async fn test_tiff_round_trip_with_independent_output_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("map_gleason.tiff");
    let classes = Arc::new(
        ClassGrid::from_records("map", 100, 70, 32, &records("map", 100, 70, 32)).unwrap(),
    );

    let written = Reassembler::new(ColorMap::GLEASON)
        .render_to_tiff(classes, &path, options(16, OutputCompression::None))
        .await
        .unwrap();
    assert_eq!(written, path);
    assert!(!dir.path().join("map_gleason.tiff.part").exists());

    let image = read_output(&path).await;
    assert_same_pixels(&image, &expected_class_map(100, 70, 32, &LABELS));
    assert_same_pixels(&read_with_tiff_decoder(&path), &image);

    let reader = FileRangeReader::open(&path).await.unwrap();
    let pyramid = TiffPyramid::parse(&reader).await.unwrap();
    let levels: Vec<(u32, u32)> = pyramid.levels.iter().map(|l| (l.width, l.height)).collect();
    assert_eq!(levels, level_dimensions(100, 70, 16));
    assert_eq!(levels.len(), 4);
    assert!(pyramid.levels.iter().all(|l| l.tile_width == 16));
}

#[tokio::test]
async fn test_jpeg_output_keeps_class_colors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jpeg_gleason.tiff");
    let classes = Arc::new(
        ClassGrid::from_records("jpeg", 128, 96, 32, &records("jpeg", 128, 96, 32)).unwrap(),
    );

    Reassembler::new(ColorMap::GLEASON)
        .render_to_tiff(
            classes.clone(),
            &path,
            options(64, OutputCompression::Jpeg { quality: 95 }),
        )
        .await
        .unwrap();

    // Lossy, so compare the centre of every class tile within a tolerance,
    // through this crate's reader and through the `tiff` crate
    let ours = read_output(&path).await;
    let independent = read_with_tiff_decoder(&path);
    for image in [&ours, &independent] {
        assert_eq!(image.dimensions(), (128, 96));
        for cell in classes.grid().cells() {
            let (x, y) = (cell.x + cell.width / 2, cell.y + cell.height / 2);
            let expected = ColorMap::GLEASON.rgb8(classes.label(cell.col, cell.row));
            let actual = image.get_pixel(x, y);
            for c in 0..3 {
                let diff = (actual[c] as i32 - expected[c] as i32).abs();
                assert!(diff <= 12, "({}, {}): {:?} vs {:?}", x, y, actual, expected);
            }
        }
    }
}

#[tokio::test]
async fn test_memory_and_tiff_sinks_agree() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agree_gleason.tiff");
    let classes = Arc::new(
        ClassGrid::from_records("agree", 50, 45, 20, &records("agree", 50, 45, 20)).unwrap(),
    );
    let reassembler = Reassembler::new(ColorMap::GLEASON);

    let in_memory = reassembler
        .render(classes.clone(), MemorySink::new(50, 45, 16))
        .await
        .unwrap();
    reassembler
        .render_to_tiff(classes, &path, options(32, OutputCompression::None))
        .await
        .unwrap();

    assert_same_pixels(&read_output(&path).await, &in_memory);
}

#[tokio::test]
async fn test_overlay_blends_over_slide() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("overlay_gleason.tiff");
    let slide = RgbImage::from_fn(60, 40, |x, y| Rgb([(x * 4) as u8, (y * 6) as u8, 200]));
    let classes = Arc::new(
        ClassGrid::from_records("overlay", 60, 40, 20, &records("overlay", 60, 40, 20)).unwrap(),
    );

    let overlay = Overlay {
        source: Arc::new(RasterSource::from_image(slide.clone())),
        weight: 0.3,
    };
    Reassembler::new(ColorMap::GLEASON)
        .with_overlay(overlay)
        .render_to_tiff(classes, &path, options(16, OutputCompression::None))
        .await
        .unwrap();

    let expected = expected_overlay(&slide, 20, &LABELS, 0.3);
    assert_same_pixels(&read_output(&path).await, &expected);
}

#[tokio::test]
async fn test_incomplete_predictions_write_nothing() {
    let dir = tempfile::tempdir().unwrap();

    let mut partial = records("gap", 64, 64, 32);
    partial.remove(2);
    assert!(ClassGrid::from_records("gap", 64, 64, 32, &partial).is_err());

    // A sink of the wrong size is rejected before any tile is rendered
    let classes = Arc::new(
        ClassGrid::from_records("gap", 64, 64, 32, &records("gap", 64, 64, 32)).unwrap(),
    );
    let reassembler = Reassembler::new(ColorMap::GLEASON);
    assert!(reassembler
        .render(classes.clone(), MemorySink::new(64, 48, 16))
        .await
        .is_err());

    // A writer that cannot be created leaves no output behind
    let missing_dir = dir.path().join("missing").join("gap_gleason.tiff");
    assert!(reassembler
        .render_to_tiff(classes, &missing_dir, options(16, OutputCompression::None))
        .await
        .is_err());
    assert!(!missing_dir.exists());
}
