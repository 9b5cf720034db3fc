//! End-to-end slide processing through the controller.

use std::path::PathBuf;

use wsi_gleason::inference::{read_table, write_table};
use wsi_gleason::format::tiff::{TiffPyramid, TileData};
use wsi_gleason::tile::encode_png;
use wsi_gleason::{
    open_slide, ColorMap, FileRangeReader, FsTileStore, GleasonLabel, OutputCompression,
    PipelineError, PredictionRecord, PyramidTiffWriter, SlideOutcome, SlideState, TileGenerator,
    TileStore, WriterOptions,
};

use super::test_utils::{
    assert_same_pixels, expected_class_map, expected_overlay, labelled_slide, read_output,
    write_png_slide, write_tiled_slide, PixelClassifier, Workspace,
};

const LABELS: [GleasonLabel; 5] = [
    GleasonLabel::Regular,
    GleasonLabel::Grade3,
    GleasonLabel::Grade4,
    GleasonLabel::ArtefactSponge,
    GleasonLabel::Grade5,
];

#[tokio::test]
async fn test_png_slide_end_to_end() {
    let ws = Workspace::new();
    let input = ws.input("biopsy_1.png");
    write_png_slide(&input, &labelled_slide(70, 45, 16, &LABELS));

    let classifier = PixelClassifier::new();
    let controller = ws.controller(ws.config(16), classifier.clone());
    let report = controller.run_batch(&[input]).await;

    assert_eq!(report.succeeded(), 1);
    let slide = &report.slides[0];
    assert_eq!(slide.id, "biopsy_1");
    let output = ws.output_root().join("biopsy_1_gleason.tiff");
    assert!(matches!(&slide.outcome, SlideOutcome::Written(path) if *path == output));

    // 5 x 3 grid, classified in batches of 4
    assert_eq!(classifier.tiles(), 15);
    assert_eq!(classifier.calls(), 4);

    assert_same_pixels(
        &read_output(&output).await,
        &expected_class_map(70, 45, 16, &LABELS),
    );

    // Cache is removed once the output exists
    assert!(!ws.cache_root().join("biopsy_1").exists());

    let table = read_table(&ws.predictions()).unwrap();
    assert_eq!(table.len(), 15);
    assert!(table.iter().all(|r| r.tile.starts_with("biopsy_1_")));
    let first = table.iter().find(|r| r.tile == "biopsy_1_000000_000000.png").unwrap();
    assert_eq!(first.label, GleasonLabel::Regular);
}

#[tokio::test]
async fn test_tiled_tiff_slide_end_to_end() {
    let ws = Workspace::new();
    let input = ws.input("resection.tiff");
    write_tiled_slide(&input, &labelled_slide(96, 80, 24, &LABELS), 32);

    let controller = ws.controller(ws.config(24), PixelClassifier::new());
    let report = controller.run_batch(&[input]).await;
    assert_eq!(report.failed(), 0, "{}", report.slides[0]);

    let output = ws.output_root().join("resection_gleason.tiff");
    assert_same_pixels(
        &read_output(&output).await,
        &expected_class_map(96, 80, 24, &LABELS),
    );
}

#[tokio::test]
async fn test_existing_output_is_skipped() {
    let ws = Workspace::new();
    let input = ws.input("done.png");
    write_png_slide(&input, &labelled_slide(32, 32, 16, &LABELS));

    let classifier = PixelClassifier::new();
    let controller = ws.controller(ws.config(16), classifier.clone());
    controller.run_batch(&[input.clone()]).await;
    let calls = classifier.calls();
    let output = ws.output_root().join("done_gleason.tiff");
    let written = std::fs::read(&output).unwrap();

    // The input is no longer decodable, so any tile extraction would fail
    std::fs::write(&input, b"truncated upload").unwrap();
    let leftover = ws.cache_root().join("done");
    std::fs::create_dir_all(&leftover).unwrap();
    std::fs::write(leftover.join("done_000000_000000.png"), b"stale").unwrap();
    let report = controller.run_batch(&[input]).await;

    assert!(matches!(report.slides[0].outcome, SlideOutcome::Skipped(_)));
    assert_eq!(report.slides[0].state(), SlideState::Done);
    assert_eq!(classifier.calls(), calls);
    assert_eq!(std::fs::read(&output).unwrap(), written);
    assert!(!leftover.exists());

    // Nothing new is appended for a skipped slide
    assert_eq!(read_table(&ws.predictions()).unwrap().len(), 4);
}

#[tokio::test]
async fn test_failing_slide_does_not_stop_batch() {
    let ws = Workspace::new();
    let broken = ws.input("broken.svs");
    std::fs::write(&broken, b"not an image at all").unwrap();
    let missing = ws.input("missing.png");
    let good = ws.input("good.png");
    write_png_slide(&good, &labelled_slide(40, 20, 16, &LABELS));

    let controller = ws.controller(ws.config(16), PixelClassifier::new());
    let report = controller
        .run_batch(&[broken.clone(), missing, good.clone()])
        .await;

    assert_eq!(report.slides.len(), 3);
    assert_eq!(report.failed(), 2);
    assert_eq!(report.succeeded(), 1);

    assert_eq!(report.slides[0].id, "broken");
    assert!(report.slides[0].error().is_some());
    assert!(report.slides[1].error().is_some());
    assert!(report.slides[2].is_success());
    assert!(ws.output_root().join("good_gleason.tiff").exists());
    assert!(!ws.output_root().join("broken_gleason.tiff").exists());
}

#[tokio::test]
async fn test_duplicate_slide_ids_are_rejected() {
    let ws = Workspace::new();
    let first = ws.input("twin.png");
    let nested = ws.dir.path().join("elsewhere");
    std::fs::create_dir(&nested).unwrap();
    let second = nested.join("twin.tiff");
    let image = labelled_slide(32, 16, 16, &LABELS);
    write_png_slide(&first, &image);
    write_tiled_slide(&second, &image, 16);

    let classifier = PixelClassifier::new();
    let controller = ws.controller(ws.config(16), classifier.clone());
    let report = controller.run_batch(&[first, second]).await;

    assert!(report.slides[0].is_success());
    assert!(matches!(
        report.slides[1].error(),
        Some(PipelineError::DuplicateSlideId(id)) if id == "twin"
    ));
    assert_eq!(classifier.tiles(), 2);
}

#[tokio::test]
async fn test_model_failure_keeps_cache_for_resume() {
    let ws = Workspace::new();
    let input = ws.input("flaky.png");
    write_png_slide(&input, &labelled_slide(48, 32, 16, &LABELS));

    let classifier = PixelClassifier::new();
    classifier.set_failing(true);
    let controller = ws.controller(ws.config(16), classifier.clone());
    let report = controller.run_batch(&[input.clone()]).await;

    match &report.slides[0].outcome {
        SlideOutcome::Failed { stage, error } => {
            assert_eq!(*stage, SlideState::Inferring);
            assert_eq!(error.kind(), "ModelInvocationFailure");
        }
        other => panic!("expected a failure, got {:?}", other),
    }
    let cache = ws.cache_root().join("flaky");
    let tiles: Vec<PathBuf> = std::fs::read_dir(&cache)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(tiles.len(), 6);
    assert!(!ws.output_root().join("flaky_gleason.tiff").exists());
    assert!(!ws.predictions().exists());

    classifier.set_failing(false);
    let report = controller.run_batch(&[input]).await;
    assert!(report.slides[0].is_success(), "{}", report.slides[0]);
    assert_eq!(classifier.tiles(), 6);
    assert!(!cache.exists());
}

#[tokio::test]
async fn test_cached_predictions_skip_the_model() {
    let ws = Workspace::new();
    let input = ws.input("cached.png");
    let image = labelled_slide(32, 32, 16, &LABELS);
    write_png_slide(&input, &image);

    // Tiles and a prediction table from an earlier, interrupted run
    let cache = ws.cache_root().join("cached");
    let store = FsTileStore::open(&cache).await.unwrap();
    let source = open_slide(&input, 8).await.unwrap();
    TileGenerator::new(16, 2)
        .generate("cached", source, &store)
        .await
        .unwrap();
    let records: Vec<PredictionRecord> = store
        .names()
        .await
        .unwrap()
        .into_iter()
        .map(|name| PredictionRecord::new(name, &[0.0, 0.0, 0.0, 0.0, 0.0, 1.0]).unwrap())
        .collect();
    write_table(&cache.join("predictions.csv"), &records).unwrap();

    let classifier = PixelClassifier::new();
    let controller = ws.controller(ws.config(16), classifier.clone());
    let report = controller.run_batch(&[input.clone()]).await;

    assert!(report.slides[0].is_success(), "{}", report.slides[0]);
    assert_eq!(classifier.calls(), 0);
    let output = read_output(&ws.output_root().join("cached_gleason.tiff")).await;
    assert_same_pixels(
        &output,
        &expected_class_map(32, 32, 16, &[GleasonLabel::Grade5]),
    );
}

#[tokio::test]
async fn test_stale_cached_predictions_are_recomputed() {
    let ws = Workspace::new();
    let input = ws.input("stale.png");
    write_png_slide(&input, &labelled_slide(32, 32, 16, &LABELS));

    // The table covers one tile but the cache will hold four
    let cache = ws.cache_root().join("stale");
    let store = FsTileStore::open(&cache).await.unwrap();
    let tile = image::RgbImage::new(16, 16);
    store
        .insert("stale_000000_000000.png", encode_png(&tile).unwrap())
        .await
        .unwrap();
    let records = vec![PredictionRecord::new(
        "stale_000000_000000.png",
        &[0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
    )
    .unwrap()];
    write_table(&cache.join("predictions.csv"), &records).unwrap();

    let classifier = PixelClassifier::new();
    let controller = ws.controller(ws.config(16), classifier.clone());
    let report = controller.run_batch(&[input]).await;

    assert!(report.slides[0].is_success(), "{}", report.slides[0]);
    assert_eq!(classifier.tiles(), 4);

    // The planted black tile was kept, so its cell reads as label 0
    let mut expected = expected_class_map(32, 32, 16, &LABELS);
    for y in 0..16 {
        for x in 0..16 {
            expected.put_pixel(x, y, ColorMap::GLEASON.rgb8(GleasonLabel::ArtefactSponge));
        }
    }
    let output = read_output(&ws.output_root().join("stale_gleason.tiff")).await;
    assert_same_pixels(&output, &expected);
}

#[tokio::test]
async fn test_overlay_run_blends_slide() {
    let ws = Workspace::new();
    let input = ws.input("blend.png");
    let image = labelled_slide(64, 16, 16, &LABELS);
    write_png_slide(&input, &image);

    let mut config = ws.config(16);
    config.overlay = Some(0.3);
    let controller = ws.controller(config, PixelClassifier::new());
    let report = controller.run_batch(&[input]).await;
    assert!(report.slides[0].is_success(), "{}", report.slides[0]);

    // Includes an artefact-sponge cell, whose color is not a whole byte
    let expected = expected_overlay(&image, 16, &LABELS, 0.3);
    let output = read_output(&ws.output_root().join("blend_gleason.tiff")).await;
    assert_same_pixels(&output, &expected);
}

#[tokio::test]
async fn test_predictions_table_accumulates_slides() {
    let ws = Workspace::new();
    let a = ws.input("a.png");
    let b = ws.input("b.png");
    write_png_slide(&a, &labelled_slide(32, 16, 16, &LABELS));
    write_png_slide(&b, &labelled_slide(16, 48, 16, &LABELS));

    let controller = ws.controller(ws.config(16), PixelClassifier::new());
    let report = controller.run_batch(&[a, b]).await;
    assert_eq!(report.succeeded(), 2);

    let table = read_table(&ws.predictions()).unwrap();
    assert_eq!(table.len(), 5);
    assert_eq!(table.iter().filter(|r| r.tile.starts_with("a_")).count(), 2);
    assert_eq!(table.iter().filter(|r| r.tile.starts_with("b_")).count(), 3);

    let header = std::fs::read_to_string(ws.predictions()).unwrap();
    assert_eq!(header.matches("sample").count(), 1);
}

#[tokio::test]
async fn test_invalid_cached_predictions_are_recomputed() {
    let ws = Workspace::new();
    let input = ws.input("tampered.png");
    write_png_slide(&input, &labelled_slide(32, 32, 16, &LABELS));

    // Complete tiles, but every row sums to 2.7 and claims Gleason 5
    let cache = ws.cache_root().join("tampered");
    let store = FsTileStore::open(&cache).await.unwrap();
    let source = open_slide(&input, 8).await.unwrap();
    TileGenerator::new(16, 2)
        .generate("tampered", source, &store)
        .await
        .unwrap();
    let mut rows = String::from("A_S,A_D,R,G3,G4,G5,sample,class\n");
    for name in store.names().await.unwrap() {
        let sample = name.trim_end_matches(".png");
        rows.push_str(&format!("0.9,0.9,0.9,0,0,0,{},G5\n", sample));
    }
    std::fs::write(cache.join("predictions.csv"), rows).unwrap();

    let classifier = PixelClassifier::new();
    let controller = ws.controller(ws.config(16), classifier.clone());
    let report = controller.run_batch(&[input]).await;

    assert!(report.slides[0].is_success(), "{}", report.slides[0]);
    assert_eq!(classifier.tiles(), 4);
    let output = read_output(&ws.output_root().join("tampered_gleason.tiff")).await;
    assert_same_pixels(&output, &expected_class_map(32, 32, 16, &LABELS));

    let table = read_table(&ws.predictions()).unwrap();
    assert_eq!(table.len(), 4);
    assert!(table.iter().all(|r| r.label != GleasonLabel::Grade5));
}

#[tokio::test]
async fn test_table_failure_leaves_no_output() {
    let ws = Workspace::new();
    let input = ws.input("unlisted.png");
    write_png_slide(&input, &labelled_slide(32, 16, 16, &LABELS));

    // A directory where the global table should be cannot be appended to
    let blocked = ws.dir.path().join("blocked.csv");
    std::fs::create_dir(&blocked).unwrap();
    let mut config = ws.config(16);
    config.predictions = Some(blocked);

    let classifier = PixelClassifier::new();
    let report = ws
        .controller(config, classifier.clone())
        .run_batch(&[input.clone()])
        .await;

    match &report.slides[0].outcome {
        SlideOutcome::Failed { stage, error } => {
            assert_eq!(*stage, SlideState::Reassembling);
            assert_eq!(error.kind(), "PredictionTableFailure");
        }
        other => panic!("expected a failure, got {:?}", other),
    }
    let output = ws.output_root().join("unlisted_gleason.tiff");
    assert!(!output.exists());
    assert!(!ws.output_root().join("unlisted_gleason.tiff.part").exists());
    assert!(ws.cache_root().join("unlisted").join("predictions.csv").exists());

    // The rerun reuses the cached predictions and lists the slide
    let report = ws
        .controller(ws.config(16), classifier.clone())
        .run_batch(&[input])
        .await;
    assert!(report.slides[0].is_success(), "{}", report.slides[0]);
    assert_eq!(classifier.calls(), 1);
    assert!(output.exists());
    assert_eq!(read_table(&ws.predictions()).unwrap().len(), 2);
}

#[tokio::test]
async fn test_unreadable_source_tile_fails_tiling() {
    let ws = Workspace::new();
    let input = ws.input("scratched.tiff");
    let image = labelled_slide(64, 64, 16, &LABELS);
    let options = WriterOptions {
        tile_size: 32,
        compression: OutputCompression::Jpeg { quality: 90 },
        resolution: None,
        description: None,
    };
    let mut writer = PyramidTiffWriter::create(&input, 64, 64, options).unwrap();
    for row in 0..2 {
        for col in 0..2 {
            let part = image::imageops::crop_imm(&image, col * 32, row * 32, 32, 32).to_image();
            writer.write_tile(col, row, &part).unwrap();
        }
    }
    writer.finish().unwrap();

    // Zero out the bottom-right source tile
    let (offset, len) = {
        let reader = FileRangeReader::open(&input).await.unwrap();
        let pyramid = TiffPyramid::parse(&reader).await.unwrap();
        let level = &pyramid.levels[0];
        let tiles = TileData::load(&reader, level, &pyramid.header).await.unwrap();
        tiles.get_tile_location(level.tile_index(1, 1).unwrap()).unwrap()
    };
    let mut bytes = std::fs::read(&input).unwrap();
    bytes[offset as usize..(offset + len) as usize].fill(0);
    std::fs::write(&input, bytes).unwrap();

    let classifier = PixelClassifier::new();
    let controller = ws.controller(ws.config(16), classifier.clone());
    let report = controller.run_batch(&[input]).await;

    match &report.slides[0].outcome {
        SlideOutcome::Failed { stage, error } => {
            assert_eq!(*stage, SlideState::Tiling);
            assert_eq!(error.kind(), "TileExtractionFailure");
            assert!(matches!(error, PipelineError::TileExtraction { failed: 4, .. }));
        }
        other => panic!("expected a failure, got {:?}", other),
    }
    assert_eq!(classifier.calls(), 0);
    assert!(!ws.output_root().join("scratched_gleason.tiff").exists());

    // Tiles outside the damaged source tile stay cached for the next run
    let cache = ws.cache_root().join("scratched");
    let store = FsTileStore::open(&cache).await.unwrap();
    let names = store.names().await.unwrap();
    assert_eq!(names.len(), 12);
    assert!(!names.contains(&"scratched_000048_000048.png".to_string()));
}
