//! Tile generation against real slide files and the on-disk tile cache.

use image::imageops;
use std::collections::BTreeMap;
use std::path::Path;

use wsi_gleason::tile::decode_png;
use wsi_gleason::{open_slide, FsTileStore, GleasonLabel, TileGenerator, TileName, TileStore};

use super::test_utils::{labelled_slide, write_png_slide, write_tiled_slide};

const LABELS: [GleasonLabel; 3] = [
    GleasonLabel::Regular,
    GleasonLabel::Grade3,
    GleasonLabel::Grade5,
];

fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let entry = entry.unwrap();
            (
                entry.file_name().to_string_lossy().into_owned(),
                std::fs::read(entry.path()).unwrap(),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_tiles_match_source_regions() {
    let dir = tempfile::tempdir().unwrap();
    let slide = dir.path().join("case_7.tiff");
    let image = labelled_slide(100, 70, 32, &LABELS);
    write_tiled_slide(&slide, &image, 32);

    let source = open_slide(&slide, 8).await.unwrap();
    let store = FsTileStore::open(dir.path().join("cache")).await.unwrap();
    let report = TileGenerator::new(32, 4)
        .generate("case_7", source, &store)
        .await
        .unwrap();

    // 4 x 3 grid, right column 4 px wide, bottom row 6 px high
    assert_eq!(report.written, 12);
    assert!(report.is_complete());

    let names = store.names().await.unwrap();
    assert_eq!(names.len(), 12);
    for name in names {
        let tile = TileName::parse(&name).unwrap();
        assert_eq!(tile.slide_id, "case_7");

        let decoded = decode_png(&store.read(&name).await.unwrap()).unwrap();
        let w = (100 - tile.x).min(32);
        let h = (70 - tile.y).min(32);
        assert_eq!(decoded.dimensions(), (w, h), "{}", name);

        let expected = imageops::crop_imm(&image, tile.x, tile.y, w, h).to_image();
        assert_eq!(decoded, expected, "{}", name);
    }
}

#[tokio::test]
async fn test_resume_regenerates_only_missing_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let slide = dir.path().join("resume.png");
    write_png_slide(&slide, &labelled_slide(64, 64, 16, &LABELS));
    let cache = dir.path().join("cache");
    let generator = TileGenerator::new(16, 3);

    {
        let source = open_slide(&slide, 8).await.unwrap();
        let store = FsTileStore::open(&cache).await.unwrap();
        let report = generator.generate("resume", source, &store).await.unwrap();
        assert_eq!(report.written, 16);
    }
    let original = snapshot(&cache);
    assert_eq!(original.len(), 16);

    // A rerun over a complete cache writes nothing
    {
        let source = open_slide(&slide, 8).await.unwrap();
        let store = FsTileStore::open(&cache).await.unwrap();
        let report = generator.generate("resume", source, &store).await.unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(report.skipped, 16);
    }
    assert_eq!(snapshot(&cache), original);

    // Drop two tiles and leave an interrupted write behind
    let removed = ["resume_000016_000032.png", "resume_000048_000000.png"];
    for name in removed {
        std::fs::remove_file(cache.join(name)).unwrap();
    }
    std::fs::write(cache.join("resume_000000_000016.png.part"), b"trunc").unwrap();

    let source = open_slide(&slide, 8).await.unwrap();
    let store = FsTileStore::open(&cache).await.unwrap();
    let report = generator.generate("resume", source, &store).await.unwrap();
    assert_eq!(report.written, 2);
    assert_eq!(report.skipped, 14);

    // Untouched tiles are byte-identical, regenerated ones decode to the same pixels
    let resumed = snapshot(&cache);
    assert_eq!(resumed.len(), 16);
    for (name, bytes) in &original {
        if removed.contains(&name.as_str()) {
            assert_eq!(
                decode_png(&resumed[name]).unwrap(),
                decode_png(bytes).unwrap(),
                "{}",
                name
            );
        } else {
            assert_eq!(&resumed[name], bytes, "{}", name);
        }
    }
}

#[tokio::test]
async fn test_raster_and_tiled_slides_give_same_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let image = labelled_slide(90, 50, 24, &LABELS);
    let png = dir.path().join("a.png");
    let tiff = dir.path().join("a.tiff");
    write_png_slide(&png, &image);
    write_tiled_slide(&tiff, &image, 32);

    let generator = TileGenerator::new(24, 2);
    let mut decoded = Vec::new();
    for (slide, cache) in [(&png, "png"), (&tiff, "tiff")] {
        let source = open_slide(slide, 8).await.unwrap();
        let store = FsTileStore::open(dir.path().join(cache)).await.unwrap();
        generator.generate("a", source, &store).await.unwrap();

        let mut tiles = Vec::new();
        for name in store.names().await.unwrap() {
            tiles.push((name.clone(), decode_png(&store.read(&name).await.unwrap()).unwrap()));
        }
        decoded.push(tiles);
    }

    assert_eq!(decoded[0].len(), 12);
    assert_eq!(decoded[0], decoded[1]);
}
