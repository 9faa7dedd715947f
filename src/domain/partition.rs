//! Tiled extraction fan-out over the rayon thread pool.
//!
//! Images larger than 200 px on both edges are split into at most
//! `max_workers` tiles of roughly equal area. Each tile is extracted with
//! a 20-px overlap into its neighbors; stars detected within 15 px outside
//! a tile's core are kept so sources bisected by a tile edge are not lost,
//! and the duplicates this produces inside the overlap strips are merged
//! afterwards.

use log::warn;
use ndarray::Array2;
use rayon::prelude::*;

use crate::domain::{buffer, extract};
use crate::error::{Error, Result};
use crate::model::{Background, Parameters, Star, Statistic, SubFrame};
use crate::utils::cancel::CancelToken;

/// Images at or below this edge length are extracted in one piece.
const PARTITION_SIZE: u32 = 200;
/// Stars this far outside a tile core are still attributed to the tile.
const PARTITION_MARGIN: f64 = 15.0;
/// Extraction overlap into neighboring tiles.
const PARTITION_OVERLAP: u32 = 20;

struct Tile {
    /// Core rectangle; cores partition the region exactly.
    core: SubFrame,
    /// Core plus overlap, clamped to the region.
    rect: SubFrame,
}

fn layout_tiles(region: SubFrame, max_workers: usize) -> Vec<Tile> {
    let mut cols = (region.width / PARTITION_SIZE).max(1) as usize;
    let mut rows = (region.height / PARTITION_SIZE).max(1) as usize;
    while cols * rows > max_workers.max(1) {
        if cols >= rows && cols > 1 {
            cols -= 1;
        } else if rows > 1 {
            rows -= 1;
        } else {
            break;
        }
    }

    let base_w = region.width / cols as u32;
    let base_h = region.height / rows as u32;
    let mut tiles = Vec::with_capacity(cols * rows);
    for row in 0..rows as u32 {
        for col in 0..cols as u32 {
            let x = region.x + col * base_w;
            let y = region.y + row * base_h;
            let w = if col as usize == cols - 1 { region.x + region.width - x } else { base_w };
            let h = if row as usize == rows - 1 { region.y + region.height - y } else { base_h };
            let core = SubFrame { x, y, width: w, height: h };

            let rx = core.x.saturating_sub(PARTITION_OVERLAP).max(region.x);
            let ry = core.y.saturating_sub(PARTITION_OVERLAP).max(region.y);
            let rr = (core.x + core.width + PARTITION_OVERLAP).min(region.x + region.width);
            let rb = (core.y + core.height + PARTITION_OVERLAP).min(region.y + region.height);
            let rect = SubFrame { x: rx, y: ry, width: rr - rx, height: rb - ry };
            tiles.push(Tile { core, rect });
        }
    }
    tiles
}

fn extract_one_tile(
    stats: &Statistic,
    pixels: &[u8],
    tile: &Tile,
    params: &Parameters,
    compute_hfr: bool,
) -> Result<extract::TileExtraction> {
    let mut plane: Array2<f32> = buffer::float_plane(stats, pixels, tile.rect)
        .map_err(|e| Error::ExtractionFailed(format!("{:#}", e)))?;
    let mut result = extract::extract_tile(&mut plane, params, compute_hfr)
        .map_err(|e| Error::ExtractionFailed(format!("{:#}", e)))?;

    // Tile-local 1-based coordinates to image 1-based coordinates.
    for star in &mut result.stars {
        star.x += tile.rect.x as f32;
        star.y += tile.rect.y as f32;
    }

    // Keep detections in the core plus margin; the rest belong to the
    // neighboring tile.
    let keep_x = (tile.core.x as f64 + 1.0 - PARTITION_MARGIN)
        ..=(tile.core.x as f64 + tile.core.width as f64 + PARTITION_MARGIN);
    let keep_y = (tile.core.y as f64 + 1.0 - PARTITION_MARGIN)
        ..=(tile.core.y as f64 + tile.core.height as f64 + PARTITION_MARGIN);
    result
        .stars
        .retain(|s| keep_x.contains(&(s.x as f64)) && keep_y.contains(&(s.y as f64)));
    Ok(result)
}

/// Two stars from different tiles inside the overlap window are the same
/// detection when closer than `min(a + a', b + b')`.
fn dedup_overlaps(tagged: &mut Vec<(usize, Star)>) {
    tagged.sort_by(|(_, s1), (_, s2)| {
        s1.x.partial_cmp(&s2.x).unwrap_or(std::cmp::Ordering::Equal)
    });
    let window = (PARTITION_OVERLAP as f32 + PARTITION_MARGIN as f32) * 2.0;
    let mut dropped = vec![false; tagged.len()];
    for i in 0..tagged.len() {
        if dropped[i] {
            continue;
        }
        for j in i + 1..tagged.len() {
            if dropped[j] {
                continue;
            }
            let (tile_i, ref si) = tagged[i];
            let (tile_j, ref sj) = tagged[j];
            if sj.x - si.x > window {
                break;
            }
            if tile_i == tile_j {
                continue;
            }
            let dx = si.x - sj.x;
            let dy = si.y - sj.y;
            let tol = (si.a + sj.a).min(si.b + sj.b);
            if dx * dx + dy * dy < tol * tol {
                // Prefer the detection with more pixels.
                if sj.num_pixels > si.num_pixels {
                    dropped[i] = true;
                    break;
                }
                dropped[j] = true;
            }
        }
    }
    let mut keep = dropped.iter().map(|d| !d);
    tagged.retain(|_| keep.next().unwrap());
}

/// Extract every star in `region`, fanning tiles across worker threads.
pub fn extract_region(
    stats: &Statistic,
    pixels: &[u8],
    region: SubFrame,
    params: &Parameters,
    compute_hfr: bool,
    cancel: &CancelToken,
) -> Result<(Vec<Star>, Background)> {
    let partitioned = region.width > PARTITION_SIZE && region.height > PARTITION_SIZE;
    let tiles = if partitioned {
        layout_tiles(region, rayon::current_num_threads())
    } else {
        vec![Tile { core: region, rect: region }]
    };

    let results: Vec<Option<extract::TileExtraction>> = tiles
        .par_iter()
        .map(|tile| {
            // Suspension point: each worker observes cancellation before
            // starting its tile.
            if cancel.is_cancelled() {
                return None;
            }
            match extract_one_tile(stats, pixels, tile, params, compute_hfr) {
                Ok(r) => Some(r),
                Err(e) => {
                    // A failing tile degrades to an empty list.
                    warn!(
                        "extraction failed on tile {}x{}+{}+{}: {}",
                        tile.rect.width, tile.rect.height, tile.rect.x, tile.rect.y, e
                    );
                    Some(extract::TileExtraction {
                        stars: Vec::new(),
                        background: Background::default(),
                    })
                }
            }
        })
        .collect();

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut tagged: Vec<(usize, Star)> = Vec::new();
    let mut background = Background::default();
    let mut contributing = 0u32;
    for (tile_id, result) in results.into_iter().flatten().enumerate() {
        if result.background.bw > 0 {
            background.bw = result.background.bw;
            background.bh = result.background.bh;
            background.global += result.background.global;
            background.global_rms += result.background.global_rms;
            background.num_stars_detected += result.background.num_stars_detected;
            contributing += 1;
        }
        for star in result.stars {
            tagged.push((tile_id, star));
        }
    }
    if contributing > 0 {
        background.global /= contributing as f32;
        background.global_rms /= contributing as f32;
    }

    if partitioned {
        dedup_overlaps(&mut tagged);
    }
    Ok((tagged.into_iter().map(|(_, s)| s).collect(), background))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_covers_region() {
        let region = SubFrame { x: 0, y: 0, width: 1000, height: 800 };
        let tiles = layout_tiles(region, 8);
        assert!(!tiles.is_empty());
        assert!(tiles.len() <= 8);
        let area: u64 = tiles.iter().map(|t| t.core.width as u64 * t.core.height as u64).sum();
        assert_eq!(area, 1000 * 800);
        for tile in &tiles {
            assert!(tile.core.width >= 200);
            assert!(tile.core.height >= 200);
            assert!(tile.rect.x <= tile.core.x);
            assert!(tile.rect.width >= tile.core.width);
        }
    }

    #[test]
    fn test_layout_respects_worker_limit() {
        let region = SubFrame { x: 0, y: 0, width: 4000, height: 4000 };
        let tiles = layout_tiles(region, 4);
        assert!(tiles.len() <= 4);
    }

    #[test]
    fn test_layout_offset_region() {
        let region = SubFrame { x: 100, y: 50, width: 600, height: 600 };
        let tiles = layout_tiles(region, 16);
        for tile in &tiles {
            assert!(tile.rect.x >= 100);
            assert!(tile.rect.y >= 50);
            assert!(tile.rect.x + tile.rect.width <= 700);
            assert!(tile.rect.y + tile.rect.height <= 650);
        }
    }

    #[test]
    fn test_dedup_prefers_larger_detection() {
        let mk = |x: f32, npix: u32| Star {
            x,
            y: 100.0,
            mag: 10.0,
            flux: 100.0,
            peak: 10.0,
            hfr: 0.0,
            a: 2.0,
            b: 1.5,
            theta: 0.0,
            ra: f64::NAN,
            dec: f64::NAN,
            num_pixels: npix,
        };
        let mut tagged = vec![(0usize, mk(200.0, 12)), (1usize, mk(201.0, 30))];
        dedup_overlaps(&mut tagged);
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].1.num_pixels, 30);
    }

    #[test]
    fn test_dedup_keeps_same_tile_pairs() {
        let mk = |x: f32| Star {
            x,
            y: 100.0,
            mag: 10.0,
            flux: 100.0,
            peak: 10.0,
            hfr: 0.0,
            a: 2.0,
            b: 1.5,
            theta: 0.0,
            ra: f64::NAN,
            dec: f64::NAN,
            num_pixels: 9,
        };
        let mut tagged = vec![(0usize, mk(200.0)), (0usize, mk(201.0))];
        dedup_overlaps(&mut tagged);
        assert_eq!(tagged.len(), 2);
    }
}
