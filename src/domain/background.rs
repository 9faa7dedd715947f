//! Mesh-based background estimation.
//!
//! The plane is partitioned into 64x64-pixel cells; each cell gets a
//! sigma-clipped median and sigma. The cell grids are smoothed with a 3x3
//! median box (fthresh = 0, so the filter always applies) and interpolated
//! back to per-pixel values with a Catmull-Rom bicubic. Estimation never
//! fails on data values.

use ndarray::Array2;

use crate::model::Background;
use crate::utils::stats::sigma_clipped_stats;

/// Mesh cell edge in pixels.
const MESH_SIZE: usize = 64;
/// Median filter box over the cell grid.
const FILTER_BOX: usize = 3;

#[derive(Debug, Clone)]
pub struct BackgroundMap {
    cell_w: usize,
    cell_h: usize,
    grid_w: usize,
    grid_h: usize,
    cells: Vec<f32>,
    pub global: f32,
    pub global_rms: f32,
}

/// Median-box smoothing of a cell grid; box is clipped at the grid edge.
fn median_filter_grid(grid: &[f32], w: usize, h: usize, boxsize: usize) -> Vec<f32> {
    let half = boxsize / 2;
    let mut out = vec![0.0f32; grid.len()];
    let mut window: Vec<f32> = Vec::with_capacity(boxsize * boxsize);
    for y in 0..h {
        for x in 0..w {
            window.clear();
            for j in y.saturating_sub(half)..(y + half + 1).min(h) {
                for i in x.saturating_sub(half)..(x + half + 1).min(w) {
                    window.push(grid[j * w + i]);
                }
            }
            out[y * w + x] = crate::utils::stats::exact_median_mut(&mut window) as f32;
        }
    }
    out
}

#[inline]
fn catmull_rom(p0: f32, p1: f32, p2: f32, p3: f32, t: f32) -> f32 {
    0.5 * (2.0 * p1
        + (p2 - p0) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t * t
        + (3.0 * p1 - p0 - 3.0 * p2 + p3) * t * t * t)
}

impl BackgroundMap {
    /// Estimate the background of `plane`.
    pub fn estimate(plane: &Array2<f32>) -> BackgroundMap {
        let (rows, cols) = plane.dim();
        let grid_w = cols.div_ceil(MESH_SIZE).max(1);
        let grid_h = rows.div_ceil(MESH_SIZE).max(1);

        let mut medians = vec![0.0f32; grid_w * grid_h];
        let mut sigmas = vec![0.0f32; grid_w * grid_h];
        let mut cell: Vec<f32> = Vec::with_capacity(MESH_SIZE * MESH_SIZE);

        for gy in 0..grid_h {
            for gx in 0..grid_w {
                cell.clear();
                let y_end = ((gy + 1) * MESH_SIZE).min(rows);
                let x_end = ((gx + 1) * MESH_SIZE).min(cols);
                for y in gy * MESH_SIZE..y_end {
                    for x in gx * MESH_SIZE..x_end {
                        let v = plane[[y, x]];
                        if v.is_finite() {
                            cell.push(v);
                        }
                    }
                }
                let (med, sig) = sigma_clipped_stats(&mut cell, 3.0, 2);
                medians[gy * grid_w + gx] = med as f32;
                sigmas[gy * grid_w + gx] = sig as f32;
            }
        }

        let cells = median_filter_grid(&medians, grid_w, grid_h, FILTER_BOX);
        let sigmas = median_filter_grid(&sigmas, grid_w, grid_h, FILTER_BOX);

        let n = cells.len() as f32;
        let global = cells.iter().sum::<f32>() / n;
        let global_rms = sigmas.iter().sum::<f32>() / n;

        BackgroundMap {
            cell_w: MESH_SIZE,
            cell_h: MESH_SIZE,
            grid_w,
            grid_h,
            cells,
            global,
            global_rms,
        }
    }

    #[inline]
    fn cell(&self, gx: isize, gy: isize) -> f32 {
        let gx = gx.clamp(0, self.grid_w as isize - 1) as usize;
        let gy = gy.clamp(0, self.grid_h as isize - 1) as usize;
        self.cells[gy * self.grid_w + gx]
    }

    /// Bicubic background value at a 0-based pixel position.
    pub fn value_at(&self, x: f64, y: f64) -> f32 {
        let gx = (x + 0.5) / self.cell_w as f64 - 0.5;
        let gy = (y + 0.5) / self.cell_h as f64 - 0.5;
        let ix = gx.floor() as isize;
        let iy = gy.floor() as isize;
        let tx = (gx - ix as f64) as f32;
        let ty = (gy - iy as f64) as f32;

        let mut rows = [0.0f32; 4];
        for (j, row) in rows.iter_mut().enumerate() {
            let yy = iy + j as isize - 1;
            *row = catmull_rom(
                self.cell(ix - 1, yy),
                self.cell(ix, yy),
                self.cell(ix + 1, yy),
                self.cell(ix + 2, yy),
                tx,
            );
        }
        catmull_rom(rows[0], rows[1], rows[2], rows[3], ty)
    }

    /// Subtract the interpolated background from `plane` in place.
    pub fn subtract(&self, plane: &mut Array2<f32>) {
        let (rows, cols) = plane.dim();
        for y in 0..rows {
            for x in 0..cols {
                plane[[y, x]] -= self.value_at(x as f64, y as f64);
            }
        }
    }

    pub fn summary(&self, num_stars_detected: u32) -> Background {
        Background {
            bw: self.cell_w as u32,
            bh: self.cell_h as u32,
            global: self.global,
            global_rms: self.global_rms,
            num_stars_detected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_field() {
        let plane = Array2::from_elem((128, 128), 100.0f32);
        let bkg = BackgroundMap::estimate(&plane);
        assert!((bkg.global - 100.0).abs() < 1e-3);
        assert!(bkg.global_rms < 1.0);
        assert!((bkg.value_at(64.0, 64.0) - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_gradient_tracked() {
        let plane = Array2::from_shape_fn((256, 256), |(y, _)| 50.0 + y as f32 * 0.5);
        let bkg = BackgroundMap::estimate(&plane);
        // Background at the top differs from the bottom by roughly the ramp.
        let top = bkg.value_at(128.0, 16.0);
        let bottom = bkg.value_at(128.0, 240.0);
        assert!(bottom - top > 80.0, "top {} bottom {}", top, bottom);
    }

    #[test]
    fn test_subtract_centers_on_zero() {
        let mut plane = Array2::from_elem((128, 128), 42.0f32);
        let bkg = BackgroundMap::estimate(&plane);
        bkg.subtract(&mut plane);
        let max = plane.iter().fold(0.0f32, |m, &v| m.max(v.abs()));
        assert!(max < 0.5, "residual {}", max);
    }

    #[test]
    fn test_stars_do_not_skew_median() {
        let mut plane = Array2::from_elem((128, 128), 10.0f32);
        // A bright star covering a few pixels in one cell.
        for y in 30..34 {
            for x in 30..34 {
                plane[[y, x]] = 5000.0;
            }
        }
        let bkg = BackgroundMap::estimate(&plane);
        assert!((bkg.global - 10.0).abs() < 1.0);
    }

    #[test]
    fn test_small_plane() {
        let plane = Array2::from_elem((8, 8), 7.0f32);
        let bkg = BackgroundMap::estimate(&plane);
        assert!((bkg.global - 7.0).abs() < 1e-3);
    }
}
