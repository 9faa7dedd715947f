//! Read-only star/quad index files.
//!
//! An index is a little-endian binary artifact (magic `SSIX`, version 1)
//! holding a reference star table (RA/Dec, degrees) and a quad table
//! (four star ids plus the canonical 4-D code). Files are memory-mapped,
//! parsed once at load, and shared across jobs behind an `Arc`; the
//! kd-trees built here are immutable afterwards and need no locking.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use log::{info, warn};
use memmap2::Mmap;

use crate::domain::wcs::radec_to_xyz;
use crate::error::{Error, Result};
use crate::utils::kdtree::KdTree;

pub const INDEX_MAGIC: &[u8; 4] = b"SSIX";
pub const INDEX_VERSION: u32 = 1;
pub const INDEX_EXTENSION: &str = "ssix";

/// One loaded index file.
#[derive(Debug)]
pub struct IndexFile {
    pub path: PathBuf,
    pub index_id: u32,
    /// Usable quad angular size band, arcseconds.
    pub scale_lo: f64,
    pub scale_hi: f64,
    /// Match radius in code space.
    pub code_tol: f64,
    stars: Vec<(f64, f64)>,
    star_tree: KdTree<3>,
    code_tree: KdTree<4>,
    quads: Vec<[u32; 4]>,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            bail!("truncated index file at byte {}", self.pos);
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> anyhow::Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> anyhow::Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

impl IndexFile {
    pub fn load(path: &Path) -> anyhow::Result<IndexFile> {
        let file = File::open(path).with_context(|| format!("failed to open index {:?}", path))?;
        // Safety of the map: index files are read-only artifacts; writers
        // racing the map are outside the engine's contract.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to map index {:?}", path))?;
        let mut r = Reader { bytes: &mmap, pos: 0 };

        if r.take(4)? != &INDEX_MAGIC[..] {
            bail!("{:?} is not an index file (bad magic)", path);
        }
        let version = r.u32()?;
        if version != INDEX_VERSION {
            bail!("{:?}: unsupported index version {}", path, version);
        }
        let index_id = r.u32()?;
        let scale_lo = r.f64()?;
        let scale_hi = r.f64()?;
        let code_tol = r.f64()?;
        let n_stars = r.u32()? as usize;
        let n_quads = r.u32()? as usize;
        if scale_lo <= 0.0 || scale_hi < scale_lo {
            bail!("{:?}: nonsensical scale band {}..{}", path, scale_lo, scale_hi);
        }

        let mut stars = Vec::with_capacity(n_stars);
        let mut positions = Vec::with_capacity(n_stars);
        for _ in 0..n_stars {
            let ra = r.f64()?;
            let dec = r.f64()?;
            stars.push((ra, dec));
            positions.push(radec_to_xyz(ra, dec));
        }

        let mut quads = Vec::with_capacity(n_quads);
        let mut codes = Vec::with_capacity(n_quads);
        for _ in 0..n_quads {
            let mut ids = [0u32; 4];
            for id in &mut ids {
                *id = r.u32()?;
                if *id as usize >= n_stars {
                    bail!("{:?}: quad references star {} of {}", path, id, n_stars);
                }
            }
            let code = [r.f64()?, r.f64()?, r.f64()?, r.f64()?];
            quads.push(ids);
            codes.push(code);
        }

        Ok(IndexFile {
            path: path.to_path_buf(),
            index_id,
            scale_lo,
            scale_hi,
            code_tol,
            stars,
            star_tree: KdTree::build(positions),
            code_tree: KdTree::build(codes),
            quads,
        })
    }

    pub fn num_stars(&self) -> usize {
        self.stars.len()
    }

    pub fn num_quads(&self) -> usize {
        self.quads.len()
    }

    pub fn star_radec(&self, id: u32) -> (f64, f64) {
        self.stars[id as usize]
    }

    pub fn quad_stars(&self, quad_id: u32) -> [u32; 4] {
        self.quads[quad_id as usize]
    }

    /// Does this index cover any quad size in `lo..hi` arcseconds?
    pub fn overlaps_band(&self, lo_arcsec: f64, hi_arcsec: f64) -> bool {
        self.scale_lo <= hi_arcsec && lo_arcsec <= self.scale_hi
    }

    /// Quad ids whose code lies within `code_tol` of `code`.
    pub fn matching_quads(&self, code: &[f64; 4]) -> Vec<u32> {
        self.code_tree.within(code, self.code_tol).into_iter().map(|(id, _)| id).collect()
    }

    /// Reference star ids within `radius_rad` of the direction `xyz`,
    /// with squared chord distances.
    pub fn stars_near(&self, xyz: &[f64; 3], radius_rad: f64) -> Vec<(u32, f64)> {
        let chord = crate::domain::wcs::chord_for_angle(radius_rad);
        self.star_tree.within(xyz, chord)
    }

    /// Nearest reference star to `xyz` within `radius_rad`, if any.
    pub fn nearest_star(&self, xyz: &[f64; 3], radius_rad: f64) -> Option<u32> {
        let chord = crate::domain::wcs::chord_for_angle(radius_rad);
        match self.star_tree.nearest(xyz) {
            Some((id, d2)) if d2 <= chord * chord => Some(id),
            _ => None,
        }
    }
}

/// All indexes configured for a job. Sharable across concurrent solves.
#[derive(Debug)]
pub struct IndexCatalog {
    pub indexes: Vec<Arc<IndexFile>>,
}

impl IndexCatalog {
    /// Load every index reachable from `paths`: directories contribute
    /// their `*.ssix` entries, plain paths are loaded directly. Unreadable
    /// files are logged and skipped; an empty catalog is `NoIndexes`.
    pub fn load_paths(paths: &[PathBuf]) -> Result<IndexCatalog> {
        let mut files: Vec<PathBuf> = Vec::new();
        for path in paths {
            if path.is_dir() {
                let entries = std::fs::read_dir(path)
                    .map_err(|e| Error::InvalidInput(format!("cannot read {:?}: {}", path, e)))?;
                let mut found: Vec<PathBuf> = entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        p.extension().map(|e| e.eq_ignore_ascii_case(INDEX_EXTENSION)).unwrap_or(false)
                    })
                    .collect();
                found.sort();
                files.extend(found);
            } else if path.exists() {
                files.push(path.clone());
            }
        }

        let mut indexes = Vec::new();
        for file in &files {
            match IndexFile::load(file) {
                Ok(index) => {
                    info!(
                        "loaded index {} ({:?}): {} stars, {} quads, {:.0}-{:.0} arcsec",
                        index.index_id,
                        file.file_name().unwrap_or_default(),
                        index.num_stars(),
                        index.num_quads(),
                        index.scale_lo,
                        index.scale_hi
                    );
                    indexes.push(Arc::new(index));
                }
                Err(e) => warn!("skipping index {:?}: {:#}", file, e),
            }
        }
        if indexes.is_empty() {
            return Err(Error::NoIndexes);
        }
        Ok(IndexCatalog { indexes })
    }

    /// Indexes whose quad scale band intersects `lo..hi` arcseconds.
    pub fn in_band(&self, lo_arcsec: f64, hi_arcsec: f64) -> Vec<Arc<IndexFile>> {
        self.indexes
            .iter()
            .filter(|idx| idx.overlaps_band(lo_arcsec, hi_arcsec))
            .cloned()
            .collect()
    }
}
