//! Candidate lookup: field quad codes against each index's code tree.

use std::sync::Arc;

use crate::domain::index::IndexFile;
use crate::domain::quads::{flip_code_perm, FieldQuad};
use crate::model::Parity;

/// One candidate correspondence between a field quad and an index quad.
/// `field_stars` is aligned star-for-star with the index quad's order.
#[derive(Clone)]
pub struct QuadMatch {
    pub index: Arc<IndexFile>,
    pub index_quad: u32,
    pub field_stars: [usize; 4],
    /// Parity implied by the query that produced this hit.
    pub parity: Parity,
}

/// Query one index for quads matching `quad` under the configured parity.
///
/// The index stores codes computed in tangent-plane coordinates (east,
/// north). A direct hit therefore implies an orientation-preserving
/// pixel-to-sky map (negative parity); a mirrored field matches through
/// the flipped code (positive parity).
pub fn find_candidates(
    quad: &FieldQuad,
    index: &Arc<IndexFile>,
    search_parity: Parity,
    pixscale_band: (f64, f64),
    out: &mut Vec<QuadMatch>,
) {
    // Quad angular size must be coverable by this index somewhere in the
    // trial pixel-scale band.
    let quad_lo = quad.scale * pixscale_band.0;
    let quad_hi = quad.scale * pixscale_band.1;
    if !index.overlaps_band(quad_lo, quad_hi) {
        return;
    }

    if search_parity != Parity::Positive {
        for index_quad in index.matching_quads(&quad.code) {
            out.push(QuadMatch {
                index: Arc::clone(index),
                index_quad,
                field_stars: quad.stars,
                parity: Parity::Negative,
            });
        }
    }
    if search_parity != Parity::Negative {
        let (flipped, perm) = flip_code_perm(&quad.code);
        for index_quad in index.matching_quads(&flipped) {
            out.push(QuadMatch {
                index: Arc::clone(index),
                index_quad,
                field_stars: [
                    quad.stars[perm[0]],
                    quad.stars[perm[1]],
                    quad.stars[perm[2]],
                    quad.stars[perm[3]],
                ],
                parity: Parity::Positive,
            });
        }
    }
}
