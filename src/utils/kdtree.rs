//! Fixed-dimension kd-tree over `[f64; K]` points.
//!
//! Built once, queried from many threads without locking. Used with K = 3
//! for unit-sphere star positions and K = 4 for quad codes.

/// Balanced kd-tree stored as an index permutation over the point array:
/// the node of range `[lo, hi)` is the median element, with children in
/// the two half-ranges.
#[derive(Debug, Clone)]
pub struct KdTree<const K: usize> {
    points: Vec<[f64; K]>,
    order: Vec<u32>,
}

fn dist_sq<const K: usize>(a: &[f64; K], b: &[f64; K]) -> f64 {
    let mut acc = 0.0;
    for i in 0..K {
        let d = a[i] - b[i];
        acc += d * d;
    }
    acc
}

impl<const K: usize> KdTree<K> {
    pub fn build(points: Vec<[f64; K]>) -> Self {
        let mut order: Vec<u32> = (0..points.len() as u32).collect();
        let mut tree = KdTree { points, order: Vec::new() };
        if !tree.points.is_empty() {
            let n = order.len();
            tree.split(&mut order, 0, n, 0);
        }
        tree.order = order;
        tree
    }

    fn split(&self, order: &mut [u32], lo: usize, hi: usize, depth: usize) {
        if hi - lo <= 1 {
            return;
        }
        let axis = depth % K;
        let mid = (lo + hi) / 2;
        order[lo..hi].select_nth_unstable_by(mid - lo, |&a, &b| {
            let va = self.points[a as usize][axis];
            let vb = self.points[b as usize][axis];
            va.partial_cmp(&vb).unwrap_or(std::cmp::Ordering::Equal)
        });
        self.split(order, lo, mid, depth + 1);
        self.split(order, mid + 1, hi, depth + 1);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, id: u32) -> &[f64; K] {
        &self.points[id as usize]
    }

    /// All point ids within `radius` of `target`, with squared distances.
    pub fn within(&self, target: &[f64; K], radius: f64) -> Vec<(u32, f64)> {
        let mut hits = Vec::new();
        if !self.points.is_empty() {
            self.within_rec(target, radius * radius, 0, self.order.len(), 0, &mut hits);
        }
        hits
    }

    fn within_rec(
        &self,
        target: &[f64; K],
        radius_sq: f64,
        lo: usize,
        hi: usize,
        depth: usize,
        hits: &mut Vec<(u32, f64)>,
    ) {
        if lo >= hi {
            return;
        }
        let mid = (lo + hi) / 2;
        let id = self.order[mid];
        let node = &self.points[id as usize];
        let d2 = dist_sq(target, node);
        if d2 <= radius_sq {
            hits.push((id, d2));
        }
        let axis = depth % K;
        let delta = target[axis] - node[axis];
        let (near, far) = if delta <= 0.0 {
            ((lo, mid), (mid + 1, hi))
        } else {
            ((mid + 1, hi), (lo, mid))
        };
        self.within_rec(target, radius_sq, near.0, near.1, depth + 1, hits);
        if delta * delta <= radius_sq {
            self.within_rec(target, radius_sq, far.0, far.1, depth + 1, hits);
        }
    }

    /// Nearest point id and its squared distance.
    pub fn nearest(&self, target: &[f64; K]) -> Option<(u32, f64)> {
        if self.points.is_empty() {
            return None;
        }
        let mut best = (self.order[0], f64::INFINITY);
        self.nearest_rec(target, 0, self.order.len(), 0, &mut best);
        Some(best)
    }

    fn nearest_rec(
        &self,
        target: &[f64; K],
        lo: usize,
        hi: usize,
        depth: usize,
        best: &mut (u32, f64),
    ) {
        if lo >= hi {
            return;
        }
        let mid = (lo + hi) / 2;
        let id = self.order[mid];
        let node = &self.points[id as usize];
        let d2 = dist_sq(target, node);
        if d2 < best.1 {
            *best = (id, d2);
        }
        let axis = depth % K;
        let delta = target[axis] - node[axis];
        let (near, far) = if delta <= 0.0 {
            ((lo, mid), (mid + 1, hi))
        } else {
            ((mid + 1, hi), (lo, mid))
        };
        self.nearest_rec(target, near.0, near.1, depth + 1, best);
        if delta * delta < best.1 {
            self.nearest_rec(target, far.0, far.1, depth + 1, best);
        }
    }
}
