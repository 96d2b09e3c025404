//! Tent basis functions attached to octree nodes
//!
//! A node at depth `d` with integer offset `o` owns the trilinear tent
//! `B(p) = prod_k max(0, 1 - |p_k / w - (o_k + 0.5)|)` with `w = 2^-d`, in
//! unit-cube coordinates. All coupling integrals between two tents factor into
//! products of 1D integrals, which are exact for piecewise linear functions.

use itertools::iproduct;
use psrecon_core::Vector3d;

/// Largest depth difference whose 1D integrals are tabulated
const MAX_TABULATED_DELTA: u8 = 10;

/// Width of a node at `depth` in unit-cube coordinates
pub fn node_width(depth: u8) -> f64 {
    (-(depth as f64)).exp2()
}

/// Position of a node or node corner along an axis in units of half of the
/// width at `finest`, for `finest >= depth`
fn half_units(depth: u8, offset: i64, finest: u8) -> i64 {
    (2 * offset + 1) << (finest - depth)
}

/// 1D tent value and derivative for `t = p / w - o - 0.5`
#[inline]
pub fn tent(t: f64) -> (f64, f64) {
    let a = t.abs();
    if a >= 1.0 {
        (0.0, 0.0)
    } else if t == 0.0 {
        (1.0, 0.0)
    } else if t > 0.0 {
        (1.0 - a, -1.0)
    } else {
        (1.0 - a, 1.0)
    }
}

/// Exact 1D tent integrals for a coarse tent (first) and a fine tent (second)
///
/// Lengths are measured in units of the fine width: the coarse tent is
/// centered at 0 with half-width `s`, the fine tent at `center` with
/// half-width 1.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AxisIntegrals {
    /// Value times value
    pub vv: f64,
    /// Derivative times derivative
    pub gg: f64,
    /// Coarse derivative times fine value
    pub gv: f64,
    /// Coarse value times fine derivative
    pub vg: f64,
}

impl AxisIntegrals {
    pub fn compute(s: f64, center: f64) -> Self {
        let coarse = |x: f64| (1.0 - x.abs() / s).max(0.0);
        let fine = |x: f64| (1.0 - (x - center).abs()).max(0.0);
        let coarse_slope = |x: f64| if x.abs() >= s { 0.0 } else if x > 0.0 { -1.0 / s } else { 1.0 / s };
        let fine_slope = |x: f64| {
            let t = x - center;
            if t.abs() >= 1.0 {
                0.0
            } else if t > 0.0 {
                -1.0
            } else {
                1.0
            }
        };

        let mut breaks = [-s, 0.0, s, center - 1.0, center, center + 1.0];
        breaks.sort_by(f64::total_cmp);

        let mut out = Self::default();
        for pair in breaks.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let h = b - a;
            if h <= 0.0 {
                continue;
            }
            let m = 0.5 * (a + b);
            // Simpson's rule is exact for the quadratic product; slopes are constant per piece
            out.vv += h / 6.0 * (coarse(a) * fine(a) + 4.0 * coarse(m) * fine(m) + coarse(b) * fine(b));
            out.gg += h * coarse_slope(m) * fine_slope(m);
            out.gv += coarse_slope(m) * h * 0.5 * (fine(a) + fine(b));
            out.vg += fine_slope(m) * h * 0.5 * (coarse(a) + coarse(b));
        }
        out
    }
}

/// Identifies a basis function: node depth and integer offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TentKey {
    pub depth: u8,
    pub offset: [u32; 3],
}

impl TentKey {
    pub fn new(depth: u8, offset: [u32; 3]) -> Self {
        Self { depth, offset }
    }

    /// Tent center in unit-cube coordinates
    pub fn center(&self) -> Vector3d {
        let w = node_width(self.depth);
        Vector3d::new(
            (self.offset[0] as f64 + 0.5) * w,
            (self.offset[1] as f64 + 0.5) * w,
            (self.offset[2] as f64 + 0.5) * w,
        )
    }

    /// Value and gradient of the tent at `p`
    pub fn evaluate(&self, p: &Vector3d) -> (f64, Vector3d) {
        let scale = (self.depth as f64).exp2();
        let mut values = [0.0; 3];
        let mut slopes = [0.0; 3];
        for k in 0..3 {
            let (v, s) = tent(p[k] * scale - self.offset[k] as f64 - 0.5);
            values[k] = v;
            slopes[k] = s * scale;
        }
        let value = values[0] * values[1] * values[2];
        let gradient = Vector3d::new(
            slopes[0] * values[1] * values[2],
            values[0] * slopes[1] * values[2],
            values[0] * values[1] * slopes[2],
        );
        (value, gradient)
    }
}

/// Do the supports of two tents overlap along one axis
fn overlaps_1d(da: u8, oa: i64, db: u8, ob: i64) -> bool {
    let finest = da.max(db);
    let ca = half_units(da, oa, finest);
    let cb = half_units(db, ob, finest);
    let reach = (2i64 << (finest - da)) + (2i64 << (finest - db));
    (ca - cb).abs() < reach
}

/// Do the supports of two tents overlap
pub fn tents_overlap(a: &TentKey, b: &TentKey) -> bool {
    (0..3).all(|k| overlaps_1d(a.depth, a.offset[k] as i64, b.depth, b.offset[k] as i64))
}

/// Inclusive range of offsets at depth `db` whose tents overlap the tent at
/// offset `oa`, depth `da`, along one axis
pub fn overlap_range(da: u8, oa: u32, db: u8) -> Option<(u32, u32)> {
    let wa = node_width(da);
    let wb = node_width(db);
    let center = (oa as f64 + 0.5) * wa;
    let reach = wa + wb;
    let max_offset = (1i64 << db) - 1;

    let mut lo = (((center - reach) / wb) - 0.5).floor() as i64;
    let mut hi = (((center + reach) / wb) - 0.5).ceil() as i64;
    lo = lo.max(0);
    hi = hi.min(max_offset);
    while lo <= hi && !overlaps_1d(da, oa as i64, db, lo) {
        lo += 1;
    }
    while hi >= lo && !overlaps_1d(da, oa as i64, db, hi) {
        hi -= 1;
    }
    (lo <= hi).then_some((lo as u32, hi as u32))
}

/// All offsets at depth `db` whose tents overlap `key`
pub fn overlapping_offsets(key: &TentKey, db: u8) -> impl Iterator<Item = [u32; 3]> {
    let ranges: Option<Vec<(u32, u32)>> = (0..3).map(|k| overlap_range(key.depth, key.offset[k], db)).collect();
    let [rx, ry, rz] = match ranges.as_deref() {
        Some(&[x, y, z]) => [x, y, z],
        _ => [(1, 0), (1, 0), (1, 0)],
    };
    iproduct!(rx.0..=rx.1, ry.0..=ry.1, rz.0..=rz.1).map(|(x, y, z)| [x, y, z])
}

/// Cached 1D integrals per depth difference
///
/// Entry `r` of the table for depth difference `delta` holds the integrals
/// for a fine tent whose center sits `r / 2` fine widths from the coarse
/// center.
#[derive(Debug, Clone)]
pub struct CouplingTables {
    tables: Vec<Vec<AxisIntegrals>>,
}

impl CouplingTables {
    /// Tabulate depth differences up to `max_delta`
    pub fn new(max_delta: u8) -> Self {
        let tables = (0..=max_delta.min(MAX_TABULATED_DELTA))
            .map(|delta| {
                let s = (delta as f64).exp2();
                let radius = Self::radius(delta);
                (-radius..=radius)
                    .map(|r| AxisIntegrals::compute(s, r as f64 * 0.5))
                    .collect()
            })
            .collect();
        Self { tables }
    }

    /// Largest `|r|` with overlapping supports
    fn radius(delta: u8) -> i64 {
        2 * ((1i64 << delta) + 1) - 1
    }

    fn axis(&self, delta: u8, r: i64) -> AxisIntegrals {
        let radius = Self::radius(delta);
        if r.abs() > radius {
            return AxisIntegrals::default();
        }
        match self.tables.get(delta as usize) {
            Some(table) => table[(r + radius) as usize],
            None => AxisIntegrals::compute((delta as f64).exp2(), r as f64 * 0.5),
        }
    }

    /// Per-axis integrals with `a` as the coarse tent, plus whether the
    /// arguments were swapped and the fine width
    fn factors(&self, a: &TentKey, b: &TentKey) -> ([AxisIntegrals; 3], bool, f64) {
        let (coarse, fine, swapped) = if a.depth <= b.depth { (a, b, false) } else { (b, a, true) };
        let delta = fine.depth - coarse.depth;
        let mut axes = [AxisIntegrals::default(); 3];
        for k in 0..3 {
            let r = half_units(fine.depth, fine.offset[k] as i64, fine.depth)
                - half_units(coarse.depth, coarse.offset[k] as i64, fine.depth);
            axes[k] = self.axis(delta, r);
        }
        (axes, swapped, node_width(fine.depth))
    }

    /// Stiffness coupling `integral grad B_a . grad B_b`
    pub fn laplacian(&self, a: &TentKey, b: &TentKey) -> f64 {
        let (axes, _, w) = self.factors(a, b);
        let [x, y, z] = axes;
        w * (x.gg * y.vv * z.vv + x.vv * y.gg * z.vv + x.vv * y.vv * z.gg)
    }

    /// Divergence coupling `integral (d/dx_k B_a) B_b` for each axis `k`
    pub fn gradient_value(&self, a: &TentKey, b: &TentKey) -> Vector3d {
        let (axes, swapped, w) = self.factors(a, b);
        let slope = |i: &AxisIntegrals| if swapped { i.vg } else { i.gv };
        let [x, y, z] = axes;
        w * w
            * Vector3d::new(
                slope(&x) * y.vv * z.vv,
                x.vv * slope(&y) * z.vv,
                x.vv * y.vv * slope(&z),
            )
    }
}

/// Corners of the unit cube in bit order: bit 0 = x, bit 1 = y, bit 2 = z
pub fn corner_offsets() -> impl Iterator<Item = [u32; 3]> {
    (0..8u32).map(|c| [c & 1, (c >> 1) & 1, (c >> 2) & 1])
}
