use crate::Real;

/// Spatial interpolation scheme used when child patches are created and
/// when ghost cells are filled from a coarser level. `Quad`/`Quar` are the
/// cell-centered aliases of their conservative variants: only cell-averaged
/// fields exist here, so the node-centered stencils collapse onto the
/// conservative ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpScheme {
    Central,
    MinMod,
    VanLeer,
    CQuad,
    Quad,
    CQuar,
    Quar,
}

impl InterpScheme {
    /// Coarse cells needed on each side of the interpolated cell.
    pub fn pad(&self) -> usize {
        match self {
            InterpScheme::CQuar | InterpScheme::Quar => 2,
            _ => 1,
        }
    }
}

/// Slope of the interpolant across one coarse cell, from the 3-point
/// neighborhood. Children receive `c -+ slope/4`, which preserves the cell
/// average exactly.
pub fn slope3(scheme: InterpScheme, l: Real, c: Real, r: Real) -> Real {
    let dl = c - l;
    let dr = r - c;
    match scheme {
        InterpScheme::Central | InterpScheme::CQuad | InterpScheme::Quad => 0.5 * (dl + dr),
        InterpScheme::MinMod => {
            if dl * dr > 0.0 {
                dl.signum() * dl.abs().min(dr.abs())
            } else {
                0.0
            }
        }
        InterpScheme::VanLeer => {
            if dl * dr > 0.0 {
                2.0 * dl * dr / (dl + dr)
            } else {
                0.0
            }
        }
        InterpScheme::CQuar | InterpScheme::Quar => unreachable!("quartic slope needs 5 points"),
    }
}

/// Fourth-order slope from the 5-point neighborhood, used by the quartic
/// schemes.
pub fn slope5(ll: Real, l: Real, r: Real, rr: Real) -> Real {
    (8.0 * (r - l) - (rr - ll)) / 12.0
}

/// Slope across coarse cell `i` of a 1D strip, honoring the scheme's
/// stencil width. The strip must extend `pad` cells past `i` on both
/// sides.
fn strip_slope(scheme: InterpScheme, strip: &[Real], i: usize) -> Real {
    match scheme {
        InterpScheme::CQuar | InterpScheme::Quar => {
            slope5(strip[i - 2], strip[i - 1], strip[i + 1], strip[i + 2])
        }
        _ => slope3(scheme, strip[i - 1], strip[i], strip[i + 1]),
    }
}

/// Refine one axis of a scalar box by a factor of two. The input box has
/// dimensions `(nx, ny, nz)` (x fastest); the output box has dimensions
/// `(2 * (nx - 2 * pad), ny, nz)` and covers the input interior.
fn refine_axis_x(
    input: &[Real],
    nx: usize,
    ny: usize,
    nz: usize,
    pad: usize,
    scheme: InterpScheme,
) -> Vec<Real> {
    let nfx = 2 * (nx - 2 * pad);
    let mut out = vec![0.0; nfx * ny * nz];

    for k in 0..nz {
        for j in 0..ny {
            let row = &input[(k * ny + j) * nx..(k * ny + j) * nx + nx];
            let out_row = &mut out[(k * ny + j) * nfx..(k * ny + j) * nfx + nfx];
            for i in pad..nx - pad {
                let s = strip_slope(scheme, row, i);
                out_row[2 * (i - pad)] = row[i] - 0.25 * s;
                out_row[2 * (i - pad) + 1] = row[i] + 0.25 * s;
            }
        }
    }
    out
}

/// Rotate the box axes `(x, y, z) -> (y, z, x)` so three applications of
/// `refine_axis_x` refine all three axes.
fn cycle_axes(input: &[Real], nx: usize, ny: usize, nz: usize) -> Vec<Real> {
    let mut out = vec![0.0; input.len()];
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                // (i, j, k) -> output index with (j, k, i) layout
                out[(i * nz + k) * ny + j] = input[(k * ny + j) * nx + i];
            }
        }
    }
    out
}

/// Interpolate a padded coarse scalar box of side `nc` onto the 2x-refined
/// box covering its interior (side `2 * (nc - 2 * pad)`). Interpolation is
/// applied per axis in succession, so the cross terms of the tensor-product
/// stencil are retained and every coarse interior cell equals the average
/// of its eight children.
pub fn refine_box(coarse: &[Real], nc: usize, scheme: InterpScheme) -> Vec<Real> {
    let pad = scheme.pad();
    let nf = 2 * (nc - 2 * pad);
    debug_assert_eq!(coarse.len(), nc * nc * nc);

    // x pass, then rotate so y and z take their turns
    let a = refine_axis_x(coarse, nc, nc, nc, pad, scheme);
    let a = cycle_axes(&a, nf, nc, nc);
    let b = refine_axis_x(&a, nc, nc, nf, pad, scheme);
    let b = cycle_axes(&b, nf, nc, nf);
    let c = refine_axis_x(&b, nc, nf, nf, pad, scheme);
    let c = cycle_axes(&c, nf, nf, nf);

    debug_assert_eq!(c.len(), nf * nf * nf);
    c
}

#[cfg(test)]
mod test {
    use super::*;

    fn coarse_box(nc: usize, f: impl Fn(usize, usize, usize) -> Real) -> Vec<Real> {
        let mut v = vec![0.0; nc * nc * nc];
        for k in 0..nc {
            for j in 0..nc {
                for i in 0..nc {
                    v[(k * nc + j) * nc + i] = f(i, j, k);
                }
            }
        }
        v
    }

    #[test]
    fn refinement_preserves_cell_averages() {
        let nc = 6;
        let coarse = coarse_box(nc, |i, j, k| {
            1.0 + 0.3 * i as Real - 0.2 * (j * j) as Real + 0.05 * (i * k) as Real
        });
        for scheme in [
            InterpScheme::Central,
            InterpScheme::MinMod,
            InterpScheme::VanLeer,
            InterpScheme::CQuad,
            InterpScheme::CQuar,
        ] {
            let pad = scheme.pad();
            let fine = refine_box(&coarse, nc, scheme);
            let nf = 2 * (nc - 2 * pad);

            for ck in 0..nc - 2 * pad {
                for cj in 0..nc - 2 * pad {
                    for ci in 0..nc - 2 * pad {
                        let mut avg = 0.0;
                        for dk in 0..2 {
                            for dj in 0..2 {
                                for di in 0..2 {
                                    avg += fine[((2 * ck + dk) * nf + (2 * cj + dj)) * nf
                                        + (2 * ci + di)];
                                }
                            }
                        }
                        avg /= 8.0;
                        let parent =
                            coarse[((ck + pad) * nc + (cj + pad)) * nc + (ci + pad)];
                        assert!(
                            (avg - parent).abs() < 1e-12,
                            "{:?}: {} vs {}",
                            scheme,
                            avg,
                            parent
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn linear_fields_refine_exactly() {
        let nc = 6;
        let coarse = coarse_box(nc, |i, _, _| 2.0 * i as Real);
        let fine = refine_box(&coarse, nc, InterpScheme::Central);
        let nf = 2 * (nc - 2);
        // fine cells sample the linear field at quarter offsets, so adjacent
        // fine cells differ by half the coarse slope
        for i in 1..nf {
            assert!((fine[i] - fine[i - 1] - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn minmod_does_not_overshoot_steps() {
        let nc = 6;
        let coarse = coarse_box(nc, |i, _, _| if i < 3 { 1.0 } else { 0.0 });
        let fine = refine_box(&coarse, nc, InterpScheme::MinMod);
        for x in &fine {
            assert!(*x >= -1e-12 && *x <= 1.0 + 1e-12);
        }
    }
}
