use crate::Real;

/// Slope limiter applied during data reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrLimiter {
    VanLeer,
    GMinMod,
    VanAlbada,
    VanLeerGMinMod,
    ExtremaPreserving,
}

/// Piecewise-linear or piecewise-parabolic face states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconScheme {
    Plm,
    Ppm,
}

/// Variables the limiting is performed in. Characteristic reconstruction is
/// used when self-gravity is off; primitive otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarMode {
    Primitive,
    Characteristic,
}

#[derive(Clone, Copy)]
pub struct ReconParams {
    pub limiter: LrLimiter,
    pub minmod_coeff: Real,
    pub ep_coeff: Real,
    pub scheme: ReconScheme,
    pub vars: VarMode,
    pub gamma: Real,
}

#[inline]
fn cell(pri: &[Real], id: usize) -> [Real; 5] {
    [
        pri[id * 5],
        pri[id * 5 + 1],
        pri[id * 5 + 2],
        pri[id * 5 + 3],
        pri[id * 5 + 4],
    ]
}

#[inline]
fn diff(a: &[Real; 5], b: &[Real; 5]) -> [Real; 5] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2], a[3] - b[3], a[4] - b[4]]
}

/// Project a primitive-variable difference onto the characteristic
/// amplitudes of the `axis`-directed system, linearized about `w`.
fn char_project(d: &[Real; 5], w: &[Real; 5], axis: usize, gamma: Real) -> [Real; 5] {
    let cs = (gamma * w[4] / w[0]).sqrt();
    let vn = 1 + axis;
    let vt1 = 1 + (axis + 1) % 3;
    let vt2 = 1 + (axis + 2) % 3;
    let inv_cs2 = 1.0 / (cs * cs);
    [
        0.5 * (d[4] * inv_cs2 - w[0] * d[vn] / cs),
        d[0] - d[4] * inv_cs2,
        d[vt1],
        d[vt2],
        0.5 * (d[4] * inv_cs2 + w[0] * d[vn] / cs),
    ]
}

/// Inverse of `char_project`.
fn char_unproject(a: &[Real; 5], w: &[Real; 5], axis: usize, gamma: Real) -> [Real; 5] {
    let cs = (gamma * w[4] / w[0]).sqrt();
    let vn = 1 + axis;
    let vt1 = 1 + (axis + 1) % 3;
    let vt2 = 1 + (axis + 2) % 3;
    let mut d = [0.0; 5];
    d[0] = a[0] + a[1] + a[4];
    d[vn] = cs / w[0] * (a[4] - a[0]);
    d[vt1] = a[2];
    d[vt2] = a[3];
    d[4] = cs * cs * (a[0] + a[4]);
    d
}

/// Limited slope of one scalar from the left, right, and centered
/// differences.
fn limit_slope(limiter: LrLimiter, dl: Real, dr: Real, minmod_coeff: Real, ep_coeff: Real) -> Real {
    let dc = 0.5 * (dl + dr);

    let gminmod = |dl: Real, dr: Real, dc: Real| -> Real {
        if dl * dr > 0.0 {
            dc.signum()
                * (minmod_coeff * dl.abs())
                    .min(minmod_coeff * dr.abs())
                    .min(dc.abs())
        } else {
            0.0
        }
    };

    match limiter {
        LrLimiter::VanLeer => {
            if dl * dr > 0.0 {
                2.0 * dl * dr / (dl + dr)
            } else {
                0.0
            }
        }
        LrLimiter::GMinMod => gminmod(dl, dr, dc),
        LrLimiter::VanAlbada => {
            if dl * dr > 0.0 {
                dl * dr * (dl + dr) / (dl * dl + dr * dr)
            } else {
                0.0
            }
        }
        LrLimiter::VanLeerGMinMod => {
            if dl * dr > 0.0 {
                let vl = 2.0 * dl * dr / (dl + dr);
                let gm = gminmod(dl, dr, dc);
                if vl.abs() < gm.abs() {
                    vl
                } else {
                    gm
                }
            } else {
                0.0
            }
        }
        LrLimiter::ExtremaPreserving => {
            if dl * dr > 0.0 {
                gminmod(dl, dr, dc)
            } else {
                // retain a bounded slope at extrema instead of flattening
                dc.signum() * dc.abs().min(ep_coeff * 0.5 * (dl.abs() + dr.abs()))
            }
        }
    }
}

/// Monotonicity-limited van-Leer slope used to build the PPM parabola.
fn ppm_slope(dl: Real, dr: Real, dc: Real) -> Real {
    if dl * dr > 0.0 {
        dc.signum() * dc.abs().min(2.0 * dl.abs()).min(2.0 * dr.abs())
    } else {
        0.0
    }
}

/// The slope vector multiplied by the primitive-form coefficient matrix
/// `A_d(w)`, used to trace face states through a half time-step.
fn primitive_form_product(w: &[Real; 5], s: &[Real; 5], axis: usize, gamma: Real) -> [Real; 5] {
    let vn = 1 + axis;
    let vd = w[vn];
    let mut out = [
        vd * s[0] + w[0] * s[vn],
        vd * s[1],
        vd * s[2],
        vd * s[3],
        vd * s[4] + gamma * w[4] * s[vn],
    ];
    out[vn] += s[4] / w[0];
    out
}

/// Given cell-centered primitive states on a cube of side `n_in` (cell-major
/// layout, 5 reals per cell), produce the six face-centered states of every
/// cell on the interior cube of side `n_in - 2 * n_ghost`. Output layout is
/// `[cell][face][var]` with faces ordered (-x,+x,-y,+y,-z,+z).
///
/// When `dt_dh` is given (CTU), the face states are additionally advanced
/// by a half time-step using the primitive-form evolution equations; the
/// MUSCL-Hancock schemes pass `None` and do their own prediction.
pub fn data_reconstruction(
    pri: &[Real],
    fc: &mut [Real],
    n_in: usize,
    n_ghost: usize,
    p: &ReconParams,
    dt_dh: Option<(Real, Real)>,
) {
    let n_out = n_in - 2 * n_ghost;
    let did = [1, n_in, n_in * n_in];

    for k in 0..n_out {
        for j in 0..n_out {
            for i in 0..n_out {
                let id_out = (k * n_out + j) * n_out + i;
                let id_in = ((k + n_ghost) * n_in + (j + n_ghost)) * n_in + (i + n_ghost);
                let w_c = cell(pri, id_in);

                for axis in 0..3 {
                    let (mut w_minus, mut w_plus, slope) = match p.scheme {
                        ReconScheme::Plm => {
                            plm_faces(pri, id_in, did[axis], axis, &w_c, p)
                        }
                        ReconScheme::Ppm => {
                            ppm_faces(pri, id_in, did[axis], axis, &w_c, p)
                        }
                    };

                    if let Some((dt, dh)) = dt_dh {
                        let adv = primitive_form_product(&w_c, &slope, axis, p.gamma);
                        for v in 0..5 {
                            let c = 0.5 * dt / dh * adv[v];
                            w_minus[v] -= c;
                            w_plus[v] -= c;
                        }
                    }

                    // face states must stay physical after tracing
                    w_minus[0] = w_minus[0].max(Real::MIN_POSITIVE);
                    w_plus[0] = w_plus[0].max(Real::MIN_POSITIVE);

                    let base = (id_out * 6 + 2 * axis) * 5;
                    fc[base..base + 5].copy_from_slice(&w_minus);
                    fc[base + 5..base + 10].copy_from_slice(&w_plus);
                }
            }
        }
    }
}

/// Piecewise-linear faces: returns (minus face, plus face, slope vector).
fn plm_faces(
    pri: &[Real],
    id: usize,
    did: usize,
    axis: usize,
    w_c: &[Real; 5],
    p: &ReconParams,
) -> ([Real; 5], [Real; 5], [Real; 5]) {
    let w_l = cell(pri, id - did);
    let w_r = cell(pri, id + did);
    let dl = diff(w_c, &w_l);
    let dr = diff(&w_r, w_c);

    let slope = match p.vars {
        VarMode::Primitive => {
            let mut s = [0.0; 5];
            for v in 0..5 {
                s[v] = limit_slope(p.limiter, dl[v], dr[v], p.minmod_coeff, p.ep_coeff);
            }
            s
        }
        VarMode::Characteristic => {
            let al = char_project(&dl, w_c, axis, p.gamma);
            let ar = char_project(&dr, w_c, axis, p.gamma);
            let mut a = [0.0; 5];
            for v in 0..5 {
                a[v] = limit_slope(p.limiter, al[v], ar[v], p.minmod_coeff, p.ep_coeff);
            }
            char_unproject(&a, w_c, axis, p.gamma)
        }
    };

    let mut w_minus = [0.0; 5];
    let mut w_plus = [0.0; 5];
    for v in 0..5 {
        w_minus[v] = w_c[v] - 0.5 * slope[v];
        w_plus[v] = w_c[v] + 0.5 * slope[v];
    }
    (w_minus, w_plus, slope)
}

/// Piecewise-parabolic faces built from 5-point slopes with van-Leer
/// monotonization followed by the PPM parabola limiter.
fn ppm_faces(
    pri: &[Real],
    id: usize,
    did: usize,
    axis: usize,
    w_c: &[Real; 5],
    p: &ReconParams,
) -> ([Real; 5], [Real; 5], [Real; 5]) {
    let w_ll = cell(pri, id - 2 * did);
    let w_l = cell(pri, id - did);
    let w_r = cell(pri, id + did);
    let w_rr = cell(pri, id + 2 * did);

    // interface deltas, optionally projected onto characteristics about the
    // central cell
    let deltas: [[Real; 5]; 4] = {
        let raw = [
            diff(&w_l, &w_ll),
            diff(w_c, &w_l),
            diff(&w_r, w_c),
            diff(&w_rr, &w_r),
        ];
        match p.vars {
            VarMode::Primitive => raw,
            VarMode::Characteristic => {
                let mut out = [[0.0; 5]; 4];
                for (o, d) in out.iter_mut().zip(&raw) {
                    *o = char_project(d, w_c, axis, p.gamma);
                }
                out
            }
        }
    };

    let mut a_minus = [0.0; 5];
    let mut a_plus = [0.0; 5];
    let mut slope = [0.0; 5];
    for v in 0..5 {
        let s_l = ppm_slope(deltas[0][v], deltas[1][v], 0.5 * (deltas[0][v] + deltas[1][v]));
        let s_c = ppm_slope(deltas[1][v], deltas[2][v], 0.5 * (deltas[1][v] + deltas[2][v]));
        let s_r = ppm_slope(deltas[2][v], deltas[3][v], 0.5 * (deltas[2][v] + deltas[3][v]));

        // face values in the delta frame (cell value is the origin)
        let mut al = -0.5 * deltas[1][v] - (s_c - s_l) / 6.0;
        let mut ar = 0.5 * deltas[2][v] - (s_r - s_c) / 6.0;

        // PPM monotonization of the parabola through (al, 0, ar)
        if al * ar >= 0.0 {
            al = 0.0;
            ar = 0.0;
        } else {
            let da = ar - al;
            let mid = -0.5 * (al + ar);
            if da * mid > da * da / 6.0 {
                al = -2.0 * ar;
            } else if -da * da / 6.0 > da * mid {
                ar = -2.0 * al;
            }
        }
        a_minus[v] = al;
        a_plus[v] = ar;
        slope[v] = ar - al;
    }

    let (d_minus, d_plus, d_slope) = match p.vars {
        VarMode::Primitive => (a_minus, a_plus, slope),
        VarMode::Characteristic => (
            char_unproject(&a_minus, w_c, axis, p.gamma),
            char_unproject(&a_plus, w_c, axis, p.gamma),
            char_unproject(&slope, w_c, axis, p.gamma),
        ),
    };

    let mut w_minus = [0.0; 5];
    let mut w_plus = [0.0; 5];
    for v in 0..5 {
        w_minus[v] = w_c[v] + d_minus[v];
        w_plus[v] = w_c[v] + d_plus[v];
    }
    (w_minus, w_plus, d_slope)
}

#[cfg(test)]
mod test {
    use super::*;

    const GAMMA: Real = 1.4;

    fn params(limiter: LrLimiter, vars: VarMode, scheme: ReconScheme) -> ReconParams {
        ReconParams {
            limiter,
            minmod_coeff: 1.5,
            ep_coeff: 0.5,
            scheme,
            vars,
            gamma: GAMMA,
        }
    }

    fn uniform_gradient_field(n: usize) -> Vec<Real> {
        let mut pri = vec![0.0; n * n * n * 5];
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    let id = (k * n + j) * n + i;
                    pri[id * 5] = 1.0 + 0.1 * i as Real;
                    pri[id * 5 + 1] = 0.2;
                    pri[id * 5 + 2] = 0.0;
                    pri[id * 5 + 3] = 0.0;
                    pri[id * 5 + 4] = 2.0 + 0.05 * j as Real;
                }
            }
        }
        pri
    }

    #[test]
    fn char_projection_round_trips() {
        let w = [1.3, 0.4, -0.2, 0.7, 2.1];
        let d = [0.1, -0.05, 0.02, 0.03, 0.2];
        for axis in 0..3 {
            let a = char_project(&d, &w, axis, GAMMA);
            let back = char_unproject(&a, &w, axis, GAMMA);
            for v in 0..5 {
                assert!((back[v] - d[v]).abs() < 1e-13);
            }
        }
    }

    #[test]
    fn linear_field_reconstructs_exactly() {
        let n = 6;
        let ghost = 2;
        let n_out = n - 2 * ghost;
        let pri = uniform_gradient_field(n);
        for (vars, scheme) in [
            (VarMode::Primitive, ReconScheme::Plm),
            (VarMode::Characteristic, ReconScheme::Plm),
        ] {
            let mut fc = vec![0.0; n_out * n_out * n_out * 6 * 5];
            let p = params(LrLimiter::GMinMod, vars, scheme);
            data_reconstruction(&pri, &mut fc, n, ghost, &p, None);

            // x faces of the first output cell: density varies linearly in i
            let id_in = ((ghost) * n + ghost) * n + ghost;
            let center = pri[id_in * 5];
            let minus = fc[0];
            let plus = fc[5];
            assert!((minus - (center - 0.05)).abs() < 1e-12);
            assert!((plus - (center + 0.05)).abs() < 1e-12);
        }
    }

    #[test]
    fn limiters_flatten_extrema() {
        for limiter in [
            LrLimiter::VanLeer,
            LrLimiter::GMinMod,
            LrLimiter::VanAlbada,
            LrLimiter::VanLeerGMinMod,
        ] {
            assert_eq!(limit_slope(limiter, 1.0, -1.0, 1.5, 0.5), 0.0);
        }
        // the extrema preserver keeps a bounded slope instead
        let s = limit_slope(LrLimiter::ExtremaPreserving, 1.0, -0.5, 1.5, 0.5);
        assert!(s.abs() <= 0.5 * 0.5 * 1.5);
    }

    #[test]
    fn half_step_tracing_advects_density() {
        // uniform rightward flow with a density ramp: tracing should lower
        // both x-face states by v * drho/dx * dt/2
        let n = 6;
        let ghost = 2;
        let n_out = n - 2 * ghost;
        let pri = uniform_gradient_field(n);
        let p = params(LrLimiter::GMinMod, VarMode::Primitive, ReconScheme::Plm);

        let mut fc0 = vec![0.0; n_out * n_out * n_out * 6 * 5];
        data_reconstruction(&pri, &mut fc0, n, ghost, &p, None);
        let mut fc1 = vec![0.0; n_out * n_out * n_out * 6 * 5];
        data_reconstruction(&pri, &mut fc1, n, ghost, &p, Some((0.1, 1.0)));

        let expected_shift = 0.5 * 0.1 * 0.2 * 0.1; // dt/2 * v * slope
        assert!((fc0[0] - fc1[0] - expected_shift).abs() < 1e-12);
    }

    #[test]
    fn ppm_is_monotone_on_step_profile() {
        let n = 8;
        let ghost = 2;
        let n_out = n - 2 * ghost;
        let mut pri = vec![0.0; n * n * n * 5];
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    let id = (k * n + j) * n + i;
                    pri[id * 5] = if i < n / 2 { 1.0 } else { 0.1 };
                    pri[id * 5 + 4] = 1.0;
                }
            }
        }
        let p = params(LrLimiter::VanLeer, VarMode::Primitive, ReconScheme::Ppm);
        let mut fc = vec![0.0; n_out * n_out * n_out * 6 * 5];
        data_reconstruction(&pri, &mut fc, n, ghost, &p, None);

        for id in 0..n_out * n_out * n_out {
            for f in 0..6 {
                let rho = fc[(id * 6 + f) * 5];
                assert!(rho >= 0.1 - 1e-12 && rho <= 1.0 + 1e-12);
            }
        }
    }
}
