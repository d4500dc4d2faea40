//! Weighted-average-flux patch-group kernel. The three-dimensional
//! evolution is dimensionally split; the sweep order is x,y,z (forward) or
//! z,y,x (backward) per the `xyz_forward` flag. Each sweep transposes the
//! tile so the 1D kernel always runs along x.

use super::{FluxPlanes, KernelParams, PlaneSide, WafLimiter};
use crate::hydro::riemann::{self, RiemannSolver};
use crate::hydro::{self, pri_to_flux_x, Prim};
use crate::{Real, MAX_ERROR, PS2};

const WAF_GHOST: usize = 2;

pub fn advance_waf(p: &KernelParams, input: &mut [Real], output: &mut [Real], planes: &mut FluxPlanes) {
    let nxt = p.nxt();
    debug_assert_eq!(p.ghost, WAF_GHOST);

    // per-column intercell fluxes: [PS2*PS2][left, center, right][5]
    let mut fc = vec![0.0; PS2 * PS2 * 3 * 5];

    if p.xyz_forward {
        // x sweep
        advance_x(input, &mut fc, nxt, 0, 0, p);
        if p.store_flux {
            store_axis(planes, &fc, 0);
        }

        // x-y-z -> y-x-z, y sweep
        transpose_xy(input, nxt);
        advance_x(input, &mut fc, nxt, WAF_GHOST, 0, p);
        transpose_flux_components(&mut fc, 1, 2);
        if p.store_flux {
            store_axis(planes, &fc, 1);
        }

        // y-x-z -> z-x-y, z sweep
        transpose_xz(input, nxt);
        advance_x(input, &mut fc, nxt, WAF_GHOST, WAF_GHOST, p);
        transpose_flux_components(&mut fc, 1, 3);
        transpose_flux_components(&mut fc, 1, 2);
        if p.store_flux {
            store_axis(planes, &fc, 2);
        }

        // restore x-y-z
        transpose_xz(input, nxt);
        transpose_xy(input, nxt);
    } else {
        // x-y-z -> z-x-y, z sweep
        transpose_xy(input, nxt);
        transpose_xz(input, nxt);
        advance_x(input, &mut fc, nxt, 0, 0, p);
        transpose_flux_components(&mut fc, 1, 3);
        transpose_flux_components(&mut fc, 1, 2);
        if p.store_flux {
            store_axis(planes, &fc, 2);
        }

        // z-x-y -> y-x-z, y sweep
        transpose_xz(input, nxt);
        advance_x(input, &mut fc, nxt, 0, WAF_GHOST, p);
        transpose_flux_components(&mut fc, 1, 2);
        if p.store_flux {
            store_axis(planes, &fc, 1);
        }

        // y-x-z -> x-y-z, x sweep
        transpose_xy(input, nxt);
        advance_x(input, &mut fc, nxt, WAF_GHOST, WAF_GHOST, p);
        if p.store_flux {
            store_axis(planes, &fc, 0);
        }
    }

    // copy the updated interior into the output block
    let nxt3 = nxt * nxt * nxt;
    let n3 = PS2 * PS2 * PS2;
    for v in 0..5 {
        for k in 0..PS2 {
            for j in 0..PS2 {
                for i in 0..PS2 {
                    let id_out = (k * PS2 + j) * PS2 + i;
                    let id_in =
                        ((k + WAF_GHOST) * nxt + (j + WAF_GHOST)) * nxt + (i + WAF_GHOST);
                    output[v * n3 + id_out] = input[v * nxt3 + id_in];
                }
            }
        }
    }
}

#[inline]
fn fc_index(id: usize, slot: usize) -> usize {
    (id * 3 + slot) * 5
}

/// Advance every x column of the tile by one time step. `j_gap`/`k_gap`
/// cells are skipped on each side in the transverse directions once those
/// directions have already been swept.
fn advance_x(u: &mut [Real], fc: &mut [Real], nxt: usize, j_gap: usize, k_gap: usize, p: &KernelParams) {
    let nxt3 = nxt * nxt * nxt;
    let ratio = p.dt / p.dh;
    let gamma = p.gamma();

    let mut ux = vec![[0.0; 5]; nxt];
    let mut flux = vec![[0.0; 5]; PS2 + 1];
    let mut l_st = vec![[0.0; 5]; PS2 + 3];
    let mut r_st = vec![[0.0; 5]; PS2 + 3];
    let mut eval = vec![[0.0; 5]; PS2 + 3];

    for k in k_gap..nxt - k_gap {
        for j in j_gap..nxt - j_gap {
            // copy one column of data
            for i in 0..nxt {
                let id = (k * nxt + j) * nxt + i;
                for v in 0..5 {
                    ux[i][v] = u[v * nxt3 + id];
                }
            }

            // star states and wave speeds at every interface in the stencil
            for m in 0..PS2 + 3 {
                let c_l = hydro::con_to_pri(&ux[m], gamma, p.min_pres);
                let c_r = hydro::con_to_pri(&ux[m + 1], gamma, p.min_pres);

                if p.riemann == RiemannSolver::Exact {
                    let sol = riemann::exact(0, &c_l, &c_r, gamma);
                    eval[m] = sol.eival;
                    l_st[m] = sol.l_star;
                    r_st[m] = sol.r_star;
                } else {
                    let (e, l, r) = riemann::star_roe(&c_l, &c_r, gamma, p.min_pres);
                    eval[m] = e;
                    l_st[m] = l;
                    r_st[m] = r;
                }
            }

            // intercell fluxes
            for i in WAF_GHOST..WAF_GHOST + PS2 + 1 {
                let c_l2 = hydro::con_to_pri(&ux[i - 2], gamma, p.min_pres);
                let c_l1 = hydro::con_to_pri(&ux[i - 1], gamma, p.min_pres);
                let c_r1 = hydro::con_to_pri(&ux[i], gamma, p.min_pres);
                let c_r2 = hydro::con_to_pri(&ux[i + 1], gamma, p.min_pres);

                let ii = i - WAF_GHOST;
                let f = solve_flux(
                    &l_st[ii],
                    &r_st[ii],
                    &l_st[ii + 1],
                    &r_st[ii + 1],
                    &l_st[i],
                    &r_st[i],
                    &eval[ii + 1],
                    &c_l2,
                    &c_l1,
                    &c_r1,
                    &c_r2,
                    gamma,
                    ratio,
                    p.waf_limiter,
                );
                flux[ii] = f;

                // paste the boundary and central intercell fluxes
                let interior = j >= WAF_GHOST
                    && j < WAF_GHOST + PS2
                    && k >= WAF_GHOST
                    && k < WAF_GHOST + PS2;
                if interior {
                    let id = (k - WAF_GHOST) * PS2 + (j - WAF_GHOST);
                    let slot = if i == WAF_GHOST {
                        Some(0)
                    } else if i == WAF_GHOST + PS2 / 2 {
                        Some(1)
                    } else if i == WAF_GHOST + PS2 {
                        Some(2)
                    } else {
                        None
                    };
                    if let Some(slot) = slot {
                        fc[fc_index(id, slot)..fc_index(id, slot) + 5].copy_from_slice(&f);
                    }
                }
            }

            // update the conserved variables
            for i in WAF_GHOST..WAF_GHOST + PS2 {
                let ii = i - WAF_GHOST;
                for v in 0..5 {
                    ux[i][v] += ratio * (flux[ii][v] - flux[ii + 1][v]);
                }
                if let Some(floor) = p.min_pres {
                    hydro::enforce_positive_pressure(&mut ux[i], gamma, floor);
                }
            }

            // paste the column back
            for i in WAF_GHOST..WAF_GHOST + PS2 {
                let id = (k * nxt + j) * nxt + i;
                for v in 0..5 {
                    u[v * nxt3 + id] = ux[i][v];
                }
            }
        }
    }
}

/// Compose the WAF intercell flux at one interface from the star fan of the
/// central Riemann problem and the upwind jump ratios of the neighboring
/// fans.
#[allow(clippy::too_many_arguments)]
fn solve_flux(
    ll_star: &Prim,
    lr_star: &Prim,
    cl_star: &Prim,
    cr_star: &Prim,
    rl_star: &Prim,
    rr_star: &Prim,
    eival: &[Real; 5],
    l_2: &Prim,
    l_1: &Prim,
    r_1: &Prim,
    r_2: &Prim,
    gamma: Real,
    ratio: Real,
    limiter: WafLimiter,
) -> [Real; 5] {
    // jump magnitudes across each wave of the left, central, and right fans;
    // waves 2 and 3 carry the transverse velocities, the others the density
    let fans = [
        (ll_star, lr_star, l_2, l_1),
        (cl_star, cr_star, l_1, r_1),
        (rl_star, rr_star, r_1, r_2),
    ];
    let mut delta = [[0.0; 5]; 3];
    let mut mean = [[0.0; 5]; 3];
    for (n, (ls, rs, outer_l, outer_r)) in fans.iter().enumerate() {
        delta[n][0] = ls[0] - outer_l[0];
        delta[n][1] = rs[0] - ls[0];
        delta[n][2] = rs[2] - ls[2];
        delta[n][3] = rs[3] - ls[3];
        delta[n][4] = outer_r[0] - rs[0];
        mean[n][0] = 0.5 * (ls[0].abs() + outer_l[0].abs());
        mean[n][1] = 0.5 * (rs[0].abs() + ls[0].abs());
        mean[n][2] = 0.5 * (rs[2].abs() + ls[2].abs());
        mean[n][3] = 0.5 * (rs[3].abs() + ls[3].abs());
        mean[n][4] = 0.5 * (outer_r[0].abs() + rs[0].abs());
    }

    // limiter value per wave, from the jump ratio on the upwind side
    let mut limit = [0.0; 5];
    for w in 0..5 {
        limit[w] = if eival[w].abs() < MAX_ERROR {
            1.0
        } else {
            let up = if eival[w] > 0.0 { 0 } else { 2 };
            if mean[up][w] == 0.0 || mean[1][w] == 0.0 {
                1.0
            } else if (delta[up][w] * delta[1][w]) / (mean[up][w] * mean[1][w])
                < MAX_ERROR * MAX_ERROR
            {
                1.0
            } else {
                let r = delta[up][w] / delta[1][w];
                set_limit(r, eival[w] * ratio, limiter)
            }
        };
    }

    // sign of each wave speed
    let mut theta = [0.0; 5];
    for w in 0..5 {
        theta[w] = if eival[w].abs() < MAX_ERROR {
            0.0
        } else if eival[w] > 0.0 {
            1.0
        } else {
            -1.0
        };
    }

    #[cfg(feature = "waf-dissipate")]
    {
        dissipated_structure(l_1, r_1, cl_star, cr_star, &limit, &theta, gamma)
    }
    #[cfg(not(feature = "waf-dissipate"))]
    {
        undissipated_structure(l_1, r_1, cl_star, cr_star, &limit, &theta, gamma)
    }
}

/// WAF limiter kernels; `c` is the per-wave Courant number.
fn set_limit(r: Real, c: Real, limiter: WafLimiter) -> Real {
    match limiter {
        WafLimiter::Superbee => {
            if r > 0.0 && r <= 0.5 {
                1.0 - 2.0 * r * (1.0 - c.abs())
            } else if r <= 1.0 {
                c.abs()
            } else if r <= 2.0 {
                1.0 - r * (1.0 - c.abs())
            } else {
                2.0 * c.abs() - 1.0
            }
        }
        WafLimiter::VanLeer => 1.0 - 2.0 * r * (1.0 - c.abs()) / (1.0 + r),
        WafLimiter::VanAlbada => 1.0 - r * (1.0 + r) * (1.0 - c.abs()) / (1.0 + r * r),
        WafLimiter::MinBee => {
            if r > 0.0 && r <= 1.0 {
                1.0 - r * (1.0 - c.abs())
            } else {
                c.abs()
            }
        }
    }
}

/// Intercell flux from the non-dissipative wave structure: a convex
/// combination of the four physical fluxes of the fan, with waves 2 and 3
/// only acting on their transverse momentum component.
#[cfg(not(feature = "waf-dissipate"))]
fn undissipated_structure(
    l: &Prim,
    r: &Prim,
    l_star: &Prim,
    r_star: &Prim,
    limit: &[Real; 5],
    theta: &[Real; 5],
    gamma: Real,
) -> [Real; 5] {
    let f = [
        pri_to_flux_x(l, gamma),
        pri_to_flux_x(l_star, gamma),
        pri_to_flux_x(r_star, gamma),
        pri_to_flux_x(r, gamma),
    ];

    let mut flux = [0.0; 5];
    for (v, mid_wave) in [(0, 1), (1, 1), (4, 1), (2, 2), (3, 3)] {
        flux[v] = 0.5 * (f[0][v] + f[3][v])
            - 0.5
                * (theta[0] * limit[0] * (f[1][v] - f[0][v])
                    + theta[mid_wave] * limit[mid_wave] * (f[2][v] - f[1][v])
                    + theta[4] * limit[4] * (f[3][v] - f[2][v]));
    }
    flux
}

/// Intercell flux from the dissipative wave structure: six fluxes per wave
/// with ghost intermediate states, ordered by a partial sort of the limiter
/// magnitudes of the interior waves.
#[cfg(feature = "waf-dissipate")]
fn dissipated_structure(
    l: &Prim,
    r: &Prim,
    l_star: &Prim,
    r_star: &Prim,
    limit: &[Real; 5],
    theta: &[Real; 5],
    gamma: Real,
) -> [Real; 5] {
    let mut iflux = [[0.0; 5]; 6];
    iflux[0] = pri_to_flux_x(l, gamma);
    iflux[1] = pri_to_flux_x(l_star, gamma);
    iflux[4] = pri_to_flux_x(r_star, gamma);
    iflux[5] = pri_to_flux_x(r, gamma);

    // ghost states between the contact and the transverse waves, chosen by
    // the relative limiter magnitudes of waves 1..3
    let mut stat = [[0.0; 5]; 2];
    if limit[1] <= limit[2] {
        if limit[3] <= limit[1] {
            stat[0] = [l_star[0], l_star[1], l_star[2], r_star[3], l_star[4]];
            stat[1] = [r_star[0], l_star[1], l_star[2], r_star[3], l_star[4]];
        } else if limit[3] <= limit[2] {
            stat[0] = [r_star[0], l_star[1], l_star[2], l_star[3], l_star[4]];
            stat[1] = [r_star[0], l_star[1], l_star[2], r_star[3], l_star[4]];
        } else {
            stat[0] = [r_star[0], l_star[1], l_star[2], l_star[3], l_star[4]];
            stat[1] = [r_star[0], l_star[1], r_star[2], l_star[3], l_star[4]];
        }
    } else {
        if limit[3] <= limit[2] {
            stat[0] = [l_star[0], l_star[1], l_star[2], r_star[3], l_star[4]];
            stat[1] = [l_star[0], l_star[1], r_star[2], r_star[3], l_star[4]];
        } else if limit[3] <= limit[1] {
            stat[0] = [l_star[0], l_star[1], r_star[2], l_star[3], l_star[4]];
            stat[1] = [l_star[0], l_star[1], r_star[2], r_star[3], l_star[4]];
        } else {
            stat[0] = [l_star[0], l_star[1], r_star[2], l_star[3], l_star[4]];
            stat[1] = [r_star[0], l_star[1], r_star[2], l_star[3], l_star[4]];
        }
    }

    iflux[2] = pri_to_flux_x(&stat[0], gamma);
    iflux[3] = pri_to_flux_x(&stat[1], gamma);

    // partial three-element sort of the interior limiter values
    let mut lim = *limit;
    for i in 1..3 {
        if lim[i] > lim[i + 1] {
            lim.swap(i, i + 1);
        }
    }
    if lim[1] > lim[2] {
        lim.swap(1, 2);
    }

    let mut flux = [0.0; 5];
    for v in 0..5 {
        flux[v] = 0.5 * (iflux[0][v] + iflux[5][v])
            - 0.5
                * (theta[0] * lim[0] * (iflux[1][v] - iflux[0][v])
                    + theta[1] * lim[1] * (iflux[2][v] - iflux[1][v])
                    + theta[2] * lim[2] * (iflux[3][v] - iflux[2][v])
                    + theta[3] * lim[3] * (iflux[4][v] - iflux[3][v])
                    + theta[4] * lim[4] * (iflux[5][v] - iflux[4][v]));
    }
    flux
}

/// Copy the per-column intercell fluxes into the patch-group flux planes.
/// The column index was built as `(k - G) * PS2 + (j - G)` in sweep
/// orientation; the mapping of `(j, k)` back to lab axes depends on which
/// sweep produced them.
fn store_axis(planes: &mut FluxPlanes, fc: &[Real], axis: usize) {
    let sides = [PlaneSide::Minus, PlaneSide::Center, PlaneSide::Plus];

    for m in 0..PS2 {
        for n in 0..PS2 {
            let id = m * PS2 + n;
            for (slot, &side) in sides.iter().enumerate() {
                let b = fc_index(id, slot);
                for v in 0..5 {
                    // axis 0: j = y (t1), k = z (t2)
                    // axis 1: j = x (t2), k = z (t1)
                    // axis 2: j = x (t1), k = y (t2)
                    let (t1, t2) = match axis {
                        0 => (n, m),
                        1 => (m, n),
                        _ => (n, m),
                    };
                    planes.set(axis, side, v, t1, t2, fc[b + v]);
                }
            }
        }
    }
}

/// Swap two momentum components of every stored flux entry, restoring lab
/// ordering after a transposed sweep.
fn transpose_flux_components(fc: &mut [Real], a: usize, b: usize) {
    for id in 0..PS2 * PS2 {
        for slot in 0..3 {
            let base = fc_index(id, slot);
            fc.swap(base + a, base + b);
        }
    }
}

/// Transpose the x and y axes of the tile and swap the corresponding
/// momentum components.
fn transpose_xy(u: &mut [Real], nxt: usize) {
    let nxt3 = nxt * nxt * nxt;
    let plane = nxt * nxt;
    let perm = [0, 2, 1, 3, 4];
    let mut scratch = vec![0.0; 5 * plane];

    for k in 0..nxt {
        for j in 0..nxt {
            for i in 0..nxt {
                let src = (k * nxt + j) * nxt + i;
                let dst = i * nxt + j;
                for v in 0..5 {
                    scratch[v * plane + dst] = u[perm[v] * nxt3 + src];
                }
            }
        }
        for v in 0..5 {
            let base = v * nxt3 + k * plane;
            u[base..base + plane].copy_from_slice(&scratch[v * plane..(v + 1) * plane]);
        }
    }
}

/// Transpose the x and z axes of the tile and swap the corresponding
/// momentum components. In-place pairwise swap.
fn transpose_xz(u: &mut [Real], nxt: usize) {
    let nxt3 = nxt * nxt * nxt;
    let perm = [0, 3, 2, 1, 4];

    for j in 0..nxt {
        for k in 0..nxt {
            for i in 0..k {
                let id1 = (k * nxt + j) * nxt + i;
                let id2 = (i * nxt + j) * nxt + k;

                let mut tmp = [0.0; 5];
                for v in 0..5 {
                    tmp[v] = u[perm[v] * nxt3 + id1];
                }
                for v in 0..5 {
                    u[v * nxt3 + id1] = u[perm[v] * nxt3 + id2];
                }
                for v in 0..5 {
                    u[v * nxt3 + id2] = tmp[v];
                }
            }

            // diagonal cells only swap their momentum components
            let id = (k * nxt + j) * nxt + k;
            let tmp = u[nxt3 + id];
            u[nxt3 + id] = u[3 * nxt3 + id];
            u[3 * nxt3 + id] = tmp;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tile_transposes_are_involutions() {
        let nxt = 6;
        let nxt3 = nxt * nxt * nxt;
        let mut u = vec![0.0; 5 * nxt3];
        for v in 0..5 {
            for id in 0..nxt3 {
                u[v * nxt3 + id] = (v * nxt3 + id) as Real;
            }
        }
        let original = u.clone();

        transpose_xy(&mut u, nxt);
        transpose_xy(&mut u, nxt);
        assert_eq!(u, original);

        transpose_xz(&mut u, nxt);
        transpose_xz(&mut u, nxt);
        assert_eq!(u, original);
    }

    #[test]
    fn transpose_xy_moves_cells_and_momenta() {
        let nxt = 4;
        let nxt3 = nxt * nxt * nxt;
        let mut u = vec![0.0; 5 * nxt3];
        let id = |k: usize, j: usize, i: usize| (k * nxt + j) * nxt + i;
        u[id(1, 2, 3)] = 7.0; // density
        u[nxt3 + id(1, 2, 3)] = 1.0; // x momentum
        u[2 * nxt3 + id(1, 2, 3)] = 2.0; // y momentum

        transpose_xy(&mut u, nxt);
        assert_eq!(u[id(1, 3, 2)], 7.0);
        assert_eq!(u[nxt3 + id(1, 3, 2)], 2.0);
        assert_eq!(u[2 * nxt3 + id(1, 3, 2)], 1.0);
    }

    #[test]
    fn waf_limiters_reduce_to_courant_at_unit_ratio() {
        for limiter in [
            WafLimiter::Superbee,
            WafLimiter::VanLeer,
            WafLimiter::VanAlbada,
            WafLimiter::MinBee,
        ] {
            let c = 0.4;
            let l = set_limit(1.0, c, limiter);
            assert!((l - c.abs()).abs() < 1e-12, "{:?}", limiter);
        }
    }
}
