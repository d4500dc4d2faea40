//! MUSCL-Hancock patch-group kernels. The three-dimensional evolution is
//! unsplit; two half-step predictors are supported. `advance_mhm` predicts
//! with interpolated face-centered values (no Riemann solve), `advance_mhm_rp`
//! with first-order Riemann fluxes.

use super::{
    compute_flux, fc_pri_to_con, fc_var_index, full_step_update, store_flux, tile_to_primitive,
    FluxPlanes, KernelParams,
};
use crate::hydro::reconstruct::data_reconstruction;
use crate::hydro::riemann;
use crate::hydro::{self, DENS};
use crate::{Real, PS2};

/// MUSCL-Hancock with the Hancock predictor.
pub fn advance_mhm(p: &KernelParams, input: &mut [Real], output: &mut [Real], planes: &mut FluxPlanes) {
    let nxt = p.nxt();
    let n_fc = p.n_fc_var();
    let nxt3 = nxt * nxt * nxt;
    let n_fc3 = n_fc * n_fc * n_fc;

    // 1. conserved -> primitive everywhere
    let mut pri = vec![0.0; 5 * nxt3];
    tile_to_primitive(input, &mut pri, nxt, p);

    // 2. face-centered values by data reconstruction
    let mut fc_var = vec![0.0; n_fc3 * 6 * 5];
    data_reconstruction(&pri, &mut fc_var, nxt, p.ghost - 1, &p.recon, None);

    // 3. primitive -> conserved face states
    fc_pri_to_con(&mut fc_var, n_fc, p.gamma());

    // 4. half-step Hancock prediction
    hancock_predict(&mut fc_var, input, n_fc, p);

    // 5. full-step interface fluxes
    let mut fc_flux = vec![0.0; n_fc3 * 3 * 5];
    compute_flux(&fc_var, &mut fc_flux, n_fc, PS2 + 1, 1, p);

    // 6. conservative update
    full_step_update(input, output, &fc_flux, n_fc, p);

    // 7. inter-patch fluxes for the fix-up
    if p.store_flux {
        store_flux(planes, &fc_flux, n_fc);
    }
}

/// MUSCL-Hancock with Riemann prediction (Stone & Gardiner 2009).
pub fn advance_mhm_rp(
    p: &KernelParams,
    input: &mut [Real],
    output: &mut [Real],
    planes: &mut FluxPlanes,
) {
    let nxt = p.nxt();
    let n_fc = p.n_fc_var();
    let n_fc3 = n_fc * n_fc * n_fc;
    let nh = nxt - 1;
    let nv = nxt - 2;

    // 1. half-step first-order fluxes from the Riemann solver
    let mut half_flux = vec![0.0; nh * nh * nh * 3 * 5];
    riemann_predict_flux(input, &mut half_flux, nxt, p);

    // 2. half-step cell-centered solution
    let mut half_var = vec![0.0; nv * nv * nv * 5];
    riemann_predict(input, &half_flux, &mut half_var, nxt, p);

    // 3. conserved -> primitive on the half-step states, in place
    for id in 0..nv * nv * nv {
        let mut u = [0.0; 5];
        u.copy_from_slice(&half_var[id * 5..id * 5 + 5]);
        let w = hydro::con_to_pri(&u, p.gamma(), p.min_pres);
        half_var[id * 5..id * 5 + 5].copy_from_slice(&w);
    }

    // 4. face-centered values by data reconstruction of the half-step field
    let mut fc_var = vec![0.0; n_fc3 * 6 * 5];
    data_reconstruction(&half_var, &mut fc_var, nv, p.ghost - 2, &p.recon, None);

    // 5. primitive -> conserved face states
    fc_pri_to_con(&mut fc_var, n_fc, p.gamma());

    // 6. full-step interface fluxes
    let mut fc_flux = vec![0.0; n_fc3 * 3 * 5];
    compute_flux(&fc_var, &mut fc_flux, n_fc, PS2 + 1, 1, p);

    // 7. conservative update
    full_step_update(input, output, &fc_flux, n_fc, p);

    // 8. inter-patch fluxes for the fix-up
    if p.store_flux {
        store_flux(planes, &fc_flux, n_fc);
    }
}

/// Advance the face-centered states by a half time-step from the per-face
/// flux differences. No Riemann solve and no neighbor data are required.
/// On a non-positive face density the whole cell reverts to its pre-update
/// state.
fn hancock_predict(fc_var: &mut [Real], input: &[Real], n_fc: usize, p: &KernelParams) {
    let nxt = p.nxt();
    let nxt3 = nxt * nxt * nxt;
    let g = p.ghost - 1;
    let dt_dh2 = 0.5 * p.dt / p.dh;

    for k in 0..n_fc {
        for j in 0..n_fc {
            for i in 0..n_fc {
                let id = (k * n_fc + j) * n_fc + i;
                let id_in = ((k + g) * nxt + (j + g)) * nxt + (i + g);

                let mut flux = [[0.0; 5]; 6];
                for f in 0..6 {
                    let b = fc_var_index(id, f);
                    let mut u = [0.0; 5];
                    u.copy_from_slice(&fc_var[b..b + 5]);
                    flux[f] = hydro::con_to_flux(f / 2, &u, p.gamma());
                }

                for v in 0..5 {
                    let dflux = dt_dh2
                        * (flux[1][v] - flux[0][v] + flux[3][v] - flux[2][v] + flux[5][v]
                            - flux[4][v]);
                    for f in 0..6 {
                        fc_var[fc_var_index(id, f) + v] -= dflux;
                    }
                }

                if let Some(floor) = p.min_pres {
                    for f in 0..6 {
                        let b = fc_var_index(id, f);
                        let mut u = [0.0; 5];
                        u.copy_from_slice(&fc_var[b..b + 5]);
                        hydro::enforce_positive_pressure(&mut u, p.gamma(), floor);
                        fc_var[b..b + 5].copy_from_slice(&u);
                    }

                    let negative = (0..6)
                        .any(|f| fc_var[fc_var_index(id, f) + DENS] <= 0.0);
                    if negative {
                        // revert all six faces to the cell-centered input
                        let mut u = [0.0; 5];
                        for v in 0..5 {
                            u[v] = input[v * nxt3 + id_in];
                        }
                        for f in 0..6 {
                            let b = fc_var_index(id, f);
                            fc_var[b..b + 5].copy_from_slice(&u);
                        }
                    }
                }
            }
        }
    }
}

/// First-order interface fluxes on the raw input tile. The flux cube has
/// side `nxt - 1`; entry `[c][d]` holds the flux between tile cells `c` and
/// `c + e_d`.
fn riemann_predict_flux(input: &[Real], half_flux: &mut [Real], nxt: usize, p: &KernelParams) {
    let nxt3 = nxt * nxt * nxt;
    let nh = nxt - 1;
    let stride = [1, nxt, nxt * nxt];

    for d in 0..3 {
        for k in 0..nh {
            for j in 0..nh {
                for i in 0..nh {
                    let id_h = ((k * nh + j) * nh + i) * 3 + d;
                    let id_l = (k * nxt + j) * nxt + i;
                    let id_r = id_l + stride[d];

                    let mut l = [0.0; 5];
                    let mut r = [0.0; 5];
                    for v in 0..5 {
                        l[v] = input[v * nxt3 + id_l];
                        r[v] = input[v * nxt3 + id_r];
                    }

                    let f = riemann::solve(p.riemann, d, &l, &r, p.gamma(), p.fallback, p.min_pres);
                    half_flux[id_h * 5..id_h * 5 + 5].copy_from_slice(&f);
                }
            }
        }
    }
}

/// Advance the cell-centered states by a half time-step using the
/// first-order fluxes. The output cube has side `nxt - 2`; cell `c` maps to
/// tile cell `c + 1`.
fn riemann_predict(
    input: &[Real],
    half_flux: &[Real],
    half_var: &mut [Real],
    nxt: usize,
    p: &KernelParams,
) {
    let nxt3 = nxt * nxt * nxt;
    let nh = nxt - 1;
    let nv = nxt - 2;
    let h_stride = [1, nh, nh * nh];
    let dt_dh2 = 0.5 * p.dt / p.dh;

    for k in 0..nv {
        for j in 0..nv {
            for i in 0..nv {
                let id_v = (k * nv + j) * nv + i;
                let id_in = ((k + 1) * nxt + (j + 1)) * nxt + (i + 1);
                let id_h = ((k + 1) * nh + (j + 1)) * nh + (i + 1);

                let mut u = [0.0; 5];
                for v in 0..5 {
                    u[v] = input[v * nxt3 + id_in];
                }
                for d in 0..3 {
                    let fp = (id_h * 3 + d) * 5;
                    let fm = ((id_h - h_stride[d]) * 3 + d) * 5;
                    for v in 0..5 {
                        u[v] -= dt_dh2 * (half_flux[fp + v] - half_flux[fm + v]);
                    }
                }

                if let Some(floor) = p.min_pres {
                    hydro::enforce_positive_pressure(&mut u, p.gamma(), floor);
                }
                half_var[id_v * 5..id_v * 5 + 5].copy_from_slice(&u);
            }
        }
    }
}
