//! Corner-transport-upwind patch-group kernel (Stone et al. 2008). The face
//! states are half-step predicted inside the data reconstruction and then
//! corrected by the transverse flux gradients before the full-step Riemann
//! solves.

use super::{
    compute_flux, fc_pri_to_con, fc_var_index, fc_flux_index, full_step_update, store_flux,
    tile_to_primitive, FluxPlanes, KernelParams,
};
use crate::hydro::reconstruct::data_reconstruction;
use crate::{Real, PS2};

pub fn advance_ctu(p: &KernelParams, input: &mut [Real], output: &mut [Real], planes: &mut FluxPlanes) {
    let nxt = p.nxt();
    let n_fc = p.n_fc_var();
    let nxt3 = nxt * nxt * nxt;
    let n_fc3 = n_fc * n_fc * n_fc;

    // 1. conserved -> primitive everywhere
    let mut pri = vec![0.0; 5 * nxt3];
    tile_to_primitive(input, &mut pri, nxt, p);

    // 2. face-centered values at the half time-step
    let mut fc_var = vec![0.0; n_fc3 * 6 * 5];
    data_reconstruction(
        &pri,
        &mut fc_var,
        nxt,
        p.ghost - 1,
        &p.recon,
        Some((p.dt, p.dh)),
    );

    // 3. primitive -> conserved face states
    fc_pri_to_con(&mut fc_var, n_fc, p.gamma());

    // 4. half-step fluxes at every interior face
    let mut fc_flux = vec![0.0; n_fc3 * 3 * 5];
    compute_flux(&fc_var, &mut fc_flux, n_fc, n_fc - 1, 0, p);

    // 5. transverse-gradient correction of the face states
    tgradient_correction(&mut fc_var, &fc_flux, n_fc, p);

    // 6. full-step fluxes from the corrected faces
    compute_flux(&fc_var, &mut fc_flux, n_fc, PS2 + 1, 1, p);

    // 7. conservative update
    full_step_update(input, output, &fc_flux, n_fc, p);

    // 8. inter-patch fluxes for the fix-up
    if p.store_flux {
        store_flux(planes, &fc_flux, n_fc);
    }
}

/// Subtract `dt/(2 dh)` of the two perpendicular half-step flux gradients
/// from both `d`-faces of every cell. This is the defining CTU step; it
/// assumes the variable and flux cubes share the grid `n_fc`.
fn tgradient_correction(fc_var: &mut [Real], fc_flux: &[Real], n_fc: usize, p: &KernelParams) {
    let did = [1, n_fc, n_fc * n_fc];
    let dt_dh2 = 0.5 * p.dt / p.dh;

    for d in 0..3 {
        let (fl, fr) = (2 * d, 2 * d + 1);
        let (t1, t2) = ((d + 1) % 3, (d + 2) % 3);

        let mut gap = [0usize; 3];
        gap[t1] = 1;
        gap[t2] = 1;

        for k in gap[2]..n_fc - gap[2] {
            for j in gap[1]..n_fc - gap[1] {
                for i in gap[0]..n_fc - gap[0] {
                    let id = (k * n_fc + j) * n_fc + i;

                    for v in 0..5 {
                        let tgrad1 = fc_flux[fc_flux_index(id, t1) + v]
                            - fc_flux[fc_flux_index(id - did[t1], t1) + v];
                        let tgrad2 = fc_flux[fc_flux_index(id, t2) + v]
                            - fc_flux[fc_flux_index(id - did[t2], t2) + v];
                        let correct = -dt_dh2 * (tgrad1 + tgrad2);

                        fc_var[fc_var_index(id, fl) + v] += correct;
                        fc_var[fc_var_index(id, fr) + v] += correct;
                    }
                }
            }
        }
    }
}
