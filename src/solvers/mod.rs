pub mod ctu;
pub mod mhm;
pub mod waf;

use crate::hydro::reconstruct::{ReconParams, ReconScheme};
use crate::hydro::riemann::{self, RiemannSolver, RoeFallback};
use crate::hydro::{self, DENS};
use crate::{Real, PS1, PS2};

/// Fluid integration scheme, selected once at driver launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FluScheme {
    /// MUSCL-Hancock
    Mhm,
    /// MUSCL-Hancock with Riemann prediction
    MhmRp,
    /// Corner transport upwind
    Ctu,
    /// Weighted average flux (dimensionally split)
    Waf,
}

/// Flux limiter used by the WAF scheme; all kernels take the per-wave
/// Courant number as input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WafLimiter {
    Superbee,
    VanLeer,
    VanAlbada,
    MinBee,
}

/// Everything a patch-group kernel needs besides its data tiles. The kernel
/// contract (input tile, gamma, dt, dh, limiter parameters, output tile,
/// boundary-flux planes) is shared by all four schemes, so the scheme is a
/// plain function pointer chosen once at launch.
#[derive(Clone, Copy)]
pub struct KernelParams {
    pub dt: Real,
    pub dh: Real,
    pub min_pres: Option<Real>,
    pub recon: ReconParams,
    pub riemann: RiemannSolver,
    pub fallback: RoeFallback,
    pub waf_limiter: WafLimiter,
    pub xyz_forward: bool,
    pub ghost: usize,
    pub store_flux: bool,
}

impl KernelParams {
    pub fn gamma(&self) -> Real {
        self.recon.gamma
    }

    /// Side length of the padded input tile.
    pub fn nxt(&self) -> usize {
        PS2 + 2 * self.ghost
    }

    /// Side length of the face-centered variable cube produced by the data
    /// reconstruction.
    pub fn n_fc_var(&self) -> usize {
        PS2 + 2
    }
}

/// Ghost width consumed by each scheme. PPM reconstruction widens the
/// stencil of the unsplit schemes by one cell.
pub fn ghost_width(scheme: FluScheme, recon: ReconScheme) -> usize {
    match (scheme, recon) {
        (FluScheme::Waf, _) => 2,
        (_, ReconScheme::Plm) => 3,
        (_, ReconScheme::Ppm) => 4,
    }
}

/// A patch-group kernel: consumes the padded conserved input tile
/// (variable-major, `5 * nxt^3`), writes the updated interior block
/// (variable-major, `5 * PS2^3`) and, when requested, the nine boundary flux
/// planes. The input tile is mutable because the dimensionally-split WAF
/// scheme transposes it in place; the unsplit schemes leave it untouched.
pub type FluidKernel = fn(&KernelParams, &mut [Real], &mut [Real], &mut FluxPlanes);

/// Resolve the launch-time scheme selection into a kernel function pointer.
pub fn fluid_kernel(scheme: FluScheme) -> FluidKernel {
    match scheme {
        FluScheme::Mhm => mhm::advance_mhm,
        FluScheme::MhmRp => mhm::advance_mhm_rp,
        FluScheme::Ctu => ctu::advance_ctu,
        FluScheme::Waf => waf::advance_waf,
    }
}

/// The interface fluxes a patch group hands to the flux fix-up: for each
/// axis, the minus boundary plane, the central plane, and the plus boundary
/// plane of the group, `5 * PS2^2` reals each. The central planes matter
/// because a patch face interior to one group can still be a coarse/fine
/// boundary of the neighboring octant.
pub struct FluxPlanes {
    data: Vec<Real>,
}

/// Plane slot within an axis: the group's minus face, the central plane, or
/// the plus face.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PlaneSide {
    Minus = 0,
    Center = 1,
    Plus = 2,
}

impl FluxPlanes {
    pub fn new() -> Self {
        Self {
            data: vec![0.0; 9 * 5 * PS2 * PS2],
        }
    }

    #[inline]
    fn offset(axis: usize, side: PlaneSide, v: usize) -> usize {
        ((axis * 3 + side as usize) * 5 + v) * PS2 * PS2
    }

    /// Transverse indexing: `t1` runs along axis `(axis+1)%3`, `t2` along
    /// `(axis+2)%3`, both in group-interior coordinates `0..PS2`.
    #[inline]
    pub fn get(&self, axis: usize, side: PlaneSide, v: usize, t1: usize, t2: usize) -> Real {
        self.data[Self::offset(axis, side, v) + t2 * PS2 + t1]
    }

    #[inline]
    pub fn set(&mut self, axis: usize, side: PlaneSide, v: usize, t1: usize, t2: usize, f: Real) {
        self.data[Self::offset(axis, side, v) + t2 * PS2 + t1] = f;
    }
}

impl Default for FluxPlanes {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
pub(crate) fn fc_var_index(id: usize, face: usize) -> usize {
    (id * 6 + face) * 5
}

#[inline]
pub(crate) fn fc_flux_index(id: usize, axis: usize) -> usize {
    (id * 3 + axis) * 5
}

/// Solve the Riemann problem at every face of the face-centered variable
/// cube. `fc_var` holds `[cell][face][var]` conserved states on a cube of
/// side `n_fc`; the flux at the plus-`d` face of cell `c` (equally the
/// minus-`d` face of `c + 1`) lands in `fc_flux[c][d]`. The normal face
/// index runs over `0..n_flux` and the transverse indices over
/// `gap..n_fc-gap`.
pub fn compute_flux(
    fc_var: &[Real],
    fc_flux: &mut [Real],
    n_fc: usize,
    n_flux: usize,
    gap: usize,
    p: &KernelParams,
) {
    let did = [1, n_fc, n_fc * n_fc];

    for d in 0..3 {
        let (t1, t2) = ((d + 1) % 3, (d + 2) % 3);
        let mut coord = [0usize; 3];

        for c2 in gap..n_fc - gap {
            for c1 in gap..n_fc - gap {
                for n in 0..n_flux {
                    coord[d] = n;
                    coord[t1] = c1;
                    coord[t2] = c2;
                    let id = (coord[2] * n_fc + coord[1]) * n_fc + coord[0];

                    let mut l = [0.0; 5];
                    let mut r = [0.0; 5];
                    let lb = fc_var_index(id, 2 * d + 1);
                    let rb = fc_var_index(id + did[d], 2 * d);
                    l.copy_from_slice(&fc_var[lb..lb + 5]);
                    r.copy_from_slice(&fc_var[rb..rb + 5]);

                    let f = riemann::solve(
                        p.riemann,
                        d,
                        &l,
                        &r,
                        p.gamma(),
                        p.fallback,
                        p.min_pres,
                    );
                    let fb = fc_flux_index(id, d);
                    fc_flux[fb..fb + 5].copy_from_slice(&f);
                }
            }
        }
    }
}

/// Conservative update of the interior `PS2^3` block:
/// `U_new = U_old - dt/dh * sum_d (F_plus - F_minus)`, with the positivity
/// policy applied afterwards (pressure floor; whole-cell reversion to the
/// pre-update state if the density went non-positive).
pub fn full_step_update(
    input: &[Real],
    output: &mut [Real],
    fc_flux: &[Real],
    n_fc: usize,
    p: &KernelParams,
) {
    let nxt = p.nxt();
    let g = p.ghost;
    let dt_dh = p.dt / p.dh;
    let did = [1, n_fc, n_fc * n_fc];
    let n3 = PS2 * PS2 * PS2;
    let nxt3 = nxt * nxt * nxt;

    for k in 0..PS2 {
        for j in 0..PS2 {
            for i in 0..PS2 {
                let id_out = (k * PS2 + j) * PS2 + i;
                let id_in = ((k + g) * nxt + (j + g)) * nxt + (i + g);
                // cell position on the face-centered grid
                let id_fc = ((k + 1) * n_fc + (j + 1)) * n_fc + (i + 1);

                let mut u_old = [0.0; 5];
                for v in 0..5 {
                    u_old[v] = input[v * nxt3 + id_in];
                }

                let mut u = u_old;
                for d in 0..3 {
                    let fp = fc_flux_index(id_fc, d);
                    let fm = fc_flux_index(id_fc - did[d], d);
                    for v in 0..5 {
                        u[v] -= dt_dh * (fc_flux[fp + v] - fc_flux[fm + v]);
                    }
                }

                if let Some(floor) = p.min_pres {
                    if u[DENS] <= 0.0 {
                        log::warn!(
                            "non-positive density after full-step update, reverting cell ({},{},{})",
                            i, j, k
                        );
                        u = u_old;
                    } else {
                        hydro::enforce_positive_pressure(&mut u, p.gamma(), floor);
                    }
                }

                for v in 0..5 {
                    output[v * n3 + id_out] = u[v];
                }
            }
        }
    }
}

/// Copy the interface fluxes on the nine bounding/central planes of the
/// patch group out of the face-centered flux cube.
pub fn store_flux(planes: &mut FluxPlanes, fc_flux: &[Real], n_fc: usize) {
    let did = [1, n_fc, n_fc * n_fc];
    let sides = [
        (PlaneSide::Minus, 0),
        (PlaneSide::Center, PS1),
        (PlaneSide::Plus, PS2),
    ];

    for d in 0..3 {
        let (t1, t2) = ((d + 1) % 3, (d + 2) % 3);
        for &(side, n) in &sides {
            for c2 in 0..PS2 {
                for c1 in 0..PS2 {
                    let mut coord = [0usize; 3];
                    coord[d] = n;
                    coord[t1] = c1 + 1;
                    coord[t2] = c2 + 1;
                    let id = (coord[2] * n_fc + coord[1]) * n_fc + coord[0];
                    debug_assert!(id < n_fc * n_fc * n_fc && did[d] > 0);

                    let fb = fc_flux_index(id, d);
                    for v in 0..5 {
                        planes.set(d, side, v, c1, c2, fc_flux[fb + v]);
                    }
                }
            }
        }
    }
}

/// Convert the conserved input tile to cell-major primitive variables.
pub(crate) fn tile_to_primitive(input: &[Real], pri: &mut [Real], nxt: usize, p: &KernelParams) {
    let nxt3 = nxt * nxt * nxt;
    for id in 0..nxt3 {
        let u = [
            input[id],
            input[nxt3 + id],
            input[2 * nxt3 + id],
            input[3 * nxt3 + id],
            input[4 * nxt3 + id],
        ];
        let w = hydro::con_to_pri(&u, p.gamma(), p.min_pres);
        pri[id * 5..id * 5 + 5].copy_from_slice(&w);
    }
}

/// Convert the face-centered variable cube from primitive to conserved, in
/// place.
pub(crate) fn fc_pri_to_con(fc_var: &mut [Real], n_fc: usize, gamma: Real) {
    for id in 0..n_fc * n_fc * n_fc {
        for f in 0..6 {
            let b = fc_var_index(id, f);
            let mut w = [0.0; 5];
            w.copy_from_slice(&fc_var[b..b + 5]);
            let u = hydro::pri_to_con(&w, gamma);
            fc_var[b..b + 5].copy_from_slice(&u);
        }
    }
}

/// Shared helpers for kernel tests across the crate.
#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::hydro::pri_to_con;
    use crate::hydro::reconstruct::{LrLimiter, VarMode};

    pub fn params(scheme: FluScheme, dt: Real, dh: Real) -> KernelParams {
        let recon = ReconParams {
            limiter: LrLimiter::VanLeer,
            minmod_coeff: 1.5,
            ep_coeff: 0.5,
            scheme: ReconScheme::Plm,
            vars: VarMode::Characteristic,
            gamma: 1.4,
        };
        KernelParams {
            dt,
            dh,
            min_pres: Some(1e-12),
            recon,
            riemann: RiemannSolver::Hllc,
            fallback: RoeFallback::Hlle,
            waf_limiter: WafLimiter::VanLeer,
            xyz_forward: true,
            ghost: ghost_width(scheme, ReconScheme::Plm),
            store_flux: true,
        }
    }

    pub fn uniform_tile(p: &KernelParams, w: &[Real; 5]) -> Vec<Real> {
        let nxt3 = p.nxt().pow(3);
        let u = pri_to_con(w, p.gamma());
        let mut tile = vec![0.0; 5 * nxt3];
        for v in 0..5 {
            for id in 0..nxt3 {
                tile[v * nxt3 + id] = u[v];
            }
        }
        tile
    }
}

#[cfg(test)]
mod test {
    use super::test_support::{params as test_params, uniform_tile};
    use super::*;
    use crate::hydro::pri_to_con;

    #[test]
    fn uniform_state_is_a_fixed_point_of_every_scheme() {
        let w = [1.0, 0.3, -0.1, 0.2, 0.8];
        for scheme in [FluScheme::Mhm, FluScheme::MhmRp, FluScheme::Ctu, FluScheme::Waf] {
            let p = test_params(scheme, 0.01, 0.1);
            let mut tile = uniform_tile(&p, &w);
            let mut out = vec![0.0; 5 * PS2 * PS2 * PS2];
            let mut planes = FluxPlanes::new();
            fluid_kernel(scheme)(&p, &mut tile, &mut out, &mut planes);

            let u = pri_to_con(&w, p.gamma());
            let n3 = PS2 * PS2 * PS2;
            for v in 0..5 {
                for id in 0..n3 {
                    assert!(
                        (out[v * n3 + id] - u[v]).abs() < 1e-11,
                        "scheme {:?} component {} drifted: {} vs {}",
                        scheme,
                        v,
                        out[v * n3 + id],
                        u[v]
                    );
                }
            }
        }
    }

    #[test]
    fn zero_dt_changes_nothing() {
        let w = [1.0, 0.5, 0.0, 0.0, 1.0];
        for scheme in [FluScheme::Mhm, FluScheme::MhmRp, FluScheme::Ctu, FluScheme::Waf] {
            let p = test_params(scheme, 0.0, 0.1);
            let mut tile = uniform_tile(&p, &w);
            // break uniformity so fluxes are non-trivial
            let nxt3 = p.nxt().pow(3);
            for id in 0..nxt3 / 2 {
                tile[id] *= 1.5;
                tile[4 * nxt3 + id] *= 1.5;
            }
            let before = tile.clone();

            let mut out = vec![0.0; 5 * PS2 * PS2 * PS2];
            let mut planes = FluxPlanes::new();
            fluid_kernel(scheme)(&p, &mut tile, &mut out, &mut planes);

            let g = p.ghost;
            let nxt = p.nxt();
            let n3 = PS2 * PS2 * PS2;
            for v in 0..5 {
                for k in 0..PS2 {
                    for j in 0..PS2 {
                        for i in 0..PS2 {
                            let id_in = ((k + g) * nxt + (j + g)) * nxt + (i + g);
                            let id_out = (k * PS2 + j) * PS2 + i;
                            assert!(
                                (out[v * n3 + id_out] - before[v * nxt3 + id_in]).abs() < 1e-13,
                                "scheme {:?} not idempotent at dt=0",
                                scheme
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn interior_update_conserves_mass() {
        // with dt small and a smooth field, the total mass change of the
        // interior equals the net boundary flux recorded in the planes
        let scheme = FluScheme::MhmRp;
        let p = test_params(scheme, 1e-3, 0.1);
        let nxt = p.nxt();
        let nxt3 = nxt * nxt * nxt;
        let mut tile = vec![0.0; 5 * nxt3];
        for k in 0..nxt {
            for j in 0..nxt {
                for i in 0..nxt {
                    let id = (k * nxt + j) * nxt + i;
                    let x = i as Real / nxt as Real;
                    let w = [1.0 + 0.1 * (6.28318 * x).sin(), 0.4, 0.0, 0.0, 1.0];
                    let u = pri_to_con(&w, p.gamma());
                    for v in 0..5 {
                        tile[v * nxt3 + id] = u[v];
                    }
                }
            }
        }

        let mut out = vec![0.0; 5 * PS2 * PS2 * PS2];
        let mut planes = FluxPlanes::new();
        fluid_kernel(scheme)(&p, &mut tile, &mut out, &mut planes);

        let g = p.ghost;
        let n3 = PS2 * PS2 * PS2;
        let mut dm = 0.0;
        for k in 0..PS2 {
            for j in 0..PS2 {
                for i in 0..PS2 {
                    let id_in = ((k + g) * nxt + (j + g)) * nxt + (i + g);
                    let id_out = (k * PS2 + j) * PS2 + i;
                    dm += out[id_out] - tile[id_in];
                }
            }
        }

        let mut boundary = 0.0;
        for d in 0..3 {
            for c2 in 0..PS2 {
                for c1 in 0..PS2 {
                    boundary += planes.get(d, PlaneSide::Minus, DENS, c1, c2)
                        - planes.get(d, PlaneSide::Plus, DENS, c1, c2);
                }
            }
        }
        boundary *= p.dt / p.dh;

        assert!(
            (dm - boundary).abs() < 1e-11 * dm.abs().max(1.0),
            "mass change {} vs boundary flux {}",
            dm,
            boundary
        );
    }
}
