use super::{con_to_flux, con_to_pri, pri_to_flux_x, rotate, Cons, Prim};
use super::{DENS, ENGY, MOMX, MOMY, MOMZ};
use crate::{Real, MAX_ERROR};

/// Interface-flux solver selection. All solvers take left and right states
/// at an interface plus the adiabatic index and return the numerical flux;
/// the rotation primitive aligns their signatures across axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiemannSolver {
    Exact,
    Roe,
    Hlle,
    Hllc,
}

/// Safe solver the Roe scheme falls back to when an intermediate state has
/// non-positive density or pressure. The fallback recomputes the whole
/// interface flux rather than patching the bad component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoeFallback {
    Exact,
    Hlle,
    Hllc,
}

/// Dispatch on the configured solver. Inputs are conserved states in the
/// caller's component ordering.
pub fn solve(
    solver: RiemannSolver,
    axis: usize,
    l: &Cons,
    r: &Cons,
    gamma: Real,
    fallback: RoeFallback,
    min_pres: Option<Real>,
) -> Cons {
    match solver {
        RiemannSolver::Exact => {
            let wl = con_to_pri(l, gamma, min_pres);
            let wr = con_to_pri(r, gamma, min_pres);
            exact(axis, &wl, &wr, gamma).flux
        }
        RiemannSolver::Roe => roe(axis, l, r, gamma, fallback, min_pres),
        RiemannSolver::Hlle => hlle(axis, l, r, gamma, min_pres),
        RiemannSolver::Hllc => hllc(axis, l, r, gamma, min_pres),
    }
}

/// Roe averages shared by the linearized solvers: (u, v, w, enthalpy, sound
/// speed) about the interface.
struct RoeAverage {
    u: Real,
    v: Real,
    w: Real,
    h: Real,
    cs: Real,
}

fn roe_average(l: &Cons, r: &Cons, gamma: Real, min_pres: Option<Real>) -> RoeAverage {
    let gamma_m1 = gamma - 1.0;
    let inv_rho_l = 1.0 / l[DENS];
    let inv_rho_r = 1.0 / r[DENS];

    let p_l = gamma_m1
        * (l[ENGY] - 0.5 * (l[MOMX] * l[MOMX] + l[MOMY] * l[MOMY] + l[MOMZ] * l[MOMZ]) * inv_rho_l);
    let p_r = gamma_m1
        * (r[ENGY] - 0.5 * (r[MOMX] * r[MOMX] + r[MOMY] * r[MOMY] + r[MOMZ] * r[MOMZ]) * inv_rho_r);
    let (p_l, p_r) = match min_pres {
        Some(floor) => (p_l.max(floor), p_r.max(floor)),
        None => (p_l, p_r),
    };

    let h_l = (l[ENGY] + p_l) * inv_rho_l;
    let h_r = (r[ENGY] + p_r) * inv_rho_r;

    let rho_l_sqrt = l[DENS].sqrt();
    let rho_r_sqrt = r[DENS].sqrt();
    let inv_sum = 1.0 / (rho_l_sqrt + rho_r_sqrt);

    let u = inv_sum * (l[MOMX] / rho_l_sqrt + r[MOMX] / rho_r_sqrt);
    let v = inv_sum * (l[MOMY] / rho_l_sqrt + r[MOMY] / rho_r_sqrt);
    let w = inv_sum * (l[MOMZ] / rho_l_sqrt + r[MOMZ] / rho_r_sqrt);
    let h = inv_sum * (rho_l_sqrt * h_l + rho_r_sqrt * h_r);

    let mut p_rho = h - 0.5 * (u * u + v * v + w * w);
    if let Some(floor) = min_pres {
        p_rho = p_rho.max(floor);
    }
    let cs = (gamma_m1 * p_rho).sqrt();

    RoeAverage { u, v, w, h, cs }
}

fn one_sided_pressures(l: &Cons, r: &Cons, gamma: Real, min_pres: Option<Real>) -> (Real, Real) {
    let gamma_m1 = gamma - 1.0;
    let p_l = gamma_m1
        * (l[ENGY] - 0.5 * (l[MOMX] * l[MOMX] + l[MOMY] * l[MOMY] + l[MOMZ] * l[MOMZ]) / l[DENS]);
    let p_r = gamma_m1
        * (r[ENGY] - 0.5 * (r[MOMX] * r[MOMX] + r[MOMY] * r[MOMY] + r[MOMZ] * r[MOMZ]) / r[DENS]);
    match min_pres {
        Some(floor) => (p_l.max(floor), p_r.max(floor)),
        None => (p_l, p_r),
    }
}

/// Approximate Riemann solver of Harten, Lax, and van Leer with the
/// Einfeldt wave-speed estimate: Roe-averaged eigenvalues clipped by the
/// one-sided state speeds, then clamped to include zero.
pub fn hlle(axis: usize, l_in: &Cons, r_in: &Cons, gamma: Real, min_pres: Option<Real>) -> Cons {
    let mut l = *l_in;
    let mut r = *r_in;
    rotate(&mut l, axis, true);
    rotate(&mut r, axis, true);

    let avg = roe_average(&l, &r, gamma, min_pres);
    let (p_l, p_r) = one_sided_pressures(&l, &r, gamma, min_pres);

    let u_l = l[MOMX] / l[DENS];
    let u_r = r[MOMX] / r[DENS];
    let cs_l = (gamma * p_l / l[DENS]).sqrt();
    let cs_r = (gamma * p_r / r[DENS]).sqrt();

    let max_v_l = (avg.u - avg.cs).min(u_l - cs_l).min(0.0);
    let max_v_r = (avg.u + avg.cs).max(u_r + cs_r).max(0.0);

    let f_l = con_to_flux(0, &l, gamma);
    let f_r = con_to_flux(0, &r, gamma);

    let inv_dv = 1.0 / (max_v_r - max_v_l);
    let mut flux = [0.0; 5];
    for n in 0..5 {
        let f_l_shift = f_l[n] - max_v_l * l[n];
        let f_r_shift = f_r[n] - max_v_r * r[n];
        flux[n] = inv_dv * (max_v_r * f_l_shift - max_v_l * f_r_shift);
    }

    rotate(&mut flux, axis, false);
    flux
}

/// Three-wave HLLC solver preserving the contact discontinuity. The outer
/// signal speeds use the same Einfeldt estimate (with zero-inclusion clamp)
/// as HLLE; the contact speed comes from the pressure-consistent formula.
pub fn hllc(axis: usize, l_in: &Cons, r_in: &Cons, gamma: Real, min_pres: Option<Real>) -> Cons {
    let mut l = *l_in;
    let mut r = *r_in;
    rotate(&mut l, axis, true);
    rotate(&mut r, axis, true);

    let avg = roe_average(&l, &r, gamma, min_pres);
    let (p_l, p_r) = one_sided_pressures(&l, &r, gamma, min_pres);

    let u_l = l[MOMX] / l[DENS];
    let u_r = r[MOMX] / r[DENS];
    let cs_l = (gamma * p_l / l[DENS]).sqrt();
    let cs_r = (gamma * p_r / r[DENS]).sqrt();

    let s_l = (avg.u - avg.cs).min(u_l - cs_l).min(0.0);
    let s_r = (avg.u + avg.cs).max(u_r + cs_r).max(0.0);

    let num = p_r - p_l + l[MOMX] * (s_l - u_l) - r[MOMX] * (s_r - u_r);
    let den = l[DENS] * (s_l - u_l) - r[DENS] * (s_r - u_r);
    let s_star = if den.abs() > MAX_ERROR * (l[DENS] + r[DENS]) {
        num / den
    } else {
        avg.u
    };

    let mut flux = if s_star >= 0.0 {
        let f_l = con_to_flux(0, &l, gamma);
        let coef = l[DENS] * (s_l - u_l) / (s_l - s_star);
        let e_star = l[ENGY] / l[DENS]
            + (s_star - u_l) * (s_star + p_l / (l[DENS] * (s_l - u_l)));
        let u_star = [
            coef,
            coef * s_star,
            coef * l[MOMY] / l[DENS],
            coef * l[MOMZ] / l[DENS],
            coef * e_star,
        ];
        let mut f = [0.0; 5];
        for n in 0..5 {
            f[n] = f_l[n] + s_l * (u_star[n] - l[n]);
        }
        f
    } else {
        let f_r = con_to_flux(0, &r, gamma);
        let coef = r[DENS] * (s_r - u_r) / (s_r - s_star);
        let e_star = r[ENGY] / r[DENS]
            + (s_star - u_r) * (s_star + p_r / (r[DENS] * (s_r - u_r)));
        let u_star = [
            coef,
            coef * s_star,
            coef * r[MOMY] / r[DENS],
            coef * r[MOMZ] / r[DENS],
            coef * e_star,
        ];
        let mut f = [0.0; 5];
        for n in 0..5 {
            f[n] = f_r[n] + s_r * (u_star[n] - r[n]);
        }
        f
    };

    rotate(&mut flux, axis, false);
    flux
}

/// Approximate Riemann solver of Roe. If any intermediate state between
/// successive eigenvalues has non-positive density or pressure the whole
/// flux is recomputed by the configured fallback solver.
pub fn roe(
    axis: usize,
    l_in: &Cons,
    r_in: &Cons,
    gamma: Real,
    fallback: RoeFallback,
    min_pres: Option<Real>,
) -> Cons {
    let mut l = *l_in;
    let mut r = *r_in;
    rotate(&mut l, axis, true);
    rotate(&mut r, axis, true);

    let gamma_m1 = gamma - 1.0;
    let avg = roe_average(&l, &r, gamma, min_pres);
    let (u, v, w, h, cs) = (avg.u, avg.v, avg.w, avg.h, avg.cs);
    let v2 = u * u + v * v + w * w;

    let eigen_vec: [[Real; 5]; 5] = [
        [1.0, u - cs, v, w, h - u * cs],
        [1.0, u, v, w, 0.5 * v2],
        [0.0, 0.0, 1.0, 0.0, v],
        [0.0, 0.0, 0.0, 1.0, w],
        [1.0, u + cs, v, w, h + u * cs],
    ];
    let eigen_val = [u - cs, u, u, u, u + cs];

    let flux_l = con_to_flux(0, &l, gamma);
    let flux_r = con_to_flux(0, &r, gamma);

    // supersonic flow: return the upwind flux directly
    if eigen_val[0] >= 0.0 {
        let mut f = flux_l;
        rotate(&mut f, axis, false);
        return f;
    }
    if eigen_val[4] <= 0.0 {
        let mut f = flux_r;
        rotate(&mut f, axis, false);
        return f;
    }

    // amplitudes along the characteristics
    let mut jump = [0.0; 5];
    for n in 0..5 {
        jump[n] = r[n] - l[n];
    }
    let mut amp = [0.0; 5];
    amp[2] = jump[2] - v * jump[0];
    amp[3] = jump[3] - w * jump[0];
    amp[1] = gamma_m1 / (cs * cs)
        * (jump[0] * (h - u * u) + u * jump[1] - jump[4] + v * amp[2] + w * amp[3]);
    amp[0] = 0.5 / cs * (jump[0] * (u + cs) - jump[1] - cs * amp[1]);
    amp[4] = jump[0] - amp[0] - amp[1];

    // verify that the densities and pressures of the intermediate states are
    // positive; recompute with the fallback solver otherwise
    let mut i_state = l;
    for t in 0..4 {
        for n in 0..5 {
            i_state[n] += amp[t] * eigen_vec[t][n];
        }
        if eigen_val[t + 1] > eigen_val[t] {
            let i_pres = i_state[ENGY]
                - 0.5
                    * (i_state[MOMX] * i_state[MOMX]
                        + i_state[MOMY] * i_state[MOMY]
                        + i_state[MOMZ] * i_state[MOMZ])
                    / i_state[DENS];

            if i_state[DENS] <= 0.0 || i_pres <= 0.0 {
                log::warn!("non-physical Roe intermediate state, switching to fallback solver");

                let mut f = match fallback {
                    RoeFallback::Exact => {
                        let wl = con_to_pri(&l, gamma, min_pres);
                        let wr = con_to_pri(&r, gamma, min_pres);
                        exact(0, &wl, &wr, gamma).flux
                    }
                    RoeFallback::Hlle => hlle(0, &l, &r, gamma, min_pres),
                    RoeFallback::Hllc => hllc(0, &l, &r, gamma, min_pres),
                };
                rotate(&mut f, axis, false);
                return f;
            }
        }
    }

    let mut flux = [0.0; 5];
    for n in 0..5 {
        let mut diffusion = 0.0;
        for t in 0..5 {
            diffusion += amp[t] * eigen_val[t].abs() * eigen_vec[t][n];
        }
        flux[n] = 0.5 * (flux_l[n] + flux_r[n]) - 0.5 * diffusion;
    }

    rotate(&mut flux, axis, false);
    flux
}

/// Full wave fan returned by the exact solver: the five wave-speed
/// eigenvalues, both star-region primitive states, and the interface flux
/// sampled at x/t = 0.
pub struct ExactSolution {
    pub eival: [Real; 5],
    pub l_star: Prim,
    pub r_star: Prim,
    pub flux: Cons,
}

/// Iterative (exact) Riemann solver after Toro. Inputs are primitive
/// states; the pressure iteration converges to `MAX_ERROR`.
pub fn exact(axis: usize, l_in: &Prim, r_in: &Prim, gamma: Real) -> ExactSolution {
    let mut l = *l_in;
    let mut r = *r_in;
    rotate(&mut l, axis, true);
    rotate(&mut r, axis, true);

    let gp1 = gamma + 1.0;
    let gm1 = gamma - 1.0;
    let cs_l = (gamma * l[4] / l[0]).sqrt();
    let cs_r = (gamma * r[4] / r[0]).sqrt();
    let du = r[1] - l[1];

    // pressure function of one side and its derivative
    let f_k = |p: Real, rho: Real, pk: Real, cs: Real| -> (Real, Real) {
        if p > pk {
            // shock branch
            let a = 2.0 / (gp1 * rho);
            let b = gm1 / gp1 * pk;
            let sq = (a / (p + b)).sqrt();
            (
                (p - pk) * sq,
                sq * (1.0 - 0.5 * (p - pk) / (p + b)),
            )
        } else {
            // rarefaction branch
            let pr = p / pk;
            (
                2.0 * cs / gm1 * (pr.powf(0.5 * gm1 / gamma) - 1.0),
                1.0 / (rho * cs) * pr.powf(-0.5 * gp1 / gamma),
            )
        }
    };

    // initial guess from the primitive-variable linearized solution
    let mut p = {
        let p_pvrs = 0.5 * (l[4] + r[4])
            - 0.125 * du * (l[0] + r[0]) * (cs_l + cs_r);
        p_pvrs.max(MAX_ERROR * (l[4] + r[4]))
    };

    for _ in 0..128 {
        let (fl, dfl) = f_k(p, l[0], l[4], cs_l);
        let (fr, dfr) = f_k(p, r[0], r[4], cs_r);
        let p_new = (p - (fl + fr + du) / (dfl + dfr)).max(MAX_ERROR * p);
        let change = 2.0 * (p_new - p).abs() / (p_new + p);
        p = p_new;
        if change < MAX_ERROR {
            break;
        }
    }

    let (fl, _) = f_k(p, l[0], l[4], cs_l);
    let (fr, _) = f_k(p, r[0], r[4], cs_r);
    let u_star = 0.5 * (l[1] + r[1]) + 0.5 * (fr - fl);

    // star-region densities
    let rho_star = |rho: Real, pk: Real| -> Real {
        if p > pk {
            let q = gm1 / gp1;
            rho * ((p / pk + q) / (q * p / pk + 1.0))
        } else {
            rho * (p / pk).powf(1.0 / gamma)
        }
    };
    let rho_star_l = rho_star(l[0], l[4]);
    let rho_star_r = rho_star(r[0], r[4]);

    let l_star: Prim = [rho_star_l, u_star, l[2], l[3], p];
    let r_star: Prim = [rho_star_r, u_star, r[2], r[3], p];

    // outermost wave speeds: shock speed, or rarefaction head
    let s_l = if p > l[4] {
        l[1] - cs_l * (0.5 * gp1 / gamma * p / l[4] + 0.5 * gm1 / gamma).sqrt()
    } else {
        l[1] - cs_l
    };
    let s_r = if p > r[4] {
        r[1] + cs_r * (0.5 * gp1 / gamma * p / r[4] + 0.5 * gm1 / gamma).sqrt()
    } else {
        r[1] + cs_r
    };
    let eival = [s_l, u_star, u_star, u_star, s_r];

    // sample the solution at x/t = 0 and evaluate its flux
    let sampled: Prim = if u_star >= 0.0 {
        // interface lies left of the contact
        if p > l[4] {
            if s_l >= 0.0 {
                l
            } else {
                l_star
            }
        } else {
            let head = l[1] - cs_l;
            let cs_star = cs_l * (p / l[4]).powf(0.5 * gm1 / gamma);
            let tail = u_star - cs_star;
            if head >= 0.0 {
                l
            } else if tail <= 0.0 {
                l_star
            } else {
                // inside the left rarefaction fan
                let c = 2.0 / gp1 + gm1 / gp1 / cs_l * l[1];
                let rho = l[0] * c.powf(2.0 / gm1);
                let u = 2.0 / gp1 * (cs_l + 0.5 * gm1 * l[1]);
                let pf = l[4] * c.powf(2.0 * gamma / gm1);
                [rho, u, l[2], l[3], pf]
            }
        }
    } else {
        // interface lies right of the contact
        if p > r[4] {
            if s_r <= 0.0 {
                r
            } else {
                r_star
            }
        } else {
            let head = r[1] + cs_r;
            let cs_star = cs_r * (p / r[4]).powf(0.5 * gm1 / gamma);
            let tail = u_star + cs_star;
            if head <= 0.0 {
                r
            } else if tail >= 0.0 {
                r_star
            } else {
                // inside the right rarefaction fan
                let c = 2.0 / gp1 - gm1 / gp1 / cs_r * r[1];
                let rho = r[0] * c.powf(2.0 / gm1);
                let u = 2.0 / gp1 * (-cs_r + 0.5 * gm1 * r[1]);
                let pf = r[4] * c.powf(2.0 * gamma / gm1);
                [rho, u, r[2], r[3], pf]
            }
        }
    };

    let mut flux = pri_to_flux_x(&sampled, gamma);
    rotate(&mut flux, axis, false);

    ExactSolution {
        eival,
        l_star,
        r_star,
        flux,
    }
}

/// Star region and wave speeds by Roe's method, consumed by the WAF kernel.
/// Inputs are primitive states in a pre-rotated column (x is the sweep
/// direction); outputs are the five wave speeds and the primitive star
/// states.
pub fn star_roe(
    l: &Prim,
    r: &Prim,
    gamma: Real,
    min_pres: Option<Real>,
) -> ([Real; 5], Prim, Prim) {
    let gamma_m1 = gamma - 1.0;

    // Roe averages
    let n_l_sq = l[0].sqrt();
    let n_r_sq = r[0].sqrt();
    let h_l = 0.5 * (l[1] * l[1] + l[2] * l[2] + l[3] * l[3]) + gamma / gamma_m1 * l[4] / l[0];
    let h_r = 0.5 * (r[1] * r[1] + r[2] * r[2] + r[3] * r[3]) + gamma / gamma_m1 * r[4] / r[0];
    let n_bar_inv = 1.0 / (n_l_sq + n_r_sq);

    let u_bar = (n_l_sq * l[1] + n_r_sq * r[1]) * n_bar_inv;
    let v_bar = (n_l_sq * l[2] + n_r_sq * r[2]) * n_bar_inv;
    let w_bar = (n_l_sq * l[3] + n_r_sq * r[3]) * n_bar_inv;
    let h_bar = (n_l_sq * h_l + n_r_sq * h_r) * n_bar_inv;

    let mut p_rho = h_bar - 0.5 * (u_bar * u_bar + v_bar * v_bar + w_bar * w_bar);
    if let Some(floor) = min_pres {
        p_rho = p_rho.max(floor);
    }
    let a_bar = (gamma_m1 * p_rho).sqrt();
    let a_bar_inv = 1.0 / a_bar;

    // Roe coefficients from the conserved-variable jumps
    let du_1 = r[0] - l[0];
    let du_2 = r[0] * r[1] - l[0] * l[1];
    let du_3 = r[0] * r[2] - l[0] * l[2];
    let du_4 = r[0] * r[3] - l[0] * l[3];
    let du_5 = 0.5 * r[0] * (r[1] * r[1] + r[2] * r[2] + r[3] * r[3]) + r[4] / gamma_m1
        - 0.5 * l[0] * (l[1] * l[1] + l[2] * l[2] + l[3] * l[3])
        - l[4] / gamma_m1;

    let coef_2 = du_3 - v_bar * du_1;
    let coef_3 = du_4 - w_bar * du_1;
    let coef_1 = gamma_m1 * a_bar_inv * a_bar_inv
        * (du_1 * (h_bar - u_bar * u_bar) + u_bar * du_2 - du_5 + coef_2 * v_bar + coef_3 * w_bar);
    let coef_0 = 0.5 * a_bar_inv * (du_1 * (u_bar + a_bar) - du_2 - a_bar * coef_1);
    let coef_4 = du_1 - (coef_0 + coef_1);

    // star region
    let mut l_star = [0.0; 5];
    let mut r_star = [0.0; 5];
    l_star[0] = l[0] + coef_0;
    r_star[0] = r[0] - coef_4;
    l_star[1] = 0.5
        * ((l[0] * l[1] + coef_0 * (u_bar - a_bar)) / l_star[0]
            + (r[0] * r[1] - coef_4 * (u_bar + a_bar)) / r_star[0]);
    r_star[1] = l_star[1];
    l_star[2] = l[2];
    r_star[2] = r[2];
    l_star[3] = l[3];
    r_star[3] = r[3];
    let e_l = 0.5 * l[0] * (l[1] * l[1] + l[2] * l[2] + l[3] * l[3]);
    let e_r = 0.5 * r[0] * (r[1] * r[1] + r[2] * r[2] + r[3] * r[3]);
    let e_l_star = 0.5 * l_star[0] * (l_star[1] * l_star[1] + l_star[2] * l_star[2] + l_star[3] * l_star[3]);
    let e_r_star = 0.5 * r_star[0] * (r_star[1] * r_star[1] + r_star[2] * r_star[2] + r_star[3] * r_star[3]);
    l_star[4] = 0.5
        * gamma_m1
        * ((e_l - e_l_star + l[4] / gamma_m1 + coef_0 * (h_bar - u_bar * a_bar))
            + (e_r - e_r_star + r[4] / gamma_m1 - coef_4 * (h_bar + u_bar * a_bar)));
    r_star[4] = l_star[4];

    if let Some(floor) = min_pres {
        l_star[4] = l_star[4].max(floor);
        r_star[4] = r_star[4].max(floor);
    }

    // wave speeds
    let mut eival = [0.0; 5];
    eival[1] = l_star[1];
    eival[2] = l_star[1];
    eival[3] = l_star[1];

    let head_l = l[1] - (gamma * l[4] / l[0]).sqrt();
    let tail_l = l_star[1] - (gamma * l_star[4] / l_star[0]).sqrt();
    eival[0] = head_l.min(tail_l);

    let head_r = r[1] + (gamma * r[4] / r[0]).sqrt();
    let tail_r = r_star[1] + (gamma * r_star[4] / r_star[0]).sqrt();
    eival[4] = head_r.max(tail_r);

    (eival, l_star, r_star)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hydro::pri_to_con;

    const GAMMA: Real = 1.4;

    fn sod_states() -> (Cons, Cons) {
        let l = pri_to_con(&[1.0, 0.0, 0.0, 0.0, 1.0], GAMMA);
        let r = pri_to_con(&[0.125, 0.0, 0.0, 0.0, 0.1], GAMMA);
        (l, r)
    }

    #[test]
    fn uniform_state_yields_exact_flux() {
        let u = pri_to_con(&[1.0, 0.5, 0.25, -0.1, 2.0], GAMMA);
        let expect = con_to_flux(0, &u, GAMMA);
        for f in [
            hlle(0, &u, &u, GAMMA, None),
            hllc(0, &u, &u, GAMMA, None),
            roe(0, &u, &u, GAMMA, RoeFallback::Hlle, None),
        ] {
            for n in 0..5 {
                assert!((f[n] - expect[n]).abs() < 1e-12, "component {}", n);
            }
        }
    }

    #[test]
    fn hllc_preserves_stationary_contact() {
        let l = pri_to_con(&[1.0, 0.0, 0.0, 0.0, 1.0], GAMMA);
        let r = pri_to_con(&[0.25, 0.0, 0.0, 0.0, 1.0], GAMMA);
        let f = hllc(0, &l, &r, GAMMA, None);
        assert!(f[DENS].abs() < 1e-12);
        assert!(f[ENGY].abs() < 1e-12);
        // HLLE smears the contact instead
        let f = hlle(0, &l, &r, GAMMA, None);
        assert!(f[DENS].abs() > 1e-3);
    }

    #[test]
    fn exact_solver_matches_sod_star_state() {
        let sol = exact(
            0,
            &[1.0, 0.0, 0.0, 0.0, 1.0],
            &[0.125, 0.0, 0.0, 0.0, 0.1],
            GAMMA,
        );
        assert!((sol.l_star[4] - 0.30313).abs() < 1e-4);
        assert!((sol.l_star[1] - 0.92745).abs() < 1e-4);
        assert!((sol.l_star[0] - 0.42632).abs() < 1e-4);
        assert!((sol.r_star[0] - 0.26557).abs() < 1e-4);
    }

    #[test]
    fn solvers_agree_on_sod_to_leading_order() {
        let (l, r) = sod_states();
        let reference = {
            let wl = con_to_pri(&l, GAMMA, None);
            let wr = con_to_pri(&r, GAMMA, None);
            exact(0, &wl, &wr, GAMMA).flux
        };
        for f in [
            hlle(0, &l, &r, GAMMA, None),
            hllc(0, &l, &r, GAMMA, None),
            roe(0, &l, &r, GAMMA, RoeFallback::Hlle, None),
        ] {
            for n in 0..5 {
                assert!((f[n] - reference[n]).abs() < 0.1, "component {}", n);
            }
        }
    }

    #[test]
    fn roe_falls_back_on_strong_expansion() {
        // colliding rarefactions drive the linearized intermediate states to
        // negative pressure, so the fallback flux must be returned
        let l = pri_to_con(&[1.0, -4.0, 0.0, 0.0, 0.4], GAMMA);
        let r = pri_to_con(&[1.0, 4.0, 0.0, 0.0, 0.4], GAMMA);
        let f_roe = roe(0, &l, &r, GAMMA, RoeFallback::Hlle, None);
        let f_hlle = hlle(0, &l, &r, GAMMA, None);
        for n in 0..5 {
            assert_eq!(f_roe[n], f_hlle[n]);
        }
    }

    #[test]
    fn rotation_consistency_across_axes() {
        let (l, r) = sod_states();
        let f0 = hllc(0, &l, &r, GAMMA, None);
        for axis in 1..3 {
            let mut lr = l;
            let mut rr = r;
            rotate(&mut lr, axis, false);
            rotate(&mut rr, axis, false);
            let mut f = hllc(axis, &lr, &rr, GAMMA, None);
            rotate(&mut f, axis, true);
            for n in 0..5 {
                assert!((f[n] - f0[n]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn star_roe_symmetric_problem() {
        let l: Prim = [1.0, 1.0, 0.0, 0.0, 1.0];
        let r: Prim = [1.0, -1.0, 0.0, 0.0, 1.0];
        let (eival, l_star, r_star) = star_roe(&l, &r, GAMMA, None);
        assert!(l_star[1].abs() < 1e-12);
        assert!((l_star[4] - r_star[4]).abs() < 1e-12);
        assert!(l_star[4] > 1.0);
        assert!(eival[0] < 0.0 && eival[4] > 0.0);
        assert!((eival[0] + eival[4]).abs() < 1e-12);
    }
}
