pub mod reconstruct;
pub mod riemann;

use crate::Real;

/// Component indices of the conserved 5-vector.
pub const DENS: usize = 0;
pub const MOMX: usize = 1;
pub const MOMY: usize = 2;
pub const MOMZ: usize = 3;
pub const ENGY: usize = 4;

/// Component indices of the wave (ELBDM) 3-vector. The density component is
/// shared with hydro.
pub const WAVE_REAL: usize = 1;
pub const WAVE_IMAG: usize = 2;

/// Conserved state: density, three momentum densities, total energy density.
pub type Cons = [Real; 5];

/// Primitive state: density, three velocities, gas pressure.
pub type Prim = [Real; 5];

/// Permute the three vector components of a state so that the `axis`
/// component takes the x slot. Every 1D kernel in the crate operates on the
/// x component and relies on `rotate(rotate(u, a, true), a, false) == u`
/// holding bitwise.
pub fn rotate(u: &mut [Real; 5], axis: usize, forward: bool) {
    let t = *u;
    match (axis, forward) {
        (0, _) => {}
        (1, true) | (2, false) => {
            u[1] = t[2];
            u[2] = t[3];
            u[3] = t[1];
        }
        (2, true) | (1, false) => {
            u[1] = t[3];
            u[2] = t[1];
            u[3] = t[2];
        }
        _ => panic!("invalid axis {}", axis),
    }
}

/// Conserved to primitive. If `min_pres` is given, the derived pressure is
/// floored there (positivity enforcement).
pub fn con_to_pri(u: &Cons, gamma: Real, min_pres: Option<Real>) -> Prim {
    let gamma_m1 = gamma - 1.0;
    let inv_rho = 1.0 / u[DENS];
    let mut p = gamma_m1
        * (u[ENGY]
            - 0.5 * (u[MOMX] * u[MOMX] + u[MOMY] * u[MOMY] + u[MOMZ] * u[MOMZ]) * inv_rho);
    if let Some(floor) = min_pres {
        p = p.max(floor);
    }
    [
        u[DENS],
        u[MOMX] * inv_rho,
        u[MOMY] * inv_rho,
        u[MOMZ] * inv_rho,
        p,
    ]
}

/// Primitive to conserved; exact inverse of `con_to_pri` when no floor was
/// applied.
pub fn pri_to_con(w: &Prim, gamma: Real) -> Cons {
    let gamma_m1 = gamma - 1.0;
    [
        w[0],
        w[0] * w[1],
        w[0] * w[2],
        w[0] * w[3],
        0.5 * w[0] * (w[1] * w[1] + w[2] * w[2] + w[3] * w[3]) + w[4] / gamma_m1,
    ]
}

/// Euler flux of a conserved state in the given axis direction.
pub fn con_to_flux(axis: usize, u: &Cons, gamma: Real) -> Cons {
    let mut q = *u;
    rotate(&mut q, axis, true);

    let gamma_m1 = gamma - 1.0;
    let inv_rho = 1.0 / q[DENS];
    let vx = q[MOMX] * inv_rho;
    let p = gamma_m1
        * (q[ENGY]
            - 0.5 * (q[MOMX] * q[MOMX] + q[MOMY] * q[MOMY] + q[MOMZ] * q[MOMZ]) * inv_rho);

    let mut f = [
        q[MOMX],
        q[MOMX] * vx + p,
        q[MOMY] * vx,
        q[MOMZ] * vx,
        (q[ENGY] + p) * vx,
    ];
    rotate(&mut f, axis, false);
    f
}

/// Euler flux of a primitive state in the x direction (the WAF kernels work
/// on pre-rotated columns and evaluate fluxes from primitive data).
pub fn pri_to_flux_x(w: &Prim, gamma: Real) -> Cons {
    let gamma_m1 = gamma - 1.0;
    [
        w[0] * w[1],
        w[0] * w[1] * w[1] + w[4],
        w[0] * w[1] * w[2],
        w[0] * w[1] * w[3],
        w[1] * (0.5 * w[0] * (w[1] * w[1] + w[2] * w[2] + w[3] * w[3]) + w[4] / gamma_m1 + w[4]),
    ]
}

/// Gas pressure of a conserved state.
pub fn pressure(u: &Cons, gamma: Real) -> Real {
    (gamma - 1.0)
        * (u[ENGY]
            - 0.5 * (u[MOMX] * u[MOMX] + u[MOMY] * u[MOMY] + u[MOMZ] * u[MOMZ]) / u[DENS])
}

/// Adiabatic sound speed of a primitive state.
pub fn sound_speed(w: &Prim, gamma: Real) -> Real {
    (gamma * w[4] / w[0]).sqrt()
}

/// |v| + c, the largest characteristic speed, used by the CFL condition.
pub fn max_signal_speed(u: &Cons, gamma: Real) -> Real {
    let w = con_to_pri(u, gamma, Some(0.0));
    (w[1] * w[1] + w[2] * w[2] + w[3] * w[3]).sqrt() + sound_speed(&w, gamma)
}

/// Floor the pressure of a conserved state in place: recompute the kinetic
/// energy, derive the pressure, clamp it, and re-pack the energy.
pub fn enforce_positive_pressure(u: &mut Cons, gamma: Real, min_pres: Real) {
    let gamma_m1 = gamma - 1.0;
    let ek = 0.5 * (u[MOMX] * u[MOMX] + u[MOMY] * u[MOMY] + u[MOMZ] * u[MOMZ]) / u[DENS];
    let p = (gamma_m1 * (u[ENGY] - ek)).max(min_pres);
    u[ENGY] = ek + p / gamma_m1;
}

#[cfg(test)]
mod test {
    use super::*;

    const GAMMA: Real = 1.4;

    #[test]
    fn rotation_round_trips_bitwise() {
        let u: Cons = [1.1, -2.0, 3.5, 0.25, 9.0];
        for axis in 0..3 {
            let mut v = u;
            rotate(&mut v, axis, true);
            rotate(&mut v, axis, false);
            assert_eq!(u, v);
        }
    }

    #[test]
    fn rotation_moves_axis_component_first() {
        let mut u: Cons = [1.0, 10.0, 20.0, 30.0, 2.0];
        rotate(&mut u, 1, true);
        assert_eq!(u[MOMX], 20.0);
        let mut u: Cons = [1.0, 10.0, 20.0, 30.0, 2.0];
        rotate(&mut u, 2, true);
        assert_eq!(u[MOMX], 30.0);
    }

    #[test]
    fn con_pri_round_trip() {
        let u: Cons = [1.25, 0.5, -0.75, 0.1, 4.0];
        let w = con_to_pri(&u, GAMMA, None);
        let v = pri_to_con(&w, GAMMA);
        for (a, b) in u.iter().zip(&v) {
            assert!((a - b).abs() <= 2.0 * Real::EPSILON * a.abs());
        }
    }

    #[test]
    fn flux_matches_primitive_form() {
        let w: Prim = [1.0, 0.3, -0.2, 0.1, 0.8];
        let u = pri_to_con(&w, GAMMA);
        let f0 = con_to_flux(0, &u, GAMMA);
        let f1 = pri_to_flux_x(&w, GAMMA);
        for (a, b) in f0.iter().zip(&f1) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn rotated_flux_permutes_momenta() {
        let u: Cons = [1.0, 0.3, -0.2, 0.1, 2.0];
        let fy = con_to_flux(1, &u, GAMMA);
        let mut ur = u;
        rotate(&mut ur, 1, true);
        let mut fr = con_to_flux(0, &ur, GAMMA);
        rotate(&mut fr, 1, false);
        for (a, b) in fy.iter().zip(&fr) {
            assert_eq!(a, b);
        }
    }
}
