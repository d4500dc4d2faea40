//! 8-to-1 restriction: replace the fluid data of every refined patch at one
//! level by the average of its children, keeping the coarse representation
//! of refined regions consistent with the fine data.

use super::{Forest, Model, NONE};
use crate::hydro::{DENS, WAVE_IMAG, WAVE_REAL};
use crate::{Real, PS1};

/// Replace the data at level `lv` by the averaged data of level `lv + 1`.
/// `sg_coarse`/`sg_fine` select the sandglass slot per level. For the wave
/// model, the real and imaginary parts are rescaled after averaging so
/// their modulus matches the independently-restricted density, preserving
/// the phase while keeping the density authoritative.
pub fn restrict_level(forest: &mut Forest, lv: usize, sg_coarse: usize, sg_fine: usize) {
    if lv + 1 >= forest.nlevel {
        log::warn!("restriction requested at the finest level {}", lv);
        return;
    }
    if forest.levels[lv + 1].npatch() == 0 {
        return;
    }

    let ncomp = forest.model.ncomp();
    let half = PS1 / 2;
    let model = forest.model;
    let gravity = forest.gravity;

    let (coarse_levels, fine_levels) = forest.levels.split_at_mut(lv + 1);
    let coarse = &mut coarse_levels[lv];
    let fine = &fine_levels[0];

    for patch in coarse.patches.iter_mut() {
        if patch.son == NONE {
            continue;
        }
        let son0 = patch.son as usize;

        for local in 0..8 {
            let son = &fine.patches[son0 + local].data[sg_fine];
            let i0 = (local & 1) * half;
            let j0 = ((local >> 1) & 1) * half;
            let k0 = ((local >> 2) & 1) * half;

            for v in 0..ncomp {
                for k in 0..half {
                    for j in 0..half {
                        for i in 0..half {
                            let mut sum = 0.0;
                            for dk in 0..2 {
                                for dj in 0..2 {
                                    for di in 0..2 {
                                        sum += son.fluid_at(v, 2 * i + di, 2 * j + dj, 2 * k + dk);
                                    }
                                }
                            }
                            patch.data[sg_coarse].set_fluid(v, i + i0, j + j0, k + k0, 0.125 * sum);
                        }
                    }
                }
            }

            if gravity {
                if let (Some(pot_c), Some(pot_f)) = (
                    patch.data[sg_coarse].pot.as_deref_mut(),
                    son.pot.as_deref(),
                ) {
                    for k in 0..half {
                        for j in 0..half {
                            for i in 0..half {
                                let mut sum = 0.0;
                                for dk in 0..2 {
                                    for dj in 0..2 {
                                        for di in 0..2 {
                                            sum += pot_f[((2 * k + dk) * PS1 + 2 * j + dj) * PS1
                                                + 2 * i + di];
                                        }
                                    }
                                }
                                pot_c[((k + k0) * PS1 + (j + j0)) * PS1 + (i + i0)] = 0.125 * sum;
                            }
                        }
                    }
                }
            }
        }

        // rescale the wave components so |psi|^2 matches the restricted
        // density
        if model == Model::Elbdm {
            let data = &mut patch.data[sg_coarse];
            for k in 0..PS1 {
                for j in 0..PS1 {
                    for i in 0..PS1 {
                        let re = data.fluid_at(WAVE_REAL, i, j, k);
                        let im = data.fluid_at(WAVE_IMAG, i, j, k);
                        let rho_wrong = re * re + im * im;
                        let rho_corr = data.fluid_at(DENS, i, j, k);
                        if rho_wrong > 0.0 {
                            let rescale: Real = (rho_corr / rho_wrong).sqrt();
                            data.set_fluid(WAVE_REAL, i, j, k, re * rescale);
                            data.set_fluid(WAVE_IMAG, i, j, k, im * rescale);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mesh::{Boundary, Forest};
    use crate::PS2;

    fn refined_forest(model: Model) -> Forest {
        let mut forest = Forest::new(model, false, Boundary::Periodic, 2, [PS2, PS2, PS2]).unwrap();
        forest.init_base_grid();
        forest.allocate_octant(0, 0);
        forest.rebuild_links(1);
        forest
    }

    #[test]
    fn restriction_is_mass_exact() {
        let mut forest = refined_forest(Model::Hydro);
        // distinct fine data
        forest.fill_level(1, 0, |pos| {
            vec![
                1.0 + 0.01 * (pos[0] + 2 * pos[1] + 3 * pos[2]) as Real,
                0.1,
                -0.2,
                0.3,
                2.0,
            ]
        });

        let fine_sum: Real = forest.levels[1]
            .patches
            .iter()
            .map(|p| -> Real { p.data[0].fluid[..PS1 * PS1 * PS1].iter().sum() })
            .sum();

        restrict_level(&mut forest, 0, 0, 0);

        let coarse = &forest.levels[0].patches[0].data[0];
        let coarse_sum: Real = coarse.fluid[..PS1 * PS1 * PS1].iter().sum();
        assert!((coarse_sum * 8.0 - fine_sum).abs() < 1e-10 * fine_sum.abs());
    }

    #[test]
    fn wave_restriction_preserves_phase_and_density() {
        let mut forest = refined_forest(Model::Elbdm);
        forest.fill_level(1, 0, |pos| {
            let theta = 0.02 * pos[0] as Real;
            let amp = (2.0 + 0.01 * pos[1] as Real).sqrt();
            vec![amp * amp, amp * theta.cos(), amp * theta.sin()]
        });

        restrict_level(&mut forest, 0, 0, 0);

        let data = &forest.levels[0].patches[0].data[0];
        for k in 0..PS1 {
            for j in 0..PS1 {
                for i in 0..PS1 {
                    let rho = data.fluid_at(DENS, i, j, k);
                    let re = data.fluid_at(WAVE_REAL, i, j, k);
                    let im = data.fluid_at(WAVE_IMAG, i, j, k);
                    assert!((re * re + im * im - rho).abs() < 1e-12 * rho);
                }
            }
        }
    }
}
