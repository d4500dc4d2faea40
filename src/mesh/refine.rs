//! Refinement flagging and the patch-lifetime state machine. Each cycle:
//! per-cell criteria flag leaf patches, flags spill outward by the buffer
//! width, a fine-to-coarse sweep enforces proper nesting, and octants are
//! created or destroyed coarse-to-fine with their data interpolated in or
//! restricted out.

use super::ghost::GhostContext;
use super::interp::{refine_box, InterpScheme};
use super::restrict::restrict_level;
use super::{Forest, Model, NONE, SIB_OFFSETS};
use crate::hydro::{self, DENS, WAVE_IMAG, WAVE_REAL};
use crate::{Real, PS1, PS2};

/// Per-level refinement thresholds, one row per refinable level, loaded
/// from the plain-text criterion tables. A `None` criterion is disabled.
#[derive(Debug, Clone, Default)]
pub struct FlagTables {
    pub rho: Option<Vec<Real>>,
    pub rho_gradient: Option<Vec<Real>>,
    pub pres_gradient: Option<Vec<Real>>,
    pub engy_density: Option<Vec<[Real; 2]>>,
    pub lohner: Option<Vec<[Real; 3]>>,
    pub user: Option<Vec<Real>>,
}

/// User-supplied refinement hook: conserved cell state, the per-level
/// threshold, the cell position in finest units, and the cell width.
pub type UserFlagFn = fn(&[Real], Real, [i32; 3], Real) -> bool;

pub struct FlagContext<'a> {
    pub tables: &'a FlagTables,
    pub gamma: Real,
    pub flag_buffer: usize,
    pub interp: InterpScheme,
    pub user: Option<UserFlagFn>,
    pub dh0: Real,
}

/// Evaluate the per-cell criteria on every leaf patch of one level and set
/// the patch flags, spilling flags into neighbors within the buffer width.
pub fn flag_level(forest: &mut Forest, ctx: &FlagContext, lv: usize, sg: usize) {
    for p in forest.levels[lv].patches.iter_mut() {
        p.flag = false;
    }
    if lv + 1 >= forest.nlevel {
        return;
    }

    let n = forest.levels[lv].npatch();
    let ncomp = forest.model.ncomp();
    let model = forest.model;
    let dh = ctx.dh0 / (1 << lv) as Real;
    let scale = forest.scale(lv);
    let mut flags = vec![false; n];
    let mut spill: Vec<(usize, usize)> = Vec::new(); // (pid, direction)

    for pid in 0..n {
        // refined patches are evaluated too (on their restricted data), so
        // an octant above a persistent feature survives the pass
        // pressure field for the gradient criterion
        let pres = if ctx.tables.pres_gradient.is_some() && model == Model::Hydro {
            let data = &forest.levels[lv].patches[pid].data[sg];
            let mut pres = vec![0.0; PS1 * PS1 * PS1];
            for (c, p) in pres.iter_mut().enumerate() {
                let n3 = PS1 * PS1 * PS1;
                let u = [
                    data.fluid[c],
                    data.fluid[n3 + c],
                    data.fluid[2 * n3 + c],
                    data.fluid[3 * n3 + c],
                    data.fluid[4 * n3 + c],
                ];
                *p = hydro::pressure(&u, ctx.gamma);
            }
            Some(pres)
        } else {
            None
        };

        // extended density tile for the Lohner estimator (two ghost cells)
        let lohner_tile = if ctx.tables.lohner.is_some() {
            let gctx = GhostContext::same_time(forest, lv, sg, ctx.interp);
            Some(gctx.prepare_patch_tile(pid, 2))
        } else {
            None
        };

        let patch = &forest.levels[lv].patches[pid];
        let data = &patch.data[sg];
        let mut flagged_cells: Vec<[usize; 3]> = Vec::new();

        for k in 0..PS1 {
            for j in 0..PS1 {
                for i in 0..PS1 {
                    let mut flag = false;

                    // 1. density magnitude
                    if let Some(t) = &ctx.tables.rho {
                        flag |= data.fluid_at(DENS, i, j, k) > t[lv];
                    }

                    // 2. density gradient
                    if !flag {
                        if let Some(t) = &ctx.tables.rho_gradient {
                            flag |= gradient_exceeds(
                                &data.fluid[..PS1 * PS1 * PS1],
                                i,
                                j,
                                k,
                                t[lv],
                            );
                        }
                    }

                    // 3. pressure gradient
                    if !flag {
                        if let (Some(t), Some(pres)) = (&ctx.tables.pres_gradient, &pres) {
                            flag |= gradient_exceeds(pres, i, j, k, t[lv]);
                        }
                    }

                    // 4. wave-model energy density
                    if !flag && model == Model::Elbdm {
                        if let Some(t) = &ctx.tables.engy_density {
                            flag |= wave_energy_exceeds(data, i, j, k, t[lv]);
                        }
                    }

                    // 5. Lohner error estimator
                    if !flag {
                        if let (Some(t), Some(tile)) = (&ctx.tables.lohner, &lohner_tile) {
                            flag |= lohner_exceeds(tile, i, j, k, t[lv]);
                        }
                    }

                    // 6. user criterion
                    if !flag {
                        if let (Some(t), Some(user)) = (&ctx.tables.user, ctx.user) {
                            let n3 = PS1 * PS1 * PS1;
                            let c = (k * PS1 + j) * PS1 + i;
                            let mut u = vec![0.0; ncomp];
                            for v in 0..ncomp {
                                u[v] = data.fluid[v * n3 + c];
                            }
                            let pos = [
                                patch.corner[0] + i as i32 * scale,
                                patch.corner[1] + j as i32 * scale,
                                patch.corner[2] + k as i32 * scale,
                            ];
                            flag |= user(&u, t[lv], pos, dh);
                        }
                    }

                    if flag {
                        flagged_cells.push([i, j, k]);
                    }
                }
            }
        }

        if flagged_cells.is_empty() {
            continue;
        }
        flags[pid] = true;

        // buffer the flags outward: a flagged cell within the buffer width
        // of a patch face also flags the neighbor in that direction
        let buf = ctx.flag_buffer;
        for [i, j, k] in flagged_cells {
            let lo = |c: usize| c < buf;
            let hi = |c: usize| c + buf >= PS1;
            let ranges = [
                (lo(i), hi(i)),
                (lo(j), hi(j)),
                (lo(k), hi(k)),
            ];
            for (d, offset) in SIB_OFFSETS.iter().enumerate() {
                let hit = (0..3).all(|a| match offset[a] {
                    -1 => ranges[a].0,
                    1 => ranges[a].1,
                    _ => true,
                });
                if hit && *offset != [0, 0, 0] {
                    spill.push((pid, d));
                }
            }
        }
    }

    for (pid, d) in spill {
        let sib = forest.levels[lv].patches[pid].sibling[d];
        if sib >= 0 {
            flags[sib as usize] = true;
        }
    }

    for (pid, f) in flags.iter().enumerate() {
        forest.levels[lv].patches[pid].flag = *f;
    }
}

/// Relative gradient check with centered differences in the interior and
/// one-sided differences at the patch faces.
fn gradient_exceeds(var: &[Real], i: usize, j: usize, k: usize, threshold: Real) -> bool {
    let at = |i: usize, j: usize, k: usize| var[(k * PS1 + j) * PS1 + i];
    let v = at(i, j, k);
    if v == 0.0 {
        return false;
    }

    let diff = |c: usize, get: &dyn Fn(usize) -> Real| -> Real {
        if c == 0 {
            get(1) - get(0)
        } else if c == PS1 - 1 {
            get(PS1 - 1) - get(PS1 - 2)
        } else {
            0.5 * (get(c + 1) - get(c - 1))
        }
    };

    let gx = diff(i, &|c| at(c, j, k));
    let gy = diff(j, &|c| at(i, c, k));
    let gz = diff(k, &|c| at(i, j, c));
    let g = gx.abs().max(gy.abs()).max(gz.abs());
    g / v.abs() > threshold
}

/// Wave-model refinement criterion: the phase advance per cell against the
/// angle threshold, gated by the density softening floor.
fn wave_energy_exceeds(data: &super::PatchData, i: usize, j: usize, k: usize, t: [Real; 2]) -> bool {
    let rho = data.fluid_at(DENS, i, j, k);
    if rho <= t[1] {
        return false;
    }
    let phase = |i: usize, j: usize, k: usize| -> Real {
        let re = data.fluid_at(WAVE_REAL, i, j, k);
        let im = data.fluid_at(WAVE_IMAG, i, j, k);
        im.atan2(re)
    };
    let wrap = |d: Real| -> Real {
        let pi = std::f64::consts::PI as Real;
        let mut d = d;
        while d > pi {
            d -= 2.0 * pi;
        }
        while d < -pi {
            d += 2.0 * pi;
        }
        d
    };

    let p0 = phase(i, j, k);
    let mut max_dphase: Real = 0.0;
    if i + 1 < PS1 {
        max_dphase = max_dphase.max(wrap(phase(i + 1, j, k) - p0).abs());
    }
    if j + 1 < PS1 {
        max_dphase = max_dphase.max(wrap(phase(i, j + 1, k) - p0).abs());
    }
    if k + 1 < PS1 {
        max_dphase = max_dphase.max(wrap(phase(i, j, k + 1) - p0).abs());
    }
    max_dphase > t[0]
}

/// Lohner error estimator on the density, evaluated on a tile extended by
/// two ghost cells: ratio of second to first derivatives with the filter
/// and softening terms in the denominator.
fn lohner_exceeds(tile: &[Real], i: usize, j: usize, k: usize, t: [Real; 3]) -> bool {
    let n = PS1 + 4;
    let at = |di: i32, dj: i32, dk: i32| -> Real {
        let ii = (i as i32 + 2 + di) as usize;
        let jj = (j as i32 + 2 + dj) as usize;
        let kk = (k as i32 + 2 + dk) as usize;
        tile[(kk * n + jj) * n + ii]
    };
    let (threshold, filter, soften) = (t[0], t[1], t[2]);

    let e = [[1i32, 0, 0], [0, 1, 0], [0, 0, 1]];
    let mut num = 0.0;
    let mut den = 0.0;

    for d1 in 0..3 {
        let p1 = e[d1];
        for d2 in 0..3 {
            let p2 = e[d2];
            let second = if d1 == d2 {
                at(p1[0], p1[1], p1[2]) - 2.0 * at(0, 0, 0) + at(-p1[0], -p1[1], -p1[2])
            } else {
                0.25 * (at(p1[0] + p2[0], p1[1] + p2[1], p1[2] + p2[2])
                    - at(p1[0] - p2[0], p1[1] - p2[1], p1[2] - p2[2])
                    - at(-p1[0] + p2[0], -p1[1] + p2[1], -p1[2] + p2[2])
                    + at(-p1[0] - p2[0], -p1[1] - p2[1], -p1[2] - p2[2]))
            };
            num += second * second;

            let d_plus = (at(p1[0], p1[1], p1[2]) - at(0, 0, 0)).abs();
            let d_minus = (at(0, 0, 0) - at(-p1[0], -p1[1], -p1[2])).abs();
            let smooth = filter
                * (at(p1[0], p1[1], p1[2]).abs()
                    + 2.0 * at(0, 0, 0).abs()
                    + at(-p1[0], -p1[1], -p1[2]).abs());
            let term = d_plus + d_minus + smooth;
            den += term * term;
        }
    }

    (num / (den + soften)).sqrt() > threshold
}

/// Fine-to-coarse sweep flagging the extra coarse patches needed so every
/// flagged or refined patch has all 26 same-level neighbors (proper
/// nesting, invariant 1).
pub fn enforce_nesting(forest: &mut Forest) {
    for lv in (1..forest.nlevel).rev() {
        let width = forest.patch_width(lv);
        let father_width = forest.patch_width(lv - 1);
        let n = forest.levels[lv].npatch();
        let mut to_flag: Vec<usize> = Vec::new();

        for pid in 0..n {
            let p = &forest.levels[lv].patches[pid];
            if !p.flag && p.son == NONE {
                continue;
            }
            for (d, offset) in SIB_OFFSETS.iter().enumerate() {
                if p.sibling[d] != NONE {
                    continue;
                }
                let raw = [
                    p.corner[0] + offset[0] * width,
                    p.corner[1] + offset[1] * width,
                    p.corner[2] + offset[2] * width,
                ];
                let pos = match forest.resolve_corner(raw) {
                    Some(pos) => pos,
                    None => continue,
                };
                let fc = [
                    pos[0].div_euclid(father_width) * father_width,
                    pos[1].div_euclid(father_width) * father_width,
                    pos[2].div_euclid(father_width) * father_width,
                ];
                let coarse = forest.levels[lv - 1]
                    .find(fc)
                    .expect("proper nesting violated below a flagged patch");
                to_flag.push(coarse);
            }
        }

        for pid in to_flag {
            forest.levels[lv - 1].patches[pid].flag = true;
        }
    }
}

/// Whether the octant below `pid` may be destroyed without violating the
/// nesting of a refined neighbor octant.
fn octant_removable(forest: &Forest, lv: usize, pid: usize) -> bool {
    let p = &forest.levels[lv].patches[pid];
    let son0 = p.son;
    if son0 == NONE {
        return false;
    }
    let son0 = son0 as usize;

    // children must all be leaves
    for local in 0..8 {
        if forest.levels[lv + 1].patches[son0 + local].son != NONE {
            return false;
        }
    }

    // no refined patch at lv+1 may list one of the children as a neighbor
    for d in 0..26 {
        let q = p.sibling[d];
        if q < 0 {
            continue;
        }
        let q_son = forest.levels[lv].patches[q as usize].son;
        if q_son == NONE {
            continue;
        }
        for local in 0..8 {
            let c = &forest.levels[lv + 1].patches[q_son as usize + local];
            if c.son == NONE {
                continue;
            }
            if c
                .sibling
                .iter()
                .any(|s| *s >= son0 as i32 && (*s as usize) < son0 + 8)
            {
                return false;
            }
        }
    }
    true
}

/// Create and destroy octants at level `lv + 1` according to the flags at
/// level `lv`. Data of new children is interpolated from the father (both
/// sandglass slots); data of dying children is restricted into the father
/// first. Links and flux records of the touched levels are rebuilt.
pub fn refine_level(forest: &mut Forest, lv: usize, sg: usize, interp: InterpScheme) {
    if lv + 1 >= forest.nlevel {
        return;
    }

    // destroy de-flagged octants (children first, restriction preserves
    // the conserved sums)
    let n = forest.levels[lv].npatch();
    let mut to_destroy: Vec<usize> = (0..n)
        .filter(|&pid| {
            let p = &forest.levels[lv].patches[pid];
            !p.flag && p.son != NONE && octant_removable(forest, lv, pid)
        })
        .collect();

    if !to_destroy.is_empty() {
        restrict_level(forest, lv, sg, sg);
        // free from the back so earlier bases stay valid under swap-removal
        to_destroy.sort_by_key(|pid| std::cmp::Reverse(forest.levels[lv].patches[*pid].son));
        for pid in to_destroy {
            let base = forest.levels[lv].patches[pid].son as usize;
            forest.free_octant(lv + 1, base);
        }
        forest.rebuild_links(lv + 1);
        if lv + 2 < forest.nlevel {
            forest.rebuild_links(lv + 2);
        }
    }

    // create flagged octants
    let to_create: Vec<usize> = (0..forest.levels[lv].npatch())
        .filter(|&pid| {
            let p = &forest.levels[lv].patches[pid];
            p.flag && p.son == NONE
        })
        .collect();

    if !to_create.is_empty() {
        for pid in to_create {
            let fine = interpolate_octant_data(forest, lv, pid, sg, interp);
            let base = forest.allocate_octant(lv, pid);
            write_octant_data(forest, lv + 1, base, &fine);
        }
        forest.rebuild_links(lv + 1);
    }

    forest.rebuild_links(lv);
    super::fixup::allocate_flux_records(forest, lv);
    super::fixup::allocate_flux_records(forest, lv + 1);
    if lv + 2 < forest.nlevel {
        super::fixup::allocate_flux_records(forest, lv + 2);
    }
}

/// Interpolate the would-be children data of a patch: a `PS2^3` box per
/// component, built from the father and its neighbor ring by the configured
/// scheme. The wave model re-scales (re, im) so the modulus matches the
/// interpolated density.
fn interpolate_octant_data(
    forest: &Forest,
    lv: usize,
    pid: usize,
    sg: usize,
    interp: InterpScheme,
) -> Vec<Real> {
    let pad = interp.pad();
    let nc = PS1 + 2 * pad;
    let nc3 = nc * nc * nc;
    let ncomp = forest.model.ncomp();

    let gctx = GhostContext::same_time(forest, lv, sg, interp);
    let tile = gctx.prepare_patch_tile(pid, pad);

    let mut fine = vec![0.0; ncomp * PS2 * PS2 * PS2];
    for v in 0..ncomp {
        let refined = refine_box(&tile[v * nc3..(v + 1) * nc3], nc, interp);
        fine[v * PS2 * PS2 * PS2..(v + 1) * PS2 * PS2 * PS2].copy_from_slice(&refined);
    }

    if forest.model == Model::Elbdm {
        let n3 = PS2 * PS2 * PS2;
        for c in 0..n3 {
            let rho = fine[DENS * n3 + c];
            let re = fine[WAVE_REAL * n3 + c];
            let im = fine[WAVE_IMAG * n3 + c];
            let wrong = re * re + im * im;
            if wrong > 0.0 && rho > 0.0 {
                let rescale = (rho / wrong).sqrt();
                fine[WAVE_REAL * n3 + c] = re * rescale;
                fine[WAVE_IMAG * n3 + c] = im * rescale;
            }
        }
    }
    fine
}

/// Distribute a `PS2^3` interpolated box over the 8 children of an octant,
/// filling both sandglass slots (the children are born time-aligned).
fn write_octant_data(forest: &mut Forest, lv: usize, base: usize, fine: &[Real]) {
    let ncomp = forest.model.ncomp();
    let n3 = PS2 * PS2 * PS2;

    for local in 0..8 {
        let i0 = (local & 1) * PS1;
        let j0 = ((local >> 1) & 1) * PS1;
        let k0 = ((local >> 2) & 1) * PS1;
        let patch = &mut forest.levels[lv].patches[base + local];

        for v in 0..ncomp {
            for k in 0..PS1 {
                for j in 0..PS1 {
                    for i in 0..PS1 {
                        let x = fine[v * n3 + ((k + k0) * PS2 + (j + j0)) * PS2 + (i + i0)];
                        patch.data[0].set_fluid(v, i, j, k, x);
                        patch.data[1].set_fluid(v, i, j, k, x);
                    }
                }
            }
        }
    }
}

/// One complete refinement cycle over the whole forest: flag every level,
/// enforce nesting, then rebuild the octants coarse-to-fine.
pub fn refine_full_pass(forest: &mut Forest, ctx: &FlagContext, sgs: &[usize]) {
    for lv in 0..forest.nlevel - 1 {
        flag_level(forest, ctx, lv, sgs[lv]);
    }
    enforce_nesting(forest);
    for lv in 0..forest.nlevel - 1 {
        refine_level(forest, lv, sgs[lv], ctx.interp);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mesh::{Boundary, Forest};

    fn forest_4x() -> Forest {
        let mut forest = Forest::new(
            Model::Hydro,
            false,
            Boundary::Periodic,
            3,
            [2 * PS2, 2 * PS2, 2 * PS2],
        )
        .unwrap();
        forest.init_base_grid();
        forest.fill_level(0, 0, |_| vec![1.0, 0.0, 0.0, 0.0, 2.5]);
        forest
    }

    fn tables_rho(threshold: Real) -> FlagTables {
        FlagTables {
            rho: Some(vec![threshold; 9]),
            ..Default::default()
        }
    }

    fn flag_ctx<'a>(tables: &'a FlagTables) -> FlagContext<'a> {
        FlagContext {
            tables,
            gamma: 1.4,
            flag_buffer: 2,
            interp: InterpScheme::MinMod,
            user: None,
            dh0: 1.0,
        }
    }

    #[test]
    fn uniform_field_below_threshold_never_refines() {
        let mut forest = forest_4x();
        let tables = tables_rho(10.0);
        refine_full_pass(&mut forest, &flag_ctx(&tables), &[0, 0, 0]);
        assert_eq!(forest.levels[1].npatch(), 0);
        forest.audit().unwrap();
    }

    #[test]
    fn density_spike_refines_and_nests() {
        let mut forest = forest_4x();
        // a spike inside one patch
        let corner = forest.levels[0].patches[10].corner;
        forest.levels[0].patches[10].data[0].set_fluid(DENS, 4, 4, 4, 100.0);
        let tables = tables_rho(10.0);
        refine_full_pass(&mut forest, &flag_ctx(&tables), &[0, 0, 0]);

        assert!(forest.levels[1].npatch() >= 8);
        forest.audit().unwrap();

        // the refined octant covers the spike
        let width = forest.patch_width(1);
        let covered = forest.levels[1]
            .patches
            .iter()
            .any(|p| p.corner == corner);
        assert!(covered, "no child at the flagged corner, width {}", width);
    }

    #[test]
    fn interpolated_children_preserve_the_parent_average() {
        let mut forest = forest_4x();
        forest.fill_level(0, 0, |pos| {
            vec![1.0 + 0.01 * pos[0] as Real, 0.1, 0.0, 0.0, 2.5]
        });
        let parent_sum: Real = {
            let d = &forest.levels[0].patches[10].data[0];
            d.fluid[..PS1 * PS1 * PS1].iter().sum()
        };

        forest.levels[0].patches[10].flag = true;
        refine_level(&mut forest, 0, 0, InterpScheme::MinMod);

        let base = forest.levels[0].patches[10].son as usize;
        let child_sum: Real = (0..8)
            .map(|l| -> Real {
                forest.levels[1].patches[base + l].data[0].fluid[..PS1 * PS1 * PS1]
                    .iter()
                    .sum()
            })
            .sum();
        assert!((child_sum - 8.0 * parent_sum).abs() < 1e-9 * parent_sum.abs());
    }

    #[test]
    fn deflagging_collapses_the_tree_back() {
        let mut forest = forest_4x();
        forest.fill_level(0, 0, |_| vec![1.0, 0.0, 0.0, 0.0, 2.5]);
        let reference: Vec<Real> = forest.levels[0].patches[10].data[0].fluid.clone();

        forest.levels[0].patches[10].flag = true;
        refine_level(&mut forest, 0, 0, InterpScheme::MinMod);
        assert_eq!(forest.levels[1].npatch(), 8);

        // next pass with no flags: children restrict back into the parent
        let tables = tables_rho(10.0);
        refine_full_pass(&mut forest, &flag_ctx(&tables), &[0, 0, 0]);
        assert_eq!(forest.levels[1].npatch(), 0);

        let after = &forest.levels[0].patches[10].data[0].fluid;
        for (a, b) in reference.iter().zip(after) {
            assert!((a - b).abs() < 1e-12);
        }
        forest.audit().unwrap();
    }

    #[test]
    fn nesting_flags_coarse_neighbors_of_fine_flags() {
        let mut forest = forest_4x();
        // refine one octant, then flag one of its children
        forest.levels[0].patches[10].flag = true;
        refine_level(&mut forest, 0, 0, InterpScheme::MinMod);

        let base = forest.levels[0].patches[10].son as usize;
        forest.levels[1].patches[base].flag = true;
        enforce_nesting(&mut forest);

        // the child at the octant corner needs neighbors outside its own
        // octant, so coarse patches around patch 10 must now be flagged
        let flagged: usize = forest.levels[0].patches.iter().filter(|p| p.flag).count();
        assert!(flagged > 0);

        for lv in 0..forest.nlevel - 1 {
            refine_level(&mut forest, lv, 0, InterpScheme::MinMod);
        }
        forest.audit().unwrap();
    }
}
