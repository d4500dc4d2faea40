//! Coarse/fine flux bookkeeping. Coarse patches bordering a refined region
//! carry a flux record per boundary face; the coarse solve stores its own
//! interface flux there, the fine octant accumulates the area-averaged fine
//! fluxes, and the fix-up replaces the coarse update across the face by the
//! fine one, restoring conservation across the level interface.

use super::{mirror_sibling, Forest, FluxFace, NONE};
use crate::solvers::{FluxPlanes, PlaneSide};
use crate::{Real, PS1, PS2};

/// (Re)allocate the flux records of one level so a record exists exactly on
/// every coarse/fine boundary face (a leaf patch whose face neighbor is
/// refined). Call after every refinement pass.
pub fn allocate_flux_records(forest: &mut Forest, lv: usize) {
    let ncomp = forest.model.ncomp();
    let n = forest.levels[lv].npatch();

    for pid in 0..n {
        for f in 0..6 {
            let needed = {
                let p = &forest.levels[lv].patches[pid];
                p.son == NONE
                    && p.sibling[f] >= 0
                    && forest.levels[lv].patches[p.sibling[f] as usize].son != NONE
            };
            let slot = &mut forest.levels[lv].patches[pid].flux[f];
            match (needed, slot.is_some()) {
                (true, false) => *slot = Some(FluxFace::new(ncomp)),
                (false, true) => *slot = None,
                _ => {}
            }
        }
    }
}

/// Side of the group planes a patch face maps to, given the patch's octant
/// offset along the face axis.
fn plane_side(face: usize, offset: usize) -> PlaneSide {
    match (face % 2, offset) {
        (0, 0) => PlaneSide::Minus,
        (0, _) => PlaneSide::Center,
        (_, 0) => PlaneSide::Center,
        (_, _) => PlaneSide::Plus,
    }
}

/// Distribute the flux planes of a solved patch group at level `lv`:
///
/// * every member patch with a flux record copies its own face flux into
///   the record's coarse slot (this group is the coarse side there);
/// * the six outer planes accumulate, area-averaged and scaled by `weight`,
///   into the fine slots of the level-`lv - 1` neighbors across the group
///   boundary (this group is the fine side there). In individual time-step
///   mode each of the two half-steps contributes `weight = 0.5`.
pub fn store_group_fluxes(
    forest: &mut Forest,
    lv: usize,
    base: usize,
    planes: &FluxPlanes,
    weight: Real,
) {
    let ncomp = forest.model.ncomp().min(5);

    // coarse side: own faces
    for local in 0..8 {
        let offs = [local & 1, (local >> 1) & 1, (local >> 2) & 1];
        for f in 0..6 {
            let d = f / 2;
            let (a1, a2) = ((d + 1) % 3, (d + 2) % 3);
            let side = plane_side(f, offs[d]);

            let patch = &mut forest.levels[lv].patches[base + local];
            if let Some(record) = patch.flux[f].as_mut() {
                for v in 0..ncomp {
                    for c2 in 0..PS1 {
                        for c1 in 0..PS1 {
                            let t1 = offs[a1] * PS1 + c1;
                            let t2 = offs[a2] * PS1 + c2;
                            record.coarse[(v * PS1 + c2) * PS1 + c1] =
                                planes.get(d, side, v, t1, t2);
                        }
                    }
                }
            }
        }
    }

    // fine side: accumulate into the coarse neighbors across the group
    // boundary
    if lv == 0 {
        return;
    }
    let father = forest.levels[lv].patches[base].father;
    debug_assert!(father >= 0);

    for f in 0..6 {
        let d = f / 2;
        let side = if f % 2 == 0 {
            PlaneSide::Minus
        } else {
            PlaneSide::Plus
        };
        let neighbor = forest.levels[lv - 1].patches[father as usize].sibling[f];
        if neighbor < 0 {
            continue;
        }
        let neighbor = neighbor as usize;
        if let Some(record) = forest.levels[lv - 1].patches[neighbor].flux[mirror_sibling(f)].as_mut()
        {
            for v in 0..ncomp {
                for c2 in 0..PS1 {
                    for c1 in 0..PS1 {
                        let mut sum = 0.0;
                        for d2 in 0..2 {
                            for d1 in 0..2 {
                                sum += planes.get(d, side, v, 2 * c1 + d1, 2 * c2 + d2);
                            }
                        }
                        record.fine[(v * PS1 + c2) * PS1 + c1] += weight * 0.25 * sum;
                    }
                }
            }
        }
    }
}

/// Apply the flux fix-up on level `lv`: for every recorded face, correct
/// the adjacent row of coarse cells by `-+ dt/dh * (<F_fine> - F_coarse)`
/// and clear the record for the next step.
pub fn fix_up_level(forest: &mut Forest, lv: usize, sg: usize, dt: Real, dh: Real) {
    let ncomp = forest.model.ncomp().min(5);
    let dt_dh = dt / dh;

    for patch in forest.levels[lv].patches.iter_mut() {
        for f in 0..6 {
            let d = f / 2;
            let (a1, a2) = ((d + 1) % 3, (d + 2) % 3);
            let sign = if f % 2 == 0 { 1.0 } else { -1.0 };
            let layer = if f % 2 == 0 { 0 } else { PS1 - 1 };

            if let Some(record) = patch.flux[f].as_mut() {
                for v in 0..ncomp {
                    for c2 in 0..PS1 {
                        for c1 in 0..PS1 {
                            let df = record.fine[(v * PS1 + c2) * PS1 + c1]
                                - record.coarse[(v * PS1 + c2) * PS1 + c1];
                            let mut cell = [0usize; 3];
                            cell[d] = layer;
                            cell[a1] = c1;
                            cell[a2] = c2;
                            let old = patch.data[sg].fluid_at(v, cell[0], cell[1], cell[2]);
                            patch.data[sg].set_fluid(
                                v,
                                cell[0],
                                cell[1],
                                cell[2],
                                old + sign * dt_dh * df,
                            );
                        }
                    }
                }
                record.clear();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mesh::{Boundary, Forest, Model};

    fn refined_forest() -> Forest {
        let mut forest =
            Forest::new(Model::Hydro, false, Boundary::Periodic, 2, [PS2, PS2, PS2]).unwrap();
        forest.init_base_grid();
        forest.allocate_octant(0, 0);
        forest.rebuild_links(0);
        forest.rebuild_links(1);
        allocate_flux_records(&mut forest, 0);
        forest
    }

    #[test]
    fn records_appear_on_coarse_fine_faces_only() {
        let forest = refined_forest();
        forest.audit().unwrap();

        // with one octant refined in a 2^3-patch periodic base grid, every
        // other base patch touches the refined one on some face
        let total: usize = forest.levels[0]
            .patches
            .iter()
            .map(|p| p.flux.iter().filter(|f| f.is_some()).count())
            .sum();
        assert_eq!(total, 6);
    }

    #[test]
    fn fix_up_replaces_coarse_flux_by_fine_average() {
        let mut forest = refined_forest();

        // solve a fake fine group: uniform unit mass flux through the
        // group's -x plane
        let mut planes = FluxPlanes::new();
        for c2 in 0..PS2 {
            for c1 in 0..PS2 {
                planes.set(0, PlaneSide::Minus, 0, c1, c2, 1.0);
            }
        }
        store_group_fluxes(&mut forest, 1, 0, &planes, 1.0);

        // the -x neighbor of the refined patch is base patch 1 (periodic
        // wrap), which must hold the accumulated fine flux on its +x face
        let neighbor = forest.levels[0].patches[0].sibling[0] as usize;
        {
            let record = forest.levels[0].patches[neighbor].flux[1].as_ref().unwrap();
            for c in 0..PS1 * PS1 {
                assert!((record.fine[c] - 1.0).abs() < 1e-12);
            }
        }

        // fix-up: with zero coarse flux recorded, the +x cell layer of the
        // neighbor loses dt/dh of mass per cell
        let dt = 0.01;
        let dh = 0.5;
        fix_up_level(&mut forest, 0, 0, dt, dh);
        let data = &forest.levels[0].patches[neighbor].data[0];
        for k in 0..PS1 {
            for j in 0..PS1 {
                let rho = data.fluid_at(0, PS1 - 1, j, k);
                assert!((rho + dt / dh).abs() < 1e-12);
                assert_eq!(data.fluid_at(0, 0, j, k), 0.0);
            }
        }

        // records are cleared afterwards
        let record = forest.levels[0].patches[neighbor].flux[1].as_ref().unwrap();
        assert!(record.fine.iter().all(|x| *x == 0.0));
    }
}
