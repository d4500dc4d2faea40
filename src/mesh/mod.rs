pub mod fixup;
pub mod ghost;
pub mod interp;
pub mod refine;
pub mod restrict;

use std::collections::HashMap;

use crate::{config_error, error::Error, Real, PS1, PS2};

/// Field content of the simulation: compressible hydrodynamics or the
/// wave-function dark-matter model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Model {
    Hydro,
    Elbdm,
}

impl Model {
    /// Number of conserved components: (density, momenta, energy) for
    /// hydro; (density, real, imag) for the wave model.
    pub fn ncomp(&self) -> usize {
        match self {
            Model::Hydro => 5,
            Model::Elbdm => 3,
        }
    }
}

/// Outer-domain boundary condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    Periodic,
    Outflow,
    Reflecting,
}

/// Sentinel for an absent patch relation.
pub const NONE: i32 = -1;

/// Sibling slot value for a neighbor position outside a non-periodic
/// domain; encodes the direction it points to.
pub fn boundary_code(d: usize) -> i32 {
    -2 - d as i32
}

pub fn is_boundary_code(s: i32) -> bool {
    s <= -2
}

/// Offsets of the 26 neighbor positions, in patch widths. The first six are
/// the faces in (-x,+x,-y,+y,-z,+z) order, then the twelve edges, then the
/// eight corners.
pub const SIB_OFFSETS: [[i32; 3]; 26] = [
    [-1, 0, 0],
    [1, 0, 0],
    [0, -1, 0],
    [0, 1, 0],
    [0, 0, -1],
    [0, 0, 1],
    [-1, -1, 0],
    [1, -1, 0],
    [-1, 1, 0],
    [1, 1, 0],
    [-1, 0, -1],
    [1, 0, -1],
    [-1, 0, 1],
    [1, 0, 1],
    [0, -1, -1],
    [0, 1, -1],
    [0, -1, 1],
    [0, 1, 1],
    [-1, -1, -1],
    [1, -1, -1],
    [-1, 1, -1],
    [1, 1, -1],
    [-1, -1, 1],
    [1, -1, 1],
    [-1, 1, 1],
    [1, 1, 1],
];

/// Index of the opposite sibling direction.
pub fn mirror_sibling(d: usize) -> usize {
    let m = [
        -SIB_OFFSETS[d][0],
        -SIB_OFFSETS[d][1],
        -SIB_OFFSETS[d][2],
    ];
    SIB_OFFSETS
        .iter()
        .position(|o| o[0] == m[0] && o[1] == m[1] && o[2] == m[2])
        .unwrap()
}

/// One sandglass slot of field data on a patch: the conserved fluid
/// components (variable-major, `ncomp * PS1^3`) and optionally the
/// gravitational potential.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct PatchData {
    pub fluid: Vec<Real>,
    pub pot: Option<Vec<Real>>,
}

impl PatchData {
    pub fn new(ncomp: usize, gravity: bool) -> Self {
        Self {
            fluid: vec![0.0; ncomp * PS1 * PS1 * PS1],
            pot: if gravity {
                Some(vec![0.0; PS1 * PS1 * PS1])
            } else {
                None
            },
        }
    }

    #[inline]
    pub fn fluid_at(&self, v: usize, i: usize, j: usize, k: usize) -> Real {
        self.fluid[v * PS1 * PS1 * PS1 + (k * PS1 + j) * PS1 + i]
    }

    #[inline]
    pub fn set_fluid(&mut self, v: usize, i: usize, j: usize, k: usize, x: Real) {
        self.fluid[v * PS1 * PS1 * PS1 + (k * PS1 + j) * PS1 + i] = x;
    }
}

/// Face-area flux record kept on coarse patches at coarse/fine boundaries.
/// The owning (coarse) solver writes `coarse`; the fine octant across the
/// face accumulates the area-averaged fine fluxes into `fine`; the fix-up
/// consumes the difference and clears the record.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct FluxFace {
    pub coarse: Vec<Real>,
    pub fine: Vec<Real>,
}

impl FluxFace {
    pub fn new(ncomp: usize) -> Self {
        Self {
            coarse: vec![0.0; ncomp * PS1 * PS1],
            fine: vec![0.0; ncomp * PS1 * PS1],
        }
    }

    pub fn clear(&mut self) {
        self.coarse.iter_mut().for_each(|x| *x = 0.0);
        self.fine.iter_mut().for_each(|x| *x = 0.0);
    }
}

/// A cubic block of `PS1^3` cells: the unit of refinement, scheduling, and
/// storage. All relations are indices into the per-level patch vectors
/// (never pointers), so they survive restart and redistribution.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Patch {
    /// Position of the low corner, in finest-level cell units.
    pub corner: [i32; 3],
    /// Index of the father patch on the level below, `NONE` at level 0.
    pub father: i32,
    /// Base index of the 8-child octant on the level above, `NONE` for a
    /// leaf.
    pub son: i32,
    /// The 26 neighbor patches at the same level. `NONE` means the region
    /// is only covered at a coarser level; codes below `NONE` mark domain
    /// boundaries.
    pub sibling: [i32; 26],
    /// Refinement flag, rebuilt every flagging pass.
    pub flag: bool,
    /// Two time slots ("sandglasses") of field data, so a solver can read
    /// one while writing the other.
    pub data: [PatchData; 2],
    /// Flux records per face, allocated exactly on coarse/fine boundary
    /// faces.
    pub flux: [Option<FluxFace>; 6],
}

impl Patch {
    pub fn new(corner: [i32; 3], father: i32, ncomp: usize, gravity: bool) -> Self {
        Self {
            corner,
            father,
            son: NONE,
            sibling: [NONE; 26],
            flag: false,
            data: [PatchData::new(ncomp, gravity), PatchData::new(ncomp, gravity)],
            flux: Default::default(),
        }
    }

    /// Octant slot of this patch below its father (bit 0 = x, 1 = y,
    /// 2 = z), derived from the corner parity at the given patch width.
    pub fn local_id(&self, width: i32) -> usize {
        let mut id = 0;
        for d in 0..3 {
            if self.corner[d].rem_euclid(2 * width) != 0 {
                id |= 1 << d;
            }
        }
        id
    }
}

/// All patches of one refinement level plus the corner index used to
/// resolve relations.
#[derive(Clone, Default, Debug, serde::Serialize, serde::Deserialize)]
pub struct Level {
    pub patches: Vec<Patch>,
    #[serde(skip)]
    corner_map: HashMap<[i32; 3], usize>,
}

impl Level {
    pub fn npatch(&self) -> usize {
        self.patches.len()
    }

    pub fn n_leaves(&self) -> usize {
        self.patches.iter().filter(|p| p.son == NONE).count()
    }

    pub fn find(&self, corner: [i32; 3]) -> Option<usize> {
        self.corner_map.get(&corner).copied()
    }

    pub fn rebuild_corner_map(&mut self) {
        self.corner_map = self
            .patches
            .iter()
            .enumerate()
            .map(|(n, p)| (p.corner, n))
            .collect();
    }
}

/// The patch forest: a vector of levels, each holding its patches. Level 0
/// covers the whole domain; every further level doubles the resolution.
#[derive(Debug)]
pub struct Forest {
    pub model: Model,
    pub gravity: bool,
    pub boundary: Boundary,
    pub nlevel: usize,
    pub nx0: [usize; 3],
    pub levels: Vec<Level>,
}

impl Forest {
    pub fn new(
        model: Model,
        gravity: bool,
        boundary: Boundary,
        nlevel: usize,
        nx0: [usize; 3],
    ) -> Result<Self, Error> {
        for d in 0..3 {
            if nx0[d] == 0 || nx0[d] % PS2 != 0 {
                return Err(config_error!(
                    "base resolution nx0[{}] = {} must be a positive multiple of {}",
                    d,
                    nx0[d],
                    PS2
                ));
            }
        }
        if nlevel == 0 || nlevel > 10 {
            return Err(config_error!("level count {} out of range 1..=10", nlevel));
        }
        Ok(Self {
            model,
            gravity,
            boundary,
            nlevel,
            nx0,
            levels: vec![Level::default(); nlevel],
        })
    }

    /// Finest-level cells per cell of level `lv`.
    pub fn scale(&self, lv: usize) -> i32 {
        1 << (self.nlevel - 1 - lv)
    }

    /// Patch width at level `lv` in finest-level cell units.
    pub fn patch_width(&self, lv: usize) -> i32 {
        PS1 as i32 * self.scale(lv)
    }

    /// Domain extent along axis `d` in finest-level cell units.
    pub fn domain_span(&self, d: usize) -> i32 {
        self.nx0[d] as i32 * (1 << (self.nlevel - 1))
    }

    /// Wrap a corner into the periodic domain, or report it outside.
    pub fn resolve_corner(&self, corner: [i32; 3]) -> Option<[i32; 3]> {
        let mut c = corner;
        for d in 0..3 {
            let span = self.domain_span(d);
            if self.boundary == Boundary::Periodic {
                c[d] = c[d].rem_euclid(span);
            } else if c[d] < 0 || c[d] >= span {
                return None;
            }
        }
        Some(c)
    }

    /// Allocate the 8-child octant of `father` and return the base child
    /// index. Data is left zeroed; the caller fills it and rewires links.
    pub fn allocate_octant(&mut self, lv: usize, father: usize) -> usize {
        let child_width = self.patch_width(lv + 1);
        let corner = self.levels[lv].patches[father].corner;
        let base = self.levels[lv + 1].patches.len();
        let ncomp = self.model.ncomp();

        for local in 0..8 {
            let c = [
                corner[0] + ((local & 1) as i32) * child_width,
                corner[1] + (((local >> 1) & 1) as i32) * child_width,
                corner[2] + (((local >> 2) & 1) as i32) * child_width,
            ];
            self.levels[lv + 1]
                .patches
                .push(Patch::new(c, father as i32, ncomp, self.gravity));
        }
        self.levels[lv].patches[father].son = base as i32;
        base
    }

    /// Remove the 8-child octant whose base index is `base`, keeping the
    /// remaining patches in complete groups of eight. The displaced last
    /// group's father pointer is patched up; sibling links must be rebuilt
    /// by the caller.
    pub fn free_octant(&mut self, lv: usize, base: usize) {
        debug_assert_eq!(base % 8, 0);
        let father = self.levels[lv].patches[base].father;
        if father >= 0 {
            self.levels[lv - 1].patches[father as usize].son = NONE;
        }

        let len = self.levels[lv].patches.len();
        let last_base = len - 8;
        if base != last_base {
            for n in 0..8 {
                self.levels[lv].patches.swap(base + n, last_base + n);
            }
            let moved_father = self.levels[lv].patches[base].father;
            if moved_father >= 0 {
                self.levels[lv - 1].patches[moved_father as usize].son = base as i32;
            }
        }
        self.levels[lv].patches.truncate(last_base);
    }

    /// Rebuild the corner index, father/son pointers, and sibling links of
    /// one level. Fathers must already exist (proper allocation order).
    pub fn rebuild_links(&mut self, lv: usize) {
        self.levels[lv].rebuild_corner_map();
        let width = self.patch_width(lv);

        // father and son pointers
        if lv > 0 {
            let father_width = self.patch_width(lv - 1);
            let n = self.levels[lv].patches.len();
            for base in (0..n).step_by(8) {
                let c = self.levels[lv].patches[base].corner;
                let fc = [
                    c[0].div_euclid(father_width) * father_width,
                    c[1].div_euclid(father_width) * father_width,
                    c[2].div_euclid(father_width) * father_width,
                ];
                let father = self.levels[lv - 1]
                    .find(fc)
                    .expect("octree inconsistency: child patch without a father");
                for local in 0..8 {
                    self.levels[lv].patches[base + local].father = father as i32;
                }
                self.levels[lv - 1].patches[father].son = base as i32;
            }
        }

        // sibling links
        let n = self.levels[lv].patches.len();
        for pid in 0..n {
            let corner = self.levels[lv].patches[pid].corner;
            let mut sibling = [NONE; 26];
            for (d, offset) in SIB_OFFSETS.iter().enumerate() {
                let raw = [
                    corner[0] + offset[0] * width,
                    corner[1] + offset[1] * width,
                    corner[2] + offset[2] * width,
                ];
                sibling[d] = match self.resolve_corner(raw) {
                    None => boundary_code(d),
                    Some(c) => self.levels[lv].find(c).map(|n| n as i32).unwrap_or(NONE),
                };
            }
            self.levels[lv].patches[pid].sibling = sibling;
        }
    }

    /// Reset all son pointers of a level and re-derive them from the level
    /// above (used after loading a snapshot level by level).
    pub fn relink_all(&mut self) {
        for lv in 0..self.nlevel {
            for p in &mut self.levels[lv].patches {
                p.son = NONE;
            }
        }
        for lv in 0..self.nlevel {
            self.rebuild_links(lv);
        }
    }

    /// Create the complete level-0 patch layer covering the base grid, in
    /// octant groups.
    pub fn init_base_grid(&mut self) {
        let width = self.patch_width(0);
        let ncomp = self.model.ncomp();
        let npx = [
            self.nx0[0] / PS1,
            self.nx0[1] / PS1,
            self.nx0[2] / PS1,
        ];

        for gk in 0..npx[2] / 2 {
            for gj in 0..npx[1] / 2 {
                for gi in 0..npx[0] / 2 {
                    for local in 0..8usize {
                        let c = [
                            (2 * gi + (local & 1)) as i32 * width,
                            (2 * gj + ((local >> 1) & 1)) as i32 * width,
                            (2 * gk + ((local >> 2) & 1)) as i32 * width,
                        ];
                        self.levels[0]
                            .patches
                            .push(Patch::new(c, NONE, ncomp, self.gravity));
                    }
                }
            }
        }
        self.rebuild_links(0);
    }

    /// Fill the fluid data of every patch at one level from a closure over
    /// finest-unit cell corners. Used by initial models and tests.
    pub fn fill_level<F>(&mut self, lv: usize, sg: usize, f: F)
    where
        F: Fn([i32; 3]) -> Vec<Real>,
    {
        let scale = self.scale(lv);
        let ncomp = self.model.ncomp();
        for p in &mut self.levels[lv].patches {
            for k in 0..PS1 {
                for j in 0..PS1 {
                    for i in 0..PS1 {
                        let pos = [
                            p.corner[0] + i as i32 * scale,
                            p.corner[1] + j as i32 * scale,
                            p.corner[2] + k as i32 * scale,
                        ];
                        let u = f(pos);
                        for v in 0..ncomp {
                            p.data[sg].set_fluid(v, i, j, k, u[v]);
                        }
                    }
                }
            }
        }
    }

    /// Sum each conserved component over the leaves of the whole forest,
    /// weighted by cell volume. Finer data wins wherever levels overlap.
    pub fn conserved_sums(&self, sg: &[usize], dh0: Real) -> Vec<Real> {
        let ncomp = self.model.ncomp();
        let mut sums = vec![0.0; ncomp];
        for lv in 0..self.nlevel {
            let dh = dh0 / (1 << lv) as Real;
            let dv = dh * dh * dh;
            for p in &self.levels[lv].patches {
                if p.son != NONE {
                    continue;
                }
                let data = &p.data[sg[lv]];
                for v in 0..ncomp {
                    let base = v * PS1 * PS1 * PS1;
                    let s: Real = data.fluid[base..base + PS1 * PS1 * PS1].iter().sum();
                    sums[v] += s * dv;
                }
            }
        }
        sums
    }

    /// Verify the octree invariants: complete octants, sibling symmetry,
    /// proper nesting, and flux-record placement. Used by the debug
    /// diagnostics and the test suite.
    pub fn audit(&self) -> Result<(), Error> {
        for lv in 0..self.nlevel {
            let level = &self.levels[lv];
            if level.npatch() % 8 != 0 {
                return Err(crate::error::Error::Octree {
                    message: format!("level {} holds {} patches (not octants)", lv, level.npatch()),
                    location: crate::here!(),
                });
            }

            for (pid, p) in level.patches.iter().enumerate() {
                // sibling symmetry
                for d in 0..26 {
                    let s = p.sibling[d];
                    if s >= 0 {
                        let back = level.patches[s as usize].sibling[mirror_sibling(d)];
                        if back != pid as i32 {
                            return Err(crate::error::Error::Octree {
                                message: format!(
                                    "sibling asymmetry at level {} patch {} direction {}",
                                    lv, pid, d
                                ),
                                location: crate::here!(),
                            });
                        }
                    }
                }

                // proper nesting: a refined patch has all its neighbors
                if p.son != NONE {
                    for d in 0..26 {
                        if p.sibling[d] == NONE {
                            return Err(crate::error::Error::Octree {
                                message: format!(
                                    "proper nesting violated at level {} patch {} direction {}",
                                    lv, pid, d
                                ),
                                location: crate::here!(),
                            });
                        }
                    }
                }

                // flux records live exactly on coarse/fine boundary faces
                for f in 0..6 {
                    let fine_across = p.son == NONE
                        && p.sibling[f] >= 0
                        && level.patches[p.sibling[f] as usize].son != NONE;
                    if p.flux[f].is_some() != fine_across {
                        return Err(crate::error::Error::Octree {
                            message: format!(
                                "flux record mismatch at level {} patch {} face {}",
                                lv, pid, f
                            ),
                            location: crate::here!(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    pub fn small_forest() -> Forest {
        let mut forest =
            Forest::new(Model::Hydro, false, Boundary::Periodic, 3, [PS2, PS2, PS2]).unwrap();
        forest.init_base_grid();
        forest
    }

    #[test]
    fn mirror_sibling_is_an_involution() {
        for d in 0..26 {
            assert_eq!(mirror_sibling(mirror_sibling(d)), d);
            for a in 0..3 {
                assert_eq!(SIB_OFFSETS[d][a], -SIB_OFFSETS[mirror_sibling(d)][a]);
            }
        }
    }

    #[test]
    fn base_grid_has_complete_octants_and_symmetric_siblings() {
        let forest = small_forest();
        assert_eq!(forest.levels[0].npatch(), 8);
        forest.audit().unwrap();
    }

    #[test]
    fn periodic_base_grid_has_no_missing_siblings() {
        let forest = small_forest();
        for p in &forest.levels[0].patches {
            for d in 0..26 {
                assert!(p.sibling[d] >= 0);
            }
        }
    }

    #[test]
    fn reflecting_domain_marks_boundaries() {
        let mut forest =
            Forest::new(Model::Hydro, false, Boundary::Reflecting, 2, [PS2, PS2, PS2]).unwrap();
        forest.init_base_grid();
        let p = &forest.levels[0].patches[0]; // corner octant
        assert_eq!(p.sibling[0], boundary_code(0));
        assert!(p.sibling[1] >= 0);
    }

    #[test]
    fn octant_allocation_and_release_round_trip() {
        let mut forest = small_forest();
        let base = forest.allocate_octant(0, 3);
        forest.rebuild_links(1);
        assert_eq!(forest.levels[0].patches[3].son, base as i32);
        assert_eq!(forest.levels[1].npatch(), 8);
        assert_eq!(forest.levels[1].patches[0].father, 3);

        forest.free_octant(1, base);
        forest.rebuild_links(1);
        assert_eq!(forest.levels[0].patches[3].son, NONE);
        assert_eq!(forest.levels[1].npatch(), 0);
        forest.audit().unwrap();
    }

    #[test]
    fn local_id_matches_octant_slot() {
        let mut forest = small_forest();
        forest.allocate_octant(0, 0);
        let w = forest.patch_width(1);
        for local in 0..8 {
            assert_eq!(forest.levels[1].patches[local].local_id(w), local);
        }
    }
}
