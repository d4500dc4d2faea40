//! Binary snapshot format. The layout is fixed and little-endian: a staged
//! header (format block, options, symbolic constants, run parameters), a
//! check-code repeat guarding against truncation, the simulation info, and
//! the patch tree in level order with data on the leaves. Snapshots written
//! and re-read with the same precision reproduce the tree bit for bit.

use std::convert::TryInto;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::config::{Configuration, RuntimeState};
use crate::error::Error;
use crate::mesh::{Boundary, Forest, Model, Patch, NONE};
use crate::restart_error;
use crate::{Real, PS1};

pub const FORMAT_VERSION: i64 = 2000;
/// Smallest format carrying per-type size stamps; older files are refused
/// rather than trusted about their layout.
pub const OLDEST_SUPPORTED_VERSION: i64 = 1200;
pub const CHECK_CODE: i64 = 0x4f43_544f_464c_5558;

const HEADER_SIZE: i64 = 1024;
const OPTIONS_OFFSET: usize = 256;
const CONSTANTS_OFFSET: usize = 512;
const PARAMETERS_OFFSET: usize = 768;
const TREE_OFFSET: u64 = 2048;

struct Cursor<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at(buf: &'a mut [u8], pos: usize) -> Self {
        Self { buf, pos }
    }
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
    fn i32(&mut self, x: i32) {
        self.put(&x.to_le_bytes());
    }
    fn i64(&mut self, x: i64) {
        self.put(&x.to_le_bytes());
    }
    fn f64(&mut self, x: f64) {
        self.put(&x.to_le_bytes());
    }
    fn u8(&mut self, x: u8) {
        self.put(&[x]);
    }
}

struct Scanner<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }
    fn take(&mut self, n: usize) -> &[u8] {
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        s
    }
    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take(4).try_into().unwrap())
    }
    fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.take(8).try_into().unwrap())
    }
    fn f64(&mut self) -> f64 {
        f64::from_le_bytes(self.take(8).try_into().unwrap())
    }
    fn u8(&mut self) -> u8 {
        self.take(1)[0]
    }
}

fn model_tag(model: Model) -> i32 {
    match model {
        Model::Hydro => 1,
        Model::Elbdm => 2,
    }
}

fn boundary_tag(b: Boundary) -> i32 {
    match b {
        Boundary::Periodic => 1,
        Boundary::Outflow => 2,
        Boundary::Reflecting => 3,
    }
}

fn write_real<W: Write>(w: &mut W, x: Real) -> std::io::Result<()> {
    w.write_all(&x.to_le_bytes())
}

fn read_real<R: Read>(r: &mut R) -> std::io::Result<Real> {
    let mut b = [0u8; std::mem::size_of::<Real>()];
    r.read_exact(&mut b)?;
    Ok(Real::from_le_bytes(b))
}

fn read_i32<R: Read>(r: &mut R) -> std::io::Result<i32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(i32::from_le_bytes(b))
}

/// Write a snapshot of the forest and runtime state.
pub fn save_snapshot(
    path: &Path,
    cfg: &Configuration,
    forest: &Forest,
    state: &RuntimeState,
) -> Result<(), Error> {
    let mut file = BufWriter::new(File::create(path)?);
    let ncomp = forest.model.ncomp();

    // staged header
    let mut header = vec![0u8; TREE_OFFSET as usize];
    {
        let mut c = Cursor::at(&mut header, 0);
        c.i64(FORMAT_VERSION);
        c.i64(HEADER_SIZE);
        c.i64(CHECK_CODE);
        for size in [1i32, 4, 8, std::mem::size_of::<Real>() as i32, 8] {
            c.i32(size);
        }
    }
    {
        let mut c = Cursor::at(&mut header, OPTIONS_OFFSET);
        c.i32(model_tag(forest.model));
        c.u8(forest.gravity as u8);
        c.u8((std::mem::size_of::<Real>() == 8) as u8);
        c.i32(boundary_tag(forest.boundary));
        c.i32(cfg.scheme as i32);
        c.i32(cfg.riemann as i32);
        c.i32(cfg.lr_limiter as i32);
        c.i32(cfg.interpolation as i32);
        c.u8(1); // data order: v,k,j,i
    }
    {
        let mut c = Cursor::at(&mut header, CONSTANTS_OFFSET);
        c.i32(PS1 as i32);
        c.i32(forest.nlevel as i32);
        c.i32(ncomp as i32);
        c.i32(crate::solvers::ghost_width(cfg.scheme, cfg.reconstruction) as i32);
    }
    {
        let mut c = Cursor::at(&mut header, PARAMETERS_OFFSET);
        c.f64(cfg.box_size as f64);
        for d in 0..3 {
            c.i32(forest.nx0[d] as i32);
        }
        c.f64(cfg.gamma as f64);
        c.f64(cfg.courant as f64);
        c.f64(cfg.end_time);
        c.f64(cfg.min_pres as f64);
        for lv in 0..forest.nlevel {
            c.f64(cfg.dh(lv) as f64);
        }
    }
    {
        // check-code repeat and simulation info
        let mut c = Cursor::at(&mut header, HEADER_SIZE as usize);
        c.i64(CHECK_CODE);
        c.i32(state.dump_id);
        for lv in 0..forest.nlevel {
            c.f64(state.levels[lv].time);
        }
        c.i64(state.step);
        for lv in 0..forest.nlevel {
            c.i32(forest.levels[lv].npatch() as i32);
        }
        for lv in 0..forest.nlevel {
            c.i32(forest.levels[lv].n_leaves() as i32);
        }
        for lv in 0..forest.nlevel {
            c.put(&state.levels[lv].advance_counter.to_le_bytes());
        }
        let volume = (cfg.box_size as f64).powi(3);
        let sums = forest.conserved_sums(&state.flu_sgs(), cfg.dh(0));
        c.f64(sums[0] as f64 / volume);
    }
    file.write_all(&header)?;

    // the patch tree, in level order
    for lv in 0..forest.nlevel {
        let sg = state.levels[lv].flu_sg;
        for patch in &forest.levels[lv].patches {
            for d in 0..3 {
                file.write_all(&patch.corner[d].to_le_bytes())?;
            }
            file.write_all(&patch.son.to_le_bytes())?;

            if patch.son == NONE {
                for x in &patch.data[sg].fluid {
                    write_real(&mut file, *x)?;
                }
                if let Some(pot) = &patch.data[sg].pot {
                    for x in pot {
                        write_real(&mut file, *x)?;
                    }
                }
            }
        }
    }

    file.flush()?;
    log::info!("wrote snapshot {:?} (dump id {})", path, state.dump_id);
    Ok(())
}

fn check<T: PartialEq + std::fmt::Debug>(
    name: &str,
    file_value: T,
    runtime: T,
    fatal: bool,
) -> Result<(), Error> {
    if file_value != runtime {
        if fatal {
            return Err(restart_error!(
                "{} mismatch: file has {:?}, runtime has {:?}",
                name,
                file_value,
                runtime
            ));
        }
        log::warn!(
            "restart: {} differs (file {:?}, runtime {:?}); runtime value kept",
            name,
            file_value,
            runtime
        );
    }
    Ok(())
}

/// Load a snapshot, rebuilding the forest and runtime state. The file's
/// structural parameters must match the runtime configuration; solver
/// options may differ and only warn.
pub fn load_snapshot(path: &Path, cfg: &Configuration) -> Result<(Forest, RuntimeState), Error> {
    let mut file = BufReader::new(File::open(path)?);
    let mut header = vec![0u8; TREE_OFFSET as usize];
    file.read_exact(&mut header)?;

    let (format_version, header_size) = {
        let mut s = Scanner::at(&header, 0);
        (s.i64(), s.i64())
    };
    if format_version < OLDEST_SUPPORTED_VERSION {
        return Err(restart_error!(
            "format version {} predates per-type size stamps (oldest supported is {})",
            format_version,
            OLDEST_SUPPORTED_VERSION
        ));
    }
    if header_size != HEADER_SIZE {
        return Err(restart_error!("unexpected header size {}", header_size));
    }

    {
        let mut s = Scanner::at(&header, 16);
        check("check code", s.i64(), CHECK_CODE, true)?;
        check("sizeof(bool)", s.i32(), 1, true)?;
        check("sizeof(int)", s.i32(), 4, true)?;
        check("sizeof(long)", s.i32(), 8, true)?;
        check("sizeof(real)", s.i32(), std::mem::size_of::<Real>() as i32, true)?;
        check("sizeof(double)", s.i32(), 8, true)?;
    }

    let data_order_vkji = {
        let mut s = Scanner::at(&header, OPTIONS_OFFSET);
        check("model", s.i32(), model_tag(cfg.model), true)?;
        check("gravity", s.u8(), cfg.gravity as u8, true)?;
        check(
            "floating precision",
            s.u8(),
            (std::mem::size_of::<Real>() == 8) as u8,
            true,
        )?;
        check("boundary condition", s.i32(), boundary_tag(cfg.boundary), true)?;
        check("fluid scheme", s.i32(), cfg.scheme as i32, false)?;
        check("riemann solver", s.i32(), cfg.riemann as i32, false)?;
        check("slope limiter", s.i32(), cfg.lr_limiter as i32, false)?;
        check("interpolation", s.i32(), cfg.interpolation as i32, false)?;
        s.u8() != 0
    };

    let nlevel = {
        let mut s = Scanner::at(&header, CONSTANTS_OFFSET);
        check("patch size", s.i32(), PS1 as i32, true)?;
        let nlevel = s.i32();
        check("level count", nlevel, cfg.nlevel as i32, true)?;
        check("component count", s.i32(), cfg.model.ncomp() as i32, true)?;
        nlevel as usize
    };

    {
        let mut s = Scanner::at(&header, PARAMETERS_OFFSET);
        let box_size = s.f64();
        if (box_size - cfg.box_size as f64).abs() > 1e-12 * box_size.abs() {
            return Err(restart_error!(
                "domain size mismatch: file has {}, runtime has {}",
                box_size,
                cfg.box_size
            ));
        }
        for d in 0..3 {
            check("base resolution", s.i32(), cfg.nx0[d] as i32, true)?;
        }
        check_f64("gamma", s.f64(), cfg.gamma as f64);
        check_f64("courant factor", s.f64(), cfg.courant as f64);
    }

    // simulation info
    let mut state = RuntimeState::new(nlevel);
    let mut npatch = vec![0usize; nlevel];
    {
        let mut s = Scanner::at(&header, HEADER_SIZE as usize);
        check("trailing check code", s.i64(), CHECK_CODE, true)?;
        state.dump_id = s.i32();
        for lv in 0..nlevel {
            let t = s.f64();
            state.levels[lv].time = t;
            state.levels[lv].time_prev = t;
        }
        state.step = s.i64();
        for n in npatch.iter_mut() {
            *n = s.i32() as usize;
        }
        for _ in 0..nlevel {
            s.i32(); // leaf counts, informational
        }
        for lv in 0..nlevel {
            state.levels[lv].advance_counter =
                u32::from_le_bytes(s.take(4).try_into().unwrap());
        }
    }

    // the patch tree
    let mut forest = Forest::new(cfg.model, cfg.gravity, cfg.boundary, nlevel, cfg.nx0)?;
    let ncomp = cfg.model.ncomp();
    let n3 = PS1 * PS1 * PS1;

    for lv in 0..nlevel {
        for _ in 0..npatch[lv] {
            let corner = [read_i32(&mut file)?, read_i32(&mut file)?, read_i32(&mut file)?];
            let son = read_i32(&mut file)?;
            let mut patch = Patch::new(corner, NONE, ncomp, cfg.gravity);
            patch.son = son;

            if son == NONE {
                if data_order_vkji {
                    for x in patch.data[0].fluid.iter_mut() {
                        *x = read_real(&mut file)?;
                    }
                } else {
                    // legacy order: k,j,i,v
                    for c in 0..n3 {
                        for v in 0..ncomp {
                            patch.data[0].fluid[v * n3 + c] = read_real(&mut file)?;
                        }
                    }
                }
                if let Some(pot) = patch.data[0].pot.as_mut() {
                    for x in pot.iter_mut() {
                        *x = read_real(&mut file)?;
                    }
                }
                patch.data[1] = patch.data[0].clone();
            }
            forest.levels[lv].patches.push(patch);
        }
    }

    // relations are not stored; rebuild them from the corners, then refill
    // internal patches by restriction and re-place the flux records
    forest.relink_all();
    for lv in (0..nlevel.max(1) - 1).rev() {
        crate::mesh::restrict::restrict_level(&mut forest, lv, 0, 0);
    }
    for lv in 0..nlevel {
        crate::mesh::fixup::allocate_flux_records(&mut forest, lv);
    }
    forest.audit().map_err(|e| {
        restart_error!("snapshot tree failed the octree audit: {}", e)
    })?;

    log::info!(
        "loaded snapshot {:?}: step {}, t = {:.6e}",
        path,
        state.step,
        state.levels[0].time
    );
    Ok((forest, state))
}

fn check_f64(name: &str, file_value: f64, runtime: f64) {
    if (file_value - runtime).abs() > 1e-12 * (1.0 + runtime.abs()) {
        log::warn!(
            "restart: {} differs (file {}, runtime {}); runtime value kept",
            name,
            file_value,
            runtime
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mesh::interp::InterpScheme;
    use crate::mesh::refine::refine_level;
    use crate::PS2;

    fn build_run() -> (Configuration, Forest, RuntimeState) {
        let yaml = r#"
model: hydro
boundary: periodic
box_size: 1.0
nx0: [16, 16, 16]
nlevel: 2
gamma: 1.4
courant: 0.4
scheme: mhm_rp
riemann: hllc
end_time: 0.2
"#;
        let cfg: Configuration = serde_yaml::from_str(yaml).unwrap();
        let mut forest =
            Forest::new(cfg.model, cfg.gravity, cfg.boundary, cfg.nlevel, cfg.nx0).unwrap();
        forest.init_base_grid();
        forest.fill_level(0, 0, |pos| {
            vec![
                1.0 + 0.001 * (pos[0] * pos[1]) as Real,
                0.25,
                -0.5,
                0.125,
                2.0 + 0.01 * pos[2] as Real,
            ]
        });
        forest.levels[0].patches[2].flag = true;
        refine_level(&mut forest, 0, 0, InterpScheme::MinMod);

        let mut state = RuntimeState::new(cfg.nlevel);
        state.step = 17;
        state.levels[0].time = 0.125;
        state.levels[1].time = 0.125;
        (cfg, forest, state)
    }

    #[test]
    fn snapshot_round_trips_bit_for_bit() {
        let (cfg, forest, state) = build_run();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("RESTART");

        save_snapshot(&path, &cfg, &forest, &state).unwrap();
        let (loaded, loaded_state) = load_snapshot(&path, &cfg).unwrap();

        assert_eq!(loaded_state.step, 17);
        assert_eq!(loaded_state.levels[0].time, 0.125);

        for lv in 0..cfg.nlevel {
            assert_eq!(loaded.levels[lv].npatch(), forest.levels[lv].npatch());
            for (a, b) in loaded.levels[lv]
                .patches
                .iter()
                .zip(&forest.levels[lv].patches)
            {
                assert_eq!(a.corner, b.corner);
                assert_eq!(a.son, b.son);
                if a.son == NONE {
                    assert_eq!(a.data[0].fluid, b.data[0].fluid);
                }
            }
        }
    }

    #[test]
    fn saving_twice_is_deterministic() {
        let (cfg, forest, state) = build_run();
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("a");
        let p2 = dir.path().join("b");
        save_snapshot(&p1, &cfg, &forest, &state).unwrap();
        save_snapshot(&p2, &cfg, &forest, &state).unwrap();
        assert_eq!(std::fs::read(&p1).unwrap(), std::fs::read(&p2).unwrap());
    }

    #[test]
    fn pre_size_stamp_formats_are_refused() {
        let (cfg, forest, state) = build_run();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("RESTART");
        save_snapshot(&path, &cfg, &forest, &state).unwrap();

        // forge an ancient format version
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0..8].copy_from_slice(&1100i64.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let err = load_snapshot(&path, &cfg).unwrap_err();
        assert!(format!("{}", err).contains("size stamps"));
    }

    #[test]
    fn corrupt_check_code_is_fatal() {
        let (cfg, forest, state) = build_run();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("RESTART");
        save_snapshot(&path, &cfg, &forest, &state).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[16] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        assert!(load_snapshot(&path, &cfg).is_err());
    }

    #[test]
    fn structural_mismatch_is_fatal_but_solver_choice_warns() {
        let (cfg, forest, state) = build_run();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("RESTART");
        save_snapshot(&path, &cfg, &forest, &state).unwrap();

        // a different Riemann solver only warns
        let mut relaxed = cfg.clone();
        relaxed.riemann = crate::hydro::riemann::RiemannSolver::Roe;
        assert!(load_snapshot(&path, &relaxed).is_ok());

        // a different base resolution is fatal
        let mut wrong = cfg.clone();
        wrong.nx0 = [PS2 * 2, PS2, PS2];
        assert!(load_snapshot(&path, &wrong).is_err());
    }
}
