use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::hydro::reconstruct::{LrLimiter, ReconParams, ReconScheme, VarMode};
use crate::hydro::riemann::{RiemannSolver, RoeFallback};
use crate::mesh::interp::InterpScheme;
use crate::mesh::refine::FlagTables;
use crate::mesh::{Boundary, Model};
use crate::solvers::{ghost_width, FluScheme, KernelParams, WafLimiter};
use crate::{config_error, Real};

fn default_gamma() -> Real {
    5.0 / 3.0
}
fn default_courant() -> Real {
    0.5
}
fn default_dt_growth() -> Real {
    1.1
}
fn default_minmod() -> Real {
    1.5
}
fn default_ep() -> Real {
    0.5
}
fn default_min_pres() -> Real {
    1e-13
}
fn default_limiter() -> LrLimiter {
    LrLimiter::VanLeer
}
fn default_recon() -> ReconScheme {
    ReconScheme::Plm
}
fn default_waf_limiter() -> WafLimiter {
    WafLimiter::VanLeer
}
fn default_fallback() -> RoeFallback {
    RoeFallback::Hllc
}
fn default_interp() -> InterpScheme {
    InterpScheme::MinMod
}
fn default_flag_buffer() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_end_step() -> i64 {
    i64::MAX
}
fn default_wli() -> Real {
    0.1
}
fn default_output_directory() -> String {
    ".".into()
}
fn default_check_fold() -> usize {
    10
}

/// The immutable run configuration, deserialized from the YAML parameter
/// file at start-up and validated once. Everything mutable lives in
/// `RuntimeState`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    pub model: Model,
    #[serde(default)]
    pub gravity: bool,
    pub boundary: Boundary,

    /// Physical edge length of the (cubic) domain.
    pub box_size: Real,
    /// Base-grid cells per axis; each must be a multiple of two patch
    /// widths so level 0 tiles into octant groups.
    pub nx0: [usize; 3],
    /// Number of refinement levels including the base.
    pub nlevel: usize,

    #[serde(default = "default_gamma")]
    pub gamma: Real,
    #[serde(default = "default_courant")]
    pub courant: Real,
    /// The time step may not grow faster than this ratio per step.
    #[serde(default = "default_dt_growth")]
    pub dt_growth_max: Real,
    /// Advance all levels with one dt instead of the per-level recursion.
    #[serde(default)]
    pub shared_timestep: bool,

    pub scheme: FluScheme,
    pub riemann: RiemannSolver,
    #[serde(default = "default_fallback")]
    pub roe_fallback: RoeFallback,
    #[serde(default = "default_limiter")]
    pub lr_limiter: LrLimiter,
    #[serde(default = "default_minmod")]
    pub minmod_coeff: Real,
    #[serde(default = "default_ep")]
    pub ep_coeff: Real,
    #[serde(default = "default_recon")]
    pub reconstruction: ReconScheme,
    #[serde(default = "default_waf_limiter")]
    pub waf_limiter: WafLimiter,
    #[serde(default = "default_true")]
    pub waf_forward_sweep: bool,

    #[serde(default = "default_true")]
    pub enforce_positive: bool,
    #[serde(default = "default_min_pres")]
    pub min_pres: Real,

    #[serde(default = "default_interp")]
    pub interpolation: InterpScheme,
    #[serde(default = "default_flag_buffer")]
    pub flag_buffer: usize,

    /// Which refinement criteria are enabled; each enabled one loads its
    /// per-level threshold table from `criteria_directory`.
    #[serde(default)]
    pub flag_rho: bool,
    #[serde(default)]
    pub flag_rho_gradient: bool,
    #[serde(default)]
    pub flag_pres_gradient: bool,
    #[serde(default)]
    pub flag_engy_density: bool,
    #[serde(default)]
    pub flag_lohner: bool,
    #[serde(default)]
    pub flag_user: bool,
    #[serde(default = "default_output_directory")]
    pub criteria_directory: String,

    pub end_time: f64,
    #[serde(default = "default_end_step")]
    pub end_step: i64,

    /// Simulation-time interval between snapshots; disabled when absent.
    #[serde(default)]
    pub checkpoint_interval: Option<f64>,
    /// Steps between progress reports and between diagnostic check passes.
    #[serde(default = "default_check_fold")]
    pub fold: usize,

    /// Weighted load-imbalance factor above which a rebalance is
    /// requested.
    #[serde(default = "default_wli")]
    pub wli_max: Real,

    #[serde(default = "default_output_directory")]
    pub output_directory: String,
    #[serde(default)]
    pub num_threads: Option<usize>,
    /// Patch groups per accelerator batch; 0 runs the kernels in-line.
    #[serde(default)]
    pub offload_ngroup: usize,
}

impl Configuration {
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let cfg: Configuration = serde_yaml::from_reader(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.box_size <= 0.0 {
            return Err(config_error!("box_size = {} must be positive", self.box_size));
        }
        if self.gamma <= 1.0 {
            return Err(config_error!("gamma = {} must exceed 1", self.gamma));
        }
        if !(0.0 < self.courant && self.courant < 1.0) {
            return Err(config_error!("courant = {} outside (0, 1)", self.courant));
        }
        if self.nlevel == 0 || self.nlevel > 10 {
            return Err(config_error!("nlevel = {} outside 1..=10", self.nlevel));
        }
        if self.model == Model::Elbdm && self.scheme != FluScheme::Mhm {
            return Err(config_error!(
                "the wave model carries no Godunov solver; scheme must be left at mhm"
            ));
        }
        if self.scheme == FluScheme::Waf && self.reconstruction == ReconScheme::Ppm {
            return Err(config_error!("the WAF scheme performs no reconstruction; use plm"));
        }
        Ok(())
    }

    pub fn max_level(&self) -> usize {
        self.nlevel - 1
    }

    /// Cell width at one level.
    pub fn dh(&self, lv: usize) -> Real {
        self.box_size / (self.nx0[0] * (1 << lv)) as Real
    }

    /// Reconstruction runs in characteristic variables unless self-gravity
    /// couples source terms into the primitive system.
    pub fn var_mode(&self) -> VarMode {
        if self.gravity {
            VarMode::Primitive
        } else {
            VarMode::Characteristic
        }
    }

    pub fn recon_params(&self) -> ReconParams {
        ReconParams {
            limiter: self.lr_limiter,
            minmod_coeff: self.minmod_coeff,
            ep_coeff: self.ep_coeff,
            scheme: self.reconstruction,
            vars: self.var_mode(),
            gamma: self.gamma,
        }
    }

    /// Assemble the shared kernel-parameter block for one level and time
    /// step.
    pub fn kernel_params(&self, dt: Real, dh: Real, store_flux: bool) -> KernelParams {
        KernelParams {
            dt,
            dh,
            min_pres: if self.enforce_positive {
                Some(self.min_pres)
            } else {
                None
            },
            recon: self.recon_params(),
            riemann: self.riemann,
            fallback: self.roe_fallback,
            waf_limiter: self.waf_limiter,
            xyz_forward: self.waf_forward_sweep,
            ghost: ghost_width(self.scheme, self.reconstruction),
            store_flux,
        }
    }

    /// Load the per-level threshold tables of every enabled refinement
    /// criterion from `criteria_directory`.
    pub fn load_flag_tables(&self) -> Result<FlagTables, Error> {
        let dir = PathBuf::from(&self.criteria_directory);
        let rows = self.nlevel.max(2) - 1;
        let mut tables = FlagTables::default();

        if self.flag_rho {
            tables.rho = Some(scalar_table(&dir.join("Input__Flag_Rho"), rows)?);
        }
        if self.flag_rho_gradient {
            tables.rho_gradient = Some(scalar_table(&dir.join("Input__Flag_RhoGradient"), rows)?);
        }
        if self.flag_pres_gradient {
            tables.pres_gradient =
                Some(scalar_table(&dir.join("Input__Flag_PresGradient"), rows)?);
        }
        if self.flag_engy_density {
            let raw = load_table(&dir.join("Input__Flag_EngyDensity"), 2, rows)?;
            tables.engy_density = Some(raw.into_iter().map(|r| [r[0], r[1]]).collect());
        }
        if self.flag_lohner {
            let raw = load_table(&dir.join("Input__Flag_Lohner"), 3, rows)?;
            tables.lohner = Some(raw.into_iter().map(|r| [r[0], r[1], r[2]]).collect());
        }
        if self.flag_user {
            tables.user = Some(scalar_table(&dir.join("Input__Flag_User"), rows)?);
        }
        Ok(tables)
    }
}

fn scalar_table(path: &Path, rows: usize) -> Result<Vec<Real>, Error> {
    Ok(load_table(path, 1, rows)?.into_iter().map(|r| r[0]).collect())
}

/// Read one refinement-criterion table: a header line (skipped), then one
/// row per refinable level holding the level index and `ncols` values.
fn load_table(path: &Path, ncols: usize, rows: usize) -> Result<Vec<Vec<Real>>, Error> {
    let file = File::open(path).map_err(|_| {
        config_error!("refinement criterion table {:?} does not exist", path)
    })?;
    let mut lines = BufReader::new(file).lines();
    lines.next(); // header

    let mut table = Vec::with_capacity(rows);
    for lv in 0..rows {
        let line = lines
            .next()
            .ok_or_else(|| config_error!("{:?}: missing row for level {}", path, lv))??;
        let mut fields = line.split_whitespace();
        let _level: i64 = fields
            .next()
            .ok_or_else(|| config_error!("{:?}: empty row at level {}", path, lv))?
            .parse()
            .map_err(|_| config_error!("{:?}: bad level index at level {}", path, lv))?;

        let mut row = Vec::with_capacity(ncols);
        for c in 0..ncols {
            let v: f64 = fields
                .next()
                .ok_or_else(|| {
                    config_error!("{:?}: missing column {} at level {}", path, c, lv)
                })?
                .parse()
                .map_err(|_| config_error!("{:?}: bad value at level {}", path, lv))?;
            row.push(v as Real);
        }
        table.push(row);
    }
    Ok(table)
}

/// Mutable per-level bookkeeping: the two sandglass times, the slot the
/// current data lives in, and the sub-step counter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LevelState {
    pub time: f64,
    pub time_prev: f64,
    pub flu_sg: usize,
    pub pot_sg: usize,
    pub advance_counter: u32,
}

impl LevelState {
    pub fn new() -> Self {
        Self {
            time: 0.0,
            time_prev: 0.0,
            flu_sg: 0,
            pot_sg: 0,
            advance_counter: 0,
        }
    }

    /// Flip the sandglass and advance this level's clock.
    pub fn advance(&mut self, dt: f64) {
        self.time_prev = self.time;
        self.time += dt;
        self.flu_sg = 1 - self.flu_sg;
        self.advance_counter += 1;
    }
}

impl Default for LevelState {
    fn default() -> Self {
        Self::new()
    }
}

/// The small mutable core of the run: step counter, snapshot counter, and
/// the per-level states.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeState {
    pub step: i64,
    pub dump_id: i32,
    pub last_dt: f64,
    pub levels: Vec<LevelState>,
}

impl RuntimeState {
    pub fn new(nlevel: usize) -> Self {
        Self {
            step: 0,
            dump_id: 0,
            last_dt: 0.0,
            levels: vec![LevelState::new(); nlevel],
        }
    }

    pub fn flu_sgs(&self) -> Vec<usize> {
        self.levels.iter().map(|l| l.flu_sg).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    pub fn test_configuration() -> Configuration {
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
        cfg.validate().unwrap();
        cfg
    }

    #[test]
    fn parameter_file_round_trip() {
        let cfg = test_configuration();
        assert_eq!(cfg.nx0, [16, 16, 16]);
        assert_eq!(cfg.riemann, RiemannSolver::Hllc);
        assert_eq!(cfg.lr_limiter, LrLimiter::VanLeer);
        assert!((cfg.dh(1) - 1.0 / 32.0).abs() < 1e-12);
        // characteristic reconstruction while gravity is off
        assert_eq!(cfg.var_mode(), VarMode::Characteristic);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = "model: hydro\nboundary: periodic\nbox_size: 1.0\nnx0: [16,16,16]\nnlevel: 1\nscheme: mhm\nriemann: roe\nend_time: 1.0\nno_such_option: 3\n";
        assert!(serde_yaml::from_str::<Configuration>(yaml).is_err());
    }

    #[test]
    fn flag_table_parses_daino_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Input__Flag_Lohner");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "# level   threshold   filter   soften").unwrap();
        writeln!(f, "0  0.5  0.01  1e-4").unwrap();
        writeln!(f, "1  0.6  0.01  1e-4").unwrap();
        drop(f);

        let table = load_table(&path, 3, 2).unwrap();
        assert_eq!(table.len(), 2);
        assert!((table[1][0] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn missing_table_is_a_configuration_error() {
        let mut cfg = test_configuration();
        cfg.flag_rho = true;
        cfg.criteria_directory = "/nonexistent".into();
        assert!(cfg.load_flag_tables().is_err());
    }

    #[test]
    fn level_state_sandglass_flips() {
        let mut s = LevelState::new();
        s.advance(0.25);
        assert_eq!(s.flu_sg, 1);
        assert_eq!(s.time, 0.25);
        assert_eq!(s.time_prev, 0.0);
        s.advance(0.25);
        assert_eq!(s.flu_sg, 0);
        assert_eq!(s.advance_counter, 2);
    }
}
