//! The outer integration loop: time-step computation, the shared- or
//! individual-time-step advance over the level hierarchy, coarse/fine
//! coupling (restriction and flux fix-up), the refinement cycle, periodic
//! diagnostics, and termination handling.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::config::{Configuration, RuntimeState};
use crate::error::Error;
use crate::hydro;
use crate::mesh::fixup::{fix_up_level, store_group_fluxes};
use crate::mesh::ghost::GhostContext;
use crate::mesh::refine::{refine_full_pass, FlagContext, FlagTables, UserFlagFn};
use crate::mesh::restrict::restrict_level;
use crate::mesh::{Forest, Model, NONE};
use crate::message::{self, Communicator};
use crate::offload::{FluidBatch, FluidOffload, HostExecutor};
use crate::solvers::{fluid_kernel, FluidKernel, FluxPlanes};
use crate::tasks::Tasks;
use crate::{Real, PS1, PS2};

/// Contract of the gravity collaborator: read the density of one level
/// from the given fluid sandglass, write the potential into the chosen
/// potential slot. The solver itself (FFT, SOR, multigrid) lives outside
/// the crate.
pub trait PoissonSolver: Send {
    fn solve(
        &mut self,
        forest: &mut Forest,
        lv: usize,
        rho_sg: usize,
        pot_sg: usize,
    ) -> Result<(), Error>;
}

/// Contract of the load-balance collaborator: report the weighted
/// load-imbalance factor and redistribute patches when asked. The serial
/// implementation is perfectly balanced by definition.
pub trait LoadBalancer: Send {
    fn weighted_load_imbalance(&self, forest: &Forest) -> Real;
    fn rebalance(&mut self, forest: &mut Forest) -> Result<(), Error>;
}

pub struct SerialBalance;

impl LoadBalancer for SerialBalance {
    fn weighted_load_imbalance(&self, _forest: &Forest) -> Real {
        0.0
    }
    fn rebalance(&mut self, _forest: &mut Forest) -> Result<(), Error> {
        Ok(())
    }
}

/// Per-level time-step hook supplied by problem setups; returns an upper
/// bound on dt or infinity.
pub type UserDtFn = fn(&Configuration, f64) -> f64;

/// The assembled simulation: configuration, forest, runtime state, and the
/// external collaborators behind their seams.
pub struct Simulation {
    pub cfg: Configuration,
    pub forest: Forest,
    pub state: RuntimeState,
    pub tasks: Tasks,
    pub tables: FlagTables,
    comm: Box<dyn Communicator>,
    kernel: FluidKernel,
    poisson: Option<Box<dyn PoissonSolver>>,
    balancer: Box<dyn LoadBalancer>,
    offload: Option<HostExecutor>,
    terminate: Arc<AtomicBool>,
    user_flag: Option<UserFlagFn>,
    user_dt: Option<UserDtFn>,
    reference_sums: Option<Vec<Real>>,
}

impl Simulation {
    /// Build a fresh run from an initial model: a closure from finest-unit
    /// cell corner to the conserved state.
    pub fn new<F>(
        cfg: Configuration,
        comm: Box<dyn Communicator>,
        tables: FlagTables,
        model: F,
    ) -> Result<Self, Error>
    where
        F: Fn([i32; 3]) -> Vec<Real>,
    {
        let mut forest = Forest::new(cfg.model, cfg.gravity, cfg.boundary, cfg.nlevel, cfg.nx0)?;
        forest.init_base_grid();
        forest.fill_level(0, 0, &model);
        // mirror the initial data into the second sandglass so in-time
        // interpolation is well defined before the first step
        forest.fill_level(0, 1, &model);

        let state = RuntimeState::new(cfg.nlevel);
        Ok(Self::assemble(cfg, comm, tables, forest, state))
    }

    /// Resume from a snapshot.
    pub fn from_snapshot(
        cfg: Configuration,
        comm: Box<dyn Communicator>,
        tables: FlagTables,
        path: &Path,
    ) -> Result<Self, Error> {
        let (forest, state) = crate::restart::load_snapshot(path, &cfg)?;
        Ok(Self::assemble(cfg, comm, tables, forest, state))
    }

    fn assemble(
        cfg: Configuration,
        comm: Box<dyn Communicator>,
        tables: FlagTables,
        forest: Forest,
        state: RuntimeState,
    ) -> Self {
        let kernel = fluid_kernel(cfg.scheme);
        let offload = if cfg.offload_ngroup > 0 {
            let queues = cfg.num_threads.unwrap_or(2).max(2);
            Some(HostExecutor::new(kernel, queues, cfg.offload_ngroup))
        } else {
            None
        };
        let mut tasks = Tasks::from_configuration(&cfg);
        tasks.synchronize(state.levels[0].time, state.step);
        Self {
            cfg,
            forest,
            state,
            tasks,
            tables,
            comm,
            kernel,
            poisson: None,
            balancer: Box::new(SerialBalance),
            offload,
            terminate: Arc::new(AtomicBool::new(false)),
            user_flag: None,
            user_dt: None,
            reference_sums: None,
        }
    }

    pub fn with_poisson(mut self, poisson: Box<dyn PoissonSolver>) -> Self {
        self.poisson = Some(poisson);
        self
    }

    pub fn with_balancer(mut self, balancer: Box<dyn LoadBalancer>) -> Self {
        self.balancer = balancer;
        self
    }

    pub fn with_user_flag(mut self, f: UserFlagFn) -> Self {
        self.user_flag = Some(f);
        self
    }

    pub fn with_user_dt(mut self, f: UserDtFn) -> Self {
        self.user_dt = Some(f);
        self
    }

    /// Register SIGINT/SIGTERM into the termination flag checked once per
    /// outer iteration.
    pub fn install_signal_handlers(&self) -> Result<(), Error> {
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&self.terminate))?;
        }
        Ok(())
    }

    pub fn time(&self) -> f64 {
        self.state.levels[0].time
    }

    /// The largest admissible time step at the base level, folded over all
    /// constraints, levels, and ranks.
    pub fn compute_dt(&self) -> f64 {
        let mut dt = f64::INFINITY;

        for lv in 0..self.forest.nlevel {
            if self.forest.levels[lv].npatch() == 0 {
                continue;
            }
            let dh = self.cfg.dh(lv) as f64;
            let sg = self.state.levels[lv].flu_sg;

            let dt_lv = match self.forest.model {
                Model::Hydro => {
                    let vmax = self.max_signal_speed(lv, sg).max(1e-300);
                    self.cfg.courant as f64 * dh / vmax
                }
                // phase advance of the free-particle kinetic term
                Model::Elbdm => self.cfg.courant as f64 * dh * dh,
            };

            let dt_lv = match self.gravity_dt(lv, dh) {
                Some(dt_g) => dt_lv.min(dt_g),
                None => dt_lv,
            };

            // in individual-time-step mode, level lv advances in 2^lv
            // sub-steps of the base step
            let scale = if self.cfg.shared_timestep {
                1.0
            } else {
                (1u64 << lv) as f64
            };
            dt = dt.min(dt_lv * scale);
        }

        if let Some(user) = self.user_dt {
            dt = dt.min(user(&self.cfg, self.time()));
        }
        if self.state.last_dt > 0.0 {
            dt = dt.min(self.state.last_dt * self.cfg.dt_growth_max as f64);
        }
        dt = dt.min(self.cfg.end_time - self.time());

        message::all_reduce_min(self.comm.as_ref(), &[dt as Real])[0] as f64
    }

    fn max_signal_speed(&self, lv: usize, sg: usize) -> f64 {
        let gamma = self.cfg.gamma;
        self.forest.levels[lv]
            .patches
            .par_iter()
            .map(|p| {
                let data = &p.data[sg];
                let n3 = PS1 * PS1 * PS1;
                let mut vmax: Real = 0.0;
                for c in 0..n3 {
                    let u = [
                        data.fluid[c],
                        data.fluid[n3 + c],
                        data.fluid[2 * n3 + c],
                        data.fluid[3 * n3 + c],
                        data.fluid[4 * n3 + c],
                    ];
                    if u[0] > 0.0 {
                        vmax = vmax.max(hydro::max_signal_speed(&u, gamma));
                    }
                }
                vmax as f64
            })
            .reduce(|| 0.0, f64::max)
    }

    /// Free-fall constraint from the potential gradient, when gravity is
    /// active and the potential has been computed.
    fn gravity_dt(&self, lv: usize, dh: f64) -> Option<f64> {
        if !self.cfg.gravity {
            return None;
        }
        let sg = self.state.levels[lv].pot_sg;
        let mut gmax: f64 = 0.0;
        for p in &self.forest.levels[lv].patches {
            let pot = p.data[sg].pot.as_deref()?;
            for k in 0..PS1 {
                for j in 0..PS1 {
                    for i in 0..PS1 {
                        let grad = |c: usize, stride: usize, n: usize| -> f64 {
                            let id = (k * PS1 + j) * PS1 + i;
                            if c == 0 {
                                (pot[id + stride] - pot[id]) as f64
                            } else if c == n - 1 {
                                (pot[id] - pot[id - stride]) as f64
                            } else {
                                0.5 * (pot[id + stride] - pot[id - stride]) as f64
                            }
                        };
                        let gx = grad(i, 1, PS1).abs();
                        let gy = grad(j, PS1, PS1).abs();
                        let gz = grad(k, PS1 * PS1, PS1).abs();
                        gmax = gmax.max(gx.max(gy).max(gz) / dh);
                    }
                }
            }
        }
        if gmax > 0.0 {
            Some(self.cfg.courant as f64 * (dh / gmax).sqrt())
        } else {
            None
        }
    }

    /// Interpolation weights for reading level `lv - 1` data at level
    /// `lv`'s current time.
    fn coarse_time_weights(&self, lv: usize) -> (usize, Real, usize, Real) {
        if lv == 0 {
            return (0, 1.0, 0, 0.0);
        }
        let target = self.state.levels[lv].time;
        let coarse = &self.state.levels[lv - 1];
        let span = coarse.time - coarse.time_prev;
        if span <= 0.0 {
            return (coarse.flu_sg, 1.0, coarse.flu_sg, 0.0);
        }
        let w_new = ((target - coarse.time_prev) / span).clamp(0.0, 1.0) as Real;
        (coarse.flu_sg, w_new, 1 - coarse.flu_sg, 1.0 - w_new)
    }

    /// Advance one level by `dt`: assemble ghost tiles, run the fluid
    /// kernel over every patch group, write the results into the other
    /// sandglass, and hand the boundary fluxes to the fix-up machinery.
    fn solve_level(&mut self, lv: usize, dt: f64, flux_weight: Real) {
        let npatch = self.forest.levels[lv].npatch();
        if npatch == 0 {
            return;
        }

        let sg = self.state.levels[lv].flu_sg;
        let sg_new = 1 - sg;
        let dh = self.cfg.dh(lv);

        if self.forest.model == Model::Elbdm {
            // the wave-model kinetic solver is an external collaborator;
            // carry the state across the sandglass so the AMR machinery
            // stays consistent
            for p in self.forest.levels[lv].patches.iter_mut() {
                let src = p.data[sg].clone();
                p.data[sg_new] = src;
            }
            self.state.levels[lv].advance(dt);
            return;
        }

        let params = self.cfg.kernel_params(dt as Real, dh, true);
        let ghost = params.ghost;
        let coarse_time = self.coarse_time_weights(lv);
        let bases: Vec<usize> = (0..npatch).step_by(8).collect();

        let results: Vec<(usize, Vec<Real>, FluxPlanes)> = match &self.offload {
            Some(executor) => {
                let ctx = GhostContext {
                    forest: &self.forest,
                    lv,
                    sg,
                    coarse_time,
                    interp: self.cfg.interpolation,
                };
                let mut tokens = Vec::new();
                for chunk in bases.chunks(executor.batch_capacity()) {
                    let tiles = chunk
                        .par_iter()
                        .map(|base| ctx.prepare_group_tile(*base, ghost))
                        .collect();
                    tokens.push(executor.enqueue(FluidBatch {
                        params,
                        bases: chunk.to_vec(),
                        tiles,
                    }));
                }
                tokens
                    .into_iter()
                    .flat_map(|t| {
                        let r = t.wait();
                        r.bases
                            .into_iter()
                            .zip(r.outputs)
                            .zip(r.planes)
                            .map(|((b, o), p)| (b, o, p))
                            .collect::<Vec<_>>()
                    })
                    .collect()
            }
            None => {
                let forest = &self.forest;
                let kernel = self.kernel;
                let interp = self.cfg.interpolation;
                bases
                    .par_iter()
                    .map(|&base| {
                        let ctx = GhostContext {
                            forest,
                            lv,
                            sg,
                            coarse_time,
                            interp,
                        };
                        let mut tile = ctx.prepare_group_tile(base, ghost);
                        let mut out = vec![0.0; 5 * PS2 * PS2 * PS2];
                        let mut planes = FluxPlanes::new();
                        kernel(&params, &mut tile, &mut out, &mut planes);
                        (base, out, planes)
                    })
                    .collect()
            }
        };

        // write back the interior blocks and distribute the fluxes
        let n3 = PS2 * PS2 * PS2;
        for (base, out, planes) in results {
            for local in 0..8 {
                let i0 = (local & 1) * PS1;
                let j0 = ((local >> 1) & 1) * PS1;
                let k0 = ((local >> 2) & 1) * PS1;
                let patch = &mut self.forest.levels[lv].patches[base + local];
                for v in 0..5 {
                    for k in 0..PS1 {
                        for j in 0..PS1 {
                            for i in 0..PS1 {
                                let x =
                                    out[v * n3 + ((k + k0) * PS2 + (j + j0)) * PS2 + (i + i0)];
                                patch.data[sg_new].set_fluid(v, i, j, k, x);
                            }
                        }
                    }
                }
                // the potential is carried across the sandglass unchanged
                if let Some(pot) = patch.data[sg].pot.clone() {
                    patch.data[sg_new].pot = Some(pot);
                }
            }
            store_group_fluxes(&mut self.forest, lv, base, &planes, flux_weight);
        }

        self.state.levels[lv].advance(dt);

        if self.cfg.gravity {
            if let Some(poisson) = self.poisson.as_mut() {
                let pot_sg = self.state.levels[lv].pot_sg;
                if let Err(e) = poisson.solve(&mut self.forest, lv, sg_new, pot_sg) {
                    log::error!("poisson solver failed at level {}: {}", lv, e);
                }
            }
        }
    }

    /// Individual-time-step recursion: one step of `lv` spans two
    /// half-steps of `lv + 1`, followed by restriction and flux fix-up
    /// into `lv`.
    fn advance_level(&mut self, lv: usize, dt: f64) {
        let weight = if lv == 0 { 1.0 } else { 0.5 };
        self.solve_level(lv, dt, weight);

        if lv + 1 < self.forest.nlevel && self.forest.levels[lv + 1].npatch() > 0 {
            self.advance_level(lv + 1, 0.5 * dt);
            self.advance_level(lv + 1, 0.5 * dt);

            // restriction and fix-up consume cross-rank fine data
            self.comm.barrier();
            let sg_c = self.state.levels[lv].flu_sg;
            let sg_f = self.state.levels[lv + 1].flu_sg;
            restrict_level(&mut self.forest, lv, sg_c, sg_f);
            fix_up_level(
                &mut self.forest,
                lv,
                sg_c,
                dt as Real,
                self.cfg.dh(lv),
            );
        }
    }

    /// Shared-time-step sweep: every level advances by the same dt, then
    /// restriction and fix-up run fine-to-coarse.
    fn advance_shared(&mut self, dt: f64) {
        for lv in 0..self.forest.nlevel {
            self.solve_level(lv, dt, 1.0);
        }
        self.comm.barrier();
        for lv in (0..self.forest.nlevel - 1).rev() {
            let sg_c = self.state.levels[lv].flu_sg;
            let sg_f = self.state.levels[lv + 1].flu_sg;
            restrict_level(&mut self.forest, lv, sg_c, sg_f);
            fix_up_level(&mut self.forest, lv, sg_c, dt as Real, self.cfg.dh(lv));
        }
    }

    /// One complete outer step: dt, advance, refine, diagnostics.
    pub fn step(&mut self) -> Result<(), Error> {
        let dt = self.compute_dt();
        if !(dt.is_finite() && dt > 0.0) && self.time() < self.cfg.end_time {
            return Err(Error::Numerical {
                message: format!("non-positive time step {}", dt),
                level: 0,
                patch: 0,
                i: 0,
                j: 0,
                k: 0,
            });
        }

        if self.cfg.shared_timestep {
            self.advance_shared(dt);
        } else {
            self.advance_level(0, dt);
        }
        self.state.last_dt = dt;
        self.state.step += 1;

        // refinement reshapes the halo topology on every rank
        self.comm.barrier();
        self.refine_cycle();

        let (t, step) = (self.time(), self.state.step);
        if self.tasks.run_checks.is_due(t, step) {
            self.periodic_checks()?;
            self.tasks.run_checks.mark_done(t, step);
        }
        if self.tasks.report_progress.is_due(t, step) {
            self.report_progress();
            self.tasks.report_progress.mark_done(t, step);
        }
        if self.tasks.rebalance_probe.is_due(t, step) {
            self.probe_load_balance()?;
            self.tasks.rebalance_probe.mark_done(t, step);
        }
        self.side_effects()?;
        Ok(())
    }

    /// Flag + refine/coarsen the whole hierarchy and rebuild what depends
    /// on it.
    fn refine_cycle(&mut self) {
        let empty_before: Vec<bool> = (0..self.forest.nlevel)
            .map(|lv| self.forest.levels[lv].npatch() == 0)
            .collect();

        let sgs = self.state.flu_sgs();
        let ctx = FlagContext {
            tables: &self.tables,
            gamma: self.cfg.gamma,
            flag_buffer: self.cfg.flag_buffer,
            interp: self.cfg.interpolation,
            user: self.user_flag,
            dh0: self.cfg.dh(0),
        };
        refine_full_pass(&mut self.forest, &ctx, &sgs);

        // a level populated this cycle inherits its parent's clock and
        // sandglass slot
        for lv in 1..self.forest.nlevel {
            if empty_before[lv] && self.forest.levels[lv].npatch() > 0 {
                let parent = self.state.levels[lv - 1].clone();
                self.state.levels[lv].time = parent.time;
                self.state.levels[lv].time_prev = parent.time;
                self.state.levels[lv].flu_sg = parent.flu_sg;
            }
        }
    }

    /// The diagnostic battery: conservation, positivity, finiteness. A
    /// non-positive density that survived the local fallbacks is fatal
    /// here.
    fn periodic_checks(&mut self) -> Result<(), Error> {
        self.check_conservation();
        let negative = self.check_negative();
        if negative > 0 {
            return Err(Error::Numerical {
                message: format!("{} cells hold non-positive density or pressure", negative),
                level: 0,
                patch: 0,
                i: 0,
                j: 0,
                k: 0,
            });
        }
        self.check_finite()
    }

    /// Progress line with the per-level patch counts.
    fn report_progress(&self) {
        let counts: Vec<String> = (0..self.forest.nlevel)
            .map(|lv| format!("{}", self.forest.levels[lv].npatch()))
            .collect();
        log::info!(
            "step {:6}  t = {:.6e}  dt = {:.6e}  patches [{}]",
            self.state.step,
            self.time(),
            self.state.last_dt,
            counts.join(", ")
        );
    }

    /// Query the load-balance collaborator and trigger a redistribution
    /// when the weighted imbalance exceeds the configured bound.
    fn probe_load_balance(&mut self) -> Result<(), Error> {
        let wli = self.balancer.weighted_load_imbalance(&self.forest);
        if wli > self.cfg.wli_max {
            log::info!("load imbalance {:.3} exceeds {:.3}, rebalancing", wli, self.cfg.wli_max);
            self.balancer.rebalance(&mut self.forest)?;
        }
        Ok(())
    }

    /// Global conservation sums compared against the first recorded step.
    fn check_conservation(&mut self) {
        let sums = self
            .forest
            .conserved_sums(&self.state.flu_sgs(), self.cfg.dh(0));
        let sums = message::all_reduce_sum(self.comm.as_ref(), &sums);

        match &self.reference_sums {
            None => self.reference_sums = Some(sums),
            Some(reference) => {
                for (v, (now, then)) in sums.iter().zip(reference).enumerate() {
                    let scale = then.abs().max(1e-300);
                    let drift = ((now - then) / scale).abs();
                    let tol = if std::mem::size_of::<Real>() == 8 {
                        1e-10
                    } else {
                        1e-5
                    };
                    if drift > tol {
                        log::warn!(
                            "conservation drift in component {}: {:.3e} relative",
                            v,
                            drift
                        );
                    }
                }
            }
        }
    }

    /// Count cells with non-positive density or pressure, reporting their
    /// coordinates.
    fn check_negative(&self) -> usize {
        if self.forest.model != Model::Hydro {
            return 0;
        }
        let gamma = self.cfg.gamma;
        let mut bad = 0;

        for lv in 0..self.forest.nlevel {
            let sg = self.state.levels[lv].flu_sg;
            for (pid, p) in self.forest.levels[lv].patches.iter().enumerate() {
                if p.son != NONE {
                    continue;
                }
                let data = &p.data[sg];
                let n3 = PS1 * PS1 * PS1;
                for k in 0..PS1 {
                    for j in 0..PS1 {
                        for i in 0..PS1 {
                            let c = (k * PS1 + j) * PS1 + i;
                            let u = [
                                data.fluid[c],
                                data.fluid[n3 + c],
                                data.fluid[2 * n3 + c],
                                data.fluid[3 * n3 + c],
                                data.fluid[4 * n3 + c],
                            ];
                            let pres = hydro::pressure(&u, gamma);
                            if u[0] <= 0.0 || pres <= 0.0 {
                                if bad == 0 {
                                    log::error!(
                                        "negative density/pressure at t = {:.7e}, step {}",
                                        self.time(),
                                        self.state.step
                                    );
                                    log::error!(
                                        "{:>4}  {:>7}  {:>19}  {:>10}  {:>14}  {:>14}",
                                        "rank", "pid", "patch corner", "cell", "density", "pressure"
                                    );
                                }
                                log::error!(
                                    "{:>4}  {:>7}  ({:5},{:5},{:5})  ({:2},{:2},{:2})  {:14.7e}  {:14.7e}",
                                    self.comm.rank(),
                                    pid,
                                    p.corner[0],
                                    p.corner[1],
                                    p.corner[2],
                                    i,
                                    j,
                                    k,
                                    u[0],
                                    pres
                                );
                                bad += 1;
                            }
                        }
                    }
                }
            }
        }
        bad
    }

    fn check_finite(&self) -> Result<(), Error> {
        for lv in 0..self.forest.nlevel {
            let sg = self.state.levels[lv].flu_sg;
            for (pid, p) in self.forest.levels[lv].patches.iter().enumerate() {
                if let Some(c) = p.data[sg].fluid.iter().position(|x| !x.is_finite()) {
                    let n3 = PS1 * PS1 * PS1;
                    let cell = c % n3;
                    return Err(Error::Numerical {
                        message: "non-finite value in fluid data".into(),
                        level: lv,
                        patch: pid,
                        i: cell % PS1,
                        j: (cell / PS1) % PS1,
                        k: cell / (PS1 * PS1),
                    });
                }
            }
        }
        Ok(())
    }

    /// Output cadence and manual dump / termination sentinels.
    fn side_effects(&mut self) -> Result<(), Error> {
        let (t, step) = (self.time(), self.state.step);
        if self.tasks.write_checkpoint.is_due(t, step) {
            self.write_checkpoint()?;
            self.tasks.write_checkpoint.mark_done(t, step);
        }

        // a DUMP sentinel requests one snapshot without terminating
        let dump_sentinel = PathBuf::from(&self.cfg.output_directory).join("DUMP_OCTOFLUX");
        let dump = message::all_reduce_any(self.comm.as_ref(), dump_sentinel.exists());
        if dump {
            if self.comm.rank() == 0 {
                let _ = std::fs::remove_file(&dump_sentinel);
            }
            self.write_checkpoint()?;
        }
        Ok(())
    }

    fn write_checkpoint(&mut self) -> Result<(), Error> {
        let path = PathBuf::from(&self.cfg.output_directory)
            .join(format!("Data_{:06}", self.state.dump_id));
        crate::restart::save_snapshot(&path, &self.cfg, &self.forest, &self.state)?;
        self.state.dump_id += 1;
        Ok(())
    }

    /// Whether the run should stop now: OS signal or the STOP sentinel
    /// file, agreed across ranks.
    fn termination_requested(&self) -> bool {
        let stop_sentinel = PathBuf::from(&self.cfg.output_directory).join("STOP_OCTOFLUX");
        let local = self.terminate.load(Ordering::Relaxed) || stop_sentinel.exists();
        message::all_reduce_any(self.comm.as_ref(), local)
    }

    /// Run to the configured end time or step count. Returns `true` on
    /// normal completion, `false` when a termination request cut the run
    /// short (after a final dump).
    pub fn run(&mut self) -> Result<bool, Error> {
        log::info!(
            "starting run: {:?} scheme, {:?} solver, {} levels, base {:?}",
            self.cfg.scheme,
            self.cfg.riemann,
            self.cfg.nlevel,
            self.cfg.nx0
        );
        self.check_conservation();

        while self.time() < self.cfg.end_time && self.state.step < self.cfg.end_step {
            if self.termination_requested() {
                log::warn!("termination requested, writing a final dump");
                self.write_checkpoint()?;
                return Ok(false);
            }
            self.step()?;
        }

        log::info!(
            "run complete: {} steps to t = {:.6e}",
            self.state.step,
            self.time()
        );
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Configuration;
    use crate::hydro::pri_to_con;
    use crate::message::Serial;

    fn sod_configuration(scheme: &str, nx: usize, end_time: f64) -> Configuration {
        let yaml = format!(
            r#"
model: hydro
boundary: outflow
box_size: 1.0
nx0: [{}, 16, 16]
nlevel: 1
gamma: 1.4
courant: 0.4
scheme: {}
riemann: hllc
end_time: {}
fold: 1000000
"#,
            nx, scheme, end_time
        );
        let cfg: Configuration = serde_yaml::from_str(&yaml).unwrap();
        cfg.validate().unwrap();
        cfg
    }

    fn sod_model(cfg: &Configuration) -> impl Fn([i32; 3]) -> Vec<Real> {
        let gamma = cfg.gamma;
        let span = cfg.nx0[0] as i32;
        move |pos| {
            let x = (pos[0] as Real + 0.5) / span as Real;
            let w = if x < 0.5 {
                [1.0, 0.0, 0.0, 0.0, 1.0]
            } else {
                [0.125, 0.0, 0.0, 0.0, 0.1]
            };
            pri_to_con(&w, gamma).to_vec()
        }
    }

    #[test]
    fn zero_length_run_changes_nothing() {
        let cfg = sod_configuration("mhm_rp", 16, 0.0);
        let model = sod_model(&cfg);
        let mut sim =
            Simulation::new(cfg, Box::new(Serial), FlagTables::default(), model).unwrap();
        let before: Vec<Real> = sim.forest.levels[0].patches[0].data[0].fluid.clone();
        assert!(sim.run().unwrap());
        assert_eq!(sim.state.step, 0);
        assert_eq!(sim.forest.levels[0].patches[0].data[0].fluid, before);
    }

    #[test]
    fn sod_shock_tube_develops_the_star_plateaus() {
        let cfg = sod_configuration("mhm_rp", 64, 0.1);
        let model = sod_model(&cfg);
        let mut sim =
            Simulation::new(cfg, Box::new(Serial), FlagTables::default(), model).unwrap();
        assert!(sim.run().unwrap());
        assert!(sim.state.step > 5);

        // sample the density along the x axis
        let sg = sim.state.levels[0].flu_sg;
        let nx = sim.cfg.nx0[0];
        let mut rho = vec![0.0; nx];
        for p in &sim.forest.levels[0].patches {
            if p.corner[1] == 0 && p.corner[2] == 0 {
                for i in 0..PS1 {
                    rho[p.corner[0] as usize + i] = p.data[sg].fluid_at(0, i, 0, 0);
                }
            }
        }

        // left state intact, right state intact, and the left-star plateau
        // (rho ~ 0.4263) present between contact and rarefaction
        assert!((rho[1] - 1.0).abs() < 1e-3);
        assert!((rho[nx - 2] - 0.125).abs() < 1e-3);
        let x_star = (0.5 + 0.65 * 0.927 * 0.1) * nx as Real; // just left of the contact
        let plateau = rho[x_star as usize];
        assert!(
            (plateau - 0.4263).abs() < 0.05,
            "left-star plateau density {} (expected about 0.4263)",
            plateau
        );

        // monotone decrease from left to right state overall
        assert!(rho.iter().all(|r| *r > 0.0));
    }

    #[test]
    fn reflecting_box_conserves_mass_and_energy() {
        let yaml = r#"
model: hydro
boundary: reflecting
box_size: 1.0
nx0: [16, 16, 16]
nlevel: 1
gamma: 1.4
courant: 0.4
scheme: mhm
riemann: hllc
end_time: 0.05
fold: 1000000
"#;
        let cfg: Configuration = serde_yaml::from_str(yaml).unwrap();
        let nx = cfg.nx0[0] as Real;
        let model = move |pos: [i32; 3]| {
            let x = (pos[0] as Real + 0.5) / nx;
            let w = [
                1.0 + 0.3 * (6.283185 * x).sin(),
                0.1,
                0.0,
                0.0,
                1.0,
            ];
            pri_to_con(&w, 1.4).to_vec()
        };
        let mut sim =
            Simulation::new(cfg, Box::new(Serial), FlagTables::default(), model).unwrap();

        let before = sim
            .forest
            .conserved_sums(&sim.state.flu_sgs(), sim.cfg.dh(0));
        assert!(sim.run().unwrap());
        let after = sim
            .forest
            .conserved_sums(&sim.state.flu_sgs(), sim.cfg.dh(0));

        // mass and energy conserved to round-off under reflecting walls
        for v in [0usize, 4] {
            assert!(
                ((after[v] - before[v]) / before[v]).abs() < 1e-10,
                "component {} drifted from {} to {}",
                v,
                before[v],
                after[v]
            );
        }
    }

    #[test]
    fn uniform_refine_coarsen_round_trip_restores_the_tree() {
        let yaml = r#"
model: hydro
boundary: periodic
box_size: 1.0
nx0: [32, 32, 32]
nlevel: 2
gamma: 1.4
courant: 0.4
scheme: mhm_rp
riemann: hllc
end_time: 1.0
end_step: 0
flag_rho_gradient: true
fold: 1000000
"#;
        let cfg: Configuration = serde_yaml::from_str(yaml).unwrap();
        let model = |_: [i32; 3]| pri_to_con(&[1.0, 0.0, 0.0, 0.0, 1.0], 1.4).to_vec();
        let tables = FlagTables {
            // threshold far above any gradient of the uniform field
            rho_gradient: Some(vec![1e10; 9]),
            ..Default::default()
        };
        let mut sim = Simulation::new(cfg, Box::new(Serial), tables, model).unwrap();

        // refine one octant by hand, then let the flag pass collapse it
        sim.forest.levels[0].patches[12].flag = true;
        crate::mesh::refine::refine_level(
            &mut sim.forest,
            0,
            0,
            sim.cfg.interpolation,
        );
        assert_eq!(sim.forest.levels[1].npatch(), 8);

        sim.refine_cycle();
        assert_eq!(sim.forest.levels[1].npatch(), 0);
        sim.forest.audit().unwrap();

        // the base data is bit-identical to the uniform initial state
        let u = pri_to_con(&[1.0, 0.0, 0.0, 0.0, 1.0], 1.4);
        for p in &sim.forest.levels[0].patches {
            for k in 0..PS1 {
                for j in 0..PS1 {
                    for i in 0..PS1 {
                        for v in 0..5 {
                            assert_eq!(p.data[0].fluid_at(v, i, j, k), u[v]);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn restart_round_trip_resumes_identically() {
        let cfg = sod_configuration("mhm", 32, 0.04);
        let model = sod_model(&cfg);

        // continuous run to t = 0.04
        let mut continuous =
            Simulation::new(cfg.clone(), Box::new(Serial), FlagTables::default(), model)
                .unwrap();
        assert!(continuous.run().unwrap());

        // split run: stop at 0.02, dump, reload, continue to 0.04; the
        // time-step sequence must match, so replay the first leg with the
        // same end time before cutting it short by step count
        let mut first =
            Simulation::new(cfg.clone(), Box::new(Serial), FlagTables::default(), {
                let cfg = cfg.clone();
                sod_model(&cfg)
            })
            .unwrap();
        while first.time() < 0.02 && first.time() < first.cfg.end_time {
            first.step().unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("RESTART");
        crate::restart::save_snapshot(&path, &first.cfg, &first.forest, &first.state).unwrap();

        let mut second = Simulation::from_snapshot(
            cfg.clone(),
            Box::new(Serial),
            FlagTables::default(),
            &path,
        )
        .unwrap();
        // reproduce the dt growth clamp state of the continuous run
        second.state.last_dt = first.state.last_dt;
        assert!(second.run().unwrap());

        assert_eq!(continuous.state.step, second.state.step);
        let sg_a = continuous.state.levels[0].flu_sg;
        let sg_b = second.state.levels[0].flu_sg;
        for (a, b) in continuous.forest.levels[0]
            .patches
            .iter()
            .zip(&second.forest.levels[0].patches)
        {
            for (x, y) in a.data[sg_a].fluid.iter().zip(&b.data[sg_b].fluid) {
                assert!((x - y).abs() < 1e-13, "{} vs {}", x, y);
            }
        }
    }
}
