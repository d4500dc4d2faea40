use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;

use octoflux::config::Configuration;
use octoflux::driver::Simulation;
use octoflux::hydro::pri_to_con;
use octoflux::message::Serial;
use octoflux::Real;

#[derive(Parser)]
#[clap(
    version,
    about = "Block-structured AMR engine for compressible hydrodynamics"
)]
struct Opts {
    /// YAML parameter file
    parameter_file: PathBuf,

    /// Resume from a snapshot instead of starting fresh
    #[clap(long)]
    restart: Option<PathBuf>,

    /// Built-in initial model: uniform, sod, or sedov
    #[clap(long, default_value = "uniform")]
    setup: String,

    /// Worker threads (defaults to the core count)
    #[clap(long)]
    threads: Option<usize>,

    /// Log level: off, error, warn, info, debug, trace
    #[clap(long, default_value = "info")]
    log_level: String,
}

fn initial_model(setup: &str, cfg: &Configuration) -> Option<impl Fn([i32; 3]) -> Vec<Real>> {
    let gamma = cfg.gamma;
    let span: i32 = cfg.nx0[0] as i32 * (1 << (cfg.nlevel - 1));
    let dh_fine = cfg.box_size / span as Real;

    enum Setup {
        Uniform,
        Sod,
        Sedov,
    }
    let setup = match setup {
        "uniform" => Setup::Uniform,
        "sod" => Setup::Sod,
        "sedov" => Setup::Sedov,
        _ => return None,
    };

    Some(move |pos: [i32; 3]| {
        let x = (pos[0] as Real + 0.5) / span as Real;
        let w = match setup {
            Setup::Uniform => [1.0, 0.0, 0.0, 0.0, 1.0],
            Setup::Sod => {
                if x < 0.5 {
                    [1.0, 0.0, 0.0, 0.0, 1.0]
                } else {
                    [0.125, 0.0, 0.0, 0.0, 0.1]
                }
            }
            Setup::Sedov => {
                // unit energy concentrated at the domain center
                let center = span / 2;
                let near = (0..3).all(|d| (pos[d] - center).abs() <= 1);
                let p = if near {
                    let cell_volume = dh_fine * dh_fine * dh_fine;
                    (gamma - 1.0) / (27.0 * cell_volume)
                } else {
                    1e-5
                };
                [1.0, 0.0, 0.0, 0.0, p]
            }
        };
        pri_to_con(&w, gamma).to_vec()
    })
}

fn run() -> i32 {
    let opts = Opts::parse();

    let level = log::LevelFilter::from_str(&opts.log_level).unwrap_or(log::LevelFilter::Info);
    if simple_logger::SimpleLogger::new().with_level(level).init().is_err() {
        eprintln!("logger initialization failed");
    }

    let cfg = match Configuration::from_file(&opts.parameter_file) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("{}", e);
            return 2;
        }
    };

    if let Some(threads) = opts.threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
        {
            log::warn!("could not size the worker pool: {}", e);
        }
    }

    let tables = match cfg.load_flag_tables() {
        Ok(tables) => tables,
        Err(e) => {
            log::error!("{}", e);
            return 2;
        }
    };

    let sim = match &opts.restart {
        Some(path) => Simulation::from_snapshot(cfg, Box::new(Serial), tables, path),
        None => match initial_model(&opts.setup, &cfg) {
            Some(model) => Simulation::new(cfg, Box::new(Serial), tables, model),
            None => {
                log::error!("unknown setup '{}'", opts.setup);
                return 2;
            }
        },
    };

    let mut sim = match sim {
        Ok(sim) => sim,
        Err(e) => {
            log::error!("{}", e);
            return e.exit_code();
        }
    };

    if let Err(e) = sim.install_signal_handlers() {
        log::warn!("signal handlers unavailable: {}", e);
    }

    match sim.run() {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            log::error!("{}", e);
            2
        }
    }
}

fn main() {
    std::process::exit(run());
}
