use std::fmt;

/// Source location attached to configuration and consistency errors, so a
/// failure report identifies where the offending check lives.
#[derive(Debug, Clone, Copy)]
pub struct Location {
    pub file: &'static str,
    pub line: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Capture the current source location.
#[macro_export]
macro_rules! here {
    () => {
        $crate::error::Location {
            file: file!(),
            line: line!(),
        }
    };
}

/// Build a configuration error with a formatted message and the call site.
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::error::Error::Config {
            message: format!($($arg)*),
            location: $crate::here!(),
        }
    };
}

/// Build a restart-consistency error with a formatted message and the call
/// site.
#[macro_export]
macro_rules! restart_error {
    ($($arg:tt)*) => {
        $crate::error::Error::Restart {
            message: format!($($arg)*),
            location: $crate::here!(),
        }
    };
}

/// The tagged error object carried up to the driver loop. Local numerical
/// fallbacks (pressure floors, density reversion, Riemann-solver fallback)
/// are handled where they occur and never construct one of these; a variant
/// here means the step loop must flush output and terminate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration: {message} [{location}]")]
    Config { message: String, location: Location },

    #[error("restart file: {message} [{location}]")]
    Restart { message: String, location: Location },

    #[error("numerical fault at level {level}, patch {patch}, cell ({i},{j},{k}): {message}")]
    Numerical {
        message: String,
        level: usize,
        patch: usize,
        i: usize,
        j: usize,
        k: usize,
    },

    #[error("octree inconsistency: {message} [{location}]")]
    Octree { message: String, location: Location },

    #[error("rank mismatch: {0}")]
    RankMismatch(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Process exit code associated with this error kind. Termination
    /// requests exit 1; everything else is a fatal inconsistency.
    pub fn exit_code(&self) -> i32 {
        2
    }
}
