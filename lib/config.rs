//! Explicit run-time configuration.
//!
//! Everything that tunes the behavior of the environment engine is carried in
//! plain structs that are passed by reference to the functions that need them;
//! there is no process-wide mutable state. Textual names of the enumerated
//! options follow the conventions of the usual iPEPS/CTMRG drivers (e.g.
//! `"CTMRG"` for the environment initialization, `"4X4"` for the full-system
//! projectors) and can be parsed with [`FromStr`].

use std::{ fmt, str::FromStr };
use thiserror::Error;
use crate::lattice::EdgeDir;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Returned when parsing an unrecognized environment initialization name.
    #[error("config error: unknown environment initialization method '{0}'")]
    UnknownInit(String),

    /// Returned when parsing an unrecognized projector construction name.
    #[error("config error: unknown projector method '{0}'")]
    UnknownProjector(String),

    /// Returned when parsing an unrecognized element type name.
    #[error("config error: unknown dtype '{0}'")]
    UnknownDType(String),

    /// Returned when parsing an unrecognized device name.
    #[error("config error: unknown device '{0}'")]
    UnknownDevice(String),

    /// Returned when parsing a CTMRG move sequence containing a character
    /// other than `L`, `U`, `R`, or `D`.
    #[error("config error: invalid move '{0}' in CTMRG move sequence")]
    UnknownMove(char),
}
use ConfigError::*;
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Method used to populate a freshly created environment.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum EnvInit {
    /// Build corners and edges from the doubled on-site tensors.
    #[default]
    Ctmrg,
    /// Constant tensors.
    Const,
    /// Random tensors.
    Random,
    /// Open-boundary CTMRG initialization.
    CtmrgObc,
}

impl FromStr for EnvInit {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "CTMRG" => Ok(Self::Ctmrg),
            "CONST" => Ok(Self::Const),
            "RANDOM" => Ok(Self::Random),
            "CTMRG_OBC" => Ok(Self::CtmrgObc),
            _ => Err(UnknownInit(s.to_string())),
        }
    }
}

impl fmt::Display for EnvInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ctmrg => write!(f, "CTMRG"),
            Self::Const => write!(f, "CONST"),
            Self::Random => write!(f, "RANDOM"),
            Self::CtmrgObc => write!(f, "CTMRG_OBC"),
        }
    }
}

/// Construction of the renormalization projectors.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ProjectorMethod {
    /// Isometry from the SVD of a single enlarged corner.
    Corner,
    /// Isometry from the SVD of the two enlarged corners on one side of the
    /// cut.
    HalfSystem,
    /// Biorthogonal pair from the SVD of the product of the two halves of the
    /// full 2x2 plaquette.
    #[default]
    FullSystem,
}

impl FromStr for ProjectorMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "CORNER" => Ok(Self::Corner),
            "4X2" => Ok(Self::HalfSystem),
            "4X4" => Ok(Self::FullSystem),
            _ => Err(UnknownProjector(s.to_string())),
        }
    }
}

impl fmt::Display for ProjectorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corner => write!(f, "CORNER"),
            Self::HalfSystem => write!(f, "4X2"),
            Self::FullSystem => write!(f, "4X4"),
        }
    }
}

/// Numeric type of tensor elements.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    #[default]
    F64,
    C32,
    C64,
}

impl FromStr for DType {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "float32" => Ok(Self::F32),
            "float64" => Ok(Self::F64),
            "complex64" => Ok(Self::C32),
            "complex128" => Ok(Self::C64),
            _ => Err(UnknownDType(s.to_string())),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "float32"),
            Self::F64 => write!(f, "float64"),
            Self::C32 => write!(f, "complex64"),
            Self::C64 => write!(f, "complex128"),
        }
    }
}

/// Where tensors live. Only host memory is supported.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Device {
    #[default]
    Cpu,
}

impl FromStr for Device {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "cpu" => Ok(Self::Cpu),
            _ => Err(UnknownDevice(s.to_string())),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu")
    }
}

/// Settings fixed for the lifetime of a computation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GlobalArgs {
    pub dtype: DType,
    pub device: Device,
}

/// Verbosity levels of the individual stages. Zero is silent beyond the
/// default `log` records; higher values enable more expensive diagnostics.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Verbosity {
    pub initialization: u8,
    pub ctm_convergence: u8,
    pub projectors: u8,
    pub ctm_move: u8,
    pub rdm: u8,
}

/// Parameters of the CTMRG procedure.
#[derive(Clone, Debug, PartialEq)]
pub struct CtmArgs {
    /// Environment bond dimension χ.
    pub chi: usize,
    /// Maximum number of sweeps.
    pub ctm_max_iter: usize,
    /// Tolerance handed to the convergence checks.
    pub ctm_conv_tol: f64,
    /// How to populate the initial environment.
    pub ctm_env_init_type: EnvInit,
    /// Order of the directional moves within one sweep.
    pub ctm_move_sequence: Vec<EdgeDir>,
    /// Projector construction.
    pub projector_method: ProjectorMethod,
    /// Singular values below this fraction of the largest one are discarded
    /// when forming projectors.
    pub projector_svd_reltol: f64,
    /// Avoid splitting degenerate multiplets of singular values on truncation.
    pub keep_multiplets: bool,
    /// Relative gap below which neighbouring singular values are considered
    /// degenerate.
    pub projector_eps_multiplet: f64,
    /// Evaluate convergence checks on the host. Always satisfied on the only
    /// supported device.
    pub conv_check_cpu: bool,
    /// Use double-layer contractions of the on-site tensors in the C4v engine
    /// (otherwise ket and bra layers are absorbed one after the other).
    pub ctm_force_dl: bool,
    pub verbosity: Verbosity,
    pub global: GlobalArgs,
}

impl Default for CtmArgs {
    fn default() -> Self {
        Self {
            chi: 8,
            ctm_max_iter: 50,
            ctm_conv_tol: 1e-8,
            ctm_env_init_type: EnvInit::Ctmrg,
            ctm_move_sequence: DEFAULT_MOVES.to_vec(),
            projector_method: ProjectorMethod::FullSystem,
            projector_svd_reltol: 1e-8,
            keep_multiplets: false,
            projector_eps_multiplet: 1e-10,
            conv_check_cpu: false,
            ctm_force_dl: true,
            verbosity: Verbosity::default(),
            global: GlobalArgs::default(),
        }
    }
}

const DEFAULT_MOVES: [EdgeDir; 4]
    = [EdgeDir::Left, EdgeDir::Up, EdgeDir::Right, EdgeDir::Down];

/// Parse a move sequence written as a string of `L`, `U`, `R`, `D`.
pub fn parse_move_sequence(s: &str) -> ConfigResult<Vec<EdgeDir>> {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            'L' | 'l' => Ok(EdgeDir::Left),
            'U' | 'u' => Ok(EdgeDir::Up),
            'R' | 'r' => Ok(EdgeDir::Right),
            'D' | 'd' => Ok(EdgeDir::Down),
            _ => Err(UnknownMove(c)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_names() {
        assert_eq!("CTMRG".parse::<EnvInit>().unwrap(), EnvInit::Ctmrg);
        assert_eq!("CTMRG_OBC".parse::<EnvInit>().unwrap(), EnvInit::CtmrgObc);
        assert!(matches!("FOO".parse::<EnvInit>(), Err(UnknownInit(_))));
        assert_eq!("4X2".parse::<ProjectorMethod>().unwrap(), ProjectorMethod::HalfSystem);
        assert!("cuda".parse::<Device>().is_err());
        assert_eq!("complex128".parse::<DType>().unwrap(), DType::C64);
        for init in [EnvInit::Ctmrg, EnvInit::Const, EnvInit::Random, EnvInit::CtmrgObc] {
            assert_eq!(init.to_string().parse::<EnvInit>().unwrap(), init);
        }
    }

    #[test]
    fn move_sequence() {
        assert_eq!(parse_move_sequence("LURD").unwrap(), DEFAULT_MOVES.to_vec());
        assert_eq!(CtmArgs::default().ctm_move_sequence, DEFAULT_MOVES.to_vec());
        assert!(matches!(parse_move_sequence("LX"), Err(UnknownMove('X'))));
    }
}
