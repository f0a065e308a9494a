//! UDPST Protocol Library
//!
//! Contract with the OB-UDPST measurement binary as seen from the control panel.
//! The binary is treated as an opaque process: this crate only knows how to
//! build its command line and how to interpret what it prints.
//!
//! Nothing in here performs I/O, so every piece can be tested in isolation.

pub mod args;
pub mod constants;
pub mod error;
pub mod parser;
pub mod quality;
pub mod severity;

pub use args::{ArgBuilder, ClientParams, FlagSet, IpVersion, ServerParams, TestType, command_line};
pub use constants::*;
pub use error::ParseError;
pub use parser::{ParsedResult, parse_output};
pub use quality::{QualityAssessment, QualityTier, assess_quality};
pub use severity::{Severity, SeverityVerdict, classify_severity};
