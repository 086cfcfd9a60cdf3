//! Encoding modules for the MP4 batch converter

pub mod handbrake;

pub use handbrake::{
    build_convert_command, build_scan_command, Engine, EngineError, EngineRun, HandBrake, Unit,
    UnitExit, UnitProcess, ENCODE_ARGS,
};
