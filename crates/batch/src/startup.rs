//! Startup checks module for the MP4 batch converter
//!
//! Verifies the transcoding engine can be launched before any item is touched,
//! so a missing executable fails the run up front instead of on the first item.

use crate::config::Config;
use std::process::{Command, Stdio};
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Engine not available: {0}")]
    EngineUnavailable(String),
}

/// Check that the engine runs by invoking `<program> --version`
pub fn check_engine_available(program: &str) -> Result<(), StartupError> {
    let output = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            StartupError::EngineUnavailable(format!(
                "{} --version failed; is it installed and in PATH? Error: {}",
                program, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::EngineUnavailable(format!(
            "{} --version exited with {}",
            program, output.status
        )));
    }

    let banner = String::from_utf8_lossy(&output.stdout);
    if let Some(first) = banner.lines().find(|l| !l.trim().is_empty()) {
        tracing::info!(engine = program, version = first.trim(), "Engine available");
    }

    Ok(())
}

/// Run all startup checks for a configuration
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_engine_available(&cfg.engine.program)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_engine_is_unavailable() {
        let result = check_engine_available("mp4-batch-definitely-missing-engine");
        match result {
            Err(StartupError::EngineUnavailable(msg)) => {
                assert!(msg.contains("mp4-batch-definitely-missing-engine"));
            }
            other => panic!("expected EngineUnavailable, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_engine_is_unavailable() {
        // `false` ignores its arguments and exits 1.
        let result = check_engine_available("false");
        assert!(matches!(result, Err(StartupError::EngineUnavailable(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_working_engine_passes() {
        // `true` ignores its arguments and exits 0.
        assert!(check_engine_available("true").is_ok());
    }

    #[test]
    fn test_run_startup_checks_uses_configured_program() {
        let mut cfg = Config::default();
        cfg.engine.program = "mp4-batch-definitely-missing-engine".to_string();
        assert!(run_startup_checks(&cfg).is_err());
    }
}
