// src/utils/system.rs: System functions

use std::path::Path;

use log::{debug, warn};
use sysinfo::System;

use crate::config::defs::PipelineError;


/// Finds the amount of total and available RAM
///
/// # Arguments
///
///
/// # Returns
///
/// Result<u64, u64> total ram, available ram
pub fn detect_ram() -> Result<(u64, u64), PipelineError> {
    let mut system = System::new_all();
    system.refresh_memory();
    let (total_ram, available_ram) = (system.total_memory(), system.available_memory());

    if total_ram == 0 || available_ram == 0 {
        return Err(PipelineError::IOError("Failed to detect valid RAM values".to_string()));
    }

    Ok((total_ram, available_ram))
}


pub fn physical_cores() -> usize {
    System::physical_core_count().unwrap_or(1)
}


/// Converts a human readable memory amount to bytes. Suffixes are powers of
/// 1024: `K`, `M`, `G`, `T`, optionally followed by `B`.
///
/// # Arguments
///
/// * `amount` - e.g. `2G`, `500M`, `1.5G`, `1024`
///
/// # Returns
///
/// Number of bytes
pub fn human2bytes(amount: &str) -> Result<u64, PipelineError> {
    let trimmed = amount.trim();
    let upper = trimmed.to_uppercase();
    let upper = upper.strip_suffix('B').unwrap_or(&upper);
    let (number, factor) = match upper.chars().last() {
        Some('K') => (&upper[..upper.len() - 1], 1u64 << 10),
        Some('M') => (&upper[..upper.len() - 1], 1u64 << 20),
        Some('G') => (&upper[..upper.len() - 1], 1u64 << 30),
        Some('T') => (&upper[..upper.len() - 1], 1u64 << 40),
        _ => (upper, 1u64),
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| PipelineError::Configuration(format!("Cannot parse memory amount '{}'", amount)))?;
    if !value.is_finite() || value < 0.0 {
        return Err(PipelineError::Configuration(format!("Invalid memory amount '{}'", amount)));
    }
    Ok((value * factor as f64) as u64)
}


/// Warns when a locally run statement asks for more memory or threads than
/// this machine has.
pub fn warn_if_oversubscribed(job_memory: Option<&str>, job_threads: Option<i64>) {
    if let Some(memory) = job_memory {
        match (human2bytes(memory), detect_ram()) {
            (Ok(requested), Ok((_, available))) if requested > available => {
                warn!(
                    "Job requests {} but only {} bytes (~{} GiB) are available",
                    memory,
                    available,
                    available / 1_073_741_824
                );
            }
            (Err(e), _) => debug!("Skipping memory check: {}", e),
            _ => {}
        }
    }
    if let Some(threads) = job_threads {
        let cores = physical_cores();
        if threads > cores as i64 {
            warn!("Job requests {} threads but only {} physical cores were detected", threads, cores);
        }
    }
}


/// Checks that every executable is on the PATH.
///
/// # Arguments
///
/// * `names` - Executables to look for.
///
/// # Returns
///
/// An error listing every missing executable.
pub fn check_executables<S: AsRef<str>>(names: &[S]) -> Result<(), PipelineError> {
    let missing: Vec<&str> = names
        .iter()
        .map(|n| n.as_ref())
        .filter(|n| which::which(n).is_err())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::Configuration(format!("missing executables: {}", missing.join(", "))))
    }
}


pub fn check_scripts<P: AsRef<Path>>(paths: &[P]) -> Result<(), PipelineError> {
    let missing: Vec<String> = paths
        .iter()
        .map(|p| p.as_ref())
        .filter(|p| !p.exists())
        .map(|p| p.display().to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::Configuration(format!("missing scripts: {}", missing.join(", "))))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::NamedTempFile;

    #[test]
    fn test_human2bytes() -> Result<()> {
        assert_eq!(human2bytes("1024")?, 1024);
        assert_eq!(human2bytes("2K")?, 2048);
        assert_eq!(human2bytes("2G")?, 2 * 1_073_741_824);
        assert_eq!(human2bytes("1.5g")?, 1_610_612_736);
        assert_eq!(human2bytes("500MB")?, 500 * 1_048_576);
        assert!(human2bytes("lots").is_err());
        assert!(human2bytes("").is_err());
        Ok(())
    }

    #[test]
    fn test_check_executables() {
        assert!(check_executables(&["sh"]).is_ok());
        let err = check_executables(&["sh", "definitely-not-a-real-tool-xyz"]).unwrap_err();
        assert!(err.to_string().contains("definitely-not-a-real-tool-xyz"));
    }

    #[test]
    fn test_check_scripts() -> Result<()> {
        let script = NamedTempFile::new()?;
        assert!(check_scripts(&[script.path()]).is_ok());
        assert!(check_scripts(&[Path::new("/nonexistent/script.sh")]).is_err());
        Ok(())
    }
}
