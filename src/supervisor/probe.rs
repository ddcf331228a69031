//! Hardware probe for the server's device profile.

use crate::config::DeviceMode;
use std::process::Command;
use std::sync::OnceLock;
use tracing::{debug, info};

impl DeviceMode {
    /// Resolve to "accelerator present?", probing only in `Auto` mode.
    pub fn resolve(self) -> bool {
        match self {
            DeviceMode::Accelerator => true,
            DeviceMode::Cpu => false,
            DeviceMode::Auto => accelerator_available(),
        }
    }
}

/// Whether a CUDA-capable GPU is visible. Cached for the process lifetime.
///
/// Uses `nvidia-smi` in a subprocess so a broken driver cannot take this
/// process down with it.
pub fn accelerator_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();

    *AVAILABLE.get_or_init(|| {
        let count = query_gpu_count();
        match count {
            Some(n) if n > 0 => {
                info!("Accelerator probe: {} GPU(s) visible", n);
                true
            }
            _ => {
                debug!("Accelerator probe: no GPU visible");
                false
            }
        }
    })
}

fn query_gpu_count() -> Option<u32> {
    let output = Command::new("nvidia-smi")
        .arg("--query-gpu=count")
        .arg("--format=csv,noheader")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_gpu_count(&String::from_utf8_lossy(&output.stdout))
}

/// `nvidia-smi` prints the count once per GPU; the first line is enough.
fn parse_gpu_count(stdout: &str) -> Option<u32> {
    stdout.lines().next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_modes_skip_probe() {
        assert!(DeviceMode::Accelerator.resolve());
        assert!(!DeviceMode::Cpu.resolve());
    }

    #[test]
    fn parse_gpu_count_reads_first_line() {
        assert_eq!(parse_gpu_count("2\n2\n"), Some(2));
        assert_eq!(parse_gpu_count(" 1 "), Some(1));
        assert_eq!(parse_gpu_count(""), None);
        assert_eq!(parse_gpu_count("No devices were found"), None);
    }
}
