// ECC event monitoring through the kernel's EDAC sysfs interface.
//
// The memory controller reports corrected and uncorrected error counts
// per controller under <edac>/mc/mc*/. We snapshot the counters before
// the stress phase and report the delta afterwards. Correctable events
// are informational; uncorrectable ones are real data corruption and
// count toward the run's error total.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EccCounts {
    pub correctable: u64,
    pub uncorrectable: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EccDelta {
    pub correctable: u64,
    pub uncorrectable: u64,
}

pub struct EccMonitor {
    base: PathBuf,
    baseline: EccCounts,
}

fn read_count(path: &Path) -> u64 {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

fn read_counts(base: &Path) -> io::Result<EccCounts> {
    let mc_dir = base.join("mc");
    let mut counts = EccCounts::default();
    let mut found = false;

    for entry in fs::read_dir(&mc_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("mc") {
            continue;
        }
        let dir = entry.path();
        counts.correctable += read_count(&dir.join("ce_count"));
        counts.uncorrectable += read_count(&dir.join("ue_count"));
        found = true;
    }

    if !found {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no EDAC memory controllers",
        ));
    }
    Ok(counts)
}

impl EccMonitor {
    /// Probe the EDAC tree; None when the platform exposes no memory
    /// controllers there, which is the common case off-target.
    pub fn probe(base: &Path) -> Option<EccMonitor> {
        match read_counts(base) {
            Ok(baseline) => {
                info!(
                    "ECC monitoring active, baseline ce={} ue={}",
                    baseline.correctable, baseline.uncorrectable
                );
                Some(EccMonitor {
                    base: base.to_path_buf(),
                    baseline,
                })
            }
            Err(err) => {
                debug!("ECC monitoring unavailable: {}", err);
                None
            }
        }
    }

    /// Counter movement since the baseline snapshot. Counters only move
    /// forward; a controller reset mid-run reads as zero delta rather
    /// than an underflow.
    pub fn delta(&self) -> EccDelta {
        let now = read_counts(&self.base).unwrap_or(self.baseline);
        EccDelta {
            correctable: now.correctable.saturating_sub(self.baseline.correctable),
            uncorrectable: now
                .uncorrectable
                .saturating_sub(self.baseline.uncorrectable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_edac(ce: &str, ue: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "memstress_edac_{}_{}",
            std::process::id(),
            ce.len() * 31 + ue.len()
        ));
        let mc0 = dir.join("mc").join("mc0");
        fs::create_dir_all(&mc0).unwrap();
        fs::write(mc0.join("ce_count"), ce).unwrap();
        fs::write(mc0.join("ue_count"), ue).unwrap();
        dir
    }

    #[test]
    fn probe_missing_tree_is_none() {
        assert!(EccMonitor::probe(Path::new("/nonexistent/edac")).is_none());
    }

    #[test]
    fn delta_tracks_counter_movement() {
        let dir = fake_edac("5\n", "0\n");
        let monitor = EccMonitor::probe(&dir).unwrap();
        assert_eq!(monitor.delta(), EccDelta::default());

        let mc0 = dir.join("mc").join("mc0");
        fs::write(mc0.join("ce_count"), "8\n").unwrap();
        fs::write(mc0.join("ue_count"), "2\n").unwrap();
        let delta = monitor.delta();
        assert_eq!(delta.correctable, 3);
        assert_eq!(delta.uncorrectable, 2);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn malformed_counter_reads_as_zero() {
        let dir = fake_edac("not a number", "1\n");
        let monitor = EccMonitor::probe(&dir).unwrap();
        assert_eq!(monitor.delta(), EccDelta::default());
        fs::remove_dir_all(&dir).unwrap();
    }
}
