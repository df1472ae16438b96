// Thermal and clock telemetry sampled alongside a stress run.
//
// Strictly an observer: the engine never reads these values and no
// telemetry reading can change a verdict. The binary runs the sampler on
// its own thread and prints the aggregates next to the report, because a
// part that only fails above 80 C is a finding worth keeping.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;

use crate::scheduler::StopSignal;

#[derive(Clone, Copy, Debug, Default)]
pub struct TelemetrySample {
    pub cpu_temp_c: Option<f64>,
    pub gpu_temp_c: Option<f64>,
    pub soc_temp_c: Option<f64>,
    pub power_w: Option<f64>,
    pub cpu_freq_mhz: Option<f64>,
    pub gpu_freq_mhz: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TempAggregate {
    pub min: f64,
    pub max: f64,
    sum: f64,
    count: u64,
}

impl TempAggregate {
    fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
    }

    pub fn avg(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TelemetrySummary {
    pub cpu: TempAggregate,
    pub gpu: TempAggregate,
    pub soc: TempAggregate,
    pub samples: u64,
}

pub struct SensorMonitor {
    zones: Vec<(String, PathBuf)>,
    cpu_freq: Option<PathBuf>,
}

fn zone_temp(path: &Path) -> Option<f64> {
    let raw = fs::read_to_string(path).ok()?;
    let millis: f64 = raw.trim().parse().ok()?;
    Some(millis / 1000.0)
}

fn read_khz(path: &Path) -> Option<f64> {
    let raw = fs::read_to_string(path).ok()?;
    let khz: f64 = raw.trim().parse().ok()?;
    Some(khz / 1000.0)
}

impl SensorMonitor {
    pub fn new() -> SensorMonitor {
        SensorMonitor::with_root(Path::new("/sys/class/thermal"))
    }

    pub fn with_root(root: &Path) -> SensorMonitor {
        let mut zones = Vec::new();
        if let Ok(entries) = fs::read_dir(root) {
            for entry in entries.flatten() {
                let dir = entry.path();
                if !entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("thermal_zone")
                {
                    continue;
                }
                if let Ok(kind) = fs::read_to_string(dir.join("type")) {
                    zones.push((kind.trim().to_ascii_lowercase(), dir.join("temp")));
                }
            }
        }
        if zones.is_empty() {
            debug!("no thermal zones found; telemetry disabled");
        }

        let cpu_freq = Path::new("/sys/devices/system/cpu/cpu0/cpufreq/scaling_cur_freq");
        let cpu_freq = cpu_freq.exists().then(|| cpu_freq.to_path_buf());

        SensorMonitor { zones, cpu_freq }
    }

    pub fn sample(&self) -> TelemetrySample {
        let mut sample = TelemetrySample::default();
        for (kind, path) in &self.zones {
            let Some(temp) = zone_temp(path) else { continue };
            if kind.contains("cpu") {
                sample.cpu_temp_c = Some(sample.cpu_temp_c.map_or(temp, |t: f64| t.max(temp)));
            } else if kind.contains("gpu") {
                sample.gpu_temp_c = Some(sample.gpu_temp_c.map_or(temp, |t: f64| t.max(temp)));
            } else {
                sample.soc_temp_c = Some(sample.soc_temp_c.map_or(temp, |t: f64| t.max(temp)));
            }
        }
        if let Some(path) = &self.cpu_freq {
            sample.cpu_freq_mhz = read_khz(path);
        }
        // Power and GPU clock sources are platform specific; left unset
        // where the generic sysfs interfaces do not expose them.
        sample
    }

    /// Sample on a cadence until stop is requested. Meant for a dedicated
    /// thread in the binary.
    pub fn run(&self, interval: Duration, stop: &StopSignal) -> TelemetrySummary {
        let mut summary = TelemetrySummary::default();
        while !stop.observed() {
            let sample = self.sample();
            if let Some(t) = sample.cpu_temp_c {
                summary.cpu.add(t);
            }
            if let Some(t) = sample.gpu_temp_c {
                summary.gpu.add(t);
            }
            if let Some(t) = sample.soc_temp_c {
                summary.soc.add(t);
            }
            summary.samples += 1;
            std::thread::sleep(interval);
        }
        summary
    }
}

impl Default for SensorMonitor {
    fn default() -> SensorMonitor {
        SensorMonitor::new()
    }
}
