// Command-line entry point.
//
// Usage: memstress <target_mb> <duration_s>
//
// Exit codes: 0 pass, 1 fault(s) detected, 2 could not run, 130 interrupted.
// A SIGINT or SIGTERM requests a cooperative stop; the run drains,
// verifies and writes its report before exiting.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{error, info, warn};

use memstress::monitor::SensorMonitor;
use memstress::{lifecycle, RunReport, StopSignal, TestConfig, Verdict};

const RESULT_PATH: &str = "/tmp/memstress_result.txt";

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
fn install_signal_handlers() -> Result<(), nix::Error> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    extern "C" fn on_signal(_sig: nix::libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handlers() -> Result<(), std::convert::Infallible> {
    Ok(())
}

fn parse_args() -> Option<TestConfig> {
    let mut args = std::env::args().skip(1);
    let target_mb: usize = args.next()?.parse().ok()?;
    let duration_s: u64 = args.next()?.parse().ok()?;
    if args.next().is_some() {
        return None;
    }
    Some(TestConfig::new(
        target_mb * 1024 * 1024,
        Duration::from_secs(duration_s),
    ))
}

fn write_result_file(report: &RunReport, interrupted: bool) {
    use std::fmt::Write as _;

    let stats = &report.stats;
    let mut out = String::new();
    let _ = writeln!(out, "verdict={:?}", report.verdict);
    let _ = writeln!(out, "interrupted={}", interrupted);
    let _ = writeln!(out, "blocks={}", report.blocks);
    let _ = writeln!(out, "bytes_under_test={}", report.bytes_under_test);
    let _ = writeln!(out, "elapsed_s={:.1}", report.elapsed.as_secs_f64());
    let _ = writeln!(out, "total_errors={}", report.total_errors());
    let _ = writeln!(out, "total_passes={}", stats.total_passes());
    let _ = writeln!(out, "total_reads={}", stats.total_reads());
    let _ = writeln!(out, "total_writes={}", stats.total_writes());
    let _ = writeln!(out, "verification_failures={}", stats.verification_failures);
    let _ = writeln!(out, "worker_timeouts={}", stats.worker_timeouts);
    for (idx, bucket) in stats.per_pattern.iter().enumerate() {
        let name = memstress::Pattern::bucket_name(idx);
        let _ = writeln!(
            out,
            "{}_passes={} {}_errors={}",
            name,
            bucket.passes,
            name,
            bucket.errors + bucket.aliasing
        );
    }
    let bw = &stats.bandwidth;
    let _ = writeln!(out, "bw_seq_write_mbps={:.1}", bw.seq_write.mbps());
    let _ = writeln!(out, "bw_seq_read_mbps={:.1}", bw.seq_read.mbps());
    let _ = writeln!(out, "bw_random_mbps={:.1}", bw.random.mbps());
    if let Some(ecc) = report.ecc {
        let _ = writeln!(out, "ecc_correctable={}", ecc.correctable);
        let _ = writeln!(out, "ecc_uncorrectable={}", ecc.uncorrectable);
    }

    if let Err(err) = std::fs::write(RESULT_PATH, out) {
        warn!("could not write {}: {}", RESULT_PATH, err);
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Some(cfg) = parse_args() else {
        eprintln!("usage: memstress <target_mb> <duration_s>");
        return ExitCode::from(2);
    };

    if let Err(err) = install_signal_handlers() {
        error!("could not install signal handlers: {}", err);
        return ExitCode::from(2);
    }

    let stop = StopSignal::new();

    // The signal handler can only flip an atomic; a watcher thread turns
    // that into a stop request the workers observe.
    let watcher_stop = stop.clone();
    std::thread::spawn(move || loop {
        if INTERRUPTED.load(Ordering::SeqCst) {
            info!("interrupt received, requesting stop");
            watcher_stop.request();
            break;
        }
        if watcher_stop.observed() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    });

    let monitor_stop = stop.clone();
    let telemetry = std::thread::spawn(move || {
        SensorMonitor::new().run(Duration::from_secs(2), &monitor_stop)
    });

    let result = lifecycle::run(&cfg, &stop);
    stop.request();

    if let Ok(summary) = telemetry.join() {
        if summary.samples > 0 {
            if let Some(avg) = summary.cpu.avg() {
                info!(
                    "cpu temp: min {:.1} C, max {:.1} C, avg {:.1} C",
                    summary.cpu.min, summary.cpu.max, avg
                );
            }
            if let Some(avg) = summary.soc.avg() {
                info!(
                    "soc temp: min {:.1} C, max {:.1} C, avg {:.1} C",
                    summary.soc.min, summary.soc.max, avg
                );
            }
        }
    }

    let interrupted = INTERRUPTED.load(Ordering::SeqCst);
    match result {
        Ok(report) => {
            write_result_file(&report, interrupted);
            if interrupted {
                ExitCode::from(130)
            } else if report.verdict == Verdict::Passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(err) => {
            error!("run failed to start: {}", err);
            ExitCode::from(2)
        }
    }
}
