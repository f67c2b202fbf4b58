//! Self-protection watchdog.
//!
//! Samples the daemon's own CPU and resident-memory usage from
//! `/proc/self/stat` on a background thread and aborts the process when a
//! sliding-window limit is exceeded. Also provides one-shot [`FatalTimer`]s
//! used to bound the duration of individual trace operations. A resource
//! exhaustion condition has no safe recovery path, so the only escalation
//! mechanism is terminating the whole process.

pub mod ring;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::error;

use self::ring::SampleRing;

/// Default cadence at which the watchdog samples `/proc/self/stat`.
pub const DEFAULT_POLLING_INTERVAL_MS: u32 = 30_000;

/// Slack added on top of the shared-memory size when deriving the default
/// memory limit.
pub const DEFAULT_MEMORY_SLACK_BYTES: u64 = 32 * 1024 * 1024;

/// Window over which the default memory limit is evaluated.
pub const DEFAULT_MEMORY_WINDOW_MS: u32 = 30_000;

/// Process-wide resource watchdog.
///
/// Limits are evaluated over sliding windows whose width must be an integer
/// multiple of the polling interval. A zero limit disables the matching
/// check. Starting is idempotent and only spawns the sampling thread on
/// Linux and Android; elsewhere the watchdog accepts limits but is inert.
pub struct Watchdog {
    polling_interval_ms: u32,
    shared: Arc<Shared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

struct Shared {
    state: Mutex<LimitState>,
    exit_signal: Condvar,
}

struct LimitState {
    quit: bool,
    memory_limit_bytes: u64,
    memory_window_bytes: SampleRing,
    cpu_limit_percentage: u32,
    cpu_window_ticks: SampleRing,
}

impl Watchdog {
    /// Create a watchdog with a custom polling interval.
    pub fn new(polling_interval_ms: u32) -> Self {
        Self {
            polling_interval_ms,
            shared: Arc::new(Shared {
                state: Mutex::new(LimitState {
                    quit: true,
                    memory_limit_bytes: 0,
                    memory_window_bytes: SampleRing::new(0),
                    cpu_limit_percentage: 0,
                    cpu_window_ticks: SampleRing::new(0),
                }),
                exit_signal: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// The process-wide instance, polling at the default interval.
    pub fn instance() -> &'static Watchdog {
        static INSTANCE: OnceLock<Watchdog> = OnceLock::new();
        INSTANCE.get_or_init(|| Watchdog::new(DEFAULT_POLLING_INTERVAL_MS))
    }

    /// Start the sampling thread. Idempotent; a no-op off Linux/Android.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            self.shared.state.lock().quit = false;

            let shared = Arc::clone(&self.shared);
            let interval = self.polling_interval_ms;
            match thread::Builder::new()
                .name("probekit-watchdog".into())
                .spawn(move || worker_loop(&shared, interval))
            {
                Ok(handle) => *worker = Some(handle),
                Err(e) => error!(error = %e, "failed to spawn watchdog thread"),
            }
        }
    }

    /// Limit the mean resident-set size over `window_ms`.
    ///
    /// `bytes == 0` disables the check. Panics if the window is not a
    /// multiple of the polling interval.
    pub fn set_memory_limit(&self, bytes: u64, window_ms: u32) {
        let mut state = self.shared.state.lock();

        assert!(
            bytes == 0 || is_multiple_of(window_ms, self.polling_interval_ms),
            "memory window must be a multiple of the polling interval",
        );

        let capacity = if bytes == 0 {
            0
        } else {
            (window_ms / self.polling_interval_ms + 1) as usize
        };
        state.memory_window_bytes.reset(capacity);
        state.memory_limit_bytes = bytes;
    }

    /// Limit the CPU usage percentage over `window_ms`.
    ///
    /// `percentage == 0` disables the check. Panics if the percentage
    /// exceeds 100 or the window is not a multiple of the polling interval.
    pub fn set_cpu_limit(&self, percentage: u32, window_ms: u32) {
        let mut state = self.shared.state.lock();

        assert!(percentage <= 100, "cpu limit is a percentage");
        assert!(
            percentage == 0 || is_multiple_of(window_ms, self.polling_interval_ms),
            "cpu window must be a multiple of the polling interval",
        );

        let capacity = if percentage == 0 {
            0
        } else {
            (window_ms / self.polling_interval_ms + 1) as usize
        };
        state.cpu_window_ticks.reset(capacity);
        state.cpu_limit_percentage = percentage;
    }

    /// Arm a one-shot timer that aborts the process after `ms` milliseconds
    /// unless dropped first.
    pub fn create_fatal_timer(&self, ms: u32, reason: &'static str) -> FatalTimer {
        FatalTimer::new(ms, reason)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };

        {
            let mut state = self.shared.state.lock();
            state.quit = true;
        }
        self.shared.exit_signal.notify_one();
        let _ = handle.join();
    }
}

fn is_multiple_of(number: u32, divisor: u32) -> bool {
    number >= divisor && number % divisor == 0
}

/// Returns the offending mean RSS when the memory limit is breached.
fn check_memory(state: &mut LimitState, rss_bytes: u64) -> Option<f64> {
    if state.memory_limit_bytes == 0 {
        return None;
    }
    if !state.memory_window_bytes.push(rss_bytes) {
        return None;
    }

    let mean = state.memory_window_bytes.mean();
    (mean > state.memory_limit_bytes as f64).then_some(mean)
}

/// Returns the offending CPU percentage when the CPU limit is breached.
///
/// The samples are cumulative tick counts, so the usage over the window is
/// `newest - oldest`. The wall-clock width spans `capacity - 1` polling
/// intervals, matching the span between the newest and oldest samples.
fn check_cpu(
    state: &mut LimitState,
    cpu_ticks: u64,
    polling_interval_ms: u32,
    ticks_per_second: u64,
) -> Option<f64> {
    if state.cpu_limit_percentage == 0 {
        return None;
    }
    if !state.cpu_window_ticks.push(cpu_ticks) {
        return None;
    }

    let window = &state.cpu_window_ticks;
    let difference_ticks = window
        .newest_when_full()
        .saturating_sub(window.oldest_when_full());

    let window_ms = (window.capacity() - 1) as f64 * f64::from(polling_interval_ms);
    let window_ticks = window_ms / 1000.0 * ticks_per_second as f64;
    let percentage = difference_ticks as f64 / window_ticks * 100.0;

    (percentage > f64::from(state.cpu_limit_percentage)).then_some(percentage)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn worker_loop(shared: &Shared, polling_interval_ms: u32) {
    let Ok(mut stat_file) = File::open("/proc/self/stat") else {
        error!("failed to open /proc/self/stat, resource limits are not enforced");
        return;
    };

    // SAFETY: sysconf with a valid name has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(1) as u64;
    // SAFETY: as above.
    let ticks_per_second = unsafe { libc::sysconf(libc::_SC_CLK_TCK) }.max(1) as u64;

    let mut guard = shared.state.lock();
    loop {
        shared
            .exit_signal
            .wait_for(&mut guard, Duration::from_millis(u64::from(polling_interval_ms)));
        if guard.quit {
            return;
        }

        let stat = match read_self_stat(&mut stat_file) {
            Ok(stat) => stat,
            Err(e) => {
                error!(error = %e, "failed to read /proc/self/stat, resource limits are not enforced");
                return;
            }
        };

        let cpu_ticks = stat.utime_ticks + stat.stime_ticks;
        let rss_bytes = stat.rss_pages * page_size;

        if let Some(mean) = check_memory(&mut guard, rss_bytes) {
            error!(
                mean_rss_bytes = mean,
                limit_bytes = guard.memory_limit_bytes,
                "memory watchdog limit exceeded, aborting",
            );
            std::process::abort();
        }

        if let Some(percentage) = check_cpu(&mut guard, cpu_ticks, polling_interval_ms, ticks_per_second)
        {
            error!(
                cpu_percentage = percentage,
                limit_percentage = guard.cpu_limit_percentage,
                "cpu watchdog limit exceeded, aborting",
            );
            std::process::abort();
        }
    }
}

/// Errors from sampling `/proc/self/stat`.
#[derive(Debug, Error)]
pub enum ProcStatError {
    #[error("reading stat file: {0}")]
    Io(#[from] std::io::Error),

    #[error("stat line has no comm terminator")]
    MissingComm,

    #[error("stat field {index} missing or malformed")]
    Field { index: usize },
}

/// The fields of `/proc/self/stat` the watchdog samples, per `proc(5)`:
/// utime (14), stime (15) and rss in pages (24).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    utime_ticks: u64,
    stime_ticks: u64,
    rss_pages: u64,
}

#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
fn read_self_stat(file: &mut File) -> Result<ProcStat, ProcStatError> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; 512];
    let n = file.read(&mut buf)?;
    parse_self_stat(&String::from_utf8_lossy(&buf[..n]))
}

fn parse_self_stat(raw: &str) -> Result<ProcStat, ProcStatError> {
    // The comm field is parenthesised and may contain spaces; split after
    // the closing paren and count fields from state (field 3) onwards.
    let (_, rest) = raw.rsplit_once(')').ok_or(ProcStatError::MissingComm)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();

    let field = |index: usize| -> Result<u64, ProcStatError> {
        fields
            .get(index - 3)
            .and_then(|s| s.parse().ok())
            .ok_or(ProcStatError::Field { index })
    };

    Ok(ProcStat {
        utime_ticks: field(14)?,
        stime_ticks: field(15)?,
        rss_pages: field(24)?,
    })
}

/// One-shot deadline that crashes the process unless dropped in time.
///
/// The deadline uses the monotonic clock. Dropping the timer disarms it;
/// moving it transfers ownership of the armed deadline.
#[derive(Debug)]
pub struct FatalTimer {
    disarm: Option<mpsc::Sender<()>>,
}

impl FatalTimer {
    /// Arm a timer that aborts the process after `ms` milliseconds.
    ///
    /// `reason` is logged before aborting, for post-mortem analysis.
    pub fn new(ms: u32, reason: &'static str) -> Self {
        let (disarm, expired) = mpsc::channel::<()>();

        let spawned = thread::Builder::new()
            .name("probekit-fatal-timer".into())
            .spawn(move || {
                match expired.recv_timeout(Duration::from_millis(u64::from(ms))) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        error!(reason, deadline_ms = ms, "fatal timer expired, aborting");
                        std::process::abort();
                    }
                    // Sender dropped: the timer was disarmed.
                    _ => {}
                }
            });

        if let Err(e) = spawned {
            error!(error = %e, reason, "failed to arm fatal timer");
        }

        Self {
            disarm: Some(disarm),
        }
    }
}

impl Drop for FatalTimer {
    fn drop(&mut self) {
        // Disconnects the channel, waking and terminating the timer thread.
        self.disarm.take();
    }
}
