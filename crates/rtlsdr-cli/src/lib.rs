//! Helpers for driving the `rtl_sdr` / `rtl_test` command-line tools.
//!
//! The receiver is only ever touched through these child processes, so this
//! crate owns the argument layout and the parsing of the device listing.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Tuner parameters for one `rtl_sdr` capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureArgs {
    pub device_index: u32,
    pub frequency_hz: u32,
    pub sample_rate_hz: u32,
    /// Tuner gain in dB. `0.0` selects automatic gain.
    pub gain_db: f64,
    pub bias_tee: bool,
    pub output: PathBuf,
}

impl CaptureArgs {
    pub fn new(device_index: u32, output: impl Into<PathBuf>) -> Self {
        Self {
            device_index,
            frequency_hz: 0,
            sample_rate_hz: 0,
            gain_db: 0.0,
            bias_tee: false,
            output: output.into(),
        }
    }

    /// Render the argument vector, output file last.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-d".to_string(),
            self.device_index.to_string(),
            "-f".to_string(),
            self.frequency_hz.to_string(),
            "-s".to_string(),
            self.sample_rate_hz.to_string(),
            "-g".to_string(),
            format_gain(self.gain_db),
        ];
        if self.bias_tee {
            args.push("-T".to_string());
        }
        args.push(self.output.to_string_lossy().into_owned());
        args
    }
}

fn format_gain(gain_db: f64) -> String {
    if gain_db.fract() == 0.0 {
        format!("{}", gain_db as i64)
    } else {
        format!("{:.1}", gain_db)
    }
}

/// One receiver as reported by `rtl_test`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedDevice {
    pub index: u32,
    pub vendor: String,
    pub product: String,
    pub serial: String,
}

/// Parse the `Found N device(s):` block that `rtl_test` prints on stderr.
///
/// Anything outside that block is ignored, so `No supported devices found.`
/// yields an empty list.
pub fn parse_device_listing(output: &str) -> Vec<ListedDevice> {
    let mut devices = Vec::new();
    let mut in_block = false;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Found ") && trimmed.ends_with("device(s):") {
            in_block = true;
            continue;
        }
        if !in_block {
            continue;
        }
        if trimmed.is_empty() {
            break;
        }
        if let Some(device) = parse_device_line(trimmed) {
            devices.push(device);
        }
    }

    devices
}

fn parse_device_line(line: &str) -> Option<ListedDevice> {
    let (index, rest) = line.split_once(':')?;
    let index = index.trim().parse().ok()?;

    let mut parts = rest.trim().splitn(3, ',').map(str::trim);
    let vendor = parts.next().unwrap_or_default().to_string();
    let product = parts.next().unwrap_or_default().to_string();
    let serial = parts
        .next()
        .map(|s| s.strip_prefix("SN:").unwrap_or(s).trim().to_string())
        .unwrap_or_default();

    Some(ListedDevice {
        index,
        vendor,
        product,
        serial,
    })
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// `rtl_sdr` invocation writing raw 8-bit I/Q to `args.output`.
#[cfg(feature = "tokio")]
pub fn capture_command(program: impl AsRef<OsStr>, args: &CaptureArgs) -> tokio::process::Command {
    let mut cmd = tokio_command(program);
    cmd.args(args.to_args());
    cmd
}

/// `rtl_test -t` invocation; it enumerates devices and exits.
#[cfg(feature = "tokio")]
pub fn listing_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio_command(program);
    cmd.arg("-t");
    cmd
}

/// Whether `path` looks like an explicit filesystem path rather than a bare
/// program name to be resolved through `PATH`.
pub fn is_explicit_path(path: &Path) -> bool {
    path.components().count() > 1 || path.is_absolute()
}
