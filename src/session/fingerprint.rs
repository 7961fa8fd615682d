//! Device fingerprint derivation.
//!
//! DESIGN
//! ======
//! The fingerprint is a digest of a fixed, ordered list of environment signals
//! joined with `|`. Order matters: reordering the list changes every visitor's
//! fingerprint and detaches them from their prior sessions.
//!
//! With the `sha256` feature the digest is SHA-256 rendered as lowercase hex.
//! Builds without it fall back to a 32-bit rolling multiplicative hash
//! rendered as 8 hex characters. Both are deterministic; neither is used for
//! access control.

#[cfg(test)]
#[path = "fingerprint_test.rs"]
mod fingerprint_test;

use std::fmt::Write;

const SIGNAL_DELIMITER: &str = "|";
const UNKNOWN: &str = "unknown";

/// Digest applied to the joined signal list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
    Rolling,
}

impl DigestAlgorithm {
    /// Strongest digest compiled into this build.
    #[must_use]
    pub fn preferred() -> Self {
        if cfg!(feature = "sha256") { Self::Sha256 } else { Self::Rolling }
    }
}

/// Display geometry reported by the embedding host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenGeometry {
    pub width: u32,
    pub height: u32,
    pub color_depth: u8,
}

/// Stable device/browser characteristics that make up a fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentSignals {
    pub user_agent: String,
    pub locale: String,
    pub screen: Option<ScreenGeometry>,
    /// Minutes east of UTC.
    pub timezone_offset_minutes: i32,
    pub hardware_concurrency: Option<usize>,
    pub device_memory_gb: Option<f64>,
}

impl EnvironmentSignals {
    /// Collect signals from the running process.
    ///
    /// Screen geometry and device memory have no portable native source and
    /// are left for the embedder to fill in.
    #[must_use]
    pub fn detect() -> Self {
        let user_agent = format!(
            "convo-widget/{} ({}; {})",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH
        );
        let locale = ["LC_ALL", "LC_MESSAGES", "LANG"]
            .iter()
            .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
            .map_or_else(|| UNKNOWN.to_owned(), |raw| normalize_locale(&raw));
        let timezone_offset_minutes = time::UtcOffset::current_local_offset()
            .map(|offset| i32::from(offset.whole_minutes()))
            .unwrap_or(0);
        let hardware_concurrency = std::thread::available_parallelism().ok().map(std::num::NonZeroUsize::get);

        Self {
            user_agent,
            locale,
            screen: None,
            timezone_offset_minutes,
            hardware_concurrency,
            device_memory_gb: None,
        }
    }

    #[must_use]
    pub fn with_screen(mut self, screen: ScreenGeometry) -> Self {
        self.screen = Some(screen);
        self
    }

    #[must_use]
    pub fn with_device_memory(mut self, gigabytes: f64) -> Self {
        self.device_memory_gb = Some(gigabytes);
        self
    }

    /// Signals in fingerprint order.
    #[must_use]
    pub fn ordered_components(&self) -> Vec<String> {
        let (geometry, color_depth) = match self.screen {
            Some(screen) => (format!("{}x{}", screen.width, screen.height), screen.color_depth.to_string()),
            None => (UNKNOWN.to_owned(), UNKNOWN.to_owned()),
        };
        vec![
            self.user_agent.clone(),
            self.locale.clone(),
            geometry,
            color_depth,
            self.timezone_offset_minutes.to_string(),
            self.hardware_concurrency.map_or_else(|| UNKNOWN.to_owned(), |n| n.to_string()),
            self.device_memory_gb.map_or_else(|| UNKNOWN.to_owned(), |gb| gb.to_string()),
        ]
    }
}

/// Derive the fingerprint for `signals` with `algorithm`.
#[must_use]
pub fn derive_fingerprint(signals: &EnvironmentSignals, algorithm: DigestAlgorithm) -> String {
    let input = signals.ordered_components().join(SIGNAL_DELIMITER);
    match algorithm {
        DigestAlgorithm::Sha256 => sha256_hex(&input),
        DigestAlgorithm::Rolling => rolling_hex(&input),
    }
}

#[cfg(feature = "sha256")]
fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};

    to_hex(&Sha256::digest(input.as_bytes()))
}

#[cfg(not(feature = "sha256"))]
fn sha256_hex(input: &str) -> String {
    tracing::warn!("sha256 digest not compiled in; using rolling fingerprint hash");
    rolling_hex(input)
}

/// `hash = hash * 31 + c` over the input's characters, wrapping at 32 bits.
pub(crate) fn rolling_hex(input: &str) -> String {
    let hash = input
        .chars()
        .fold(0_i32, |hash, c| hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(c as i32));
    format!("{:08x}", hash.cast_unsigned())
}

#[cfg_attr(not(feature = "sha256"), allow(dead_code))]
fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// `en_US.UTF-8` -> `en-US`.
fn normalize_locale(raw: &str) -> String {
    let base = raw.split(['.', '@']).next().unwrap_or(raw);
    if base == "C" || base == "POSIX" {
        return UNKNOWN.to_owned();
    }
    base.replace('_', "-")
}
