//! Timeout arithmetic shared by the BLOB and DFU models.
//!
//! The timeout base carried in Transfer Start and Update Start scales every
//! timer: a client gives up on a target after `client_timeout`, a server
//! suspends an idle transfer after `server_timeout`.

use std::time::Duration;

/// Default number of send attempts per broadcast step.
pub const BLOCK_RETRIES: u8 = 5;

/// Interval the client grants a Pull-mode target to report missing chunks
/// after the last requested chunk went out (T_BPI).
pub const BLOCK_REPORT_WINDOW: Duration = Duration::from_millis((30 * 2 + 7) * 1000);

/// Delay before a Pull-mode server sends an unsolicited Partial Block Report.
pub const SERVER_REPORT_DELAY: Duration = Duration::from_secs(10);

/// Client side: `10 s * (timeout_base + 2) + 100 ms * ttl`.
pub fn client_timeout(ttl: u8, timeout_base: u16) -> Duration {
    Duration::from_millis(10_000 * (timeout_base as u64 + 2) + 100 * ttl as u64)
}

/// Time between retries of one broadcast step.
pub fn retry_interval(ttl: u8, timeout_base: u16, retries: u8) -> Duration {
    client_timeout(ttl, timeout_base) / retries.max(1) as u32
}

/// Server side: `10 s * (timeout_base + 1)`.
pub fn server_timeout(timeout_base: u16) -> Duration {
    Duration::from_secs(10 * (timeout_base as u64 + 1))
}

/// Pull-mode servers must also outlast their own report interval.
pub fn server_pull_timeout(timeout_base: u16, report_delay: Duration) -> Duration {
    server_timeout(timeout_base).max(report_delay + Duration::from_secs(1))
}
