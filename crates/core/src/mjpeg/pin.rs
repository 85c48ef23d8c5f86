use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Wrong PINs tolerated from one address before it is blocked.
pub const MAX_PIN_ATTEMPTS: u32 = 5;
pub const BLOCK_DURATION: Duration = Duration::from_secs(5 * 60);

/// Result of a PIN submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinCheck {
    Accepted,
    /// Wrong PIN; the address may try again.
    Rejected { attempts_left: u32 },
    /// Too many wrong PINs, or still inside an earlier block.
    Blocked,
}

#[derive(Debug, Default)]
struct AddressRecord {
    failed: u32,
    authorized: bool,
    blocked_until: Option<Instant>,
}

/// PIN gate keyed by client IP address.
///
/// Access is granted per address rather than per connection, as browsers
/// open separate connections for the page and the stream.
#[derive(Debug)]
pub struct PinGuard {
    pin: Option<String>,
    records: Mutex<HashMap<IpAddr, AddressRecord>>,
}

impl PinGuard {
    /// `None` disables the gate: every address is authorized.
    pub fn new(pin: Option<String>) -> Self {
        Self {
            pin,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.pin.is_some()
    }

    pub fn check(&self, ip: IpAddr, candidate: &str, now: Instant) -> PinCheck {
        let Some(pin) = &self.pin else {
            return PinCheck::Accepted;
        };
        let mut records = self.records.lock();
        let record = records.entry(ip).or_default();

        if record.blocked_until.is_some_and(|until| now < until) {
            return PinCheck::Blocked;
        }
        record.blocked_until = None;

        if candidate == pin {
            record.failed = 0;
            record.authorized = true;
            tracing::info!(%ip, "PIN accepted");
            return PinCheck::Accepted;
        }

        record.failed += 1;
        record.authorized = false;
        if record.failed >= MAX_PIN_ATTEMPTS {
            record.failed = 0;
            record.blocked_until = Some(now + BLOCK_DURATION);
            tracing::warn!(
                %ip,
                block_secs = BLOCK_DURATION.as_secs(),
                "too many wrong PINs, address blocked"
            );
            PinCheck::Blocked
        } else {
            tracing::debug!(%ip, failed = record.failed, "wrong PIN");
            PinCheck::Rejected {
                attempts_left: MAX_PIN_ATTEMPTS - record.failed,
            }
        }
    }

    pub fn is_blocked(&self, ip: IpAddr, now: Instant) -> bool {
        self.enabled()
            && self
                .records
                .lock()
                .get(&ip)
                .and_then(|r| r.blocked_until)
                .is_some_and(|until| now < until)
    }

    /// Whether `ip` may load the page and the stream.
    pub fn is_authorized(&self, ip: IpAddr, now: Instant) -> bool {
        if !self.enabled() {
            return true;
        }
        !self.is_blocked(ip, now) && self.records.lock().get(&ip).is_some_and(|r| r.authorized)
    }
}
