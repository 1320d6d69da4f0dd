// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::time::Duration;
use std::time::Instant;

/// Bound on a blocking operation.
///
/// [`Timeout::POLL`] (zero) checks the awaited condition exactly once and
/// returns [`Error::Timeout`] if it does not already hold; [`Timeout::INFINITE`]
/// waits forever.
///
/// [`Error::Timeout`]: crate::Error::Timeout
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Timeout(Option<Duration>);

impl Timeout {
    /// Wait forever.
    pub const INFINITE: Timeout = Timeout(None);

    /// Check once, never block.
    pub const POLL: Timeout = Timeout(Some(Duration::ZERO));

    #[must_use]
    pub const fn from_millis(millis: u64) -> Timeout {
        Timeout(Some(Duration::from_millis(millis)))
    }

    #[must_use]
    pub const fn is_infinite(self) -> bool {
        self.0.is_none()
    }

    pub(crate) fn deadline(self) -> Deadline {
        match self.0 {
            None => Deadline::Never,
            Some(d) => Deadline::At(Instant::now() + d),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout(Some(d))
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => f.write_str("Timeout::INFINITE"),
            Some(d) => write!(f, "Timeout({d:?})"),
        }
    }
}

/// Absolute form of a [`Timeout`], fixed at the start of a wait loop.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Deadline {
    Never,
    At(Instant),
}

impl Deadline {
    pub(crate) fn expired(&self) -> bool {
        match self {
            Deadline::Never => false,
            Deadline::At(t) => Instant::now() >= *t,
        }
    }

    /// Time left until expiry, clamped to `cap`. Used to slice condition
    /// variable waits so that waiters re-check their condition periodically.
    pub(crate) fn remaining_capped(&self, cap: Duration) -> Duration {
        match self {
            Deadline::Never => cap,
            Deadline::At(t) => t.saturating_duration_since(Instant::now()).min(cap),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_expires_immediately() {
        let d = Timeout::POLL.deadline();
        assert!(d.expired());
    }

    #[test]
    fn infinite_never_expires() {
        let d = Timeout::INFINITE.deadline();
        assert!(!d.expired());
        assert_eq!(
            d.remaining_capped(Duration::from_millis(5)),
            Duration::from_millis(5)
        );
    }

    #[test]
    fn millis_deadline() {
        let d = Timeout::from_millis(10_000).deadline();
        assert!(!d.expired());
        assert!(d.remaining_capped(Duration::from_secs(60)) <= Duration::from_secs(10));
    }
}
