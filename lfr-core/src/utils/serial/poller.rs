//! Wraparound-safe waiting for a reply of known length.
//!
//! The board answers each request with a fixed number of bytes and no framing,
//! so the client only needs to know when that many bytes are buffered. The
//! wait sleeps in short increments and gives up once its [`TimeBudget`] runs
//! out. The millisecond clock is 32 bits wide and wraps roughly every 49.7
//! days, so the deadline comparison has to survive one wrap mid-wait.

use embedded_hal::delay::DelayNs;

use super::{ByteStream, Clock};

/// The expected reply did not arrive within the time budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout;

/// Deadline bookkeeping for a single bounded wait.
///
/// `deadline` is `start + limit` in wrapping arithmetic. When that sum
/// overflowed, `wraps` is set and the deadline lies beyond the clock's wrap
/// point: plain `now > deadline` would be true immediately, so the comparison
/// is held off until the clock is seen to wrap. From then on the deadline is in
/// the current epoch and no further wrap is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBudget {
    start: u32,
    limit: u32,
    deadline: u32,
    wraps: bool,
    previous: u32,
    overrun: bool,
}

impl TimeBudget {
    /// Start a budget of `limit_ms` at clock sample `now`. A limit of zero never expires.
    pub fn new(
        now: u32,
        limit_ms: u32,
    ) -> Self {
        let deadline = now.wrapping_add(limit_ms);
        Self {
            start: now,
            limit: limit_ms,
            deadline,
            wraps: deadline < now,
            previous: now,
            overrun: false,
        }
    }

    pub fn deadline(&self) -> u32 {
        self.deadline
    }

    /// `true` while the deadline is still on the far side of the clock's wrap point.
    pub fn wraps(&self) -> bool {
        self.wraps
    }

    /// Milliseconds between the start and the latest sample.
    pub fn elapsed(&self) -> u32 {
        self.previous.wrapping_sub(self.start)
    }

    /// Feed a fresh clock sample and report whether the budget is exhausted.
    pub fn expired(
        &mut self,
        now: u32,
    ) -> bool {
        if now < self.previous {
            if self.wraps {
                self.wraps = false;
            } else {
                // The deadline sat in the epoch we just left.
                self.overrun = true;
            }
        }
        self.previous = now;

        if self.limit == 0 {
            return false;
        }
        self.overrun || (!self.wraps && now > self.deadline)
    }
}

/// Block until `expected` bytes are buffered on `stream` or `timeout_ms` elapses.
///
/// Returns the number of bytes available, which may exceed `expected`. A
/// `timeout_ms` of zero waits indefinitely. When enough bytes are already
/// buffered the call returns without sleeping.
pub fn wait_for_bytes<S, C, D>(
    stream: &mut S,
    clock: &C,
    delay: &mut D,
    expected: usize,
    timeout_ms: u32,
    poll_interval_ms: u32,
) -> Result<usize, Timeout>
where
    S: ByteStream + ?Sized,
    C: Clock + ?Sized,
    D: DelayNs + ?Sized,
{
    let mut available = stream.available();
    if available >= expected {
        return Ok(available);
    }

    let mut budget = TimeBudget::new(clock.now_ms(), timeout_ms);
    while available < expected {
        delay.delay_ms(poll_interval_ms);

        if budget.expired(clock.now_ms()) {
            tracing::warn!(
                expected,
                available,
                elapsed_ms = budget.elapsed(),
                "reply did not arrive in time"
            );
            return Err(Timeout);
        }

        available = stream.available();
    }

    tracing::trace!(expected, available, elapsed_ms = budget.elapsed(), "reply buffered");
    Ok(available)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::serial::mock::{ScriptedStream, SimClock};

    #[test]
    fn budget_expires_strictly_after_deadline() {
        let mut budget = TimeBudget::new(100, 5);
        assert!(!budget.wraps());
        assert!(!budget.expired(105));
        assert!(budget.expired(106));
    }

    #[test]
    fn zero_limit_never_expires() {
        let mut budget = TimeBudget::new(0, 0);
        assert!(!budget.expired(u32::MAX));
        assert!(!budget.expired(3));
    }

    #[test]
    fn overflowing_deadline_waits_for_wrap() {
        let mut budget = TimeBudget::new(u32::MAX - 2, 5);
        assert!(budget.wraps());
        assert_eq!(budget.deadline(), 2);

        // Pre-wrap samples are numerically far beyond the deadline.
        assert!(!budget.expired(u32::MAX - 1));
        assert!(!budget.expired(u32::MAX));
        assert!(!budget.expired(0));
        assert!(!budget.wraps());
        assert!(!budget.expired(2));
        assert!(budget.expired(3));
        assert_eq!(budget.elapsed(), 6);
    }

    #[test]
    fn wrap_past_non_overflowing_deadline_expires() {
        // Deadline lands exactly on u32::MAX, which `now > deadline` can never beat.
        let mut budget = TimeBudget::new(u32::MAX - 5, 5);
        assert!(!budget.wraps());
        assert!(!budget.expired(u32::MAX));
        assert!(budget.expired(0));
    }

    #[test]
    fn fast_path_does_not_sleep() {
        let clock = SimClock::new();
        let mut delay = clock.delay();
        let mut stream = ScriptedStream::new(clock.clone());
        stream.push_now(&[1, 2, 3, 4]);

        for expected in 0..=4 {
            let got = wait_for_bytes(&mut stream, &clock, &mut delay, expected, 10, 1);
            assert_eq!(got, Ok(4));
        }
        assert_eq!(delay.sleeps(), 0);
        assert_eq!(clock.now_ms(), 0);
    }

    #[test]
    fn timeout_lands_within_one_poll_interval() {
        for poll in [1, 2, 3] {
            for timeout in [1, 2, 5, 17, 100] {
                let clock = SimClock::starting_at(1_000);
                let mut delay = clock.delay();
                let mut stream = ScriptedStream::new(clock.clone());

                let got = wait_for_bytes(&mut stream, &clock, &mut delay, 2, timeout, poll);
                assert_eq!(got, Err(Timeout));

                let waited = clock.now_ms() - 1_000;
                assert!(waited >= timeout, "waited {waited} < {timeout}");
                assert!(waited <= timeout + poll, "waited {waited} > {timeout} + {poll}");
            }
        }
    }

    #[test]
    fn bytes_arriving_late_are_returned() {
        let clock = SimClock::new();
        let mut delay = clock.delay();
        let mut stream = ScriptedStream::new(clock.clone());
        stream.push_at(3, &[0xE8]);
        stream.push_at(4, &[0x0B]);

        assert_eq!(wait_for_bytes(&mut stream, &clock, &mut delay, 2, 10, 1), Ok(2));
        assert_eq!(clock.now_ms(), 4);
    }

    #[test]
    fn clock_wrap_mid_wait_is_not_a_timeout() {
        let clock = SimClock::starting_at(u32::MAX - 3);
        let mut delay = clock.delay();
        let mut stream = ScriptedStream::new(clock.clone());
        // Arrives after the wrap but before the 10 ms budget runs out.
        stream.push_at(5, &[0xAA]);

        assert_eq!(wait_for_bytes(&mut stream, &clock, &mut delay, 1, 10, 1), Ok(1));
        assert_eq!(clock.now_ms(), 5);
    }

    #[test]
    fn clock_wrap_still_times_out_on_schedule() {
        let clock = SimClock::starting_at(u32::MAX - 3);
        let mut delay = clock.delay();
        let mut stream = ScriptedStream::new(clock.clone());

        assert_eq!(wait_for_bytes(&mut stream, &clock, &mut delay, 1, 10, 1), Err(Timeout));
        // start + 10 wraps to 6; the first sample beyond it is 7.
        assert_eq!(clock.now_ms(), 7);
    }

    #[test]
    fn zero_timeout_waits_until_data() {
        let clock = SimClock::new();
        let mut delay = clock.delay();
        let mut stream = ScriptedStream::new(clock.clone());
        stream.push_at(5_000, &[0; 6]);

        assert_eq!(wait_for_bytes(&mut stream, &clock, &mut delay, 6, 0, 1), Ok(6));
        assert_eq!(clock.now_ms(), 5_000);
    }
}
