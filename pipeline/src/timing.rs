//! # Time Source & Bounded Waits
//!
//! Every wait in the pipeline (sample-transfer completion, buffer-swap
//! readiness, SD command responses, card busy, offload completion, stop drain)
//! goes through [`poll_until`]. There is no other waiting loop in the crate,
//! so the "never block forever" contract of the acquisition context is
//! enforced in one place.
//!
//! On the firmware the [`Clock`] maps to the microsecond timer and `sleep_us`
//! to a busy-wait; on the host it maps to `std::time` or to a simulated clock
//! that advances instantly.

use core::convert::Infallible;

/// Monotonic microsecond time source with a blocking sleep
pub trait Clock {
    /// Microseconds since an arbitrary fixed origin
    fn now_us(&self) -> u64;

    /// Block the calling context for at least `us` microseconds
    fn sleep_us(&self, us: u32);
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }

    fn sleep_us(&self, us: u32) {
        (**self).sleep_us(us)
    }
}

/// Outcome of a bounded wait that did not produce a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaitError<E> {
    /// The deadline passed before the attempt succeeded
    TimedOut,
    /// The attempt itself failed; waiting was abandoned
    Failed(E),
}

/// Repeatedly run `attempt` until it yields a value, fails, or `timeout_us`
/// elapses.
///
/// `attempt` always runs at least once, so a zero timeout still checks the
/// condition. Between attempts the clock sleeps `poll_us` (zero spins).
pub fn poll_until<C, T, E, F>(
    clock: &C,
    timeout_us: u64,
    poll_us: u32,
    mut attempt: F,
) -> Result<T, WaitError<E>>
where
    C: Clock + ?Sized,
    F: FnMut() -> Result<Option<T>, E>,
{
    let deadline = clock.now_us().saturating_add(timeout_us);
    loop {
        if let Some(value) = attempt().map_err(WaitError::Failed)? {
            return Ok(value);
        }
        if clock.now_us() >= deadline {
            return Err(WaitError::TimedOut);
        }
        if poll_us > 0 {
            clock.sleep_us(poll_us);
        }
    }
}

/// Infallible form of [`poll_until`]: returns whether `ready` became true
/// before the deadline.
pub fn wait_until<C, F>(clock: &C, timeout_us: u64, poll_us: u32, mut ready: F) -> bool
where
    C: Clock + ?Sized,
    F: FnMut() -> bool,
{
    poll_until::<C, (), Infallible, _>(clock, timeout_us, poll_us, || {
        Ok(ready().then_some(()))
    })
    .is_ok()
}
