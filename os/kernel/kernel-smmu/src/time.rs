//! Bounded polling against a platform time source.

/// Upper bound for global and per-context TLB sync.
pub const TLB_SYNC_TIMEOUT_US: u64 = 500_000;
/// Upper bound for the micro-controller to report idle after a halt request.
pub const HALT_TIMEOUT_US: u64 = 30_000;
/// Poll interval while an ATOS translation is in flight.
pub const ATOS_POLL_STEP_US: u64 = 5;
/// Upper bound for an ATOS translation.
pub const ATOS_TIMEOUT_US: u64 = 50;

/// Microsecond time source used for handshakes and deferred work.
pub trait Clocksource: Send + Sync {
    /// Monotonic microseconds.
    fn now_us(&self) -> u64;

    /// Busy-waits for roughly `us` microseconds.
    fn delay_us(&self, us: u64);
}

/// Polls `done` every `step_us` until it returns `true` or `timeout_us`
/// elapsed. Returns whether the condition was met.
pub fn poll_timeout(
    clock: &dyn Clocksource,
    step_us: u64,
    timeout_us: u64,
    mut done: impl FnMut() -> bool,
) -> bool {
    let step = step_us.max(1);
    let deadline = clock.now_us().saturating_add(timeout_us);
    loop {
        if done() {
            return true;
        }
        if clock.now_us() >= deadline {
            return done();
        }
        clock.delay_us(step);
    }
}
