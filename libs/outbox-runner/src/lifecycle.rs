/// The states a relay runner moves through across one `start()`/`stop()`
/// cycle (spec §4.8). Terminal once `Stopped`: a runner is not restarted
/// in place, a fresh one is constructed instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, `start()` not yet called.
    Idle,
    /// `start()` called, contending for leadership via the distributed
    /// mutex.
    Acquiring,
    /// Elected leader, `LISTEN` established, poll timer armed.
    Listening,
    /// `stop()` called; waiting for any in-flight batch to finish before
    /// releasing the leader mutex.
    Draining,
    /// Fully wound down.
    Stopped,
}
