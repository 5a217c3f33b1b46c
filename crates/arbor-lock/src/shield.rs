//! Scoped job-control signal shielding for lock-held critical sections.
//!
//! While a client holds the hardware lock it must not be stoppable: a
//! SIGSTOP'd holder would leave the device locked indefinitely. The holder
//! therefore masks the job-control signals (STOP, TSTP, TTIN, TTOU) for the
//! duration of the critical section and restores the previous mask on every
//! exit path, including error returns. Fatal signals stay deliverable.
//!
//! Actual mask manipulation is platform plumbing and is injected through
//! [`SignalMask`]; tests and non-POSIX hosts use [`NullSignalMask`].

use std::sync::Arc;

/// Opaque snapshot of the pre-shield signal mask, returned by
/// [`SignalMask::block_job_control`] and consumed by [`SignalMask::restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskToken(pub u64);

/// Collaborator that actually blocks and restores job-control signals for
/// the calling task.
pub trait SignalMask: Send + Sync {
    /// Masks {STOP, TSTP, TTIN, TTOU} and returns the previous mask.
    fn block_job_control(&self) -> MaskToken;
    /// Reinstates a previously saved mask.
    fn restore(&self, token: MaskToken);
}

/// No-op mask for tests and hosts without job-control signals.
#[derive(Debug, Default)]
pub struct NullSignalMask;

impl SignalMask for NullSignalMask {
    fn block_job_control(&self) -> MaskToken {
        MaskToken(0)
    }

    fn restore(&self, _token: MaskToken) {}
}

/// RAII guard: engages the shield on construction, restores the saved mask
/// on drop.
///
/// Dropping is the only way to disengage, so early returns and `?`
/// propagation cannot leak a blocked mask.
pub struct SignalShield {
    mask: Arc<dyn SignalMask>,
    token: Option<MaskToken>,
}

impl std::fmt::Debug for SignalShield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalShield")
            .field("token", &self.token)
            .finish()
    }
}

impl SignalShield {
    pub fn engage(mask: Arc<dyn SignalMask>) -> Self {
        let token = mask.block_job_control();
        Self {
            mask,
            token: Some(token),
        }
    }
}

impl Drop for SignalShield {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.mask.restore(token);
        }
    }
}
