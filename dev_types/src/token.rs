//! Driver lifetime tokens
//!
//! A [`DriverToken`] is a counting handle with a validity flag. Code that is
//! about to call into a driver acquires a hold first; teardown revokes the
//! token so no new holds can be taken, while holds already granted keep the
//! driver's callbacks valid until they are dropped.
//!
//! The token never owns the driver it protects. It only answers one
//! question: is the driver still accepting callers right now?

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct TokenState {
    holds: AtomicUsize,
    revoked: AtomicBool,
}

/// A revocable lifetime token for a driver
///
/// Clones share the same underlying state; a hold acquired through any clone
/// is visible to all of them.
#[derive(Debug, Clone, Default)]
pub struct DriverToken {
    state: Arc<TokenState>,
}

impl DriverToken {
    /// Creates a fresh, unrevoked token
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to take a hold on the driver
    ///
    /// Non-blocking. Returns `None` once the token has been revoked; the
    /// increment taken optimistically is undone on that path.
    pub fn try_acquire(&self) -> Option<DriverHold> {
        self.state.holds.fetch_add(1, Ordering::Acquire);
        if self.state.revoked.load(Ordering::Acquire) {
            self.state.holds.fetch_sub(1, Ordering::Release);
            return None;
        }
        Some(DriverHold {
            state: Arc::clone(&self.state),
        })
    }

    /// Marks the driver as tearing down
    ///
    /// Subsequent [`try_acquire`](Self::try_acquire) calls fail. Holds that
    /// were granted earlier stay valid until dropped; callers that need
    /// quiescence poll [`holds`](Self::holds) after revoking.
    pub fn revoke(&self) {
        self.state.revoked.store(true, Ordering::Release);
    }

    /// Returns whether the token has been revoked
    pub fn is_revoked(&self) -> bool {
        self.state.revoked.load(Ordering::Acquire)
    }

    /// Number of holds currently outstanding
    pub fn holds(&self) -> usize {
        self.state.holds.load(Ordering::Acquire)
    }
}

/// An RAII hold on a driver's token
///
/// While a hold exists, the driver behind the token must keep honoring
/// callbacks that were captured before the hold was taken. Dropping the hold
/// releases it.
#[derive(Debug)]
pub struct DriverHold {
    state: Arc<TokenState>,
}

impl Drop for DriverHold {
    fn drop(&mut self) {
        self.state.holds.fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release_counts() {
        let token = DriverToken::new();
        assert_eq!(token.holds(), 0);

        let hold = token.try_acquire().expect("fresh token must grant holds");
        assert_eq!(token.holds(), 1);

        let second = token.try_acquire().expect("holds are not exclusive");
        assert_eq!(token.holds(), 2);

        drop(hold);
        assert_eq!(token.holds(), 1);
        drop(second);
        assert_eq!(token.holds(), 0);
    }

    #[test]
    fn test_revoke_blocks_new_holds() {
        let token = DriverToken::new();
        token.revoke();
        assert!(token.is_revoked());
        assert!(token.try_acquire().is_none());
        // failed acquire must not leak a count
        assert_eq!(token.holds(), 0);
    }

    #[test]
    fn test_existing_hold_survives_revoke() {
        let token = DriverToken::new();
        let hold = token.try_acquire().expect("acquire before revoke");

        token.revoke();
        assert!(token.try_acquire().is_none());
        assert_eq!(token.holds(), 1);

        drop(hold);
        assert_eq!(token.holds(), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let token = DriverToken::new();
        let clone = token.clone();

        let hold = clone.try_acquire().expect("clone grants holds");
        assert_eq!(token.holds(), 1);

        token.revoke();
        assert!(clone.is_revoked());
        assert!(clone.try_acquire().is_none());
        drop(hold);
    }
}
