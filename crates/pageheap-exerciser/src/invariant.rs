//! Accounting checks.
//!
//! A violation means the subject and the ledger disagree about how much
//! memory is live. Nothing in the crate recovers from one: callers either
//! propagate the error to the driver or hand it to [`fatal`].

use crate::subject::BackingStats;
use crate::util::Length;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("allocation of {requested} (align {align:?}) returned no span")]
    NullSpan {
        requested: Length,
        align: Option<Length>,
    },
    #[error("allocation of {requested} was granted only {granted}")]
    ShortSpan { requested: Length, granted: Length },
    #[error(
        "breaking release of {desired} freed {released_bytes} bytes, \
         expected at least {expected_bytes}"
    )]
    ReleaseShortfall {
        desired: Length,
        expected_bytes: u64,
        released_bytes: u64,
    },
    #[error(
        "subject reports {used_bytes} bytes in use (system {system_bytes}, free {free_bytes}, \
         unmapped {unmapped_bytes}), ledger holds {ledger_bytes}"
    )]
    AccountingDrift {
        system_bytes: u64,
        free_bytes: u64,
        unmapped_bytes: u64,
        used_bytes: u64,
        ledger_bytes: u64,
    },
    #[error(
        "free {free_bytes} + unmapped {unmapped_bytes} bytes exceed system {system_bytes} bytes"
    )]
    StatsUnderflow {
        system_bytes: u64,
        free_bytes: u64,
        unmapped_bytes: u64,
    },
    #[error("{allocated} still allocated after cleanup")]
    NonZeroBalance { allocated: Length },
    #[error("releasing {releasing} from a ledger holding {allocated}")]
    LedgerUnderflow { allocated: Length, releasing: Length },
}

/// Bytes the subject considers in use: `system - free - unmapped`.
pub fn used_bytes(stats: &BackingStats) -> Result<u64, InvariantViolation> {
    stats
        .system_bytes
        .checked_sub(stats.free_bytes)
        .and_then(|rest| rest.checked_sub(stats.unmapped_bytes))
        .ok_or(InvariantViolation::StatsUnderflow {
            system_bytes: stats.system_bytes,
            free_bytes: stats.free_bytes,
            unmapped_bytes: stats.unmapped_bytes,
        })
}

/// The subject's used bytes must equal what the ledger has handed out.
pub fn check_accounting(stats: &BackingStats, allocated: Length) -> Result<(), InvariantViolation> {
    let used = used_bytes(stats)?;
    let expected = allocated.in_bytes();
    if used != expected {
        return Err(InvariantViolation::AccountingDrift {
            system_bytes: stats.system_bytes,
            free_bytes: stats.free_bytes,
            unmapped_bytes: stats.unmapped_bytes,
            used_bytes: used,
            ledger_bytes: expected,
        });
    }
    Ok(())
}

/// After cleanup nothing may remain on the ledger.
pub fn check_drained(allocated: Length) -> Result<(), InvariantViolation> {
    if !allocated.is_zero() {
        return Err(InvariantViolation::NonZeroBalance { allocated });
    }
    Ok(())
}

/// A breaking release must free at least `min(desired, free_bytes)`, where
/// `free_bytes` was read under the same lock hold as the release.
pub fn check_release_floor(
    desired: Length,
    free_bytes: u64,
    released: Length,
) -> Result<(), InvariantViolation> {
    let expected = desired.in_bytes().min(free_bytes);
    let released_bytes = released.in_bytes();
    if released_bytes < expected {
        return Err(InvariantViolation::ReleaseShortfall {
            desired,
            expected_bytes: expected,
            released_bytes,
        });
    }
    Ok(())
}

/// Report a violation and terminate.
///
/// Under libFuzzer the panic is turned into an abort with the input saved.
#[cold]
#[inline(never)]
pub fn fatal(violation: &InvariantViolation) -> ! {
    error!(%violation, "pageheap invariant violated");
    panic!("pageheap invariant violated: {violation}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{HUGE_PAGE_SIZE, PAGE_SIZE};

    fn stats(system: u64, free: u64, unmapped: u64) -> BackingStats {
        BackingStats {
            system_bytes: system,
            free_bytes: free,
            unmapped_bytes: unmapped,
        }
    }

    #[test]
    fn identity_holds() {
        let huge = HUGE_PAGE_SIZE as u64;
        let page = PAGE_SIZE as u64;
        let s = stats(huge, 200 * page, 51 * page);
        assert_eq!(used_bytes(&s), Ok(5 * page));
        assert_eq!(check_accounting(&s, Length::new(5)), Ok(()));
        assert_eq!(check_accounting(&BackingStats::default(), Length::ZERO), Ok(()));
    }

    #[test]
    fn drift_is_reported() {
        let s = stats(HUGE_PAGE_SIZE as u64, 0, 0);
        let err = check_accounting(&s, Length::new(3)).unwrap_err();
        assert!(matches!(
            err,
            InvariantViolation::AccountingDrift {
                used_bytes,
                ledger_bytes,
                ..
            } if used_bytes == HUGE_PAGE_SIZE as u64 && ledger_bytes == 3 * PAGE_SIZE as u64
        ));
    }

    #[test]
    fn underflow_is_not_wrapped() {
        let err = check_accounting(&stats(10, 8, 8), Length::ZERO).unwrap_err();
        assert!(matches!(err, InvariantViolation::StatsUnderflow { .. }));
    }

    #[test]
    fn release_floor() {
        let page = PAGE_SIZE as u64;
        // Asked for 10 pages with only 4 free: 4 is enough.
        assert_eq!(check_release_floor(Length::new(10), 4 * page, Length::new(4)), Ok(()));
        assert_eq!(check_release_floor(Length::ZERO, 4 * page, Length::ZERO), Ok(()));
        let err = check_release_floor(Length::new(3), 100 * page, Length::new(2)).unwrap_err();
        assert_eq!(
            err,
            InvariantViolation::ReleaseShortfall {
                desired: Length::new(3),
                expected_bytes: 3 * page,
                released_bytes: 2 * page,
            }
        );
    }

    #[test]
    fn drained() {
        assert_eq!(check_drained(Length::ZERO), Ok(()));
        assert_eq!(
            check_drained(Length::new(1)),
            Err(InvariantViolation::NonZeroBalance {
                allocated: Length::new(1)
            })
        );
    }

    #[test]
    #[should_panic(expected = "still allocated")]
    fn fatal_panics_with_the_message() {
        fatal(&InvariantViolation::NonZeroBalance {
            allocated: Length::new(2),
        });
    }
}
