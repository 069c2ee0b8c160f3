//! Notifications emitted by a running flash.
use crate::checksum::ChecksumSet;
use crate::error::FlashError;
use crate::progress::ProgressState;
use std::fmt;

/// Which pass a notification belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PassKind {
    Write,
    Verify,
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassKind::Write => f.write_str("write"),
            PassKind::Verify => f.write_str("verify"),
        }
    }
}

/// Lifecycle of one flash operation.
///
/// `Idle -> Writing -> (Verifying) -> Finished`, with `Errored` reachable from
/// any state and `Aborted` from either pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashState {
    Idle,
    Writing,
    Verifying,
    Finished,
    Errored,
    Aborted,
}

impl FlashState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlashState::Finished | FlashState::Errored | FlashState::Aborted
        )
    }
}

/// Totals reported once a flash completes successfully.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassResult {
    /// Bytes pulled from the image source (before any transform).
    pub bytes_read: u64,
    /// Bytes confirmed by the target, including alignment padding.
    pub bytes_written: u64,
    /// Digests of the written data. Empty if nothing was hashed.
    pub checksum: ChecksumSet,
}

/// Everything a front-end can observe about a flash.
#[derive(Clone, Debug)]
pub enum FlashEvent {
    State(FlashState),
    Progress(ProgressState),
    Checksum { kind: PassKind, checksums: ChecksumSet },
    /// An abort was observed; an `Error(Aborted)` follows.
    Abort,
    Error(FlashError),
    Finish(PassResult),
}
