pub mod base;
pub mod dragon;
pub mod hybrid;
pub mod mesi;
pub mod storage;

pub use base::CoherentCache;
pub use storage::{Geometry, Line, TagStore};

use serde::{Deserialize, Serialize};

/// Coherence state of one cache line.
///
/// All controllers share the same five states; MESI simply never enters
/// `SharedModified` on its own transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter, Serialize, Deserialize)]
pub enum State {
    Invalid,
    /// only copy, clean
    Exclusive,
    /// only copy, dirty
    Modified,
    /// shared, memory up to date
    SharedClean,
    /// shared, this cache owns the dirty data
    SharedModified,
}

impl State {
    #[must_use]
    pub fn is_valid(self) -> bool {
        self != State::Invalid
    }

    /// May this state legally carry dirty data?
    #[must_use]
    pub fn may_be_dirty(self) -> bool {
        matches!(self, State::Modified | State::SharedModified)
    }

    /// Is this the single owner of the block?
    #[must_use]
    pub fn is_exclusive(self) -> bool {
        matches!(self, State::Exclusive | State::Modified)
    }
}
