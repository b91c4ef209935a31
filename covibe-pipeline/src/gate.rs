//! Cancellation gate.
//!
//! Stages never write a transition from their own stale copy. They go
//! through [`commit`], which re-reads the persisted record, refuses to touch
//! it if it has been cancelled (or moved on), and writes with CAS.

use crate::model::{Status, Submission};
use crate::store::{Store, StoreError, MAX_CAS_ATTEMPTS};

/// Outcome of a gated transition.
#[derive(Debug)]
pub enum Commit {
    /// The transition was written; carries the stored record.
    Applied(Submission),
    /// The submission was cancelled; nothing was written.
    Cancelled,
    /// The submission is in a state the caller did not expect.
    Moved(Status),
}

/// Apply `transition` to the live record if it is still in one of the
/// `expected` states.
pub fn commit<F>(
    store: &Store,
    id: i64,
    expected: &[Status],
    mut transition: F,
) -> Result<Commit, StoreError>
where
    F: FnMut(&mut Submission),
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let mut live = store.get_submission(id)?.ok_or(StoreError::NotFound(id))?;
        if live.status == Status::Cancelled {
            return Ok(Commit::Cancelled);
        }
        if !expected.contains(&live.status) {
            return Ok(Commit::Moved(live.status));
        }
        transition(&mut live);
        match store.save(&live) {
            Ok(saved) => return Ok(Commit::Applied(saved)),
            Err(StoreError::Conflict(_)) => {
                tracing::debug!(submission_id = id, "Concurrent write, retrying transition");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::Conflict(id))
}

/// Whether the persisted record now reads CANCELLED.
pub fn is_cancelled(store: &Store, id: i64) -> Result<bool, StoreError> {
    Ok(store
        .get_submission(id)?
        .is_some_and(|s| s.status == Status::Cancelled))
}
