//! Fixed-point retry queue
//!
//! Files that reference functions created by later files fail on their first
//! attempt. Instead of asking for a dependency graph, every pending item is
//! attempted once per pass; an item that succeeds leaves the queue, one that
//! asks to be retried goes to the back. The loop stops when the queue is empty
//! or when a whole pass made no progress, which is how genuine cycles end.

use std::collections::VecDeque;

/// Result of one attempt
#[derive(Debug)]
pub enum Attempt<E> {
    Done,
    /// Try again on the next pass
    Retry,
    /// Stop the whole resolution
    Abort(E),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution<T> {
    /// Passes run, including the final pass without progress if any
    pub passes: usize,
    /// Items still pending when the loop stopped, in queue order
    pub unresolved: Vec<T>,
}

impl<T> Resolution<T> {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Attempt every item until all are done or a pass resolves none of them.
///
/// # Errors
///
/// Returns the first `Attempt::Abort` error; items not yet attempted are left
/// untouched.
pub fn resolve<T, E>(
    pending: impl IntoIterator<Item = T>,
    mut attempt: impl FnMut(&T) -> Attempt<E>,
) -> Result<Resolution<T>, E> {
    let mut queue: VecDeque<T> = pending.into_iter().collect();
    let mut passes = 0;

    while !queue.is_empty() {
        passes += 1;
        let mut progress = 0;

        for _ in 0..queue.len() {
            let Some(item) = queue.pop_front() else {
                break;
            };
            match attempt(&item) {
                Attempt::Done => progress += 1,
                Attempt::Retry => queue.push_back(item),
                Attempt::Abort(error) => return Err(error),
            }
        }

        if progress == 0 {
            break;
        }
    }

    Ok(Resolution {
        passes,
        unresolved: queue.into_iter().collect(),
    })
}
