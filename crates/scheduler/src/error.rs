// SPDX-License-Identifier: Apache-2.0

//! Errors for the scheduling stores.

/// Errors that can occur when inserting into a bounded store.
#[derive(thiserror::Error, Debug)]
pub enum PushError<T> {
    /// The store is at capacity; the rejected element is handed back so the
    /// caller can reply to the client and roll back admission accounting.
    #[error("store is full and the element could not be inserted")]
    Full(T),
}

impl<T> PushError<T> {
    /// Returns the element that failed to insert.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(t) => t,
        }
    }
}

/// Errors that can occur when removing from a store.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PopError {
    /// The store is empty.
    #[error("store is empty")]
    Empty,

    /// The element was not found where the caller claimed it was. This is a
    /// programming error on the caller's side and queues treat it as fatal.
    #[error("element not present at the claimed slot")]
    Mismatch,
}
