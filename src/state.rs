//! Shared state abstraction.
//!
//! Provides the interface for the named state objects a peer replicates.
//! The peer never inspects the bytes; it only moves them between the
//! broker and the state's `merge`/`marshal` pair.

use std::collections::BTreeSet;
use std::sync::Mutex;

/// Error type reported by state implementations.
pub type StateError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A named piece of state replicated across the cluster.
///
/// `merge` is invoked concurrently from several receive loops and
/// `marshal` from the full-state snapshot path, so implementations must be
/// internally synchronized. For the cluster to converge under arbitrary
/// delivery order, `merge` must be commutative and idempotent: a delta may
/// arrive twice, out of order, or after the full state that already
/// contained it.
///
/// # Example
///
/// ```ignore
/// use alertmesh::{State, StateError};
///
/// struct NotificationLog {
///     inner: std::sync::Mutex<Vec<u8>>,
/// }
///
/// impl State for NotificationLog {
///     fn merge(&self, data: &[u8]) -> Result<(), StateError> {
///         // fold remote entries into the local log
///         Ok(())
///     }
///
///     fn marshal(&self) -> Result<Vec<u8>, StateError> {
///         Ok(self.inner.lock().unwrap().clone())
///     }
/// }
/// ```
pub trait State: Send + Sync {
    /// Folds remotely produced bytes into the local value.
    fn merge(&self, data: &[u8]) -> Result<(), StateError>;

    /// Serializes the complete local value for a full-state publication.
    fn marshal(&self) -> Result<Vec<u8>, StateError>;
}

/// A grow-only set of opaque entries, for tests and examples.
///
/// Set union is commutative, associative and idempotent, which makes this
/// the smallest state that honors the [`State`] merge contract.
#[derive(Debug, Default)]
pub struct SetState {
    entries: Mutex<BTreeSet<Vec<u8>>>,
}

impl SetState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a local entry and returns the serialized singleton delta,
    /// ready to hand to a broadcast channel.
    pub fn insert(&self, entry: Vec<u8>) -> Result<Vec<u8>, StateError> {
        let delta = serde_json::to_vec(&[&entry])?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(entry);
        Ok(delta)
    }

    pub fn contains(&self, entry: &[u8]) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.contains(entry)
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl State for SetState {
    fn merge(&self, data: &[u8]) -> Result<(), StateError> {
        let incoming: Vec<Vec<u8>> = serde_json::from_slice(data)?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.extend(incoming);
        Ok(())
    }

    fn marshal(&self) -> Result<Vec<u8>, StateError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let all: Vec<&Vec<u8>> = entries.iter().collect();
        Ok(serde_json::to_vec(&all)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_state_merge_is_idempotent() {
        let state = SetState::new();
        let delta = state.insert(b"n1".to_vec()).unwrap();

        state.merge(&delta).unwrap();
        state.merge(&delta).unwrap();

        assert_eq!(state.len(), 1);
        assert!(state.contains(b"n1"));
    }

    #[test]
    fn test_set_state_merge_commutes() {
        let a = SetState::new();
        let b = SetState::new();

        let d1 = a.insert(b"x".to_vec()).unwrap();
        let d2 = b.insert(b"y".to_vec()).unwrap();

        // Apply in opposite orders; both sides converge.
        a.merge(&d2).unwrap();
        b.merge(&d1).unwrap();

        assert_eq!(a.marshal().unwrap(), b.marshal().unwrap());
    }

    #[test]
    fn test_set_state_full_state_round_trip() {
        let source = SetState::new();
        source.insert(b"1".to_vec()).unwrap();
        source.insert(b"2".to_vec()).unwrap();

        let target = SetState::new();
        target.merge(&source.marshal().unwrap()).unwrap();

        assert_eq!(target.len(), 2);
    }

    #[test]
    fn test_set_state_rejects_garbage() {
        let state = SetState::new();
        assert!(state.merge(b"not json").is_err());
    }
}
