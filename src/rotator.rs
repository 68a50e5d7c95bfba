//! Round-robin backend rotation
//!
//! A [`Rotator`] holds the current [`BackendSet`] and a cursor into it. The
//! set and cursor live behind one lock so reading an address and advancing
//! the cursor is a single step with respect to [`Rotator::replace`].

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Ordered backend addresses believed healthy at the last resolution.
///
/// Replaced wholesale, never edited in place. An empty set is valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendSet {
    addrs: Arc<[String]>,
}

impl BackendSet {
    pub fn new(addrs: Vec<String>) -> Self {
        Self {
            addrs: addrs.into(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }
}

impl<S: Into<String>> FromIterator<S> for BackendSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Default)]
struct Rotation {
    backends: BackendSet,
    /// Index of the next backend to hand out; always < backends.len() unless empty
    cursor: usize,
}

/// Round-robin selector shared by every connection of one service
#[derive(Debug, Default)]
pub struct Rotator {
    rotation: Mutex<Rotation>,
}

impl Rotator {
    pub fn new(backends: BackendSet) -> Self {
        Self {
            rotation: Mutex::new(Rotation {
                backends,
                cursor: 0,
            }),
        }
    }

    /// Next backend address, or `None` when the set is empty
    pub fn next(&self) -> Option<String> {
        let mut rotation = self.rotation.lock();
        let len = rotation.backends.len();
        if len == 0 {
            return None;
        }
        let addr = rotation.backends.addrs()[rotation.cursor].clone();
        rotation.cursor = (rotation.cursor + 1) % len;
        Some(addr)
    }

    /// Swap in a new backend set, clamping the cursor into its bounds
    pub fn replace(&self, backends: BackendSet) {
        let mut rotation = self.rotation.lock();
        let len = backends.len();
        rotation.cursor = if len == 0 { 0 } else { rotation.cursor % len };
        debug!(
            previous = rotation.backends.len(),
            current = len,
            "Replaced backend set"
        );
        rotation.backends = backends;
    }

    /// Snapshot of the current backend set
    pub fn backends(&self) -> BackendSet {
        self.rotation.lock().backends.clone()
    }

    pub fn len(&self) -> usize {
        self.rotation.lock().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
