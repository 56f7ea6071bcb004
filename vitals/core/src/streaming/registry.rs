//! Per-session map of live streams

use std::collections::HashMap;

use super::handle::StreamHandle;

/// Error when admitting a stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamRegisterError {
    /// A live stream already polls this sensor
    AlreadyRunning,
    /// The session runs the maximum number of streams
    MaxStreamsReached {
        /// Configured limit
        limit: usize,
    },
}

impl std::fmt::Display for StreamRegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "stream already running"),
            Self::MaxStreamsReached { limit } => {
                write!(f, "maximum concurrent streams reached ({limit})")
            }
        }
    }
}

impl std::error::Error for StreamRegisterError {}

/// Live streams of one session, keyed by sensor name
///
/// At most one handle per sensor and at most `max_streams` handles. Only the
/// session dispatcher touches the registry, so it needs no locking.
#[derive(Debug)]
pub struct StreamRegistry {
    streams: HashMap<String, StreamHandle>,
    max_streams: usize,
    total_started: u64,
}

impl StreamRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(max_streams: usize) -> Self {
        Self {
            streams: HashMap::new(),
            max_streams: max_streams.max(1),
            total_started: 0,
        }
    }

    /// Stream limit
    #[must_use]
    pub fn max_streams(&self) -> usize {
        self.max_streams
    }

    /// Number of registered streams
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether no stream is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Whether a stream for `name` is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.streams.contains_key(name)
    }

    /// Names of registered streams, sorted
    #[must_use]
    pub fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.keys().cloned().collect();
        names.sort();
        names
    }

    /// Streams started over the registry's lifetime
    #[must_use]
    pub fn total_streams_started(&self) -> u64 {
        self.total_started
    }

    /// Drop handles whose loop already exited
    ///
    /// A loop only exits on its own when the outbound channel closed or its
    /// task panicked; either way the slot is free again.
    pub fn reap_finished(&mut self) -> usize {
        let before = self.streams.len();
        self.streams.retain(|_, handle| !handle.is_finished());
        before - self.streams.len()
    }

    /// Check whether a stream for `name` may be started
    ///
    /// Duplicates are reported before capacity.
    ///
    /// # Errors
    ///
    /// Returns [`StreamRegisterError`] if `name` is live or the registry is
    /// full.
    pub fn admit(&self, name: &str) -> Result<(), StreamRegisterError> {
        if self.streams.contains_key(name) {
            return Err(StreamRegisterError::AlreadyRunning);
        }
        if self.streams.len() >= self.max_streams {
            return Err(StreamRegisterError::MaxStreamsReached {
                limit: self.max_streams,
            });
        }
        Ok(())
    }

    /// Register a started stream
    ///
    /// # Errors
    ///
    /// Returns the handle back if [`admit`](Self::admit) would refuse it.
    pub fn insert(
        &mut self,
        handle: StreamHandle,
    ) -> Result<(), (StreamRegisterError, StreamHandle)> {
        if let Err(e) = self.admit(handle.command()) {
            return Err((e, handle));
        }
        self.streams.insert(handle.command().to_string(), handle);
        self.total_started += 1;
        Ok(())
    }

    /// Mutable access to a registered stream
    pub fn get_mut(&mut self, name: &str) -> Option<&mut StreamHandle> {
        self.streams.get_mut(name)
    }

    /// Unregister a stream
    pub fn remove(&mut self, name: &str) -> Option<StreamHandle> {
        self.streams.remove(name)
    }

    /// Unregister every stream
    pub fn drain(&mut self) -> Vec<StreamHandle> {
        self.streams.drain().map(|(_, handle)| handle).collect()
    }
}
