//! Typed watch events.

/// One change delivered on a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<O> {
    /// The object was created (or re-created after a full removal).
    Added(O),
    Modified(O),
    /// The object passed its final removal; this is the last event for the
    /// uid.
    Deleted(O),
    /// Periodic marker carrying the current tip so idle watchers can keep
    /// their resume point fresh. Only sent when the watcher opted in.
    Bookmark { resource_version: String },
    /// A record could not be decoded; the stream continues.
    Error(String),
}

impl<O> WatchEvent<O> {
    pub fn object(&self) -> Option<&O> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => Some(o),
            _ => None,
        }
    }
}
