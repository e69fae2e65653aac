use std::fmt::{self, Display};
use std::path::PathBuf;

use bitflags::bitflags;
use nix::sys::inotify::AddWatchFlags;

bitflags! {
    /// Selects which classes of filesystem events a monitor reports.
    pub struct EventClasses: u8 {
        const CONTENT = 0b01;
        const METADATA = 0b10;
    }
}

/// A classified filesystem event.
///
/// This is a closed set: consumers match exhaustively, so adding a kind is a
/// compile error at every use site until it is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Access,
    Attribute,
    CloseWrite,
    CloseNoWrite,
    Create,
    Delete,
    DeleteSelf,
    Modify,
    MoveSelf,
    Rename,
    Open,
}

impl EventKind {
    /// Translate a raw inotify event mask into a kind.
    ///
    /// `IN_MOVED_TO` reports the destination name and so maps to `Rename`;
    /// `IN_MOVED_FROM` means the name left the directory and maps to
    /// `Delete`. Returns `None` for masks that carry no event bit we track
    /// (e.g. a bare `IN_ISDIR` or `IN_UNMOUNT`).
    pub fn classify(mask: AddWatchFlags) -> Option<EventKind> {
        if mask.contains(AddWatchFlags::IN_CREATE) {
            Some(EventKind::Create)
        } else if mask.contains(AddWatchFlags::IN_MOVED_TO) {
            Some(EventKind::Rename)
        } else if mask.contains(AddWatchFlags::IN_MOVED_FROM) {
            Some(EventKind::Delete)
        } else if mask.contains(AddWatchFlags::IN_DELETE) {
            Some(EventKind::Delete)
        } else if mask.contains(AddWatchFlags::IN_DELETE_SELF) {
            Some(EventKind::DeleteSelf)
        } else if mask.contains(AddWatchFlags::IN_MOVE_SELF) {
            Some(EventKind::MoveSelf)
        } else if mask.contains(AddWatchFlags::IN_CLOSE_WRITE) {
            Some(EventKind::CloseWrite)
        } else if mask.contains(AddWatchFlags::IN_MODIFY) {
            Some(EventKind::Modify)
        } else if mask.contains(AddWatchFlags::IN_ATTRIB) {
            Some(EventKind::Attribute)
        } else if mask.contains(AddWatchFlags::IN_CLOSE_NOWRITE) {
            Some(EventKind::CloseNoWrite)
        } else if mask.contains(AddWatchFlags::IN_OPEN) {
            Some(EventKind::Open)
        } else if mask.contains(AddWatchFlags::IN_ACCESS) {
            Some(EventKind::Access)
        } else {
            None
        }
    }

    pub fn class(self) -> EventClasses {
        match self {
            EventKind::CloseWrite
            | EventKind::Create
            | EventKind::Modify
            | EventKind::Delete
            | EventKind::DeleteSelf
            | EventKind::MoveSelf
            | EventKind::Rename => EventClasses::CONTENT,
            EventKind::Access
            | EventKind::Attribute
            | EventKind::CloseNoWrite
            | EventKind::Open => EventClasses::METADATA,
        }
    }

    /// Stable lowercase name, used for the `WATCHEXEC_EVENT` encoding.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Access => "access",
            EventKind::Attribute => "attribute",
            EventKind::CloseWrite => "close_write",
            EventKind::CloseNoWrite => "close_nowrite",
            EventKind::Create => "create",
            EventKind::Delete => "delete",
            EventKind::DeleteSelf => "delete_self",
            EventKind::Modify => "modify",
            EventKind::MoveSelf => "move_self",
            EventKind::Rename => "rename",
            EventKind::Open => "open",
        }
    }

    /// The inotify mask bits a watch needs in order to observe the given
    /// classes.
    pub fn mask_for(classes: EventClasses) -> AddWatchFlags {
        let mut mask = AddWatchFlags::empty();
        if classes.contains(EventClasses::CONTENT) {
            mask |= AddWatchFlags::IN_CLOSE_WRITE
                | AddWatchFlags::IN_CREATE
                | AddWatchFlags::IN_MODIFY
                | AddWatchFlags::IN_DELETE
                | AddWatchFlags::IN_DELETE_SELF
                | AddWatchFlags::IN_MOVE_SELF
                | AddWatchFlags::IN_MOVED_FROM
                | AddWatchFlags::IN_MOVED_TO;
        }
        if classes.contains(EventClasses::METADATA) {
            mask |= AddWatchFlags::IN_ACCESS
                | AddWatchFlags::IN_ATTRIB
                | AddWatchFlags::IN_CLOSE_NOWRITE
                | AddWatchFlags::IN_OPEN;
        }
        mask
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single change reported by the monitor: what happened, and to which
/// path. For `Rename` the path is the destination; `DeleteSelf` and
/// `MoveSelf` name a watched directory itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MonitorResult {
    pub kind: EventKind,
    pub path: PathBuf,
}

impl MonitorResult {
    pub fn new(kind: EventKind, path: PathBuf) -> Self {
        Self { kind, path }
    }
}

impl Display for MonitorResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.path.display())
    }
}

/// Encode a change-set for the `WATCHEXEC_EVENT` environment variable:
/// `kind:path` tuples joined by `;`.
pub fn encode_change_set(changes: &[MonitorResult]) -> String {
    changes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(";")
}
