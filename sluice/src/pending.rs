use std::mem;

use bytes::Bytes;

use crate::stream::{ReadFn, SeekFn, WritFn};

/// The main stage of an operation waiting on a prerequisite.
///
/// At most one is stored per stream. The prerequisite's continuation takes
/// it back out and either runs it or fails its callback.
#[derive(Default)]
pub(crate) enum PendingOp {
    #[default]
    None,
    OpenThenRead {
        size: usize,
        done: ReadFn,
    },
    OpenThenWrit {
        data: Bytes,
        done: WritFn,
    },
    OpenThenSeek {
        offset: u64,
        done: SeekFn,
    },
    SyncThenRead {
        size: usize,
        done: ReadFn,
    },
    SyncThenSeek {
        offset: u64,
        done: SeekFn,
    },
}

impl PendingOp {
    pub(crate) fn take(&mut self) -> PendingOp {
        mem::take(self)
    }

    pub(crate) fn is_none(&self) -> bool {
        matches!(self, PendingOp::None)
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            PendingOp::None => "none",
            PendingOp::OpenThenRead { .. } => "open_then_read",
            PendingOp::OpenThenWrit { .. } => "open_then_writ",
            PendingOp::OpenThenSeek { .. } => "open_then_seek",
            PendingOp::SyncThenRead { .. } => "sync_then_read",
            PendingOp::SyncThenSeek { .. } => "sync_then_seek",
        }
    }
}

impl std::fmt::Debug for PendingOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingOp::OpenThenRead { size, .. } | PendingOp::SyncThenRead { size, .. } => f
                .debug_struct(self.name())
                .field("size", size)
                .finish(),
            PendingOp::OpenThenWrit { data, .. } => f
                .debug_struct(self.name())
                .field("len", &data.len())
                .finish(),
            PendingOp::OpenThenSeek { offset, .. } | PendingOp::SyncThenSeek { offset, .. } => f
                .debug_struct(self.name())
                .field("offset", offset)
                .finish(),
            PendingOp::None => f.write_str(self.name()),
        }
    }
}
