//! # Timeline Merge
//!
//! Merges server-origin changes and the collapsed local queue into one
//! ascending sequence. Both inputs are expected to be sorted already; the
//! merge is a single linear pass.
//!
//! ```text
//!   server:  t1 ─────────── t3
//!   local:          t2 ─────────── t4
//!   merged:  t1 ── t2 ───── t3 ─── t4
//! ```
//!
//! On equal timestamps the server item comes first, so a local operation is
//! replayed against the freshest state the server reported for that moment.

use chrono::{DateTime, Utc};

use crate::changes::ServerChange;
use crate::types::MutationLogEntry;

/// Where a timeline item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Server,
    Local,
}

/// One item of the merged timeline.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineItem {
    Server(ServerChange),
    Local(MutationLogEntry),
}

impl TimelineItem {
    /// Timestamp used for ordering.
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            TimelineItem::Server(change) => change.occurred_at(),
            TimelineItem::Local(entry) => entry.created_at,
        }
    }

    pub fn origin(&self) -> Origin {
        match self {
            TimelineItem::Server(_) => Origin::Server,
            TimelineItem::Local(_) => Origin::Local,
        }
    }
}

/// Merges two sorted sequences into one timeline.
///
/// ## Example
/// ```rust
/// use till_core::timeline::interleave;
///
/// let merged = interleave(Vec::new(), Vec::new());
/// assert!(merged.is_empty());
/// ```
pub fn interleave(server: Vec<ServerChange>, local: Vec<MutationLogEntry>) -> Vec<TimelineItem> {
    let mut merged = Vec::with_capacity(server.len() + local.len());
    let mut server = server.into_iter().peekable();
    let mut local = local.into_iter().peekable();

    loop {
        let take_server = match (server.peek(), local.peek()) {
            (Some(s), Some(l)) => s.occurred_at() <= l.created_at,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };

        let item = if take_server {
            server.next().map(TimelineItem::Server)
        } else {
            local.next().map(TimelineItem::Local)
        };
        merged.extend(item);
    }

    merged
}
