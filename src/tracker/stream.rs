//! Append-only per-scheme event streams
//!
//! Each stream has an epoch. Rewriting a stream (after a reorg or when a
//! transaction leaves the mempool) starts a new epoch, which invalidates
//! every bookmark issued before.

use rand::Rng;

use super::bookmark::Bookmark;
use crate::core::{OutPoint, Txid};

/// Entry of a change stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Transaction(Txid),
    Received(OutPoint),
    Spent(OutPoint),
    Replaced { txid: Txid, by: Txid },
}

/// Events after a bookmark
#[derive(Debug)]
pub struct StreamWindow<'a> {
    pub events: &'a [StreamEvent],
    /// The supplied bookmark resolved against this epoch
    pub known: bool,
    /// A bookmark was supplied but could not be resolved
    pub reset: bool,
}

#[derive(Debug)]
pub struct EventStream {
    epoch: u64,
    events: Vec<StreamEvent>,
}

fn fresh_epoch() -> u64 {
    rand::thread_rng().gen_range(1..=u64::MAX)
}

impl EventStream {
    pub fn new(events: Vec<StreamEvent>) -> Self {
        Self {
            epoch: fresh_epoch(),
            events,
        }
    }

    /// Replace the content and start a new epoch
    pub fn rewrite(&mut self, events: Vec<StreamEvent>) {
        self.epoch = fresh_epoch();
        self.events = events;
    }

    pub fn append(&mut self, events: impl IntoIterator<Item = StreamEvent>) {
        self.events.extend(events);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Bookmark of the current end; `START` while the stream is empty
    pub fn bookmark(&self) -> Bookmark {
        if self.events.is_empty() {
            Bookmark::START
        } else {
            Bookmark::new(self.epoch, self.events.len() as u64)
        }
    }

    /// Events strictly after `from`, or the whole stream if `from` is unknown
    pub fn window(&self, from: Option<Bookmark>) -> StreamWindow<'_> {
        let resolved = from.and_then(|bookmark| {
            let position = bookmark.position() as usize;
            (!bookmark.is_start()
                && bookmark.epoch() == self.epoch
                && position <= self.events.len())
            .then_some(position)
        });
        match resolved {
            Some(position) => StreamWindow {
                events: &self.events[position..],
                known: true,
                reset: false,
            },
            None => StreamWindow {
                events: &self.events,
                known: false,
                reset: from.map_or(false, |bookmark| !bookmark.is_start()),
            },
        }
    }
}
