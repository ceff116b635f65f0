// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event Sequencer + Replay Ring (C8, §4.7).
//!
//! A single monotonic counter plus a [`tokio::sync::broadcast`] channel for
//! live subscribers. `assign_seq -> append_to_ring -> broadcast` happens
//! under one lock so a subscriber joining mid-publish never observes a
//! torn sequence.

use tokio::sync::broadcast;
use tokio::sync::Mutex;

use crate::events::{Event, EventKind};
use crate::ring::{ReplayRing, DEFAULT_CAPACITY};

const LIVE_CHANNEL_CAPACITY: usize = 1024;

struct Inner {
    next_seq: u64,
    ring: ReplayRing,
}

/// Owns event sequencing and replay for the whole broker.
pub struct Sequencer {
    inner: Mutex<Inner>,
    live_tx: broadcast::Sender<Event>,
}

impl Sequencer {
    pub fn new(capacity: usize) -> Self {
        let (live_tx, _rx) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner { next_seq: 1, ring: ReplayRing::new(capacity) }),
            live_tx,
        }
    }

    /// Assign the next seq to `kind`, append it to the ring, and broadcast
    /// it to every live subscriber, atomically with respect to any single
    /// subscribe() call racing this publish.
    pub async fn publish(&self, kind: EventKind) -> Event {
        let mut guard = self.inner.lock().await;
        let seq = guard.next_seq;
        guard.next_seq += 1;
        let event = Event::now(seq, kind);
        guard.ring.append(event.clone());
        // A lagging/absent subscriber set is not an error; backpressure
        // policy (§5) is to drop them, which `send`'s Err already models.
        let _ = self.live_tx.send(event.clone());
        event
    }

    /// Subscribe starting at `since_seq`. Returns the events to replay (with
    /// a leading `replay_gap` already synthesized if needed), a live
    /// receiver for everything published after the snapshot was taken, and
    /// the replay cutoff `seq`.
    ///
    /// The live receiver is created *before* locking the ring, so no event
    /// published after this call is missed. But that also means a publish
    /// racing this call can land in both the replay scan and the live
    /// channel; the caller must drop any live event with `seq` at or below
    /// the returned cutoff to avoid delivering it twice (§4.7 step 3).
    pub async fn subscribe(&self, since_seq: u64) -> (Vec<Event>, broadcast::Receiver<Event>, u64) {
        let rx = self.live_tx.subscribe();
        let guard = self.inner.lock().await;
        let cutoff = guard.ring.newest_seq();
        let (mut events, gap) = guard.ring.since(since_seq);
        if gap {
            if let Some(oldest) = guard.ring.oldest_seq() {
                let gap_event = Event::now(
                    0,
                    EventKind::ReplayGap { since_seq, oldest_available: oldest },
                );
                events.insert(0, gap_event);
            }
        }
        (events, rx, cutoff)
    }

    pub fn capacity() -> usize {
        DEFAULT_CAPACITY
    }
}
