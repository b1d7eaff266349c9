// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-channel bookkeeping of frames between submission and callback.
//!
//! The decoder's fetch queue holds at most one fetch command at a time. Frames submitted while a
//! fetch is outstanding wait in a FIFO; each completion pops the next one and re-arms the fetch,
//! which keeps callbacks in submission order without any reordering on the device.
//!
//! Two locks are involved: one over the FIFO and the fetch state, one over the records keyed by
//! frame id. They are never held by callers and never nested except in [`FrameCallbackQueue::reset`],
//! which takes them in FIFO-then-records order.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use serde::Serialize;
use sync::Mutex;

/// Frame id reserved for the end-of-stream sentinel.
pub const EOS_FRAME_ID: u64 = 0;

/// Whether a fetch command is outstanding on the fetch queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchState {
    Idle,
    Armed,
}

/// What the caller of a push has to do next.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Pushed {
    /// The pipeline was idle and is now armed for this frame: enqueue a fetch.
    ArmFetch,
    /// A fetch is outstanding; the frame waits in the FIFO.
    Queued,
}

/// Outcome of one completion.
#[derive(Debug)]
pub enum Completed<R> {
    /// The end-of-stream sentinel came back. The FIFO and fetch state are left untouched.
    EndOfStream,
    /// A frame came back. If `rearm` holds the next frame id, the caller must enqueue a fetch for
    /// it; otherwise the pipeline went idle.
    Frame { record: R, rearm: Option<u64> },
    /// The device reported a frame id that has no record. The pipeline still advances.
    Unknown { rearm: Option<u64> },
}

/// Point-in-time view for tests and diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub state: FetchState,
    /// Frame ids waiting for a fetch, oldest first.
    pub pending: Vec<u64>,
    /// Records submitted and not yet completed, the sentinel included.
    pub records: usize,
}

struct Pending {
    fifo: VecDeque<u64>,
    state: FetchState,
    frame_counter: u64,
}

struct Records<R> {
    frames: BTreeMap<u64, R>,
    eos: bool,
}

impl<R> Records<R> {
    fn len(&self) -> usize {
        self.frames.len() + usize::from(self.eos)
    }
}

pub struct FrameCallbackQueue<R> {
    pending: Mutex<Pending>,
    records: Mutex<Records<R>>,
}

impl<R> Default for FrameCallbackQueue<R> {
    fn default() -> Self {
        FrameCallbackQueue {
            pending: Mutex::new(Pending {
                fifo: VecDeque::new(),
                state: FetchState::Idle,
                frame_counter: 0,
            }),
            records: Mutex::new(Records {
                frames: BTreeMap::new(),
                eos: false,
            }),
        }
    }
}

impl<R> FrameCallbackQueue<R> {
    pub fn new() -> FrameCallbackQueue<R> {
        FrameCallbackQueue::default()
    }

    /// Assigns the id of the next submitted frame. Ids start at 1 and restart after `reset`.
    pub fn next_frame_id(&self) -> u64 {
        let mut pending = self.pending.lock();
        pending.frame_counter += 1;
        pending.frame_counter
    }

    /// Id of the last frame submitted since creation or the last `reset` (0 if none).
    pub fn last_frame_id(&self) -> u64 {
        self.pending.lock().frame_counter
    }

    /// Records a submitted frame and either arms the fetch pipeline for it or queues it behind the
    /// outstanding fetch. `frame_id` must not be `EOS_FRAME_ID`.
    pub fn push_frame(&self, frame_id: u64, record: R) -> Pushed {
        debug_assert_ne!(frame_id, EOS_FRAME_ID);
        self.records.lock().frames.insert(frame_id, record);
        self.arm_or_queue(frame_id)
    }

    /// Queues the end-of-stream sentinel behind every frame already pushed.
    pub fn push_end_of_stream(&self) -> Pushed {
        self.records.lock().eos = true;
        self.arm_or_queue(EOS_FRAME_ID)
    }

    fn arm_or_queue(&self, frame_id: u64) -> Pushed {
        let mut pending = self.pending.lock();
        match pending.state {
            FetchState::Idle => {
                pending.state = FetchState::Armed;
                Pushed::ArmFetch
            }
            FetchState::Armed => {
                pending.fifo.push_back(frame_id);
                Pushed::Queued
            }
        }
    }

    /// Undoes a push that returned `ArmFetch` when the fetch could not be enqueued, so the
    /// pipeline is idle again and the record is gone.
    pub fn cancel_arm(&self, frame_id: u64) -> Option<R> {
        let record = {
            let mut records = self.records.lock();
            if frame_id == EOS_FRAME_ID {
                records.eos = false;
                None
            } else {
                records.frames.remove(&frame_id)
            }
        };
        let mut pending = self.pending.lock();
        if pending.fifo.is_empty() {
            pending.state = FetchState::Idle;
        }
        record
    }

    /// Resolves a completion reported for `frame_id`.
    pub fn pop_on_completion(&self, frame_id: u64) -> Completed<R> {
        let record = {
            let mut records = self.records.lock();
            if frame_id == EOS_FRAME_ID {
                if records.eos {
                    records.eos = false;
                    return Completed::EndOfStream;
                }
                None
            } else {
                records.frames.remove(&frame_id)
            }
        };
        let rearm = {
            let mut pending = self.pending.lock();
            let next = pending.fifo.pop_front();
            if next.is_none() {
                pending.state = FetchState::Idle;
            }
            next
        };
        match record {
            Some(record) => Completed::Frame { record, rearm },
            None => Completed::Unknown { rearm },
        }
    }

    /// Marks the pipeline idle after a re-arm failed on the completion path, dropping whatever
    /// was still queued. Returns the dropped frame ids.
    pub fn abandon(&self) -> Vec<u64> {
        let mut pending = self.pending.lock();
        pending.state = FetchState::Idle;
        pending.fifo.drain(..).collect()
    }

    /// Returns to the steady state after end of stream: empties the FIFO and the records, marks
    /// the pipeline idle and restarts frame ids, as one step with respect to the FIFO lock.
    /// Returns how many FIFO entries and records were still present.
    pub fn reset(&self) -> (usize, usize) {
        let mut pending = self.pending.lock();
        let mut records = self.records.lock();
        let stale_fifo = pending.fifo.len();
        let stale_records = records.len();
        pending.fifo.clear();
        pending.state = FetchState::Idle;
        pending.frame_counter = 0;
        records.frames.clear();
        records.eos = false;
        (stale_fifo, stale_records)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let pending = self.pending.lock();
        let records = self.records.lock().len();
        QueueSnapshot {
            state: pending.state,
            pending: pending.fifo.iter().copied().collect(),
            records,
        }
    }
}
