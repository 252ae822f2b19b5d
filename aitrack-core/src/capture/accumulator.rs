//! Debounced batch accumulator
//!
//! ```text
//!          push                 deadline / flush
//!   Idle ────────▶ Accumulating ────────────────▶ Flushing
//!    ▲               │  ▲   push (reset deadline)     │
//!    │               └──┘                             │
//!    └──────────── finish_flush (empty) ◀─────────────┘
//! ```
//!
//! The accumulator owns a single deadline. Every push moves it to
//! `now + debounce`; the owner sleeps until the deadline and then drains.
//! It holds no timer itself so it can be driven and tested without a runtime.

use std::time::Duration;

use tokio::time::Instant;

use crate::types::CaptureEvent;

/// Accumulator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    Idle,
    Accumulating,
    Flushing,
}

pub struct BatchAccumulator {
    events: Vec<CaptureEvent>,
    debounce: Duration,
    deadline: Option<Instant>,
    state: AccumulatorState,
}

impl BatchAccumulator {
    pub fn new(debounce: Duration) -> Self {
        Self {
            events: Vec::new(),
            debounce,
            deadline: None,
            state: AccumulatorState::Idle,
        }
    }

    /// Append an event and restart the debounce window. Returns the new deadline.
    pub fn push(&mut self, event: CaptureEvent, now: Instant) -> Instant {
        self.events.push(event);
        let deadline = now + self.debounce;
        self.deadline = Some(deadline);
        if self.state == AccumulatorState::Idle {
            self.state = AccumulatorState::Accumulating;
        }
        deadline
    }

    /// Pending flush deadline, if any events are waiting
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the quiet period has elapsed
    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Drain every queued event into one batch, in push order.
    ///
    /// Returns `None` (and stays put) when nothing is queued.
    pub fn begin_flush(&mut self) -> Option<Vec<CaptureEvent>> {
        if self.events.is_empty() {
            self.deadline = None;
            return None;
        }
        self.deadline = None;
        self.state = AccumulatorState::Flushing;
        Some(std::mem::take(&mut self.events))
    }

    /// Put a drained batch back in front of anything queued since, restarting
    /// the debounce window. Used when the batch could not be handed off.
    pub fn restore(&mut self, mut rows: Vec<CaptureEvent>, now: Instant) -> Instant {
        rows.append(&mut self.events);
        self.events = rows;
        let deadline = now + self.debounce;
        self.deadline = Some(deadline);
        deadline
    }

    /// The drained batch has been handed off
    pub fn finish_flush(&mut self) {
        self.state = if self.events.is_empty() {
            AccumulatorState::Idle
        } else {
            AccumulatorState::Accumulating
        };
    }

    pub fn state(&self) -> AccumulatorState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
