//! Sliding pre/post-event frame accumulation.
//!
//! The window keeps the most recent `pre_alarm_secs × fps` frames. When a
//! trigger frame arrives it arms: the buffered frames plus the trigger frame
//! become the head of a new alarm, and the next `post_alarm_secs × fps`
//! frames complete it. Triggers seen while an alarm is accumulating are
//! coalesced into that alarm.

use crate::alarm::{Alarm, AlarmParts};
use crate::frame::Frame;
use std::collections::VecDeque;
use tracing::{debug, error, trace};

/// Named parameters for an [`AlarmWindow`].
#[derive(Debug, Clone)]
pub struct WindowParams {
    pub control_code: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pre_alarm_secs: u32,
    pub post_alarm_secs: u32,
}

/// An alarm that has been triggered but is still collecting post frames.
struct PendingAlarm {
    frames: Vec<Frame>,
    happen_index: usize,
    happen_timestamp: i64,
    remaining: usize,
}

/// Per-control pre/post-event buffer.
pub struct AlarmWindow {
    params: WindowParams,
    pre: VecDeque<Frame>,
    pre_capacity: usize,
    post_length: usize,
    pending: Option<PendingAlarm>,
    coalesced: u64,
}

impl AlarmWindow {
    pub fn new(params: WindowParams) -> Self {
        let pre_capacity = (params.pre_alarm_secs as usize) * (params.fps as usize);
        let post_length = (params.post_alarm_secs as usize) * (params.fps as usize);

        Self {
            pre: VecDeque::with_capacity(pre_capacity + 1),
            pre_capacity,
            post_length,
            pending: None,
            coalesced: 0,
            params,
        }
    }

    pub fn pre_capacity(&self) -> usize {
        self.pre_capacity
    }

    pub fn post_length(&self) -> usize {
        self.post_length
    }

    /// Frames currently held in the pre-event buffer.
    pub fn buffered(&self) -> usize {
        self.pre.len()
    }

    /// Whether an alarm is collecting post-event frames.
    pub fn is_accumulating(&self) -> bool {
        self.pending.is_some()
    }

    /// Triggers ignored because an alarm was already accumulating.
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }

    /// Feed one frame. Returns an alarm once its post window is complete.
    ///
    /// `allow_trigger` lets the caller suppress arming, e.g. while a previous
    /// alarm is still being encoded.
    pub fn push(&mut self, frame: Frame, allow_trigger: bool) -> Option<Alarm> {
        if let Some(pending) = self.pending.as_mut() {
            if frame.happen {
                self.coalesced += 1;
                trace!(
                    control = %self.params.control_code,
                    sequence = frame.sequence,
                    "Trigger coalesced into accumulating alarm"
                );
            }
            pending.frames.push(frame);
            pending.remaining = pending.remaining.saturating_sub(1);

            if pending.remaining == 0 {
                return self.complete();
            }
            return None;
        }

        if frame.happen && allow_trigger {
            return self.arm(frame);
        }

        if self.pre_capacity == 0 {
            return None;
        }
        if self.pre.len() >= self.pre_capacity {
            self.pre.pop_front();
        }
        self.pre.push_back(frame);
        None
    }

    /// Finalize an accumulating alarm with the post frames gathered so far.
    pub fn flush(&mut self) -> Option<Alarm> {
        if self.pending.is_some() {
            self.complete()
        } else {
            None
        }
    }

    /// Drop every buffered frame and any pending alarm.
    pub fn clear(&mut self) {
        self.pre.clear();
        self.pending = None;
    }

    fn arm(&mut self, frame: Frame) -> Option<Alarm> {
        let mut frames: Vec<Frame> = self.pre.drain(..).collect();
        let happen_index = frames.len();

        debug!(
            control = %self.params.control_code,
            sequence = frame.sequence,
            score = frame.happen_score,
            pre_frames = happen_index,
            post_frames = self.post_length,
            "Alarm armed"
        );

        frames.push(frame);
        self.pending = Some(PendingAlarm {
            frames,
            happen_index,
            happen_timestamp: chrono::Utc::now().timestamp_millis(),
            remaining: self.post_length,
        });

        if self.post_length == 0 {
            return self.complete();
        }
        None
    }

    fn complete(&mut self) -> Option<Alarm> {
        let pending = self.pending.take()?;
        let result = Alarm::new(AlarmParts {
            control_code: self.params.control_code.clone(),
            width: self.params.width,
            height: self.params.height,
            fps: self.params.fps,
            happen_timestamp: pending.happen_timestamp,
            happen_index: pending.happen_index,
            frames: pending.frames,
        });

        match result {
            Ok(alarm) => Some(alarm),
            Err(e) => {
                error!(
                    control = %self.params.control_code,
                    error = %e,
                    "Discarding malformed alarm"
                );
                None
            }
        }
    }
}
