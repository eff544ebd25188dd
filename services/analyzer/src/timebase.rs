//! Time bases and timestamp rescaling for the alarm muxer.

use std::fmt;

/// A time base expressed as `num / den` seconds per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    /// One tick per nanosecond, the GStreamer clock unit.
    pub const NANOSECONDS: Rational = Rational::new(1, 1_000_000_000);

    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// Time base of a constant frame rate stream: one tick per frame.
    pub const fn per_frame(fps: u32) -> Self {
        Self::new(1, fps as i64)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Divide rounding to the nearest integer, halves away from zero.
fn div_round_nearest(numerator: i128, denominator: i128) -> i128 {
    let (numerator, denominator) = if denominator < 0 {
        (-numerator, -denominator)
    } else {
        (numerator, denominator)
    };
    let half = denominator / 2;
    if numerator >= 0 {
        (numerator + half) / denominator
    } else {
        -((-numerator + half) / denominator)
    }
}

/// Rescale `value` from time base `from` into time base `to`.
///
/// Rounds to nearest with ties away from zero. `i64::MIN` and `i64::MAX` are
/// treated as sentinels and passed through untouched; other results saturate.
pub fn rescale_q_rnd(value: i64, from: Rational, to: Rational) -> i64 {
    if value == i64::MIN || value == i64::MAX {
        return value;
    }

    let numerator = value as i128 * from.num as i128 * to.den as i128;
    let denominator = from.den as i128 * to.num as i128;
    if denominator == 0 {
        return if numerator >= 0 { i64::MAX } else { i64::MIN };
    }

    div_round_nearest(numerator, denominator).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Timing attached to one submitted picture and the packets it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    /// Presentation timestamp in the stream time base
    pub pts: i64,
    /// Distance to the next frame's pts, never below one tick
    pub duration: i64,
    /// Frame counter value this timing was derived from
    pub position: i64,
}

/// Generates timestamps for a constant frame rate stream.
///
/// The counter starts at 1 and is rescaled from the codec time base into the
/// stream time base. Each tick's duration is the gap to the next tick's pts,
/// so consecutive timestamps are strictly increasing and exactly one frame
/// unit apart even when the rescale is not exact.
#[derive(Debug, Clone)]
pub struct FrameClock {
    codec: Rational,
    stream: Rational,
    counter: i64,
    next_pts: i64,
}

impl FrameClock {
    pub fn new(codec: Rational, stream: Rational) -> Self {
        Self {
            codec,
            stream,
            counter: 1,
            next_pts: rescale_q_rnd(1, codec, stream),
        }
    }

    /// Timing for the next frame.
    pub fn tick(&mut self) -> FrameTiming {
        let pts = self.next_pts;
        let following = rescale_q_rnd(self.counter + 1, self.codec, self.stream);
        let duration = following.saturating_sub(pts).max(1);

        let timing = FrameTiming {
            pts,
            duration,
            position: self.counter,
        };

        self.counter += 1;
        self.next_pts = pts.saturating_add(duration);
        timing
    }
}
