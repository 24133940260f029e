// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Settings and runtime state of patternsrc.

use mxl_component::{ExchangeKind, ExecutionMode};

/// Default frame size in bytes.
pub(crate) const DEFAULT_FRAME_SIZE: usize = 4096;

/// Default number of buffers negotiated on the output port.
pub(crate) const DEFAULT_BUFFER_COUNT: u32 = 4;

/// Frame rate as a fraction (frames per `denominator` seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub numerator: i64,
    pub denominator: i64,
}

impl Rational {
    pub const fn new(numerator: i64, denominator: i64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }
}

/// Content written into every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// Every byte holds the low byte of the frame index.
    Counter,
    /// Bytes count up from the frame index.
    Ramp,
    /// Every byte holds the given value.
    Solid(u8),
}

impl Pattern {
    /// Writes the pattern of frame `index` into `frame`.
    pub fn fill(self, index: u64, frame: &mut [u8]) {
        match self {
            Pattern::Counter => frame.fill(index as u8),
            Pattern::Ramp => {
                for (i, byte) in frame.iter_mut().enumerate() {
                    *byte = (index as usize).wrapping_add(i) as u8;
                }
            }
            Pattern::Solid(value) => frame.fill(value),
        }
    }
}

/// User-configurable settings for patternsrc.
#[derive(Debug, Clone)]
pub struct Settings {
    pub name: String,
    pub mode: ExecutionMode,
    pub pattern: Pattern,
    pub frame_size: usize,
    pub buffer_count: u32,
    pub frame_rate: Rational,
    /// Stream length; the last frame carries the end-of-stream flag.
    pub frames: Option<u64>,
    /// Exchange used once the output is tunneled.
    pub exchange: ExchangeKind,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            name: "patternsrc".to_owned(),
            mode: ExecutionMode::Passive,
            pattern: Pattern::Counter,
            frame_size: DEFAULT_FRAME_SIZE,
            buffer_count: DEFAULT_BUFFER_COUNT,
            frame_rate: Rational::new(25, 1),
            frames: None,
            exchange: ExchangeKind::StdTunnel,
        }
    }
}

/// Position in the generated stream.
#[derive(Debug, Default, Clone)]
pub struct State {
    pub frame_index: u64,
    pub eos_sent: bool,
}

impl State {
    /// Presentation time of frame `index` in nanoseconds.
    ///
    /// Returns 0 for a frame rate with a zero numerator.
    pub fn timestamp(index: u64, rate: Rational) -> i64 {
        if rate.numerator == 0 {
            return 0;
        }
        let nanos = i128::from(index) * 1_000_000_000 * i128::from(rate.denominator)
            / i128::from(rate.numerator);
        i64::try_from(nanos).unwrap_or(i64::MAX)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_follow_frame_rate() {
        let ntsc = Rational::new(30000, 1001);
        assert_eq!(State::timestamp(0, ntsc), 0);
        assert_eq!(State::timestamp(30, ntsc), 1_001_000_000);
        assert_eq!(State::timestamp(3, Rational::new(25, 1)), 120_000_000);
        assert_eq!(State::timestamp(3, Rational::new(0, 1)), 0);
    }

    #[test]
    fn patterns() {
        let mut frame = [0u8; 4];
        Pattern::Ramp.fill(254, &mut frame);
        assert_eq!(frame, [254, 255, 0, 1]);
        Pattern::Counter.fill(258, &mut frame);
        assert_eq!(frame, [2; 4]);
        Pattern::Solid(0x80).fill(9, &mut frame);
        assert_eq!(frame, [0x80; 4]);
    }
}
