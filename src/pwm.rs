
// SPDX-License-Identifier: Apache-2.0

//! Pulse-width capture on the general-purpose inputs, driven by the input-edge interrupt.

use crate::components::{GpLine, LINE_MASK, NUM_LINES};

/// Rate of the capture counter the board provides. At this rate the 0.85 to 2.15 ms window
/// spans 65_000 ticks, nearly the whole output range.
pub const CAPTURE_COUNTER_HZ: u32 = 50_000_000;

/// Full-width count from a coarse estimate and the exact low 16 bits of the same count.
///
/// `coarse` must be within 32767 ticks of the true value. The result keeps `coarse`'s upper
/// bits and takes the fine bits from `low`, correcting across a 16-bit boundary in either
/// direction.
pub const fn extend_low_bits(coarse: u32, low: u16) -> u32 {
    let skew = low.wrapping_sub(coarse as u16) as i16;
    coarse.wrapping_add(skew as i32 as u32)
}

/// Free-running hardware counter used to time pulses. Wraps at its native width; differences
/// are taken with wrapping subtraction.
pub trait CycleCounter {
    /// Current counter value
    fn now(&self) -> u32;
}

/// Window mapping a measured high time onto `0..=u16::MAX`.
///
/// Pulses between 0.85 ms and 2.15 ms are expected. Anything at or below `t_low` reads 0,
/// anything at or above `t_high` reads 65535, and the span in between is `delta - t_low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PwmCalibration {
    /// Counter ticks of the shortest expected pulse
    t_low: u32,
    /// Counter ticks of the longest expected pulse
    t_high: u32,
}

impl PwmCalibration {
    /// Shortest expected pulse, in microseconds
    pub const PULSE_MIN_US: u32 = 850;
    /// Longest expected pulse, in microseconds
    pub const PULSE_MAX_US: u32 = 2150;
    /// Window measured for the reference board's ~50.4 MHz cycle counter
    pub const REFERENCE: Self = Self::new(42_829, 108_264);

    /// Window with explicit bounds, in counter ticks.
    pub const fn new(t_low: u32, t_high: u32) -> Self {
        assert!(t_low < t_high, "PWM window must be non-empty");
        Self { t_low, t_high }
    }

    /// Window for a counter running at `counter_hz`.
    ///
    /// Recompute whenever the counter frequency changes. `t_high` is capped at
    /// `t_low + 65535` so in-window values never wrap. Panics if the counter is too slow to
    /// resolve the window at all.
    pub const fn for_counter_hz(counter_hz: u32) -> Self {
        let t_low = (counter_hz as u64 * Self::PULSE_MIN_US as u64 / 1_000_000) as u32;
        let t_high = (counter_hz as u64 * Self::PULSE_MAX_US as u64 / 1_000_000) as u32;
        let cap = t_low.saturating_add(u16::MAX as u32);
        Self::new(t_low, if t_high > cap { cap } else { t_high })
    }

    /// Lower bound, in counter ticks
    pub const fn t_low(&self) -> u32 {
        self.t_low
    }

    /// Upper bound, in counter ticks
    pub const fn t_high(&self) -> u32 {
        self.t_high
    }

    /// Map a measured high time onto the output range
    pub const fn pulse_width(&self, delta: u32) -> u16 {
        if delta <= self.t_low {
            0
        } else if delta >= self.t_high {
            u16::MAX
        } else {
            ((delta - self.t_low) & 0xffff) as u16
        }
    }
}

/// Per-pin capture state, shared between the edge interrupt (writer) and the tick (reader).
///
/// Each pin is either low (idle) or high (pulse in progress). A falling edge completes a
/// pulse and replaces that pin's width; rising edges only restart the timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PwmInputCapture {
    /// Active window
    calibration: PwmCalibration,
    /// Input levels seen by the previous edge batch, one bit per line
    levels: u8,
    /// Counter value at each line's last transition
    edge_timestamps: [u32; NUM_LINES],
    /// Width of each line's last completed pulse
    pulse_widths: [u16; NUM_LINES],
}

impl PwmInputCapture {
    /// All lines low, all widths 0
    pub const fn new(calibration: PwmCalibration) -> Self {
        Self {
            calibration,
            levels: 0,
            edge_timestamps: [0; NUM_LINES],
            pulse_widths: [0; NUM_LINES],
        }
    }

    /// Process one edge batch: `levels` is the new input snapshot.
    ///
    /// Every line that changed since the last batch is stamped with the same counter value,
    /// read once. Lines that did not change are left alone.
    pub fn on_input_change(&mut self, levels: u8, counter: &impl CycleCounter) {
        let levels = levels & LINE_MASK;
        let changed = levels ^ self.levels;
        if changed == 0 {
            return;
        }

        let now = counter.now();
        for line in GpLine::ALL {
            if changed & line.mask() == 0 {
                continue;
            }
            let i = line.index();
            // Falling edge: the line was high until now
            if self.levels & line.mask() != 0 && line.is_pwm_capable() {
                let delta = now.wrapping_sub(self.edge_timestamps[i]);
                self.pulse_widths[i] = self.calibration.pulse_width(delta);
            }
            self.edge_timestamps[i] = now;
        }

        self.levels = levels;
    }

    /// Latest completed pulse width per line. Line 0 is never PWM-capable and reads 0.
    pub fn pulse_widths(&self) -> [u16; NUM_LINES] {
        self.pulse_widths
    }

    /// Latest completed pulse width for one line
    pub fn pulse_width(&self, line: GpLine) -> u16 {
        self.pulse_widths[line.index()]
    }

    /// Input snapshot from the last edge batch
    pub fn levels(&self) -> u8 {
        self.levels
    }

    /// Replace the window, e.g. after the counter clock changed
    pub fn set_calibration(&mut self, calibration: PwmCalibration) {
        self.calibration = calibration;
    }
}
