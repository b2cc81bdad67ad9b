
// SPDX-License-Identifier: Apache-2.0

//! General-purpose digital lines and their controller
use core::convert::Infallible;

#[cfg(feature = "defmt")]
use defmt::debug;
use embedded_hal::digital::{InputPin, OutputPin, PinState};
#[cfg(not(feature = "defmt"))]
use log::debug;

/// Number of lines in each direction
pub const NUM_LINES: usize = 4;
/// Bits of a line mask that map onto real lines
pub const LINE_MASK: u8 = 0x0f;

/// Identity of a general-purpose line. The same index names output *n* and input *n*.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GpLine {
    /// Line 0. As an input: payload presence detect (active low)
    Gp0 = 0,
    /// Line 1
    Gp1 = 1,
    /// Line 2
    Gp2 = 2,
    /// Line 3
    Gp3 = 3,
}

impl GpLine {
    /// All lines, by index
    pub const ALL: [Self; NUM_LINES] = [Self::Gp0, Self::Gp1, Self::Gp2, Self::Gp3];

    /// Index into per-line arrays
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Bit for this line in a packed line mask
    pub const fn mask(self) -> u8 {
        1 << self as u8
    }

    /// Inputs 1-3 also carry PWM. Input 0 is the presence detect.
    pub const fn is_pwm_capable(self) -> bool {
        !matches!(self, Self::Gp0)
    }
}

/// Line direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Sampled by the board
    Input,
    /// Driven by the board
    Output,
}

/// Pad bias applied to a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pull {
    /// Floating / push-pull
    None,
    /// Pull-up
    Up,
    /// Pull-down
    Down,
}

/// Electrical configuration of one line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DigitalLine {
    /// Line identity
    pub line: GpLine,
    /// Input or output
    pub direction: Direction,
    /// Pad bias
    pub pull: Pull,
}

impl DigitalLine {
    /// Output line without bias
    const fn output(line: GpLine) -> Self {
        Self {
            line,
            direction: Direction::Output,
            pull: Pull::None,
        }
    }

    /// Input line with the given bias
    const fn input(line: GpLine, pull: Pull) -> Self {
        Self {
            line,
            direction: Direction::Input,
            pull,
        }
    }
}

/// Reference line map. Board bring-up configures its pins to match.
///
/// The presence detect pulls its line low when a payload is fitted, so it idles high. PWM
/// inputs idle low.
pub const LINE_MAP: [DigitalLine; 2 * NUM_LINES] = [
    DigitalLine::output(GpLine::Gp0),
    DigitalLine::output(GpLine::Gp1),
    DigitalLine::output(GpLine::Gp2),
    DigitalLine::output(GpLine::Gp3),
    DigitalLine::input(GpLine::Gp0, Pull::Up),
    DigitalLine::input(GpLine::Gp1, Pull::Down),
    DigitalLine::input(GpLine::Gp2, Pull::Down),
    DigitalLine::input(GpLine::Gp3, Pull::Down),
];

impl DigitalLine {
    /// Entry of [`LINE_MAP`] for `line` in the given direction
    pub const fn of(line: GpLine, direction: Direction) -> Self {
        let base = match direction {
            Direction::Output => 0,
            Direction::Input => NUM_LINES,
        };
        LINE_MAP[base + line.index()]
    }
}

/// Reads and writes the four input and four output lines as packed 4-bit masks.
///
/// Pins must already be configured per [`LINE_MAP`]; hardware pins are infallible.
pub struct DigitalIoController<O, I> {
    /// Output lines, by index
    outputs: [O; NUM_LINES],
    /// Input lines, by index
    inputs: [I; NUM_LINES],
    /// Mask currently driven onto the outputs
    applied: u8,
}

impl<O, I> DigitalIoController<O, I>
where
    O: OutputPin<Error = Infallible>,
    I: InputPin<Error = Infallible>,
{
    /// Take ownership of the configured lines and drive every output low.
    pub fn configure(outputs: [O; NUM_LINES], inputs: [I; NUM_LINES]) -> Self {
        let mut controller = Self {
            outputs,
            inputs,
            applied: 0,
        };
        controller.write_outputs(0);
        controller
    }

    /// Drive the low 4 bits of `mask` onto the outputs, bit *n* to line *n*.
    ///
    /// Returns `false` without touching the pins if `mask` is already applied.
    pub fn set_outputs(&mut self, mask: u8) -> bool {
        let mask = mask & LINE_MASK;
        if mask == self.applied {
            return false;
        }
        debug!("GP outputs {} -> {}", self.applied, mask);
        self.write_outputs(mask);
        true
    }

    /// Current input levels packed into the low 4 bits, bit *n* from line *n*.
    pub fn read_inputs(&mut self) -> u8 {
        self.inputs
            .iter_mut()
            .zip(GpLine::ALL)
            .fold(0, |levels, (pin, line)| {
                let high = pin.is_high().unwrap_or_else(|never| match never {});
                if high {
                    levels | line.mask()
                } else {
                    levels
                }
            })
    }

    /// Mask currently driven onto the outputs
    pub fn applied_outputs(&self) -> u8 {
        self.applied
    }

    /// Write every output line unconditionally
    fn write_outputs(&mut self, mask: u8) {
        for (pin, line) in self.outputs.iter_mut().zip(GpLine::ALL) {
            let state = PinState::from(mask & line.mask() != 0);
            pin.set_state(state).unwrap_or_else(|never| match never {});
        }
        self.applied = mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern crate std;
    use std::rc::Rc;
    use core::cell::Cell;
    use embedded_hal::digital::ErrorType;

    /// One wire: an output pin and the input pin that reads it back
    #[derive(Clone, Default)]
    struct Wire {
        level: Rc<Cell<bool>>,
        writes: Rc<Cell<u32>>,
    }

    impl ErrorType for Wire {
        type Error = Infallible;
    }

    impl OutputPin for Wire {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.writes.set(self.writes.get() + 1);
            self.level.set(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.writes.set(self.writes.get() + 1);
            self.level.set(true);
            Ok(())
        }
    }

    impl InputPin for Wire {
        fn is_high(&mut self) -> Result<bool, Infallible> {
            Ok(self.level.get())
        }

        fn is_low(&mut self) -> Result<bool, Infallible> {
            Ok(!self.level.get())
        }
    }

    fn wires() -> [Wire; NUM_LINES] {
        core::array::from_fn(|_| Wire::default())
    }

    /// Controller whose outputs are looped back to a second set of wires, and whose inputs
    /// are driven by the test
    fn loopback() -> (
        DigitalIoController<Wire, Wire>,
        [Wire; NUM_LINES],
        [Wire; NUM_LINES],
    ) {
        let outputs = wires();
        let inputs = wires();
        let controller = DigitalIoController::configure(outputs.clone(), inputs.clone());
        (controller, outputs, inputs)
    }

    fn readback(lines: &mut [Wire; NUM_LINES]) -> u8 {
        lines
            .iter_mut()
            .enumerate()
            .fold(0, |mask, (i, wire)| mask | ((wire.is_high().unwrap() as u8) << i))
    }

    #[test]
    fn configure_drives_outputs_low() {
        let outputs = wires();
        for wire in &outputs {
            wire.level.set(true);
        }
        let controller = DigitalIoController::configure(outputs.clone(), wires());

        assert_eq!(controller.applied_outputs(), 0);
        assert!(outputs.iter().all(|wire| !wire.level.get()));
    }

    #[test]
    fn outputs_loop_back() {
        let (mut controller, mut outputs, _) = loopback();
        assert!(controller.set_outputs(0b1010));
        assert_eq!(readback(&mut outputs), 0b1010);

        assert!(controller.set_outputs(0b0101));
        assert_eq!(readback(&mut outputs), 0b0101);
    }

    #[test]
    fn upper_bits_ignored() {
        let (mut controller, mut outputs, _) = loopback();
        assert!(controller.set_outputs(0xf3));
        assert_eq!(readback(&mut outputs), 0b0011);
        assert_eq!(controller.applied_outputs(), 0b0011);
        assert!(!controller.set_outputs(0x03));
    }

    #[test]
    fn repeated_mask_not_rewritten() {
        let (mut controller, outputs, _) = loopback();
        controller.set_outputs(0b1001);
        let writes: u32 = outputs.iter().map(|wire| wire.writes.get()).sum();

        assert!(!controller.set_outputs(0b1001));
        let after: u32 = outputs.iter().map(|wire| wire.writes.get()).sum();
        assert_eq!(writes, after);
    }

    #[test]
    fn inputs_reflect_external_levels() {
        let (mut controller, _, inputs) = loopback();
        assert_eq!(controller.read_inputs(), 0);

        inputs[0].level.set(true);
        inputs[3].level.set(true);
        assert_eq!(controller.read_inputs(), 0b1001);

        inputs[0].level.set(false);
        inputs[2].level.set(true);
        assert_eq!(controller.read_inputs(), 0b1100);
    }

    #[test]
    fn line_map_matches_board_wiring() {
        let inputs: std::vec::Vec<_> = LINE_MAP
            .iter()
            .filter(|line| line.direction == Direction::Input)
            .collect();
        assert_eq!(inputs.len(), NUM_LINES);
        assert_eq!(inputs[0].pull, Pull::Up);
        assert!(inputs[1..].iter().all(|line| line.pull == Pull::Down));
        assert!(LINE_MAP
            .iter()
            .filter(|line| line.direction == Direction::Output)
            .all(|line| line.pull == Pull::None));
        for line in GpLine::ALL {
            for direction in [Direction::Input, Direction::Output] {
                let entry = DigitalLine::of(line, direction);
                assert_eq!((entry.line, entry.direction), (line, direction));
            }
        }
        assert!(!GpLine::Gp0.is_pwm_capable());
        assert!(GpLine::ALL[1..].iter().all(|line| line.is_pwm_capable()));
    }
}
