
// SPDX-License-Identifier: Apache-2.0

//! State shared with the input-edge interrupt, plus static [`Mutex`].
//!
//! The edge ISR and the tick go through the same two accessors, each a single short critical
//! section, so the tick never observes a half-processed edge batch.

use core::cell::RefCell;
use critical_section::Mutex;
#[cfg(feature = "defmt")]
use defmt::debug;
#[cfg(not(feature = "defmt"))]
use log::debug;

use crate::{
    components::NUM_LINES,
    pwm::{CycleCounter, PwmCalibration, PwmInputCapture},
};

/// Capture state behind a critical-section mutex
pub type SharedCapture = Mutex<RefCell<PwmInputCapture>>;

/// PWM capture state for access in interrupts. Starts with the reference calibration;
/// bring-up replaces it with one matching the board's counter.
pub static PWM_CAPTURE: SharedCapture =
    Mutex::new(RefCell::new(PwmInputCapture::new(PwmCalibration::REFERENCE)));

/// Body of the input-edge interrupt: feed the new input snapshot to the capture state.
pub fn input_edge(capture: &SharedCapture, levels: u8, counter: &impl CycleCounter) {
    critical_section::with(|cs| {
        capture
            .borrow_ref_mut(cs)
            .on_input_change(levels, counter)
    });
}

/// Copy of the latest pulse widths, taken atomically with respect to the edge interrupt
pub fn latest_pulse_widths(capture: &SharedCapture) -> [u16; NUM_LINES] {
    critical_section::with(|cs| capture.borrow_ref(cs).pulse_widths())
}

/// Swap in a new calibration, e.g. once the counter clock is known
pub fn set_calibration(capture: &SharedCapture, calibration: PwmCalibration) {
    debug!(
        "critical_section: PWM window {} - {} ticks",
        calibration.t_low(),
        calibration.t_high()
    );
    critical_section::with(|cs| capture.borrow_ref_mut(cs).set_calibration(calibration));
}
