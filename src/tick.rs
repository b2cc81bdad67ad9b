
// SPDX-License-Identifier: Apache-2.0

//! Per-tick driver tying the digital lines, PWM capture, and analog pipeline to the
//! communications layer.

use core::convert::Infallible;

use embedded_hal::digital::{InputPin, OutputPin};

use crate::{
    buffer::{AnalogAcquisitionPipeline, AnalogReadings, BufferFault, SampleProducer},
    components::{DigitalIoController, NUM_LINES},
    interrupt::{latest_pulse_widths, SharedCapture},
};

/// The communications layer carrying values on and off the board.
pub trait Comms {
    /// Output mask requested by the last received packet
    fn gpout(&self) -> u8;

    /// Publish the 4-bit input snapshot
    fn set_gpin_state(&mut self, state: u8);

    /// Publish pulse widths, line order 0-3
    fn set_pwm_values(&mut self, values: &[u16; NUM_LINES]);

    /// Publish the pitot reading
    fn set_pitot(&mut self, pitot: u16);

    /// Publish battery current and voltage
    fn set_iv(&mut self, current: u16, voltage: u16);

    /// Publish the auxiliary (range) reading
    fn set_range(&mut self, range: u16);
}

/// Everything published on one tick
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TickReport {
    /// Input snapshot
    pub inputs: u8,
    /// Latest pulse widths
    pub pulse_widths: [u16; NUM_LINES],
    /// Analog averages
    pub analog: AnalogReadings,
    /// Set when the analog ring was reset this tick
    pub fault: Option<BufferFault>,
}

/// The general-purpose I/O block: digital lines, PWM capture, and analog acquisition.
pub struct GpIo<O, I, P: SampleProducer> {
    /// Digital lines
    digital: DigitalIoController<O, I>,
    /// Analog ring pipeline
    analog: AnalogAcquisitionPipeline<P>,
    /// State written by the edge interrupt
    capture: &'static SharedCapture,
}

impl<O, I, P> GpIo<O, I, P>
where
    O: OutputPin<Error = Infallible>,
    I: InputPin<Error = Infallible>,
    P: SampleProducer,
{
    /// Assemble the block from its configured parts
    pub fn new(
        digital: DigitalIoController<O, I>,
        analog: AnalogAcquisitionPipeline<P>,
        capture: &'static SharedCapture,
    ) -> Self {
        Self {
            digital,
            analog,
            capture,
        }
    }

    /// Run one scheduler tick and forward the results to `comms`.
    pub fn tick(&mut self, comms: &mut impl Comms) -> TickReport {
        self.digital.set_outputs(comms.gpout());

        let inputs = self.digital.read_inputs();
        comms.set_gpin_state(inputs);

        let pulse_widths = latest_pulse_widths(self.capture);
        comms.set_pwm_values(&pulse_widths);

        let acquisition = self.analog.acquire();
        let analog = acquisition.readings;
        comms.set_pitot(analog.pitot);
        comms.set_iv(analog.battery_current, analog.battery_voltage);
        comms.set_range(analog.aux);

        TickReport {
            inputs,
            pulse_widths,
            analog,
            fault: acquisition.fault,
        }
    }

    /// Digital line controller
    pub fn digital(&self) -> &DigitalIoController<O, I> {
        &self.digital
    }

    /// Analog pipeline
    pub fn analog(&self) -> &AnalogAcquisitionPipeline<P> {
        &self.analog
    }

    /// Analog pipeline, mutably
    pub fn analog_mut(&mut self) -> &mut AnalogAcquisitionPipeline<P> {
        &mut self.analog
    }
}
