//! General-purpose I/O acquisition for an RP2040-class sensor board.
//!
//! The board multiplexes four digital inputs (one payload presence detect, three PWM-capable),
//! drives four digital outputs, and continuously samples four analog channels (pitot
//! pressure, battery current, battery voltage, auxiliary) at 16x oversampling. Once per
//! scheduler tick, [`tick::GpIo::tick`] hands the averaged readings and decoded PWM widths to
//! the communications layer.
//!
//! - [`buffer`]: DMA-fed sample ring, per-tick averaging, overrun/stall recovery
//! - [`pwm`]: pulse-width capture state machine, run from the input-edge interrupt
//! - [`components`]: the digital lines and their controller
//! - [`interrupt`]: state shared between the edge interrupt and the tick
//! - [`tick`]: per-tick orchestration and the [`Comms`](tick::Comms) seam
//!
//! Everything except the `board` module is hardware-agnostic and builds on the host.
//!
//! ## Crate features
//!
//! - `rp2040`: RP2040 bindings (`board` module) and the firmware binary. Implies `defmt`.
//! - `defmt`: log through [defmt](https://docs.rs/defmt) instead of the `log` facade, and
//!   derive `defmt::Format` for public types.
//! - `trace_analog_averages`: Logs the four channel averages on every tick.
//! - `trace_raw_samples`: Logs every drained ADC sample. Very noisy!
//!
//! ## Demo
//!
//! A trimmed version of the binary crate (`src/main.rs`) wiring the block to RP2040
//! peripherals:
//!
//! ```ignore
//! let mut adc = Adc::new(pac.ADC, &mut pac.RESETS);
//! let producer = AdcDmaProducer::new(&mut adc, analog_pins, dma.ch0);
//! let ring = create_sample_ring().unwrap();
//! let counter = CaptureCounter::new(pwm_slices.pwm7, timer);
//! interrupt::set_calibration(&PWM_CAPTURE, PwmCalibration::for_counter_hz(CAPTURE_COUNTER_HZ));
//!
//! let mut gp = GpIo::new(
//!     DigitalIoController::configure(outputs, inputs),
//!     AnalogAcquisitionPipeline::new(ring, producer),
//!     &PWM_CAPTURE,
//! );
//! loop {
//!     gp.tick(&mut comms);
//!     timer.delay_us(TICK_PERIOD_US);
//! }
//! ```

// Copyright 2026 Sensor board firmware contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), feature(doc_auto_cfg), feature(doc_cfg_hide))]

#[cfg(feature = "rp2040")]
pub mod board;
pub mod buffer;
pub mod components;
pub mod interrupt;
pub mod pwm;
pub mod tick;

pub use buffer::{
    AnalogAcquisitionPipeline, AnalogReadings, BufferFault, SampleProducer, SampleRing,
};
pub use components::{DigitalIoController, GpLine};
pub use pwm::{CycleCounter, PwmCalibration, PwmInputCapture};
pub use tick::{Comms, GpIo, TickReport};

#[cfg(all(feature = "rp2040", not(target_arch = "arm")))]
compile_error!("Feature `rp2040` only builds for an ARM target (thumbv6m-none-eabi) in crate gp_io");
