
// SPDX-License-Identifier: Apache-2.0

//! RP2040 implementations of the collaborator traits: a PWM slice as capture counter, the
//! ADC FIFO + DMA ring as sample producer, line setup from [`LINE_MAP`], raw edge-latch
//! access for the interrupt, and a defmt telemetry sink standing in for the communications
//! layer.
//!
//! [`LINE_MAP`]: crate::components::LINE_MAP

use core::sync::atomic::{AtomicU8, Ordering};

use cortex_m::singleton;
use defmt::{debug, info, warn};
use rp2040_hal::{
    adc::{Adc, AdcFifo, AdcPin},
    dma::{Channel, ReadTarget, SingleChannel, CH0},
    gpio::{
        DynPinId, DynPullType, Function, FunctionSioInput, FunctionSioOutput,
        Interrupt::{EdgeHigh, EdgeLow},
        Pin, PinId, PullDown, PullNone, PullType, PullUp, ValidFunction,
    },
    pac,
    pwm::{FreeRunning, Pwm7, Slice},
    Timer,
};

use crate::{
    buffer::{RingTransfer, SampleProducer, SampleRing, NUM_CHANNELS, OVERSAMPLE_RATE},
    components::{Direction, DigitalLine, GpLine, Pull, NUM_LINES},
    interrupt::{input_edge, SharedCapture},
    pwm::{extend_low_bits, CycleCounter, CAPTURE_COUNTER_HZ},
    tick::Comms,
};

/// `clk_sys` as set up by `init_clocks_and_plls`
pub const SYS_CLOCK_HZ: u32 = 125_000_000;
/// `clk_adc` as set up by `init_clocks_and_plls`
pub const ADC_CLOCK_HZ: u32 = 48_000_000;
/// Conversions per second across all channels
pub const ADC_SAMPLE_RATE: u32 = (NUM_CHANNELS * OVERSAMPLE_RATE * 2 * 1000) as u32;

/// A conversion starts every (1 + INT) clk_adc cycles
const ADC_CLOCK_DIVIDER: u16 = (ADC_CLOCK_HZ / ADC_SAMPLE_RATE - 1) as u16;
/// One conversion (96 clk_adc cycles, 2 us) in clk_sys cycles
const CONVERSION_SYS_CYCLES: u32 = 2 * (SYS_CLOCK_HZ / 1_000_000);
/// DREQ number of the ADC FIFO
const DREQ_ADC: u8 = 36;
/// Capture counter ticks per TIMER tick
const COUNTS_PER_US: u32 = CAPTURE_COUNTER_HZ / 1_000_000;

// The slice divider below is 2 + 8/16
const _: () = assert!(SYS_CLOCK_HZ as u64 * 2 == CAPTURE_COUNTER_HZ as u64 * 5);

/// Output line with its pin number erased
pub type GpOutput = Pin<DynPinId, FunctionSioOutput, DynPullType>;
/// Input line with its pin number and bias erased
pub type GpInput = Pin<DynPinId, FunctionSioInput, DynPullType>;
/// Analog input pad with its pin number erased
pub type AnalogPin = AdcPin<Pin<DynPinId, FunctionSioInput, PullNone>>;

/// Output mask requested by the communications layer, polled once per tick
pub static GPOUT_REQUEST: AtomicU8 = AtomicU8::new(0);

/// Message for a second call to [`create_sample_ring`]
pub const RING_TAKEN_PANIC_MSG: &str = "Sample ring was already handed out";

/// Creates the ring the ADC DMA channel writes into. Only the first call returns the ring.
pub fn create_sample_ring() -> Option<&'static mut SampleRing> {
    let ring = singleton!(: SampleRing = SampleRing::new());
    if ring.is_none() {
        warn!("Sample ring has already been created");
    }
    ring
}

/// Apply a [`Pull`] and erase it from the pin type
fn with_pull<I, F, P>(pin: Pin<I, F, P>, pull: Pull) -> Pin<I, F, DynPullType>
where
    I: PinId,
    F: Function,
    P: PullType,
{
    match pull {
        Pull::None => pin.into_pull_type::<PullNone>().into_pull_type(),
        Pull::Up => pin.into_pull_type::<PullUp>().into_pull_type(),
        Pull::Down => pin.into_pull_type::<PullDown>().into_pull_type(),
    }
}

/// Configure `pin` as output `line`, biased per its [`LINE_MAP`](crate::components::LINE_MAP)
/// entry
pub fn output_line<I, F, P>(pin: Pin<I, F, P>, line: GpLine) -> GpOutput
where
    I: PinId + ValidFunction<FunctionSioOutput>,
    F: Function,
    P: PullType,
{
    let config = DigitalLine::of(line, Direction::Output);
    with_pull(pin.into_push_pull_output(), config.pull).into_dyn_pin()
}

/// Configure `pin` as input `line`, biased per its [`LINE_MAP`](crate::components::LINE_MAP)
/// entry, with both edge interrupts enabled
pub fn input_line<I, F, P>(pin: Pin<I, F, P>, line: GpLine) -> GpInput
where
    I: PinId + ValidFunction<FunctionSioInput>,
    F: Function,
    P: PullType,
{
    let config = DigitalLine::of(line, Direction::Input);
    let pin = with_pull(pin.into_function::<FunctionSioInput>(), config.pull).into_dyn_pin();
    pin.set_interrupt_enabled(EdgeHigh, true);
    pin.set_interrupt_enabled(EdgeLow, true);
    pin
}

/// Hand `pin` to the ADC. `None` unless it is one of GPIO26-29.
pub fn analog_pin<I, F, P>(pin: Pin<I, F, P>) -> Option<AnalogPin>
where
    I: PinId + ValidFunction<FunctionSioInput>,
    F: Function,
    P: PullType,
{
    AdcPin::new(pin.into_floating_input().into_dyn_pin()).ok()
}

/// PWM slice 7 free-running at [`CAPTURE_COUNTER_HZ`], extended past its 16 bits with the
/// 1 MHz TIMER.
///
/// Both count from the crystal, so the slice's low bits keep a fixed phase against the
/// scaled TIMER and the TIMER only has to land within half a slice period.
pub struct CaptureCounter {
    /// Fine count, wraps every 65536 ticks (1.31 ms)
    slice: Slice<Pwm7, FreeRunning>,
    /// Coarse count
    timer: Timer,
    /// Phase of the slice against the scaled TIMER
    offset: u32,
}

impl CaptureCounter {
    /// Start `slice` and lock its phase to `timer`
    pub fn new(mut slice: Slice<Pwm7, FreeRunning>, timer: Timer) -> Self {
        slice.set_div_int(2);
        slice.set_div_frac(8);
        slice.set_top(u16::MAX);
        slice.enable();

        let mut counter = Self {
            slice,
            timer,
            offset: 0,
        };
        let coarse = counter.coarse();
        counter.offset = counter.slice.get_counter().wrapping_sub(coarse as u16) as u32;
        debug!("Capture counter phase {}", counter.offset);
        counter
    }

    /// TIMER scaled to capture ticks, phase-aligned with the slice
    fn coarse(&self) -> u32 {
        self.timer
            .get_counter_low()
            .wrapping_mul(COUNTS_PER_US)
            .wrapping_add(self.offset)
    }
}

impl CycleCounter for CaptureCounter {
    fn now(&self) -> u32 {
        let coarse = self.coarse();
        extend_low_bits(coarse, self.slice.get_counter())
    }
}

/// Raw access to the input lines from the edge interrupt, while the pins themselves belong
/// to the [`DigitalIoController`](crate::components::DigitalIoController).
#[derive(Clone, Copy)]
pub struct EdgeLatch {
    /// GPIO number of each input line
    gpios: [u8; NUM_LINES],
}

impl EdgeLatch {
    /// Latch for the given input lines, in line order
    pub fn new(inputs: &[GpInput; NUM_LINES]) -> Self {
        Self {
            gpios: core::array::from_fn(|line| inputs[line].id().num),
        }
    }

    /// Clear pending edge flags on the input lines
    pub fn acknowledge(&self) {
        // SAFETY: INTR is write-1-to-clear and only the edge bits of our input lines are set,
        // so no other pin's state is touched.
        let io = unsafe { &*pac::IO_BANK0::ptr() };
        for gpio in self.gpios {
            let edges = 0b1100u32 << (4 * (gpio as u32 % 8));
            io.intr(gpio as usize / 8).write(|w| unsafe { w.bits(edges) });
        }
    }

    /// Input levels packed into the low 4 bits
    pub fn levels(&self) -> u8 {
        // SAFETY: GPIO_IN is read-only
        let sio = unsafe { &*pac::SIO::ptr() };
        let raw = sio.gpio_in().read().bits();
        self.gpios
            .iter()
            .enumerate()
            .fold(0, |levels, (line, gpio)| {
                levels | ((((raw >> gpio) & 1) as u8) << line)
            })
    }
}

/// Everything the input-edge interrupt needs
pub struct EdgeSource {
    /// Input line access
    latch: EdgeLatch,
    /// Timestamp source
    counter: CaptureCounter,
}

impl EdgeSource {
    /// Bundle the latch and counter for the interrupt
    pub fn new(latch: EdgeLatch, counter: CaptureCounter) -> Self {
        Self { latch, counter }
    }

    /// Body of the input-edge interrupt
    pub fn service(&self, capture: &SharedCapture) {
        self.latch.acknowledge();
        input_edge(capture, self.latch.levels(), &self.counter);
    }
}

/// ADC in round-robin free-running mode over the four analog pads, drained into a
/// [`SampleRing`] by DMA channel 0 with write-address wrapping.
///
/// The DMA transfer count starts at [`u32::MAX`] and counts down, which gives the number of
/// samples written since configuration. If it ever runs out the DMA stops, the pipeline sees
/// a stall, and reconfigures.
pub struct AdcDmaProducer<'a> {
    /// ADC while no FIFO is built
    adc: Option<&'a mut Adc>,
    /// FIFO of the current ring transfer
    fifo: Option<AdcFifo<'a, u16>>,
    /// Pitot, battery current, battery voltage, aux
    pins: [AnalogPin; NUM_CHANNELS],
    /// Channel writing the ring
    dma: Channel<CH0>,
}

impl<'a> AdcDmaProducer<'a> {
    /// Take over the ADC, its pads, and a DMA channel. No conversions run until the first
    /// [`configure_ring`](SampleProducer::configure_ring).
    pub fn new(adc: &'a mut Adc, pins: [AnalogPin; NUM_CHANNELS], dma: Channel<CH0>) -> Self {
        debug!(
            "ADC at {} samples/s, divider {}",
            ADC_SAMPLE_RATE, ADC_CLOCK_DIVIDER
        );
        Self {
            adc: Some(adc),
            fifo: None,
            pins,
            dma,
        }
    }
}

impl SampleProducer for AdcDmaProducer<'_> {
    fn samples_written(&self) -> u32 {
        if self.fifo.is_none() {
            return 0;
        }
        u32::MAX - self.dma.ch().ch_trans_count().read().bits()
    }

    fn halt(&mut self) {
        if let Some(fifo) = self.fifo.as_mut() {
            fifo.pause();
            // A conversion already started still lands in the FIFO
            cortex_m::asm::delay(CONVERSION_SYS_CYCLES);
            fifo.clear();
        }
    }

    fn resume(&mut self) {
        if let Some(fifo) = self.fifo.as_mut() {
            fifo.resume();
        }
    }

    fn configure_ring(&mut self, transfer: &RingTransfer) {
        // SAFETY: only this channel's abort bit is written
        let dma = unsafe { &*pac::DMA::ptr() };
        dma.chan_abort()
            .write(|w| unsafe { w.bits(1 << self.dma.id()) });
        while dma.chan_abort().read().bits() != 0 {}

        // Rebuilding restarts the round robin at channel 0, in step with slot 0 of the ring
        if let Some(fifo) = self.fifo.take() {
            self.adc = Some(fifo.stop());
        }
        let Some(adc) = self.adc.take() else {
            return;
        };
        let [pitot, current, voltage, aux] = &mut self.pins;
        let fifo = adc
            .build_fifo()
            .clock_divider(ADC_CLOCK_DIVIDER, 0)
            .set_channel(pitot)
            .round_robin((&mut *pitot, &mut *current, &mut *voltage, &mut *aux))
            .enable_dma()
            .start_paused();
        let (fifo_addr, _) = fifo.dma_read_target().rx_address_count();

        let ring_bytes = (transfer.len * core::mem::size_of::<i16>()) as u32;
        let ch = self.dma.ch();
        ch.ch_read_addr().write(|w| unsafe { w.bits(fifo_addr) });
        ch.ch_write_addr()
            .write(|w| unsafe { w.bits(transfer.base_addr as u32) });
        ch.ch_trans_count().write(|w| unsafe { w.bits(u32::MAX) });
        ch.ch_ctrl_trig().write(|w| unsafe {
            w.data_size()
                .size_halfword()
                .incr_read()
                .clear_bit()
                .incr_write()
                .set_bit()
                .ring_sel()
                .set_bit()
                .ring_size()
                .bits(ring_bytes.trailing_zeros() as u8)
                .treq_sel()
                .bits(DREQ_ADC)
                .chain_to()
                .bits(self.dma.id())
                .en()
                .set_bit()
        });

        self.fifo = Some(fifo);
    }
}

/// Stand-in for the communications layer: takes output requests from [`GPOUT_REQUEST`] and
/// logs the published values every [`TelemetryLog::LOG_INTERVAL`] ticks.
#[derive(Default)]
pub struct TelemetryLog {
    /// Ticks published so far
    ticks: u32,
    /// Input snapshot of the current tick
    gpin: u8,
    /// Pulse widths of the current tick
    pwm: [u16; NUM_LINES],
    /// Pitot reading of the current tick
    pitot: u16,
    /// Battery current and voltage of the current tick
    iv: (u16, u16),
}

impl TelemetryLog {
    /// Ticks between log lines
    pub const LOG_INTERVAL: u32 = 1000;
}

impl Comms for TelemetryLog {
    fn gpout(&self) -> u8 {
        GPOUT_REQUEST.load(Ordering::Relaxed)
    }

    fn set_gpin_state(&mut self, state: u8) {
        self.gpin = state;
    }

    fn set_pwm_values(&mut self, values: &[u16; NUM_LINES]) {
        self.pwm = *values;
    }

    fn set_pitot(&mut self, pitot: u16) {
        self.pitot = pitot;
    }

    fn set_iv(&mut self, current: u16, voltage: u16) {
        self.iv = (current, voltage);
    }

    // Last setter of a tick
    fn set_range(&mut self, range: u16) {
        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % Self::LOG_INTERVAL == 0 {
            info!(
                "gpin {=u8:b} pwm {} pitot {} I {} V {} range {}",
                self.gpin, self.pwm, self.pitot, self.iv.0, self.iv.1, range
            );
        }
    }
}
