//! Firmware for the sensor board's general-purpose I/O block: samples the analog channels,
//! captures PWM inputs, and mirrors the digital lines once per millisecond tick.
#![no_std]
#![no_main]
#![doc(html_playground_url = "https://play.rust-lang.org/")]
#![warn(missing_docs)]

use core::cell::RefCell;

use critical_section::Mutex;
use defmt::{debug, info};
#[allow(unused_imports)]
use defmt_rtt as _;
use embedded_hal::delay::DelayNs;
#[allow(unused_imports)]
use panic_probe as _;
use rp2040_hal::{
    clocks::init_clocks_and_plls, dma::DMAExt, entry, gpio::Pins, pac, pac::interrupt,
    pwm::Slices, Adc, Sio, Timer, Watchdog,
};

use gp_io::{
    board::{
        analog_pin, create_sample_ring, input_line, output_line, AdcDmaProducer,
        CaptureCounter, EdgeLatch, EdgeSource, TelemetryLog, RING_TAKEN_PANIC_MSG,
    },
    components::{DigitalIoController, GpLine},
    interrupt::{set_calibration, PWM_CAPTURE},
    pwm::CAPTURE_COUNTER_HZ,
    AnalogAcquisitionPipeline, GpIo, PwmCalibration,
};

/// Second-stage bootloader, from [rp2040-boot2](https://docs.rs/rp2040-boot2)
#[link_section = ".boot2"]
#[used]
pub static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_W25Q080;
/// External high-speed crystal on the pico board is 12Mhz
pub const XOSC_FREQ_HZ: u32 = 12_000_000;
/// Scheduler tick period
pub const TICK_PERIOD_US: u32 = 1_000;

/// Latch and counter for the edge interrupt, set before it is unmasked
static EDGE_SOURCE: Mutex<RefCell<Option<EdgeSource>>> = Mutex::new(RefCell::new(None));

/// Main operation loop
#[entry]
fn main() -> ! {
    info!("GP I/O startup");
    let mut pac = pac::Peripherals::take().unwrap();
    let mut watchdog = Watchdog::new(pac.WATCHDOG);
    let sio = Sio::new(pac.SIO);

    let clocks = init_clocks_and_plls(
        XOSC_FREQ_HZ,
        pac.XOSC,
        pac.CLOCKS,
        pac.PLL_SYS,
        pac.PLL_USB,
        &mut pac.RESETS,
        &mut watchdog,
    )
    .ok()
    .unwrap();
    let mut timer = Timer::new(pac.TIMER, &mut pac.RESETS, &clocks);
    let pins = Pins::new(
        pac.IO_BANK0,
        pac.PADS_BANK0,
        sio.gpio_bank0,
        &mut pac.RESETS,
    );

    // Digital lines, biased per LINE_MAP
    let outputs = [
        output_line(pins.gpio2, GpLine::Gp0),
        output_line(pins.gpio3, GpLine::Gp1),
        output_line(pins.gpio4, GpLine::Gp2),
        output_line(pins.gpio5, GpLine::Gp3),
    ];
    let inputs = [
        input_line(pins.gpio10, GpLine::Gp0),
        input_line(pins.gpio11, GpLine::Gp1),
        input_line(pins.gpio12, GpLine::Gp2),
        input_line(pins.gpio13, GpLine::Gp3),
    ];
    let latch = EdgeLatch::new(&inputs);

    // Analog pads: pitot, battery current, battery voltage, aux
    let analog_pins = [
        analog_pin(pins.gpio26).unwrap(),
        analog_pin(pins.gpio27).unwrap(),
        analog_pin(pins.gpio28).unwrap(),
        analog_pin(pins.gpio29).unwrap(),
    ];
    let mut adc = Adc::new(pac.ADC, &mut pac.RESETS);
    let dma = pac.DMA.split(&mut pac.RESETS);
    let producer = AdcDmaProducer::new(&mut adc, analog_pins, dma.ch0);
    let ring = create_sample_ring().expect(RING_TAKEN_PANIC_MSG);

    // PWM capture
    let pwm_slices = Slices::new(pac.PWM, &mut pac.RESETS);
    let counter = CaptureCounter::new(pwm_slices.pwm7, timer);
    set_calibration(
        &PWM_CAPTURE,
        PwmCalibration::for_counter_hz(CAPTURE_COUNTER_HZ),
    );
    debug!("critical_section: install edge source");
    critical_section::with(|cs| {
        EDGE_SOURCE.replace(cs, Some(EdgeSource::new(latch, counter)));
    });

    let mut gp = GpIo::new(
        DigitalIoController::configure(outputs, inputs),
        AnalogAcquisitionPipeline::new(ring, producer),
        &PWM_CAPTURE,
    );
    let mut comms = TelemetryLog::default();

    // SAFETY: the handler only touches PWM_CAPTURE and EDGE_SOURCE, both behind critical
    // sections
    unsafe { pac::NVIC::unmask(pac::Interrupt::IO_IRQ_BANK0) };
    info!("GP I/O running, tick {} us", TICK_PERIOD_US);

    loop {
        gp.tick(&mut comms);
        timer.delay_us(TICK_PERIOD_US);
    }
}

/// Edge on any input line: snapshot the levels and timestamp them for PWM capture
#[interrupt]
fn IO_IRQ_BANK0() {
    critical_section::with(|cs| {
        if let Some(source) = EDGE_SOURCE.borrow_ref(cs).as_ref() {
            source.service(&PWM_CAPTURE);
        }
    });
}
