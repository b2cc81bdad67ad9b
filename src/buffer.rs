
// SPDX-License-Identifier: Apache-2.0

//! Oversampled analog acquisition: the DMA-fed [`SampleRing`] and the
//! [`AnalogAcquisitionPipeline`] that drains and averages it once per tick.

use core::sync::atomic::{fence, AtomicI16, Ordering};

#[cfg(feature = "defmt")]
#[allow(unused_imports)]
use defmt::{debug, trace, warn};
#[cfg(not(feature = "defmt"))]
#[allow(unused_imports)]
use log::{debug, trace, warn};

/// Number of interleaved analog channels
pub const NUM_CHANNELS: usize = 4;
/// Raw samples taken per channel for every logical reading
pub const OVERSAMPLE_RATE: usize = 16;
/// Ring length in samples. Holds two oversampled rounds of every channel, twice over.
pub const RING_CAPACITY: usize = NUM_CHANNELS * OVERSAMPLE_RATE * 2 * 2;
/// Unread backlog above which the consumer is considered overrun by the producer
pub const OVERFLOW_THRESHOLD: u32 = (RING_CAPACITY * 7 / 8) as u32;
/// Most samples a single channel can physically receive in one drain
pub const MAX_SAMPLES_PER_CHANNEL: u16 = (RING_CAPACITY / NUM_CHANNELS) as u16;
/// Raw samples above this value are clamped to it
pub const SAMPLE_CLAMP_MAX: i16 = 2047;
/// Largest value an averaged reading may take
pub const AVERAGE_MAX: u32 = 32768;
/// Analog inputs 0-3 converted in round-robin order
pub const CHANNEL_MASK: u8 = 0b1111;

// The read cursor is derived from a wrapping u32 count.
const _: () = assert!(RING_CAPACITY.is_power_of_two());

/// Identity of each analog channel. Discriminants match the round-robin order in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AnalogChannelId {
    /// Pitot tube differential pressure
    Pitot = 0,
    /// Battery current sense
    BatteryCurrent = 1,
    /// Battery voltage divider
    BatteryVoltage = 2,
    /// Auxiliary input (rangefinder on the reference board)
    Aux = 3,
}

impl AnalogChannelId {
    /// All channels, in ring order
    pub const ALL: [Self; NUM_CHANNELS] = [
        Self::Pitot,
        Self::BatteryCurrent,
        Self::BatteryVoltage,
        Self::Aux,
    ];

    /// Index into per-channel arrays
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Channel that produced the sample stored at `ring_index`
    pub const fn of_sample(ring_index: usize) -> Self {
        Self::ALL[ring_index % NUM_CHANNELS]
    }
}

/// Clamp a raw conversion into `[0, SAMPLE_CLAMP_MAX]`.
///
/// Negative values (conversion errors flag bit 15) become 0.
pub const fn clamp_sample(sample: i16) -> u16 {
    if sample < 0 {
        0
    } else if sample >= SAMPLE_CLAMP_MAX {
        SAMPLE_CLAMP_MAX as u16
    } else {
        sample as u16
    }
}

/// Circular store of raw interleaved samples (`0 1 2 3 0 1 2 3 ...`).
///
/// The DMA engine writes into this memory behind the CPU's back, so every slot is an atomic
/// cell rather than plain memory reachable through `&mut`. Aligned to its own size in bytes,
/// which the RP2040 DMA write ring requires.
#[repr(C, align(512))]
pub struct SampleRing {
    /// Sample slots
    samples: [AtomicI16; RING_CAPACITY],
}

impl SampleRing {
    /// Zeroed ring
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY: AtomicI16 = AtomicI16::new(0);
        Self {
            samples: [EMPTY; RING_CAPACITY],
        }
    }

    /// Address of slot 0, handed to the producer when (re)configuring a transfer
    pub fn base_addr(&self) -> usize {
        self.samples.as_ptr() as usize
    }

    /// Read the sample at `index` (wrapped to the ring length)
    pub fn read(&self, index: usize) -> i16 {
        self.samples[index % RING_CAPACITY].load(Ordering::Relaxed)
    }

    /// Store a sample at `index` (wrapped to the ring length).
    ///
    /// Only software producers use this; the DMA engine writes the memory directly.
    pub fn write(&self, index: usize, sample: i16) {
        self.samples[index % RING_CAPACITY].store(sample, Ordering::Relaxed)
    }
}

impl Default for SampleRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters of a ring-mode transfer: the producer writes `len` samples starting at
/// `base_addr`, wraps back to `base_addr`, and keeps going until halted or reconfigured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RingTransfer {
    /// Address of the first sample slot
    pub base_addr: usize,
    /// Ring length in samples
    pub len: usize,
    /// Bit *n* set converts analog input *n*; inputs are converted in round-robin order
    pub channel_mask: u8,
}

/// The DMA-like engine filling a [`SampleRing`]. It runs on its own; software can only
/// observe its progress and stop, reprogram, or restart it.
pub trait SampleProducer {
    /// Samples written since the last [`configure_ring`](Self::configure_ring), wrapping at
    /// [`u32::MAX`]. Must read 0 before the first configuration.
    fn samples_written(&self) -> u32;

    /// Stop new conversions.
    fn halt(&mut self);

    /// Restart conversions after [`halt`](Self::halt).
    fn resume(&mut self);

    /// Reprogram the transfer and reset the written count to 0. Called with the producer
    /// halted and inside a critical section.
    fn configure_ring(&mut self, transfer: &RingTransfer);
}

/// Reason the ring was reset on a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferFault {
    /// No new samples since the previous tick (or the producer was never started)
    Stalled,
    /// The producer got too far ahead of the reader
    Overflow {
        /// Unread samples observed at the health check
        unread: u32,
    },
}

/// Per-channel accumulator for the current tick window
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalogChannel {
    /// Sum of clamped samples this window
    total: u32,
    /// Samples accumulated this window
    sample_count: u16,
    /// Last published average, `0..=AVERAGE_MAX`
    average: u16,
}

impl AnalogChannel {
    /// Add one raw sample to the window
    fn accumulate(&mut self, sample: i16) {
        assert!(
            self.sample_count < MAX_SAMPLES_PER_CHANNEL,
            "more samples drained for one channel than the ring can hold"
        );
        self.total += clamp_sample(sample) as u32;
        self.sample_count += 1;
    }

    /// Close the window: compute, store, and return the average, then clear the sums
    fn publish(&mut self) -> u16 {
        let average = match self.sample_count {
            0 => 0,
            count => (self.total << 4) / count as u32,
        };
        assert!(
            average <= AVERAGE_MAX,
            "analog average exceeds 32768; clamp and ring sizing disagree"
        );
        self.average = average as u16;
        self.total = 0;
        self.sample_count = 0;
        self.average
    }

    /// Last published average
    pub fn average(&self) -> u16 {
        self.average
    }
}

/// One averaged reading per channel, each in `0..=32768`
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AnalogReadings {
    /// Pitot pressure
    pub pitot: u16,
    /// Battery current
    pub battery_current: u16,
    /// Battery voltage
    pub battery_voltage: u16,
    /// Auxiliary channel
    pub aux: u16,
}

impl AnalogReadings {
    /// Reading for a single channel
    pub fn get(&self, channel: AnalogChannelId) -> u16 {
        match channel {
            AnalogChannelId::Pitot => self.pitot,
            AnalogChannelId::BatteryCurrent => self.battery_current,
            AnalogChannelId::BatteryVoltage => self.battery_voltage,
            AnalogChannelId::Aux => self.aux,
        }
    }
}

/// Outcome of [`AnalogAcquisitionPipeline::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Acquisition {
    /// Averages to publish. All zero when the ring was reset this tick.
    pub readings: AnalogReadings,
    /// Set when the health check reset the ring
    pub fault: Option<BufferFault>,
}

/// Keeps a [`SampleProducer`] halted for as long as it lives, and resumes it on drop.
struct Halted<'a, P: SampleProducer>(&'a mut P);

impl<'a, P: SampleProducer> Halted<'a, P> {
    /// Halt `producer` until the guard is dropped
    fn new(producer: &'a mut P) -> Self {
        producer.halt();
        Self(producer)
    }

    /// Reprogram the halted producer
    fn configure(&mut self, transfer: &RingTransfer) {
        self.0.configure_ring(transfer);
    }
}

impl<P: SampleProducer> Drop for Halted<'_, P> {
    fn drop(&mut self) {
        self.0.resume();
    }
}

/// Drains the [`SampleRing`] once per tick and averages the new samples per channel.
pub struct AnalogAcquisitionPipeline<P: SampleProducer> {
    /// Ring written by `producer`
    ring: &'static SampleRing,
    /// DMA-like engine feeding `ring`
    producer: P,
    /// Samples drained since the producer was last configured. Comparable with
    /// [`SampleProducer::samples_written`].
    consumed: u32,
    /// Accumulators, indexed by [`AnalogChannelId::index`]
    channels: [AnalogChannel; NUM_CHANNELS],
    /// Number of ring resets performed
    recoveries: u32,
}

impl<P: SampleProducer> AnalogAcquisitionPipeline<P> {
    /// Attach the pipeline to its ring and producer.
    ///
    /// The producer does not need to be running: the first [`acquire`](Self::acquire) sees
    /// no samples and configures it through the stall recovery path.
    pub fn new(ring: &'static SampleRing, producer: P) -> Self {
        Self {
            ring,
            producer,
            consumed: 0,
            channels: [AnalogChannel::default(); NUM_CHANNELS],
            recoveries: 0,
        }
    }

    /// Position of the next sample to read in the ring
    pub fn last_read_index(&self) -> usize {
        self.consumed as usize % RING_CAPACITY
    }

    /// Samples written by the producer but not yet drained
    pub fn unread(&self) -> u32 {
        self.producer.samples_written().wrapping_sub(self.consumed)
    }

    /// Number of times the ring has been reset
    pub fn recoveries(&self) -> u32 {
        self.recoveries
    }

    /// Accumulator state for one channel
    pub fn channel(&self, channel: AnalogChannelId) -> &AnalogChannel {
        &self.channels[channel.index()]
    }

    /// Shared access to the producer
    pub fn producer(&self) -> &P {
        &self.producer
    }

    /// Exclusive access to the producer
    pub fn producer_mut(&mut self) -> &mut P {
        &mut self.producer
    }

    /// Classify an unread count. `None` means the ring is healthy and can be drained.
    pub fn check_health(unread: u32) -> Option<BufferFault> {
        if unread == 0 {
            Some(BufferFault::Stalled)
        } else if unread > OVERFLOW_THRESHOLD {
            Some(BufferFault::Overflow { unread })
        } else {
            None
        }
    }

    /// Drain new samples and publish one average per channel.
    pub fn acquire(&mut self) -> Acquisition {
        let unread = self.unread();
        let fault = Self::check_health(unread);
        match fault {
            Some(fault) => self.recover(fault),
            None => self.drain(unread),
        }

        let mut averages = [0u16; NUM_CHANNELS];
        for (average, channel) in averages.iter_mut().zip(self.channels.iter_mut()) {
            *average = channel.publish();
        }
        let readings = AnalogReadings {
            pitot: averages[AnalogChannelId::Pitot.index()],
            battery_current: averages[AnalogChannelId::BatteryCurrent.index()],
            battery_voltage: averages[AnalogChannelId::BatteryVoltage.index()],
            aux: averages[AnalogChannelId::Aux.index()],
        };

        #[cfg(feature = "trace_analog_averages")]
        trace!(
            "averages: pitot {} current {} voltage {} aux {}",
            readings.pitot,
            readings.battery_current,
            readings.battery_voltage,
            readings.aux
        );

        Acquisition { readings, fault }
    }

    /// Read exactly `unread` samples from the cursor, advancing it circularly
    fn drain(&mut self, unread: u32) {
        // Samples must not be loaded before the producer's count was observed.
        fence(Ordering::Acquire);
        for _ in 0..unread {
            let index = self.last_read_index();
            let sample = self.ring.read(index);

            #[cfg(feature = "trace_raw_samples")]
            trace!("sample {}: channel {} raw {}", index, index % NUM_CHANNELS, sample);

            self.channels[AnalogChannelId::of_sample(index).index()].accumulate(sample);
            self.consumed = self.consumed.wrapping_add(1);
        }
    }

    /// Reset the cursor and restart the producer on a fresh ring transfer.
    ///
    /// Safe to run on every tick while the fault persists.
    fn recover(&mut self, fault: BufferFault) {
        match fault {
            BufferFault::Overflow { unread } => warn!(
                "ADC ring overrun ({} unread of {}), restarting transfer",
                unread, RING_CAPACITY
            ),
            BufferFault::Stalled => debug!("ADC ring stalled, restarting transfer"),
        }

        self.consumed = 0;
        let transfer = RingTransfer {
            base_addr: self.ring.base_addr(),
            len: RING_CAPACITY,
            channel_mask: CHANNEL_MASK,
        };
        let mut halted = Halted::new(&mut self.producer);
        debug!("critical_section: reconfigure ADC ring transfer");
        critical_section::with(|_cs| halted.configure(&transfer));
        drop(halted);

        self.recoveries = self.recoveries.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    extern crate std;
    use std::boxed::Box;
    use std::vec::Vec;

    /// Software producer writing interleaved samples into a ring, recording control calls
    struct MockProducer {
        ring: &'static SampleRing,
        written: u32,
        running: bool,
        configured: Vec<RingTransfer>,
        halts: u32,
    }

    impl MockProducer {
        fn new(ring: &'static SampleRing) -> Self {
            Self {
                ring,
                written: 0,
                running: false,
                configured: Vec::new(),
                halts: 0,
            }
        }

        fn push(&mut self, samples: &[i16]) {
            for &sample in samples {
                self.ring.write(self.written as usize, sample);
                self.written = self.written.wrapping_add(1);
            }
        }

        fn push_n(&mut self, count: usize) {
            for _ in 0..count {
                self.push(&[100]);
            }
        }
    }

    impl SampleProducer for MockProducer {
        fn samples_written(&self) -> u32 {
            self.written
        }

        fn halt(&mut self) {
            self.halts += 1;
            self.running = false;
        }

        fn resume(&mut self) {
            self.running = true;
        }

        fn configure_ring(&mut self, transfer: &RingTransfer) {
            assert!(!self.running, "ring reprogrammed while producer running");
            self.configured.push(*transfer);
            self.written = 0;
        }
    }

    fn leaked_ring() -> &'static SampleRing {
        Box::leak(Box::new(SampleRing::new()))
    }

    /// Pipeline whose producer has already been configured once
    fn started_pipeline() -> AnalogAcquisitionPipeline<MockProducer> {
        let ring = leaked_ring();
        let mut pipeline = AnalogAcquisitionPipeline::new(ring, MockProducer::new(ring));
        assert_eq!(pipeline.acquire().fault, Some(BufferFault::Stalled));
        pipeline
    }

    #[test]
    fn clamp_bounds() {
        assert_eq!(clamp_sample(-1), 0);
        assert_eq!(clamp_sample(i16::MIN), 0);
        assert_eq!(clamp_sample(0), 0);
        assert_eq!(clamp_sample(2046), 2046);
        assert_eq!(clamp_sample(2047), 2047);
        assert_eq!(clamp_sample(2048), 2047);
        assert_eq!(clamp_sample(4095), 2047);
        assert_eq!(clamp_sample(i16::MAX), 2047);
    }

    #[test]
    fn full_channel_window_publishes_in_range() {
        let mut channel = AnalogChannel::default();
        for _ in 0..MAX_SAMPLES_PER_CHANNEL {
            channel.accumulate(SAMPLE_CLAMP_MAX);
        }
        assert_eq!(channel.publish(), 32752);
    }

    #[test]
    #[should_panic(expected = "more samples drained for one channel")]
    fn channel_overfill_is_fatal() {
        let mut channel = AnalogChannel::default();
        for _ in 0..=MAX_SAMPLES_PER_CHANNEL {
            channel.accumulate(100);
        }
    }

    #[test]
    #[should_panic(expected = "analog average exceeds 32768")]
    fn out_of_range_average_is_fatal() {
        let mut channel = AnalogChannel {
            total: 2049,
            sample_count: 1,
            average: 0,
        };
        channel.publish();
    }

    #[test]
    fn first_acquire_starts_producer() {
        let ring = leaked_ring();
        let mut pipeline = AnalogAcquisitionPipeline::new(ring, MockProducer::new(ring));
        let acquisition = pipeline.acquire();

        assert_eq!(acquisition.fault, Some(BufferFault::Stalled));
        assert_eq!(acquisition.readings, AnalogReadings::default());
        let producer = pipeline.producer();
        assert!(producer.running);
        assert_eq!(
            producer.configured.as_slice(),
            &[RingTransfer {
                base_addr: ring.base_addr(),
                len: RING_CAPACITY,
                channel_mask: 0b1111,
            }]
        );
    }

    #[test]
    fn end_to_end_averages() {
        let mut pipeline = started_pipeline();
        for _ in 0..8 {
            pipeline.producer_mut().push(&[2000, 50, 2047, 0]);
        }

        let acquisition = pipeline.acquire();
        assert_eq!(acquisition.fault, None);
        assert_eq!(
            acquisition.readings,
            AnalogReadings {
                pitot: 32000,
                battery_current: 800,
                battery_voltage: 32752,
                aux: 0,
            }
        );
        assert_eq!(pipeline.last_read_index(), 32);
    }

    #[test]
    fn out_of_range_samples_clamped_before_averaging() {
        let mut pipeline = started_pipeline();
        pipeline.producer_mut().push(&[-5, 4095, 2048, 1000]);
        pipeline.producer_mut().push(&[-5, 4095, 2048, 1002]);

        let readings = pipeline.acquire().readings;
        assert_eq!(readings.pitot, 0);
        assert_eq!(readings.battery_current, 2047 * 16);
        assert_eq!(readings.battery_voltage, 2047 * 16);
        assert_eq!(readings.aux, 1001 * 16);
    }

    #[test]
    fn channels_without_samples_publish_zero() {
        let mut pipeline = started_pipeline();
        pipeline.producer_mut().push(&[1000, 1000]);

        let readings = pipeline.acquire().readings;
        assert_eq!(readings.pitot, 16000);
        assert_eq!(readings.battery_current, 16000);
        assert_eq!(readings.battery_voltage, 0);
        assert_eq!(readings.aux, 0);
    }

    #[test]
    fn drain_continues_channel_order_across_ticks() {
        let mut pipeline = started_pipeline();
        pipeline.producer_mut().push(&[10, 20, 30]);
        pipeline.acquire();
        pipeline.producer_mut().push(&[40, 11, 21, 31, 41]);

        let readings = pipeline.acquire().readings;
        assert_eq!(readings.pitot, 11 * 16);
        assert_eq!(readings.battery_current, 21 * 16);
        assert_eq!(readings.battery_voltage, 31 * 16);
        assert_eq!(readings.aux, ((40 + 41) * 16) / 2);
    }

    #[test]
    fn reads_wrap_around_ring_end() {
        let mut pipeline = started_pipeline();
        for _ in 0..3 {
            pipeline.producer_mut().push_n(200);
            assert_eq!(pipeline.acquire().fault, None);
        }
        assert_eq!(pipeline.last_read_index(), 600 % RING_CAPACITY);

        pipeline.producer_mut().push(&[1, 2, 3, 4]);
        let readings = pipeline.acquire().readings;
        assert_eq!(pipeline.last_read_index(), 604 % RING_CAPACITY);
        assert_eq!(readings.pitot, 16);
        assert_eq!(readings.aux, 64);
        assert_eq!(pipeline.recoveries(), 1);
    }

    #[test]
    fn lapped_reader_resets_exactly_once() {
        let mut pipeline = started_pipeline();
        pipeline.producer_mut().push_n(128);
        assert_eq!(pipeline.acquire().fault, None);
        pipeline.producer_mut().push_n(RING_CAPACITY - 1 - 128);
        assert_eq!(pipeline.acquire().fault, None);
        assert_eq!(pipeline.last_read_index(), RING_CAPACITY - 1);

        pipeline.producer_mut().push_n(RING_CAPACITY + 5);
        let acquisition = pipeline.acquire();
        assert_eq!(
            acquisition.fault,
            Some(BufferFault::Overflow {
                unread: RING_CAPACITY as u32 + 5
            })
        );
        assert_eq!(acquisition.readings, AnalogReadings::default());
        assert_eq!(pipeline.last_read_index(), 0);
        assert_eq!(pipeline.recoveries(), 2);

        pipeline.producer_mut().push(&[500, 600, 700, 800]);
        let acquisition = pipeline.acquire();
        assert_eq!(acquisition.fault, None);
        assert_eq!(acquisition.readings.pitot, 8000);
        assert_eq!(pipeline.last_read_index(), 4);
        assert_eq!(pipeline.recoveries(), 2);
    }

    #[test]
    fn backlog_at_threshold_is_drained() {
        let mut pipeline = started_pipeline();
        pipeline.producer_mut().push_n(OVERFLOW_THRESHOLD as usize);
        assert_eq!(pipeline.acquire().fault, None);

        pipeline.producer_mut().push_n(OVERFLOW_THRESHOLD as usize + 1);
        assert!(matches!(
            pipeline.acquire().fault,
            Some(BufferFault::Overflow { .. })
        ));
    }

    #[test]
    fn persistent_stall_recovers_every_tick() {
        let mut pipeline = started_pipeline();
        for _ in 0..3 {
            let acquisition = pipeline.acquire();
            assert_eq!(acquisition.fault, Some(BufferFault::Stalled));
            assert_eq!(pipeline.last_read_index(), 0);
            assert!(pipeline.producer().running);
        }
        assert_eq!(pipeline.recoveries(), 4);
        assert_eq!(pipeline.producer().halts, 4);
    }

    #[test]
    fn previous_averages_retained_until_next_publish() {
        let mut pipeline = started_pipeline();
        pipeline.producer_mut().push(&[100, 200, 300, 400]);
        pipeline.acquire();
        assert_eq!(pipeline.channel(AnalogChannelId::Aux).average(), 6400);

        pipeline.acquire();
        assert_eq!(pipeline.channel(AnalogChannelId::Aux).average(), 0);
    }

    proptest! {
        #[test]
        fn clamp_is_idempotent(sample in any::<i16>()) {
            let once = clamp_sample(sample);
            prop_assert!(once <= 2047);
            prop_assert_eq!(clamp_sample(once as i16), once);
            if (0..=2047).contains(&sample) {
                prop_assert_eq!(once, sample as u16);
            }
        }

        #[test]
        fn average_matches_scaled_mean(
            rounds in proptest::collection::vec(proptest::array::uniform4(any::<i16>()), 0..=56usize)
        ) {
            let mut pipeline = started_pipeline();
            for round in &rounds {
                pipeline.producer_mut().push(round);
            }
            let acquisition = pipeline.acquire();

            if rounds.is_empty() {
                prop_assert_eq!(acquisition.fault, Some(BufferFault::Stalled));
            } else {
                prop_assert_eq!(acquisition.fault, None);
            }
            for channel in AnalogChannelId::ALL {
                let expected = if rounds.is_empty() {
                    0
                } else {
                    let total: u32 = rounds
                        .iter()
                        .map(|round| clamp_sample(round[channel.index()]) as u32)
                        .sum();
                    (total * 16) / rounds.len() as u32
                };
                prop_assert_eq!(acquisition.readings.get(channel) as u32, expected);
                prop_assert!(expected <= AVERAGE_MAX);
            }
        }
    }
}
