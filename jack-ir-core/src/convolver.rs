//! Block based multi-channel convolution.
//!
//! [`Convolver`] is the protocol the deconvolution step relies on: configure
//! the channel count and filter length, load filters into taps (or link taps to
//! already loaded filters), start, then repeatedly fill the input blocks,
//! process and read the output blocks.

use std::sync::Arc;

use rustfft::{num_complex::Complex32, Fft, FftPlanner};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvolverError {
    #[error("invalid configuration: {channels} channels, length {max_len}, partition size {partition_size}")]
    InvalidConfiguration {
        channels: usize,
        max_len: usize,
        partition_size: usize,
    },
    #[error("convolver is not configured")]
    NotConfigured,
    #[error("channel {0} is out of range")]
    ChannelOutOfRange(usize),
    #[error("filter of length {len} exceeds the configured maximum of {max}")]
    FilterTooLong { len: usize, max: usize },
    #[error("no filter loaded for tap {0:?}")]
    MissingFilter(Tap),
    #[error("convolver is already processing")]
    AlreadyStarted,
    #[error("convolver is not processing")]
    NotStarted,
}

/// Input to output path of a multi-channel convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tap {
    pub input: usize,
    pub output: usize,
}

impl Tap {
    pub fn new(input: usize, output: usize) -> Self {
        Self { input, output }
    }

    pub fn diagonal(channel: usize) -> Self {
        Self::new(channel, channel)
    }
}

pub trait Convolver {
    fn configure(
        &mut self,
        channels: usize,
        max_len: usize,
        partition_size: usize,
    ) -> Result<(), ConvolverError>;

    fn load_filter(&mut self, tap: Tap, data: &[f32]) -> Result<(), ConvolverError>;

    /// Lets `dst` use the filter already loaded for `src`.
    fn link_tap(&mut self, src: Tap, dst: Tap) -> Result<(), ConvolverError>;

    fn start(&mut self) -> Result<(), ConvolverError>;

    /// Input block of `channel`, one partition long.
    fn input_mut(&mut self, channel: usize) -> &mut [f32];

    /// Convolves the current input blocks into the output blocks.
    fn process(&mut self) -> Result<(), ConvolverError>;

    /// Output block of `channel`, one partition long.
    fn output(&self, channel: usize) -> &[f32];
}

/// Uniformly partitioned overlap-save convolution.
///
/// Filters are split into partition sized segments that are kept in the
/// frequency domain. Every processed block is transformed once and kept in a
/// per input delay line, so a block costs one forward transform per input,
/// one inverse transform per output and a complex multiply-add per partition.
/// The output block belongs to the same input block, there is no added delay.
#[derive(Default)]
pub struct PartitionedConvolver {
    engine: Option<Engine>,
    started: bool,
}

struct Engine {
    channels: usize,
    max_len: usize,
    partition_size: usize,
    n_partitions: usize,

    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex32>,

    filters: Vec<Box<[Complex32]>>,
    taps: Vec<(Tap, usize)>,

    inputs: Vec<Box<[f32]>>,
    previous: Vec<Box<[f32]>>,
    outputs: Vec<Box<[f32]>>,
    delay_lines: Vec<Box<[Complex32]>>,
    head: usize,

    frame: Box<[Complex32]>,
    accumulator: Box<[Complex32]>,
}

impl PartitionedConvolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn engine_mut(&mut self) -> Result<&mut Engine, ConvolverError> {
        if self.started {
            return Err(ConvolverError::AlreadyStarted);
        }

        self.engine.as_mut().ok_or(ConvolverError::NotConfigured)
    }
}

impl Convolver for PartitionedConvolver {
    fn configure(
        &mut self,
        channels: usize,
        max_len: usize,
        partition_size: usize,
    ) -> Result<(), ConvolverError> {
        if self.started {
            return Err(ConvolverError::AlreadyStarted);
        }

        if channels == 0 || max_len == 0 || partition_size < 16 || !partition_size.is_power_of_two()
        {
            return Err(ConvolverError::InvalidConfiguration {
                channels,
                max_len,
                partition_size,
            });
        }

        self.engine = Some(Engine::new(channels, max_len, partition_size));

        Ok(())
    }

    fn load_filter(&mut self, tap: Tap, data: &[f32]) -> Result<(), ConvolverError> {
        let engine = self.engine_mut()?;
        engine.check_tap(tap)?;

        if data.len() > engine.max_len {
            return Err(ConvolverError::FilterTooLong {
                len: data.len(),
                max: engine.max_len,
            });
        }

        let filter = engine.transform_filter(data);
        engine.filters.push(filter);

        let index = engine.filters.len() - 1;
        engine.assign(tap, index);

        Ok(())
    }

    fn link_tap(&mut self, src: Tap, dst: Tap) -> Result<(), ConvolverError> {
        let engine = self.engine_mut()?;
        engine.check_tap(src)?;
        engine.check_tap(dst)?;

        let index = engine
            .taps
            .iter()
            .find(|(tap, _)| *tap == src)
            .map(|(_, index)| *index)
            .ok_or(ConvolverError::MissingFilter(src))?;

        engine.assign(dst, index);

        Ok(())
    }

    fn start(&mut self) -> Result<(), ConvolverError> {
        self.engine_mut()?;
        self.started = true;

        Ok(())
    }

    fn input_mut(&mut self, channel: usize) -> &mut [f32] {
        match self.engine.as_mut() {
            Some(engine) => &mut engine.inputs[channel][..],
            None => &mut [],
        }
    }

    fn process(&mut self) -> Result<(), ConvolverError> {
        match self.engine.as_mut() {
            Some(engine) if self.started => {
                engine.process();
                Ok(())
            }
            _ => Err(ConvolverError::NotStarted),
        }
    }

    fn output(&self, channel: usize) -> &[f32] {
        match self.engine.as_ref() {
            Some(engine) => &engine.outputs[channel][..],
            None => &[],
        }
    }
}

impl Engine {
    fn new(channels: usize, max_len: usize, partition_size: usize) -> Self {
        let fft_len = 2 * partition_size;
        let n_partitions = max_len.div_ceil(partition_size);

        let mut planner = FftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(fft_len);
        let inverse = planner.plan_fft_inverse(fft_len);

        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        let zero = Complex32::new(0.0, 0.0);
        let blocks = |len: usize| -> Vec<Box<[f32]>> {
            (0..channels)
                .map(|_| vec![0.0; len].into_boxed_slice())
                .collect()
        };

        Self {
            channels,
            max_len,
            partition_size,
            n_partitions,
            forward,
            inverse,
            scratch: vec![zero; scratch_len],
            filters: Vec::new(),
            taps: Vec::new(),
            inputs: blocks(partition_size),
            previous: blocks(partition_size),
            outputs: blocks(partition_size),
            delay_lines: (0..channels)
                .map(|_| vec![zero; n_partitions * fft_len].into_boxed_slice())
                .collect(),
            head: 0,
            frame: vec![zero; fft_len].into_boxed_slice(),
            accumulator: vec![zero; fft_len].into_boxed_slice(),
        }
    }

    fn check_tap(&self, tap: Tap) -> Result<(), ConvolverError> {
        for channel in [tap.input, tap.output] {
            if channel >= self.channels {
                return Err(ConvolverError::ChannelOutOfRange(channel));
            }
        }

        Ok(())
    }

    fn assign(&mut self, tap: Tap, index: usize) {
        match self.taps.iter_mut().find(|(t, _)| *t == tap) {
            Some((_, filter)) => *filter = index,
            None => self.taps.push((tap, index)),
        }
    }

    /// Spectra of all filter segments, scaled for the unnormalized inverse transform.
    fn transform_filter(&mut self, data: &[f32]) -> Box<[Complex32]> {
        let fft_len = 2 * self.partition_size;
        let scale = 1.0 / fft_len as f32;
        let mut filter = vec![Complex32::new(0.0, 0.0); self.n_partitions * fft_len];

        for (segment, spectrum) in data
            .chunks(self.partition_size)
            .zip(filter.chunks_exact_mut(fft_len))
        {
            for (bin, s) in spectrum.iter_mut().zip(segment) {
                *bin = Complex32::new(s * scale, 0.0);
            }
            self.forward
                .process_with_scratch(spectrum, &mut self.scratch);
        }

        filter.into_boxed_slice()
    }

    fn process(&mut self) {
        let Engine {
            channels,
            partition_size,
            n_partitions,
            forward,
            inverse,
            scratch,
            filters,
            taps,
            inputs,
            previous,
            outputs,
            delay_lines,
            head,
            frame,
            accumulator,
            ..
        } = self;

        let fft_len = 2 * *partition_size;
        let zero = Complex32::new(0.0, 0.0);

        // newest spectrum goes to `head`, older ones follow it
        *head = (*head + *n_partitions - 1) % *n_partitions;

        for c in 0..*channels {
            let (older, newer) = frame.split_at_mut(*partition_size);
            for (bin, s) in older.iter_mut().zip(previous[c].iter()) {
                *bin = Complex32::new(*s, 0.0);
            }
            for (bin, s) in newer.iter_mut().zip(inputs[c].iter()) {
                *bin = Complex32::new(*s, 0.0);
            }

            forward.process_with_scratch(frame, scratch);

            let slot = *head * fft_len;
            delay_lines[c][slot..slot + fft_len].copy_from_slice(frame);
            previous[c].copy_from_slice(&inputs[c]);
        }

        for out in 0..*channels {
            accumulator.fill(zero);

            for (tap, filter) in taps.iter().filter(|(tap, _)| tap.output == out) {
                let delay_line = &delay_lines[tap.input];
                let filter = &filters[*filter];

                for (p, segment) in filter.chunks_exact(fft_len).enumerate() {
                    let slot = ((*head + p) % *n_partitions) * fft_len;
                    let spectrum = &delay_line[slot..slot + fft_len];

                    for ((acc, x), h) in accumulator.iter_mut().zip(spectrum).zip(segment) {
                        *acc += x * h;
                    }
                }
            }

            inverse.process_with_scratch(accumulator, scratch);

            for (o, y) in outputs[out]
                .iter_mut()
                .zip(accumulator[*partition_size..].iter())
            {
                *o = y.re;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    use super::*;
    use crate::window::test::assert_eq_delta;

    fn direct_convolution(signal: &[f32], filter: &[f32]) -> Vec<f32> {
        let mut result = vec![0.0f32; signal.len() + filter.len() - 1];
        for (i, x) in signal.iter().enumerate() {
            for (j, h) in filter.iter().enumerate() {
                result[i + j] += x * h;
            }
        }
        result
    }

    fn run_blocks<C: Convolver>(convolver: &mut C, signal: &[f32], block: usize) -> Vec<f32> {
        let mut result = Vec::new();
        for chunk in signal.chunks(block) {
            let input = convolver.input_mut(0);
            input.fill(0.0);
            input[..chunk.len()].copy_from_slice(chunk);

            convolver.process().unwrap();
            result.extend_from_slice(&convolver.output(0)[..chunk.len()]);
        }
        result
    }

    #[test]
    fn matches_direct_convolution() {
        let mut rng = SmallRng::seed_from_u64(7);
        let signal: Vec<f32> = (0..1_000).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let filter: Vec<f32> = (0..300).map(|_| rng.gen_range(-1.0..1.0)).collect();

        let expected = direct_convolution(&signal, &filter);

        let mut padded = signal.clone();
        padded.resize(expected.len(), 0.0);

        let mut convolver = PartitionedConvolver::new();
        convolver.configure(1, filter.len(), 64).unwrap();
        convolver.load_filter(Tap::diagonal(0), &filter).unwrap();
        convolver.start().unwrap();

        let result = run_blocks(&mut convolver, &padded, 64);

        assert_eq!(result.len(), expected.len());
        for (r, e) in result.iter().zip(expected.iter()) {
            assert_eq_delta!(r, e, 1e-3);
        }
    }

    #[test]
    fn linked_taps_share_the_filter() {
        let filter = [0.5f32, 0.25, 0.125];

        let mut convolver = PartitionedConvolver::new();
        convolver.configure(2, filter.len(), 16).unwrap();
        convolver.load_filter(Tap::diagonal(0), &filter).unwrap();
        convolver
            .link_tap(Tap::diagonal(0), Tap::diagonal(1))
            .unwrap();
        convolver.start().unwrap();

        convolver.input_mut(0)[0] = 1.0;
        convolver.input_mut(1)[1] = -2.0;
        convolver.process().unwrap();

        let left = convolver.output(0);
        let right = convolver.output(1);
        for (n, h) in filter.iter().enumerate() {
            assert_eq_delta!(left[n], h, 1e-6);
            assert_eq_delta!(right[n + 1], -2.0 * *h, 1e-6);
        }
        assert_eq_delta!(left[filter.len()], 0.0, 1e-6);
    }

    #[test]
    fn rejects_invalid_configuration() {
        let mut convolver = PartitionedConvolver::new();

        assert!(matches!(
            convolver.configure(0, 128, 64),
            Err(ConvolverError::InvalidConfiguration { .. })
        ));
        assert!(matches!(
            convolver.configure(1, 128, 100),
            Err(ConvolverError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn protocol_order_is_enforced() {
        let mut convolver = PartitionedConvolver::new();

        assert_eq!(
            convolver.load_filter(Tap::diagonal(0), &[1.0]),
            Err(ConvolverError::NotConfigured)
        );
        assert_eq!(convolver.process(), Err(ConvolverError::NotStarted));

        convolver.configure(2, 8, 16).unwrap();
        assert_eq!(
            convolver.link_tap(Tap::diagonal(0), Tap::diagonal(1)),
            Err(ConvolverError::MissingFilter(Tap::diagonal(0)))
        );
        assert_eq!(
            convolver.load_filter(Tap::diagonal(0), &[1.0; 9]),
            Err(ConvolverError::FilterTooLong { len: 9, max: 8 })
        );
        assert_eq!(
            convolver.load_filter(Tap::new(0, 2), &[1.0]),
            Err(ConvolverError::ChannelOutOfRange(2))
        );

        convolver.load_filter(Tap::diagonal(0), &[1.0]).unwrap();
        convolver.start().unwrap();
        assert_eq!(
            convolver.load_filter(Tap::diagonal(1), &[1.0]),
            Err(ConvolverError::AlreadyStarted)
        );
        assert_eq!(convolver.process(), Ok(()));
    }
}
