use crate::convolver::{Convolver, ConvolverError, PartitionedConvolver, Tap};

pub const DEFAULT_PARTITION: usize = 8192;

/// Turns captured sweep responses into impulse responses by convolving every
/// channel with the inverse sweep.
pub struct Deconvolver<C = PartitionedConvolver> {
    convolver: C,
    partition_size: usize,
}

impl Deconvolver<PartitionedConvolver> {
    pub fn new() -> Self {
        Self::with_convolver(PartitionedConvolver::new())
    }
}

impl Default for Deconvolver<PartitionedConvolver> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Convolver> Deconvolver<C> {
    pub fn with_convolver(convolver: C) -> Self {
        Self {
            convolver,
            partition_size: DEFAULT_PARTITION,
        }
    }

    pub fn with_partition_size(mut self, partition_size: usize) -> Self {
        self.partition_size = partition_size;
        self
    }

    /// Replaces the content of every channel with its convolution with `inverse`.
    ///
    /// The channels need to be long enough to hold the tail of the
    /// convolution, everything past their end is dropped.
    pub fn run<B: AsMut<[f32]>>(
        mut self,
        inverse: &[f32],
        channels: &mut [B],
    ) -> Result<(), ConvolverError> {
        let n_channels = channels.len();
        let convolver = &mut self.convolver;

        convolver.configure(n_channels, inverse.len(), self.partition_size)?;
        convolver.load_filter(Tap::diagonal(0), inverse)?;
        for c in 1..n_channels {
            convolver.link_tap(Tap::diagonal(0), Tap::diagonal(c))?;
        }
        convolver.start()?;

        let n_frames = channels
            .iter_mut()
            .map(|c| c.as_mut().len())
            .min()
            .unwrap_or(0);

        tracing::debug!(
            "deconvolving {n_channels} channel(s), {n_frames} frames, partition size {}",
            self.partition_size
        );

        let mut offset = 0;
        while offset < n_frames {
            let len = self.partition_size.min(n_frames - offset);

            for (c, channel) in channels.iter_mut().enumerate() {
                let input = convolver.input_mut(c);
                input.fill(0.0);
                input[..len].copy_from_slice(&channel.as_mut()[offset..offset + len]);
            }

            convolver.process()?;

            for (c, channel) in channels.iter_mut().enumerate() {
                channel.as_mut()[offset..offset + len].copy_from_slice(&convolver.output(c)[..len]);
            }

            offset += len;
        }

        Ok(())
    }
}
