use std::{f64::consts::PI, path::Path};

use crate::{
    wav,
    window::{Envelope, Window},
    WriteError,
};

pub const AMPLITUDE: f64 = 0.5;

const PRE_ROLL: f64 = 0.1;
const FADE_OUT: f64 = 0.03;

/// Exponential sine sweep and its matched inverse filter.
///
/// Both signals are computed in a single pass over the same time base, so
/// correlating `forward` with `inverse` yields a band-limited impulse over
/// the swept range.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepSignal {
    forward: Box<[f32]>,
    inverse: Box<[f32]>,
}

impl SweepSignal {
    pub fn generate(
        start_frequency: f32,
        end_frequency: f32,
        duration_secs: f32,
        sample_rate: u32,
    ) -> Self {
        let rate = sample_rate as f64;

        let n_pre = (PRE_ROLL * rate).round() as usize;
        let n_sweep = (duration_secs as f64 * rate).round() as usize;
        let n_end = (FADE_OUT * rate).round() as usize;
        let len = n_pre + n_sweep + n_end;

        let mut forward = vec![0.0f32; len].into_boxed_slice();
        let mut inverse = vec![0.0f32; len].into_boxed_slice();

        let envelope = Envelope::new(Window::QuarterSine, n_pre, Window::QuarterSine, n_end, len);

        let a = (end_frequency as f64 / start_frequency as f64).ln() / n_sweep as f64;
        let b = start_frequency as f64 / (a * rate);
        let r = 4.0 * a * a / AMPLITUDE;

        for i in 0..len {
            let j = len - i - 1;

            // local sweep rate, the phase (in cycles) is its offset integral
            let d = b * f64::exp(a * (i as f64 - n_pre as f64));
            let p = d - b;
            let x = envelope.gain(i) * f64::sin(2.0 * PI * (p - p.floor()));

            forward[i] = (x * AMPLITUDE) as f32;
            inverse[j] = (x * d * r) as f32;
        }

        Self { forward, inverse }
    }

    pub fn forward(&self) -> &[f32] {
        &self.forward
    }

    pub fn inverse(&self) -> &[f32] {
        &self.inverse
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Writes forward sweep and inverse filter as a two channel file.
    pub fn write_to_file(&self, path: impl AsRef<Path>, sample_rate: u32) -> Result<(), WriteError> {
        wav::write_channels(path, sample_rate, &[self.forward(), self.inverse()])
    }
}

#[cfg(test)]
mod test {
    use super::{SweepSignal, AMPLITUDE};

    #[test]
    fn generation_is_deterministic() {
        let a = SweepSignal::generate(20.0, 20_000.0, 1.0, 48_000);
        let b = SweepSignal::generate(20.0, 20_000.0, 1.0, 48_000);

        let bits = |s: &[f32]| s.iter().map(|v| v.to_bits()).collect::<Vec<_>>();

        assert_eq!(bits(a.forward()), bits(b.forward()));
        assert_eq!(bits(a.inverse()), bits(b.inverse()));
    }

    #[test]
    fn length_formula() {
        for rate in [8_000u32, 44_100, 48_000, 88_200, 96_000] {
            for duration in [0.5f32, 1.0, 2.25, 10.0] {
                let sweep = SweepSignal::generate(20.0, 3_000.0, duration, rate);
                let r = rate as f64;
                let expected = (0.1 * r).round() as usize
                    + (duration as f64 * r).round() as usize
                    + (0.03 * r).round() as usize;

                assert_eq!(sweep.len(), expected, "rate {rate}, duration {duration}");
                assert_eq!(sweep.inverse().len(), expected);
            }
        }
    }

    #[test]
    fn edges_are_faded() {
        let sweep = SweepSignal::generate(20.0, 20_000.0, 1.0, 44_100);

        assert_eq!(sweep.forward()[0], 0.0);
        assert_eq!(*sweep.forward().last().unwrap(), 0.0);
        assert_eq!(sweep.inverse()[0], 0.0);
        assert_eq!(*sweep.inverse().last().unwrap(), 0.0);
    }

    #[test]
    fn amplitude_is_bounded() {
        let sweep = SweepSignal::generate(20.0, 20_000.0, 1.0, 44_100);
        let peak = sweep.forward().iter().fold(0.0f32, |m, s| m.max(s.abs()));

        assert!(peak <= AMPLITUDE as f32);
        assert!(peak > 0.49);
    }

    #[test]
    fn inverse_is_weighted_towards_high_frequencies() {
        // the inverse is time reversed, its start holds the end of the sweep
        let sweep = SweepSignal::generate(20.0, 20_000.0, 1.0, 44_100);
        let energy = |s: &[f32]| s.iter().map(|v| v * v).sum::<f32>();

        let quarter = sweep.len() / 4;
        let head = energy(&sweep.inverse()[..quarter]);
        let tail = energy(&sweep.inverse()[sweep.len() - quarter..]);

        assert!(head > tail);
    }
}
