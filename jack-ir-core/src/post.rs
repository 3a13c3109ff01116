//! Calibration of raw impulse response estimates.

use crate::{from_dbfs, window::Window};

/// Raw captures peaking at or above this level are considered clipped.
pub const CLIP_LEVEL: f32 = 0.98;

const NORMALIZE_TARGET_DBFS: f32 = -3.0;
const SIGNAL_DBFS: f32 = -20.0;
const SILENCE_DBFS: f32 = -60.0;

/// Samples the measured round-trip latency is reduced by, to tolerate
/// inaccurate port latencies and pre-ringing of the band-limited impulse.
const LATENCY_GUARD: u32 = 4;

pub fn digital_peak<B: AsRef<[f32]>>(buffers: &[B]) -> f32 {
    buffers
        .iter()
        .flat_map(|b| b.as_ref().iter())
        .fold(0.0f32, |peak, s| peak.max(s.abs()))
}

/// Raises quiet responses to -3 dBFS, with the same gain on every channel.
///
/// Returns the applied gain, `1.0` if the peak is zero or already at or above
/// the target.
pub fn normalize_peak<B: AsMut<[f32]> + AsRef<[f32]>>(buffers: &mut [B]) -> f32 {
    let peak = digital_peak(buffers);
    let target = from_dbfs(NORMALIZE_TARGET_DBFS);

    if peak == 0.0 || peak >= target {
        return 1.0;
    }

    let gain = target / peak;
    for s in buffers.iter_mut().flat_map(|b| b.as_mut().iter_mut()) {
        *s *= gain;
    }

    gain
}

/// Cuts the response after its decay into silence.
///
/// Silence detection starts once any channel exceeded -20 dBFS. A frame is
/// silent if no channel exceeds -60 dBFS. After 50ms of continuous silence
/// that run is faded out linearly and everything after it is zeroed.
/// Without such a run the last 50ms of the buffers are faded.
///
/// Returns the number of frames that remain.
pub fn trim_end<B: AsMut<[f32]> + AsRef<[f32]>>(buffers: &mut [B], sample_rate: u32) -> usize {
    let signal_level = from_dbfs(SIGNAL_DBFS);
    let silence_level = from_dbfs(SILENCE_DBFS);
    let fade_len = (sample_rate / 20) as usize;

    let n_frames = buffers
        .iter()
        .map(|b| b.as_ref().len())
        .min()
        .unwrap_or(0);

    let mut armed = false;
    let mut silent_frames = 0;
    let mut cut = n_frames;

    for n in 0..n_frames {
        let mut silent = armed;
        for buffer in buffers.iter() {
            let s = buffer.as_ref()[n].abs();
            if s > signal_level {
                armed = true;
            }
            if s > silence_level {
                silent = false;
            }
        }

        if !silent {
            silent_frames = 0;
            continue;
        }

        silent_frames += 1;
        if silent_frames >= fade_len {
            cut = n + 1;
            break;
        }
    }

    let fade_start = cut.saturating_sub(fade_len);
    for buffer in buffers.iter_mut() {
        let buffer = buffer.as_mut();

        for (n, s) in buffer[fade_start..cut].iter_mut().enumerate() {
            *s *= Window::Linear.rising(cut - fade_start - n, fade_len) as f32;
        }

        buffer[cut..].fill(0.0);
    }

    cut
}

/// Offset applied on top of the sweep length when extracting the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyCompensation {
    manual: Option<u32>,
}

impl LatencyCompensation {
    pub fn measured() -> Self {
        Self { manual: None }
    }

    /// A latency of zero falls back to the measured round-trip latency.
    pub fn manual(latency: u32) -> Self {
        Self {
            manual: (latency > 0).then_some(latency),
        }
    }

    pub fn is_manual(&self) -> bool {
        self.manual.is_some()
    }

    pub fn effective(&self, round_trip_latency: u32) -> usize {
        let latency = match self.manual {
            Some(latency) => latency,
            None => round_trip_latency.saturating_sub(LATENCY_GUARD),
        };

        latency as usize
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::window::test::assert_eq_delta;

    #[test]
    fn peak_over_all_channels() {
        let buffers = vec![vec![0.1f32, -0.2, 0.05], vec![0.0, 0.4, -0.7]];

        assert_eq!(digital_peak(&buffers), 0.7);
        assert_eq!(digital_peak::<Vec<f32>>(&[]), 0.0);
    }

    #[test]
    fn normalize_leaves_loud_response_unchanged() {
        let mut buffers = vec![vec![0.9f32, -0.2], vec![0.1, 0.0]];
        let original = buffers.clone();

        let gain = normalize_peak(&mut buffers);

        assert_eq!(gain, 1.0);
        assert_eq!(buffers, original);
    }

    #[test]
    fn normalize_leaves_silence_unchanged() {
        let mut buffers = vec![vec![0.0f32; 8]];

        assert_eq!(normalize_peak(&mut buffers), 1.0);
        assert!(buffers[0].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn normalize_raises_quiet_response_to_target() {
        let mut buffers = vec![vec![0.1f32, -0.05], vec![0.02, -0.2]];

        let gain = normalize_peak(&mut buffers);
        let target = from_dbfs(-3.0);

        assert_eq_delta!(gain, target / 0.2, 1e-5);
        assert_eq_delta!(digital_peak(&buffers), target, 1e-6);
        // channel balance is kept
        assert_eq_delta!(buffers[0][0] / buffers[1][1], 0.1 / -0.2, 1e-6);
    }

    #[test]
    fn trim_after_silent_tail() {
        let sample_rate = 1_000;
        let fade_len = 50;
        let n_frames = 1_000;
        let silent_from = 400;

        // 40% signal, 60% silence just below -60 dBFS
        let mut buffer = vec![1e-4f32; n_frames];
        buffer[..silent_from].fill(0.5);
        let mut buffers = vec![buffer];

        let trimmed = trim_end(&mut buffers, sample_rate);

        assert_eq!(trimmed, silent_from + fade_len);

        let buffer = &buffers[0];
        assert!(buffer[..silent_from].iter().all(|s| *s == 0.5));

        let fade = &buffer[silent_from..trimmed];
        assert!(fade.windows(2).all(|w| w[0] >= w[1]));
        assert!(fade[0] <= 1e-4);
        assert!(*fade.last().unwrap() < 1e-5);

        assert!(buffer[trimmed..].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn trim_waits_for_signal() {
        let sample_rate = 1_000;
        let mut buffer = vec![0.0f32; 1_000];
        // leading silence and a quiet bump do not arm the detector
        buffer[100] = 0.05;
        buffer[500] = 0.8;
        let mut buffers = vec![buffer];

        let trimmed = trim_end(&mut buffers, sample_rate);

        assert_eq!(trimmed, 551);
        assert_eq!(buffers[0][100], 0.05);
        assert_eq!(buffers[0][500], 0.8);
    }

    #[test]
    fn trim_considers_all_channels() {
        let sample_rate = 1_000;
        let mut left = vec![0.0f32; 1_000];
        left[10] = 0.9;
        let mut right = vec![0.0f32; 1_000];
        right[..300].fill(0.01);
        let mut buffers = vec![left, right];

        let trimmed = trim_end(&mut buffers, sample_rate);

        assert_eq!(trimmed, 350);
    }

    #[test]
    fn trim_without_silence_fades_the_end() {
        let sample_rate = 1_000;
        let mut buffers = vec![vec![0.5f32; 200]];

        let trimmed = trim_end(&mut buffers, sample_rate);

        assert_eq!(trimmed, 200);
        assert_eq!(buffers[0][149], 0.5);
        assert!(buffers[0][150..].windows(2).all(|w| w[0] >= w[1]));
        assert!(buffers[0][199] < 0.5 / 40.0);
    }

    #[test]
    fn latency_from_measurement() {
        let latency = LatencyCompensation::measured();

        assert_eq!(latency.effective(10), 6);
        assert_eq!(latency.effective(4), 0);
        assert_eq!(latency.effective(2), 0);
    }

    #[test]
    fn manual_latency_wins() {
        assert_eq!(LatencyCompensation::manual(3).effective(10), 3);
        assert_eq!(LatencyCompensation::manual(3).effective(0), 3);
        assert_eq!(LatencyCompensation::manual(0).effective(10), 6);
    }
}
