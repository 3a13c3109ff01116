use std::{
    collections::TryReserveError,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{
    config::{ChannelMap, Layout},
    sweep::SweepSignal,
    ResourceError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Idle = 0,
    Priming = 1,
    Run = 2,
    Completing = 3,
    Aborted = 4,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Status::Idle,
            1 => Status::Priming,
            2 => Status::Run,
            3 => Status::Completing,
            _ => Status::Aborted,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completing | Status::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AbortCause {
    Unknown = 0,
    Xrun = 1,
    Shutdown = 2,
    Interrupted = 3,
}

impl AbortCause {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AbortCause::Xrun,
            2 => AbortCause::Shutdown,
            3 => AbortCause::Interrupted,
            _ => AbortCause::Unknown,
        }
    }
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                AbortCause::Unknown => "unknown reason",
                AbortCause::Xrun => "x-run",
                AbortCause::Shutdown => "audio server shutdown",
                AbortCause::Interrupted => "interrupted",
            }
        )
    }
}

/// State of a capture session shared between the real-time thread, the
/// notification thread, the signal handler and the control thread.
///
/// Status changes are compare-and-swap transitions:
/// `Idle -> Priming -> Run -> Completing`, and from every non terminal
/// status to `Aborted`. `Completing` and `Aborted` are terminal.
#[derive(Debug)]
pub struct SessionState {
    status: AtomicU8,
    abort_cause: AtomicU8,
    processed: AtomicUsize,
    playing: AtomicBool,
    round_trip_latency: AtomicU32,
    total_frames: usize,
}

impl SessionState {
    pub fn new(total_frames: usize) -> Self {
        Self {
            status: AtomicU8::new(Status::Idle as u8),
            abort_cause: AtomicU8::new(AbortCause::Unknown as u8),
            processed: AtomicUsize::new(0),
            playing: AtomicBool::new(false),
            round_trip_latency: AtomicU32::new(0),
            total_frames,
        }
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    fn transition(&self, from: Status, to: Status) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn prime(&self) -> bool {
        self.transition(Status::Idle, Status::Priming)
    }

    pub fn start(&self) -> bool {
        self.transition(Status::Priming, Status::Run)
    }

    pub(crate) fn complete(&self) -> bool {
        self.transition(Status::Run, Status::Completing)
    }

    /// Moves any non terminal session to `Aborted`.
    ///
    /// Returns `false` if the session already ended. The first cause given
    /// is the one that is kept.
    pub fn abort(&self, cause: AbortCause) -> bool {
        let _ = self.abort_cause.compare_exchange(
            AbortCause::Unknown as u8,
            cause as u8,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );

        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if Status::from_u8(current).is_terminal() {
                return false;
            }

            match self.status.compare_exchange_weak(
                current,
                Status::Aborted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Like [`SessionState::abort`], but only a running session is aborted.
    pub fn abort_running(&self, cause: AbortCause) -> bool {
        self.status() == Status::Run && self.abort(cause)
    }

    pub fn abort_cause(&self) -> Option<AbortCause> {
        (self.status() == Status::Aborted)
            .then(|| AbortCause::from_u8(self.abort_cause.load(Ordering::Relaxed)))
    }

    pub fn frames_processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    /// Progress of the session in the range `0.0..=1.0`.
    pub fn progress(&self) -> f32 {
        if self.total_frames == 0 {
            return 1.0;
        }

        (self.frames_processed() as f32 / self.total_frames as f32).min(1.0)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    pub fn round_trip_latency(&self) -> u32 {
        self.round_trip_latency.load(Ordering::Relaxed)
    }

    pub fn set_round_trip_latency(&self, latency: u32) {
        self.round_trip_latency.store(latency, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Sweep on all outputs, all inputs recorded at once.
    SinglePass,
    /// One pass per output, separated by `silence_gap` frames.
    MultiPass { silence_gap: usize },
}

/// Plays the sweep and records the device response, driven block by block
/// from the real-time thread.
///
/// Everything is allocated up front, [`CaptureScheduler::process`] only
/// copies samples and updates atomics.
pub struct CaptureScheduler {
    sweep: Arc<SweepSignal>,
    buffers: Vec<Box<[f32]>>,
    layout: Layout,
    channel_map: ChannelMap,
    policy: Policy,
    record_len: usize,
    cursor: usize,
    pass: usize,
    state: Arc<SessionState>,
}

impl CaptureScheduler {
    pub fn new(
        sweep: Arc<SweepSignal>,
        layout: Layout,
        record_len: usize,
        silence_gap: usize,
    ) -> Result<Self, ResourceError> {
        let channel_map = layout.channel_map();
        let policy = if layout.is_multi_pass() {
            Policy::MultiPass { silence_gap }
        } else {
            Policy::SinglePass
        };

        let buffer_len = sweep.len() + record_len;
        let buffers = (0..channel_map.len())
            .map(|_| allocate(buffer_len))
            .collect::<Result<Vec<_>, _>>()?;

        let passes = channel_map.passes();
        let total_frames = match policy {
            Policy::SinglePass => record_len,
            Policy::MultiPass { silence_gap } => {
                passes * record_len + passes.saturating_sub(1) * silence_gap
            }
        };

        tracing::debug!(
            "capture buffers: {} x {buffer_len} samples, {passes} pass(es)",
            buffers.len()
        );

        Ok(Self {
            sweep,
            buffers,
            layout,
            channel_map,
            policy,
            record_len,
            cursor: 0,
            pass: 0,
            state: Arc::new(SessionState::new(total_frames)),
        })
    }

    pub fn state(&self) -> Arc<SessionState> {
        Arc::clone(&self.state)
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Frames into the current pass.
    ///
    /// Counts on through the silence gap between passes, so it can grow past
    /// the buffer length. Buffers are only written below `record_len`.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn pass_index(&self) -> usize {
        self.pass
    }

    /// Handles one block of `n_frames` frames.
    ///
    /// All outputs are cleared first, samples are only played and recorded
    /// while the session is running.
    pub fn process<'a, I, O>(&mut self, n_frames: usize, inputs: I, outputs: O)
    where
        I: IntoIterator<Item = &'a [f32]>,
        O: IntoIterator<Item = &'a mut [f32]>,
    {
        let running = self.state.status() == Status::Run;
        let sweep = self.sweep.forward();

        let play_len = if running {
            n_frames.min(sweep.len().saturating_sub(self.cursor))
        } else {
            0
        };

        for (port, out) in outputs.into_iter().enumerate() {
            out.fill(0.0);

            if play_len > 0 && self.drives(port) {
                let len = play_len.min(out.len());
                out[..len].copy_from_slice(&sweep[self.cursor..self.cursor + len]);
            }
        }

        if !running {
            return;
        }

        let record = n_frames.min(self.record_len.saturating_sub(self.cursor));
        if record > 0 {
            for (port, input) in inputs.into_iter().enumerate() {
                let Some(channel) = self.channel_of(port) else {
                    continue;
                };

                let len = record.min(input.len());
                self.buffers[channel][self.cursor..self.cursor + len]
                    .copy_from_slice(&input[..len]);
            }
        }

        self.cursor += n_frames;
        self.state.processed.fetch_add(n_frames, Ordering::Relaxed);
        self.state
            .playing
            .store(self.cursor < sweep.len(), Ordering::Relaxed);

        self.advance();
    }

    fn drives(&self, port: usize) -> bool {
        match self.policy {
            Policy::SinglePass => true,
            Policy::MultiPass { .. } => port == self.pass,
        }
    }

    fn channel_of(&self, port: usize) -> Option<usize> {
        self.channel_map
            .iter()
            .position(|slot| slot.port == port && slot.pass == self.pass)
    }

    fn advance(&mut self) {
        let last_pass = self.channel_map.passes().saturating_sub(1);

        let end = match self.policy {
            Policy::MultiPass { silence_gap } if self.pass < last_pass => {
                self.record_len + silence_gap
            }
            _ => self.record_len,
        };

        if self.cursor <= end {
            return;
        }

        if self.pass < last_pass {
            self.pass += 1;
            self.cursor = 0;
        } else {
            self.state.complete();
        }
    }

    /// Hands out the recorded buffers, only for a completed session.
    pub fn into_capture(self) -> Option<Capture> {
        (self.state.status() == Status::Completing).then(|| Capture {
            buffers: self.buffers,
            round_trip_latency: self.state.round_trip_latency(),
        })
    }
}

fn allocate(len: usize) -> Result<Box<[f32]>, TryReserveError> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len)?;
    buffer.resize(len, 0.0);

    Ok(buffer.into_boxed_slice())
}

/// Recorded responses of a completed session, one buffer per IR channel.
#[derive(Debug, Clone)]
pub struct Capture {
    buffers: Vec<Box<[f32]>>,
    round_trip_latency: u32,
}

impl Capture {
    pub fn new(buffers: Vec<Box<[f32]>>, round_trip_latency: u32) -> Self {
        Self {
            buffers,
            round_trip_latency,
        }
    }

    pub fn channels(&self) -> &[Box<[f32]>] {
        &self.buffers
    }

    pub fn round_trip_latency(&self) -> u32 {
        self.round_trip_latency
    }

    pub fn into_channels(self) -> Vec<Box<[f32]>> {
        self.buffers
    }
}
