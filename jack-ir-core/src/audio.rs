use std::{
    collections::TryReserveError,
    sync::{
        mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender},
        Arc,
    },
    thread,
    time::Duration,
};

use thiserror::Error;

use crate::capture::{AbortCause, Capture, CaptureScheduler, SessionState, Status};

const EVENT_QUEUE_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum AudioBackendError {
    #[error("audio backend failed: {0}")]
    Jack(#[from] jack::Error),
    #[error("could not connect '{from}' to '{to}': {source}")]
    Connect {
        from: String,
        to: String,
        source: jack::Error,
    },
    #[error("capture aborted: {0}")]
    Aborted(AbortCause),
    #[error("capture did not complete")]
    Incomplete,
}

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("could not allocate capture buffers: {0}")]
    Allocation(#[from] TryReserveError),
    #[error("could not register ports: {0}")]
    Ports(jack::Error),
}

/// Notifications forwarded from the audio server to the control thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Xrun,
    Shutdown,
    LatencyChanged(u32),
}

struct Processor {
    scheduler: CaptureScheduler,
    inputs: Vec<jack::Port<jack::AudioIn>>,
    outputs: Vec<jack::Port<jack::AudioOut>>,
}

impl jack::ProcessHandler for Processor {
    fn process(&mut self, _: &jack::Client, process_scope: &jack::ProcessScope) -> jack::Control {
        let n_frames = process_scope.n_frames() as usize;

        self.scheduler.process(
            n_frames,
            self.inputs.iter().map(|port| port.as_slice(process_scope)),
            self.outputs
                .iter_mut()
                .map(|port| port.as_mut_slice(process_scope)),
        );

        jack::Control::Continue
    }
}

struct Notifications {
    state: Arc<SessionState>,
    events: SyncSender<Event>,
    capture_ports: Vec<String>,
    playback_ports: Vec<String>,
}

impl jack::NotificationHandler for Notifications {
    unsafe fn shutdown(&mut self, _: jack::ClientStatus, _: &str) {
        self.state.abort(AbortCause::Shutdown);
        let _ = self.events.try_send(Event::Shutdown);
    }

    fn xrun(&mut self, _: &jack::Client) -> jack::Control {
        if self.state.abort_running(AbortCause::Xrun) {
            let _ = self.events.try_send(Event::Xrun);
        } else if !self.state.status().is_terminal() {
            tracing::debug!("x-run before the capture started, ignored");
        }

        jack::Control::Continue
    }

    fn graph_reorder(&mut self, client: &jack::Client) -> jack::Control {
        let latency = round_trip_latency(client, &self.capture_ports, &self.playback_ports);
        self.state.set_round_trip_latency(latency);
        let _ = self.events.try_send(Event::LatencyChanged(latency));

        jack::Control::Continue
    }
}

/// Sum of the worst capture latency of our input ports and the worst
/// playback latency of our output ports.
fn round_trip_latency(client: &jack::Client, capture_ports: &[String], playback_ports: &[String]) -> u32 {
    let max_latency = |ports: &[String], capture: bool| {
        ports
            .iter()
            .filter_map(|name| client.port_by_name(name))
            .map(|port| {
                let mode = if capture {
                    jack::LatencyType::Capture
                } else {
                    jack::LatencyType::Playback
                };
                let (_min, max) = port.get_latency_range(mode);
                max
            })
            .max()
            .unwrap_or(0)
    };

    max_latency(capture_ports, true) + max_latency(playback_ports, false)
}

/// Inactive connection to the audio server.
pub struct AudioEngine {
    client: jack::Client,
}

impl AudioEngine {
    pub fn new(name: &str) -> Result<Self, AudioBackendError> {
        let (client, _status) = jack::Client::new(name, jack::ClientOptions::NO_START_SERVER)?;

        tracing::debug!("opened audio server client '{}'", client.name());

        Ok(Self { client })
    }

    pub fn sample_rate(&self) -> u32 {
        self.client.sample_rate() as u32
    }

    /// Registers the ports the scheduler needs and activates the client.
    pub fn activate(self, scheduler: CaptureScheduler) -> Result<Session, crate::Error> {
        let layout = scheduler.layout();

        let outputs = (1..=layout.playback_ports())
            .map(|n| {
                self.client
                    .register_port(&format!("sweep_{n}"), jack::AudioOut::default())
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(ResourceError::Ports)?;

        let inputs = (1..=layout.capture_ports())
            .map(|n| {
                self.client
                    .register_port(&format!("input_{n}"), jack::AudioIn::default())
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(ResourceError::Ports)?;

        let capture_ports = inputs
            .iter()
            .map(|port| port.name())
            .collect::<Result<Vec<_>, _>>()
            .map_err(AudioBackendError::from)?;
        let playback_ports = outputs
            .iter()
            .map(|port| port.name())
            .collect::<Result<Vec<_>, _>>()
            .map_err(AudioBackendError::from)?;

        let state = scheduler.state();
        let (events, receiver) = sync_channel(EVENT_QUEUE_SIZE);

        let notifications = Notifications {
            state: Arc::clone(&state),
            events,
            capture_ports: capture_ports.clone(),
            playback_ports: playback_ports.clone(),
        };
        let processor = Processor {
            scheduler,
            inputs,
            outputs,
        };

        let client = self
            .client
            .activate_async(notifications, processor)
            .map_err(AudioBackendError::from)?;

        Ok(Session {
            client,
            state,
            events: receiver,
            capture_ports,
            playback_ports,
        })
    }
}

/// An active capture session.
///
/// Dropping it closes the connection to the audio server.
pub struct Session {
    client: jack::AsyncClient<Notifications, Processor>,
    state: Arc<SessionState>,
    events: Receiver<Event>,
    capture_ports: Vec<String>,
    playback_ports: Vec<String>,
}

impl Session {
    pub fn state(&self) -> Arc<SessionState> {
        Arc::clone(&self.state)
    }

    /// Connects the capture sources to our inputs and our outputs to the
    /// playback destinations, then measures the round-trip latency.
    pub fn connect<S: AsRef<str>>(
        &self,
        capture: &[S],
        playback: &[S],
    ) -> Result<u32, AudioBackendError> {
        let client = self.client.as_client();

        let connections = capture
            .iter()
            .map(AsRef::as_ref)
            .zip(self.capture_ports.iter().map(String::as_str))
            .chain(
                self.playback_ports
                    .iter()
                    .map(String::as_str)
                    .zip(playback.iter().map(AsRef::as_ref)),
            );

        for (from, to) in connections {
            client
                .connect_ports_by_name(from, to)
                .map_err(|source| AudioBackendError::Connect {
                    from: from.to_string(),
                    to: to.to_string(),
                    source,
                })?;

            tracing::debug!("connected '{from}' -> '{to}'");
        }

        let latency = round_trip_latency(client, &self.capture_ports, &self.playback_ports);
        self.state.set_round_trip_latency(latency);

        Ok(latency)
    }

    /// Waits for the connections to settle, then starts playback and recording.
    ///
    /// Returns `false` if the session was aborted in the meantime.
    pub fn start(&self, warm_up: Duration) -> bool {
        thread::sleep(warm_up);

        self.state.prime() && self.state.start()
    }

    /// Blocks until the session reached a terminal status.
    ///
    /// `on_tick` is called every `interval` while the session is running.
    pub fn wait(&self, interval: Duration, mut on_tick: impl FnMut(&SessionState)) -> Status {
        loop {
            let status = self.state.status();
            if status.is_terminal() {
                return status;
            }

            match self.events.recv_timeout(interval) {
                Ok(Event::Xrun) => tracing::warn!("x-run detected"),
                Ok(Event::Shutdown) => tracing::error!("audio server shut down"),
                Ok(Event::LatencyChanged(latency)) => {
                    tracing::debug!("round-trip latency changed to {latency} samples")
                }
                Err(RecvTimeoutError::Timeout) => on_tick(&self.state),
                Err(RecvTimeoutError::Disconnected) => {
                    self.state.abort(AbortCause::Unknown);
                }
            }
        }
    }

    /// Deactivates the client and hands out the capture of a completed session.
    pub fn finish(self) -> Result<Capture, AudioBackendError> {
        let (_client, _notifications, processor) = self.client.deactivate()?;

        match self.state.status() {
            Status::Completing => processor
                .scheduler
                .into_capture()
                .ok_or(AudioBackendError::Incomplete),
            Status::Aborted => Err(AudioBackendError::Aborted(
                self.state.abort_cause().unwrap_or(AbortCause::Unknown),
            )),
            _ => Err(AudioBackendError::Incomplete),
        }
    }
}
