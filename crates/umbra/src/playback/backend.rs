//! Network playback backend
//!
//! Opens the stream on a short-lived connect thread so the session loop never
//! blocks on the network, then hands the body to the renderer. Each connection
//! owns a `CancellationToken`; teardown cancels it, which aborts a pending
//! request or closes an open body.

use std::thread;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audio::{OutputKind, Renderer, RendererHandle};
use crate::config::playback::{AUDIO_CHANNEL_BOUND, READ_CHUNK_SIZE};
use crate::error::{RadioError, Result};
use crate::routing::{ClientPurpose, EffectiveRoute, StreamTarget};
use crate::stream::{
    open_stream, runtime, spawn_pump, HttpBody, IcyStreamReader, PumpOptions, StreamHeaders,
    TitleCallback, TrafficMeter,
};

use super::session::{ConnectionEvent, PlaybackBackend};
use super::ConnectionNotifier;

/// `PlaybackBackend` over HTTP(S), optionally proxied
pub struct NetworkBackend {
    renderer: Renderer,
    notify: ConnectionNotifier,
    meter: TrafficMeter,
    cancel: Option<CancellationToken>,
}

impl NetworkBackend {
    pub fn new(output: OutputKind, notify: ConnectionNotifier) -> Result<Self> {
        let renderer = Renderer::spawn(output, notify.clone())?;
        Ok(Self {
            renderer,
            notify,
            meter: TrafficMeter::new(),
            cancel: None,
        })
    }

    /// Count received stream bytes on `meter`
    pub fn with_meter(mut self, meter: TrafficMeter) -> Self {
        self.meter = meter;
        self
    }
}

impl PlaybackBackend for NetworkBackend {
    fn open(&mut self, generation: u64, target: &StreamTarget, route: &EffectiveRoute) -> Result<()> {
        if let EffectiveRoute::Blocked(reason) = route {
            return Err(RadioError::RouteBlocked(*reason));
        }
        runtime()?;
        self.renderer.prepare(generation);

        let cancel = CancellationToken::new();
        let request = ConnectRequest {
            generation,
            url: target.url.clone(),
            route: route.clone(),
            cancel: cancel.clone(),
            meter: self.meter.clone(),
            notify: self.notify.clone(),
            renderer: self.renderer.handle(),
        };
        thread::Builder::new()
            .name("playback-connect".into())
            .spawn(move || request.run())?;

        self.cancel = Some(cancel);
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.renderer.stop();
    }

    fn pause(&mut self) {
        self.renderer.pause();
    }

    fn resume(&mut self) {
        self.renderer.resume();
    }

    fn set_volume(&mut self, volume: f32) {
        self.renderer.set_volume(volume);
    }
}

impl Drop for NetworkBackend {
    fn drop(&mut self) {
        self.teardown();
    }
}

struct ConnectRequest {
    generation: u64,
    url: String,
    route: EffectiveRoute,
    cancel: CancellationToken,
    meter: TrafficMeter,
    notify: ConnectionNotifier,
    renderer: RendererHandle,
}

impl ConnectRequest {
    fn fail(&self, reason: String) {
        if !self.cancel.is_cancelled() {
            (self.notify)(self.generation, ConnectionEvent::Failed(reason));
        }
    }

    fn run(self) {
        let generation = self.generation;
        debug!(generation, url = %self.url, "Connecting");

        let response = match open_stream(
            &self.route,
            ClientPurpose::Playback,
            &self.url,
            &[("Icy-MetaData", "1")],
            &self.cancel,
        ) {
            Ok(Some(r)) => r,
            Ok(None) => {
                debug!(generation, "Connect abandoned");
                return;
            }
            Err(e) => {
                warn!(generation, error = %e, "Stream request failed");
                self.fail(e.to_string());
                return;
            }
        };
        if !response.status().is_success() {
            self.fail(format!("HTTP {}", response.status()));
            return;
        }

        let headers = StreamHeaders::from_headers(response.headers());
        let body = HttpBody::new(response, self.cancel.clone(), self.meter.clone());
        let notify = self.notify.clone();
        let on_title: TitleCallback =
            Box::new(move |title| notify(generation, ConnectionEvent::Metadata(title)));
        let options = PumpOptions {
            chunk_size: READ_CHUNK_SIZE,
            metaint: headers.metaint,
            channel_bound: AUDIO_CHANNEL_BOUND,
        };
        let spawned = spawn_pump(
            "playback-pump",
            body,
            options,
            Some(on_title),
            self.cancel.clone(),
        );
        let (rx, pump) = match spawned {
            Ok(p) => p,
            Err(e) => {
                self.fail(format!("Failed to start stream reader: {e}"));
                return;
            }
        };
        let reader = IcyStreamReader::new(rx, pump);

        if self.cancel.is_cancelled() {
            return;
        }
        (self.notify)(generation, ConnectionEvent::Opened(headers));
        self.renderer.start(generation, reader);
    }
}
