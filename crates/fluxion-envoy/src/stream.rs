// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Live meter stream (`/stream/meter`)
//!
//! The Envoy pushes one `data: {...}` line per second with per-phase readings
//! of the production, total-consumption and net-consumption CTs.

use crate::errors::{EnvoyError, EnvoyResult};
use crate::profile::{PHASES, clamp_negative_production};
use crate::transport::EnvoyTransport;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

const DATA_MARKER: &str = "data:";
const PHASE_IDS: [&str; 3] = ["ph-a", "ph-b", "ph-c"];

/// Upper bound for a single stream session; the loop reconnects afterwards.
const STREAM_SESSION_LIMIT: Duration = Duration::from_secs(3600);
/// No bytes for this long means the connection is dead.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Readings of one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct PhaseReading {
    #[serde(rename = "p", default)]
    pub watts: Option<f64>,
    #[serde(rename = "i", default)]
    pub amps: Option<f64>,
    #[serde(rename = "s", default)]
    pub apparent_power: Option<f64>,
    #[serde(rename = "v", default)]
    pub volts: Option<f64>,
    #[serde(rename = "pf", default)]
    pub power_factor: Option<f64>,
    #[serde(rename = "f", default)]
    pub frequency: Option<f64>,
    #[serde(rename = "q", default)]
    pub reactive_power: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFrame {
    #[serde(default)]
    production: BTreeMap<String, PhaseReading>,
    #[serde(rename = "total-consumption", default)]
    total_consumption: BTreeMap<String, PhaseReading>,
    #[serde(rename = "net-consumption", default)]
    net_consumption: BTreeMap<String, PhaseReading>,
}

/// One decoded stream event, phases keyed `l1`..`l3`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamFrame {
    pub production: BTreeMap<&'static str, PhaseReading>,
    pub consumption: BTreeMap<&'static str, PhaseReading>,
    pub net_consumption: BTreeMap<&'static str, PhaseReading>,
}

fn by_phase(raw: &BTreeMap<String, PhaseReading>) -> BTreeMap<&'static str, PhaseReading> {
    PHASE_IDS
        .iter()
        .zip(PHASES)
        .filter_map(|(id, phase)| raw.get(*id).map(|reading| (phase, *reading)))
        .collect()
}

impl StreamFrame {
    /// Decode a stream line; lines without the `data:` marker give `None`.
    pub fn parse_line(line: &str) -> EnvoyResult<Option<Self>> {
        let Some(payload) = line.trim().strip_prefix(DATA_MARKER) else {
            return Ok(None);
        };
        let raw: RawFrame = serde_json::from_str(payload.trim())?;
        Ok(Some(Self {
            production: by_phase(&raw.production),
            consumption: by_phase(&raw.total_consumption),
            net_consumption: by_phase(&raw.net_consumption),
        }))
    }

    /// Per-phase metric values carried by this frame.
    pub fn metrics(&self, clamp_production: bool) -> BTreeMap<String, Value> {
        let mut values = BTreeMap::new();
        for (phase, reading) in &self.production {
            if let Some(watts) = reading.watts {
                let clamped = clamp_negative_production(json!(watts), clamp_production);
                values.insert(format!("production_{phase}"), clamped);
            }
            put(&mut values, format!("voltage_{phase}"), reading.volts);
            put(&mut values, format!("ampere_{phase}"), reading.amps);
            put(&mut values, format!("apparent_power_{phase}"), reading.apparent_power);
            put(&mut values, format!("power_factor_{phase}"), reading.power_factor);
            put(&mut values, format!("reactive_power_{phase}"), reading.reactive_power);
            put(&mut values, format!("frequency_{phase}"), reading.frequency);
        }
        for (phase, reading) in &self.consumption {
            put(&mut values, format!("consumption_{phase}"), reading.watts);
        }
        for (phase, reading) in &self.net_consumption {
            put(&mut values, format!("net_consumption_{phase}"), reading.watts);
        }
        values
    }
}

fn put(values: &mut BTreeMap<String, Value>, name: String, value: Option<f64>) {
    if let Some(v) = value {
        values.insert(name, json!(v));
    }
}

/// How a stream session ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Dropped connection or server error; try again later.
    Retry,
    /// The Envoy refused the stream (401/404); reconnecting is pointless.
    Stop,
}

struct ReceivingGuard<'a>(&'a AtomicBool);

impl<'a> ReceivingGuard<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ReceivingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One connection attempt at a time against the meter stream.
#[derive(Debug, Clone)]
pub struct MeterStream {
    transport: EnvoyTransport,
    url: String,
    receiving: Arc<AtomicBool>,
}

impl MeterStream {
    pub fn new(transport: EnvoyTransport, url: impl Into<String>, receiving: Arc<AtomicBool>) -> Self {
        Self {
            transport,
            url: url.into(),
            receiving,
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::SeqCst)
    }

    /// Authenticate, connect and deliver frames until the connection ends.
    ///
    /// A failed authentication is retryable. A callback error tears the
    /// stream down and is returned as [`EnvoyError::StreamCallback`].
    pub async fn read_once<F>(&self, mut on_frame: F) -> EnvoyResult<StreamOutcome>
    where
        F: FnMut(&StreamFrame) -> Result<(), CallbackError>,
    {
        if let Err(e) = self.transport.authority().establish_session().await {
            warn!("📡 [ENVOY STREAM] Authentication failed: {}, will retry", e);
            return Ok(StreamOutcome::Retry);
        }

        debug!("📡 [ENVOY STREAM] Connecting to {}", self.url);
        let response = match self
            .transport
            .open_stream(&self.url, Some(STREAM_SESSION_LIMIT))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("📡 [ENVOY STREAM] Connection failed: {}", e);
                return Ok(StreamOutcome::Retry);
            }
        };

        match response.status() {
            StatusCode::OK => {}
            status @ (StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND) => {
                warn!("📡 [ENVOY STREAM] Stream refused with {}, giving up", status);
                return Ok(StreamOutcome::Stop);
            }
            status => {
                warn!("📡 [ENVOY STREAM] Stream returned {}, will retry", status);
                return Ok(StreamOutcome::Retry);
            }
        }

        let _receiving = ReceivingGuard::new(&self.receiving);
        info!("📡 [ENVOY STREAM] Receiving realtime data");

        let mut bytes = response.bytes_stream();
        let mut buffer = Vec::new();
        loop {
            let chunk = match tokio::time::timeout(STREAM_IDLE_TIMEOUT, bytes.next()).await {
                Err(_) => {
                    warn!("📡 [ENVOY STREAM] No data for {:?}, reconnecting", STREAM_IDLE_TIMEOUT);
                    return Ok(StreamOutcome::Retry);
                }
                Ok(None) => {
                    debug!("📡 [ENVOY STREAM] Stream closed by the Envoy");
                    return Ok(StreamOutcome::Retry);
                }
                Ok(Some(Err(e))) => {
                    warn!("📡 [ENVOY STREAM] Read error: {}", e);
                    return Ok(StreamOutcome::Retry);
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            buffer.extend_from_slice(&chunk);
            while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line);
                match StreamFrame::parse_line(&line) {
                    Ok(Some(frame)) => {
                        trace!("📡 [ENVOY STREAM] Frame: {:?}", frame);
                        on_frame(&frame).map_err(|e| EnvoyError::StreamCallback(e.to_string()))?;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("📡 [ENVOY STREAM] Undecodable frame {:?}: {}", line.trim(), e),
                }
            }
        }
    }
}

/// Throttles frames into "what changed" updates.
#[derive(Debug, Clone)]
pub struct DeltaTracker {
    throttle: Duration,
    clamp_production: bool,
    last_emit: Option<Instant>,
    last_values: BTreeMap<String, Value>,
}

impl DeltaTracker {
    pub fn new(throttle: Duration, clamp_production: bool) -> Self {
        Self {
            throttle,
            clamp_production,
            last_emit: None,
            last_values: BTreeMap::new(),
        }
    }

    /// Values that changed since the last emission, at most once per throttle window.
    pub fn offer(&mut self, frame: &StreamFrame, now: Instant) -> Option<BTreeMap<String, Value>> {
        if let Some(last) = self.last_emit
            && now.duration_since(last) < self.throttle
        {
            return None;
        }

        let changed: BTreeMap<String, Value> = frame
            .metrics(self.clamp_production)
            .into_iter()
            .filter(|(name, value)| self.last_values.get(name) != Some(value))
            .collect();
        if changed.is_empty() {
            return None;
        }

        self.last_values
            .extend(changed.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.last_emit = Some(now);
        Some(changed)
    }
}

/// Reconnecting supervisor around [`MeterStream`].
#[derive(Debug)]
pub struct RealtimeLoop {
    stream: MeterStream,
    tracker: DeltaTracker,
    reconnect_delay: Duration,
    shutdown: Arc<Notify>,
}

impl RealtimeLoop {
    pub fn new(stream: MeterStream, tracker: DeltaTracker, reconnect_delay: Duration, shutdown: Arc<Notify>) -> Self {
        Self {
            stream,
            tracker,
            reconnect_delay,
            shutdown,
        }
    }

    /// Run until shutdown, a refused stream, or a callback error.
    pub async fn run<F>(mut self, mut on_update: F) -> EnvoyResult<()>
    where
        F: FnMut(BTreeMap<String, Value>) -> Result<(), CallbackError>,
    {
        loop {
            let tracker = &mut self.tracker;
            let session = self.stream.read_once(|frame| match tracker.offer(frame, Instant::now()) {
                Some(update) => on_update(update),
                None => Ok(()),
            });

            let outcome = tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("📡 [ENVOY STREAM] Shutdown requested");
                    return Ok(());
                }
                outcome = session => outcome?,
            };

            match outcome {
                StreamOutcome::Stop => return Ok(()),
                StreamOutcome::Retry => {
                    debug!("📡 [ENVOY STREAM] Reconnecting in {:?}", self.reconnect_delay);
                    tokio::select! {
                        _ = self.shutdown.notified() => {
                            info!("📡 [ENVOY STREAM] Shutdown requested");
                            return Ok(());
                        }
                        () = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authenticator;
    use crate::config::EnvoyConfig;
    use crate::storage::MemoryTokenStore;
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use mockito::{Matcher, Mock, Server};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const FRAME: &str = r#"data: {"production":{"ph-a":{"p":512.5,"q":-30.1,"s":530.0,"v":231.4,"i":2.3,"pf":0.97,"f":50.0},"ph-b":{"p":-3.0,"v":230.9}},"net-consumption":{"ph-a":{"p":-400.0}},"total-consumption":{"ph-a":{"p":112.5}}}"#;

    fn owner_token() -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256","typ":"JWT"}"#);
        let exp = chrono::Utc::now().timestamp() + 3600;
        let payload = URL_SAFE_NO_PAD.encode(json!({"enphaseUser": "owner", "exp": exp}).to_string());
        format!("{header}.{payload}.signature")
    }

    fn stream_with_store(device_url: &str, store: MemoryTokenStore, url: String) -> MeterStream {
        let config = EnvoyConfig {
            base_url: Some(device_url.to_string()),
            ..EnvoyConfig::new("127.0.0.1")
        };
        let auth = Authenticator::new(&config, Arc::new(store)).unwrap();
        let transport = EnvoyTransport::new(Arc::new(auth), Duration::from_secs(5)).unwrap();
        MeterStream::new(transport, url, Arc::new(AtomicBool::new(false)))
    }

    /// Stored owner token whose check_jwt hands out `sessionId=abc`.
    async fn authenticated_stream(server: &mut Server, url: String) -> (MeterStream, Mock) {
        let session = server
            .mock("POST", "/auth/check_jwt")
            .with_status(200)
            .with_header("set-cookie", "sessionId=abc; Path=/")
            .create_async()
            .await;
        let stream = stream_with_store(&server.url(), MemoryTokenStore::with_token(owner_token()), url);
        (stream, session)
    }

    async fn meter_stream(server: &mut Server) -> (MeterStream, Mock) {
        let url = format!("{}/stream/meter", server.url());
        authenticated_stream(server, url).await
    }

    /// Answers one stream request with a single frame and then stays silent.
    async fn endless_stream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let line = format!("{FRAME}\n");
            let reply = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{line}\r\n",
                line.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            std::future::pending::<()>().await;
        });
        format!("http://{addr}/stream/meter")
    }

    #[test]
    fn test_parse_frame() {
        let frame = StreamFrame::parse_line(FRAME).unwrap().unwrap();
        assert_eq!(frame.production["l1"].watts, Some(512.5));
        assert_eq!(frame.production["l1"].reactive_power, Some(-30.1));
        assert_eq!(frame.production["l2"].volts, Some(230.9));
        assert!(!frame.production.contains_key("l3"));
        assert_eq!(frame.consumption["l1"].watts, Some(112.5));
        assert_eq!(frame.net_consumption["l1"].watts, Some(-400.0));

        assert_eq!(StreamFrame::parse_line(": keepalive").unwrap(), None);
        assert!(StreamFrame::parse_line("data: {not json").is_err());
    }

    #[test]
    fn test_frame_metrics_clamp_production() {
        let frame = StreamFrame::parse_line(FRAME).unwrap().unwrap();
        let metrics = frame.metrics(true);
        assert_eq!(metrics["production_l1"], json!(512.5));
        assert_eq!(metrics["production_l2"], json!(0));
        assert_eq!(metrics["voltage_l1"], json!(231.4));
        assert_eq!(metrics["power_factor_l1"], json!(0.97));
        assert_eq!(metrics["consumption_l1"], json!(112.5));
        assert!(!metrics.contains_key("ampere_l2"));

        assert_eq!(frame.metrics(false)["production_l2"], json!(-3.0));
    }

    #[test]
    fn test_delta_tracker_throttles_and_emits_changes() {
        let first = StreamFrame::parse_line(FRAME).unwrap().unwrap();
        let mut second = first.clone();
        if let Some(reading) = second.production.get_mut("l1") {
            reading.watts = Some(600.0);
        }

        let mut tracker = DeltaTracker::new(Duration::from_secs(10), true);
        let start = Instant::now();

        let update = tracker.offer(&first, start).unwrap();
        assert!(update.contains_key("voltage_l1"));

        assert!(tracker.offer(&second, start + Duration::from_secs(5)).is_none());

        let update = tracker.offer(&second, start + Duration::from_secs(10)).unwrap();
        assert_eq!(update.len(), 1);
        assert_eq!(update["production_l1"], json!(600.0));

        assert!(tracker.offer(&second, start + Duration::from_secs(30)).is_none());
    }

    #[tokio::test]
    async fn test_stream_authenticates_before_connect() {
        let mut server = Server::new_async().await;
        let session = server
            .mock("POST", "/auth/check_jwt")
            .with_status(200)
            .with_header("set-cookie", "sessionId=abc; Path=/")
            .expect(1)
            .create_async()
            .await;
        let stream = stream_with_store(
            &server.url(),
            MemoryTokenStore::with_token(owner_token()),
            format!("{}/stream/meter", server.url()),
        );
        let authorized = server
            .mock("GET", "/stream/meter")
            .match_header("cookie", "sessionId=abc")
            .with_status(200)
            .with_body(format!("{FRAME}\n"))
            .expect(1)
            .create_async()
            .await;
        let anonymous = server
            .mock("GET", "/stream/meter")
            .match_header("cookie", Matcher::Missing)
            .with_status(401)
            .expect(0)
            .create_async()
            .await;

        let mut frames = 0;
        let outcome = stream
            .read_once(|_| {
                frames += 1;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(outcome, StreamOutcome::Retry);
        assert_eq!(frames, 1);
        session.assert_async().await;
        authorized.assert_async().await;
        anonymous.assert_async().await;
    }

    #[tokio::test]
    async fn test_authentication_failure_is_retryable() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/stream/meter")
            .expect(0)
            .create_async()
            .await;

        // no stored token and no Enlighten credentials
        let stream = stream_with_store(
            &server.url(),
            MemoryTokenStore::new(),
            format!("{}/stream/meter", server.url()),
        );
        let outcome = stream.read_once(|_| Ok(())).await.unwrap();
        assert_eq!(outcome, StreamOutcome::Retry);
        assert!(!stream.is_receiving());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let mut server = Server::new_async().await;
        let (stream, _session) = meter_stream(&mut server).await;
        let mock = server
            .mock("GET", "/stream/meter")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let outcome = stream.read_once(|_| Ok(())).await.unwrap();
        assert_eq!(outcome, StreamOutcome::Retry);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal() {
        let mut server = Server::new_async().await;
        let (stream, _session) = meter_stream(&mut server).await;
        let _mock = server
            .mock("GET", "/stream/meter")
            .with_status(401)
            .create_async()
            .await;

        let outcome = stream.read_once(|_| Ok(())).await.unwrap();
        assert_eq!(outcome, StreamOutcome::Stop);
        assert!(!stream.is_receiving());
    }

    #[tokio::test]
    async fn test_frames_delivered_and_flag_reset() {
        let mut server = Server::new_async().await;
        let (stream, _session) = meter_stream(&mut server).await;
        let _mock = server
            .mock("GET", "/stream/meter")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(format!("{FRAME}\n\n: ping\n{FRAME}\n"))
            .create_async()
            .await;

        let mut frames = 0;
        let mut receiving_during = false;
        let flag = Arc::clone(&stream.receiving);
        let outcome = stream
            .read_once(|frame| {
                frames += 1;
                receiving_during = flag.load(Ordering::SeqCst);
                assert_eq!(frame.production["l1"].watts, Some(512.5));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(outcome, StreamOutcome::Retry);
        assert_eq!(frames, 2);
        assert!(receiving_during);
        assert!(!stream.is_receiving());
    }

    #[tokio::test]
    async fn test_callback_error_propagates() {
        let mut server = Server::new_async().await;
        let (stream, _session) = meter_stream(&mut server).await;
        let _mock = server
            .mock("GET", "/stream/meter")
            .with_status(200)
            .with_body(format!("{FRAME}\n"))
            .create_async()
            .await;

        let result = stream.read_once(|_| Err("consumer gone".into())).await;
        match result {
            Err(EnvoyError::StreamCallback(message)) => assert_eq!(message, "consumer gone"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!stream.is_receiving());
    }

    #[tokio::test]
    async fn test_loop_stops_on_refused_stream() {
        let mut server = Server::new_async().await;
        let (stream, _session) = meter_stream(&mut server).await;
        let _mock = server
            .mock("GET", "/stream/meter")
            .with_status(404)
            .create_async()
            .await;

        let realtime = RealtimeLoop::new(
            stream,
            DeltaTracker::new(Duration::ZERO, false),
            Duration::from_secs(3600),
            Arc::new(Notify::new()),
        );
        realtime.run(|_| Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn test_loop_reconnects_after_server_error() {
        let mut server = Server::new_async().await;
        let (stream, _session) = meter_stream(&mut server).await;
        let unavailable = server
            .mock("GET", "/stream/meter")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;
        let _available = server
            .mock("GET", "/stream/meter")
            .with_status(200)
            .with_body(format!("{FRAME}\n"))
            .create_async()
            .await;

        let shutdown = Arc::new(Notify::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let realtime = RealtimeLoop::new(
            stream,
            DeltaTracker::new(Duration::ZERO, false),
            Duration::from_millis(10),
            Arc::clone(&shutdown),
        );
        let handle = tokio::spawn(realtime.run(move |update| {
            let _ = tx.send(update);
            Ok(())
        }));

        let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update["production_l1"], json!(512.5));
        unavailable.assert_async().await;

        shutdown.notify_one();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_shutdown_during_read_resets_receiving() {
        let mut server = Server::new_async().await;
        let url = endless_stream().await;
        let (stream, _session) = authenticated_stream(&mut server, url).await;
        let observer = stream.clone();

        let shutdown = Arc::new(Notify::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let realtime = RealtimeLoop::new(
            stream,
            DeltaTracker::new(Duration::ZERO, false),
            Duration::from_secs(3600),
            Arc::clone(&shutdown),
        );
        let handle = tokio::spawn(realtime.run(move |update| {
            let _ = tx.send(update);
            Ok(())
        }));

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(observer.is_receiving());

        shutdown.notify_one();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
        assert!(!observer.is_receiving());
    }

    #[tokio::test]
    async fn test_loop_exits_on_shutdown_while_waiting() {
        let mut server = Server::new_async().await;
        let (stream, _session) = meter_stream(&mut server).await;
        let _mock = server
            .mock("GET", "/stream/meter")
            .with_status(503)
            .create_async()
            .await;

        let shutdown = Arc::new(Notify::new());
        let realtime = RealtimeLoop::new(
            stream,
            DeltaTracker::new(Duration::ZERO, false),
            Duration::from_secs(3600),
            Arc::clone(&shutdown),
        );
        let handle = tokio::spawn(realtime.run(|_| Ok(())));
        shutdown.notify_one();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
