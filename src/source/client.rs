//! Upstream client: dials the current source endpoint, runs the framed
//! session, and keeps the failover state machine fed.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, SourceEndpoint, SourceServers};
use crate::error::Error;
use crate::protocol::codec::{decode_base_packet, encode_heartbeat, AuthEncoder};
use crate::protocol::delimiter::Reassembler;
use crate::protocol::heartbeat::{is_heartbeat, HeartbeatClock};
use crate::source::{Failover, IngestSink};

/// Read buffer for the session loop; reassembly happens in the
/// reassembler's own growable buffer.
const READ_BUF_LEN: usize = 4096;

/// Deadline for auth and heartbeat writes.
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Cadence of the in-session supervision tick.
const SUPERVISION_TICK: Duration = Duration::from_secs(3);

/// Cooldown between a session error and the next dial.
const REDIAL_COOLDOWN: Duration = Duration::from_secs(5);

pub struct SourceClient {
    servers: SourceServers,
    heartbeat: crate::config::HeartbeatConfig,
    reauth_interval: Duration,
    delimiter: Vec<u8>,
    max_packet_length: usize,
    auth: Mutex<AuthEncoder>,
    failover: Failover,
    ingest: Arc<dyn IngestSink>,
    shutdown: CancellationToken,
}

impl SourceClient {
    pub fn new(
        config: &Config,
        ingest: Arc<dyn IngestSink>,
        shutdown: CancellationToken,
    ) -> Result<Self, Error> {
        Ok(Self {
            servers: config.source_servers.clone(),
            heartbeat: config.heartbeat.clone(),
            reauth_interval: config.authentication.reauth_interval(),
            delimiter: config.delimiter.separator_bytes()?,
            max_packet_length: config.delimiter.max_packet_length,
            auth: Mutex::new(AuthEncoder::new(&config.authentication)),
            failover: Failover::new(config.source_servers.clone()),
            ingest,
            shutdown,
        })
    }

    pub fn failover(&self) -> &Failover {
        &self.failover
    }

    /// Outer loop: dial the current endpoint, run the session until it
    /// fails, feed the failover state machine, cool down, redial. Returns
    /// when the shutdown token fires.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            primary = %self.servers.primary.name,
            backup = %self.servers.backup.name,
            "source client started"
        );

        let probe = tokio::spawn(self.clone().probe_loop());

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let server = self.failover.current();
            match self.connect_with_retry(&server).await {
                Ok(stream) => {
                    self.failover.connect_succeeded(&server.id);
                    tracing::info!(
                        endpoint = %server.name,
                        address = %server.address,
                        "connected to source server"
                    );

                    match self.run_session(stream, &server).await {
                        Err(Error::Canceled) => break,
                        Err(e) => {
                            tracing::warn!(endpoint = %server.name, error = %e, "session ended");
                            self.failover.connect_failed(&server.id);
                        }
                        Ok(()) => {}
                    }
                }
                Err(Error::Canceled) => break,
                Err(e) => {
                    tracing::warn!(endpoint = %server.name, error = %e, "connection failed");
                    self.failover.connect_failed(&server.id);
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(REDIAL_COOLDOWN) => {}
            }
        }

        let _ = probe.await;
        tracing::info!("source client stopped");
    }

    /// Up to `max_retries + 1` dial attempts with a linear backoff of
    /// `attempt` seconds in between.
    async fn connect_with_retry(&self, server: &SourceEndpoint) -> Result<TcpStream, Error> {
        let mut last_error = String::new();

        for attempt in 0..=server.max_retries {
            if attempt > 0 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(Error::Canceled),
                    _ = tokio::time::sleep(Duration::from_secs(attempt as u64)) => {}
                }
            }

            match timeout(server.timeout(), TcpStream::connect(&server.address)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "connect timed out".to_owned(),
            }

            tracing::warn!(
                address = %server.address,
                attempt = attempt + 1,
                error = %last_error,
                "connection attempt failed"
            );
        }

        Err(Error::session(format!(
            "failed to connect to {} after {} attempts: {last_error}",
            server.address,
            server.max_retries + 1
        )))
    }

    async fn run_session(&self, stream: TcpStream, server: &SourceEndpoint) -> Result<(), Error> {
        let (mut reader, mut writer) = stream.into_split();
        let mut reassembler = Reassembler::new(self.delimiter.clone(), self.max_packet_length);
        let mut clock = HeartbeatClock::new(self.heartbeat.clone());

        self.send_auth(&mut writer, &reassembler, server).await?;
        let mut last_auth = Instant::now();

        let mut ticker = tokio::time::interval(SUPERVISION_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut buf = [0u8; READ_BUF_LEN];

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::Canceled),

                _ = ticker.tick() => {
                    if clock.should_send() {
                        self.write_frame(&mut writer, &encode_heartbeat()).await?;
                        clock.mark_sent();
                        tracing::debug!(endpoint = %server.name, "heartbeat sent");
                    }

                    if clock.write_idle() {
                        tracing::warn!(endpoint = %server.name, "write idle");
                    }

                    if clock.read_idle() {
                        return Err(Error::session("read idle timeout"));
                    }

                    if last_auth.elapsed() >= self.reauth_interval {
                        self.send_auth(&mut writer, &reassembler, server).await?;
                        last_auth = Instant::now();
                    }
                }

                read = reader.read(&mut buf) => {
                    let n = read
                        .map_err(|e| Error::session(format!("read failed: {e}")))?;
                    if n == 0 {
                        return Err(Error::session("connection closed by upstream"));
                    }

                    clock.mark_recv();

                    for record in reassembler.feed(&buf[..n]) {
                        if is_heartbeat(&record) {
                            tracing::debug!(endpoint = %server.name, "heartbeat received");
                            continue;
                        }

                        match decode_base_packet(&record) {
                            Ok(packet) => {
                                tracing::debug!(
                                    source_info = packet.source_info,
                                    host_info = packet.host_info,
                                    package_no = packet.package_no,
                                    len = packet.payload.len(),
                                    "base packet received"
                                );
                                if let Err(e) =
                                    self.ingest.ingest(&packet.payload, &server.address).await
                                {
                                    tracing::error!(error = %e, "ingest failed");
                                }
                            }
                            Err(e) => {
                                // Undecodable records are handed over raw so
                                // nothing is silently dropped.
                                tracing::warn!(
                                    error = %e,
                                    len = record.len(),
                                    "decode failed, ingesting raw record"
                                );
                                if let Err(e) = self.ingest.ingest(&record, &server.address).await
                                {
                                    tracing::error!(error = %e, "ingest failed");
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn send_auth(
        &self,
        writer: &mut OwnedWriteHalf,
        reassembler: &Reassembler,
        server: &SourceEndpoint,
    ) -> Result<(), Error> {
        let frame = {
            let mut auth = self.auth.lock().expect("auth lock poisoned");
            auth.encode_auth()
        };
        let framed = reassembler.wrap(&frame);

        self.write_frame(writer, &framed).await?;
        tracing::info!(endpoint = %server.name, bytes = framed.len(), "auth packet sent");

        Ok(())
    }

    async fn write_frame(&self, writer: &mut OwnedWriteHalf, frame: &[u8]) -> Result<(), Error> {
        timeout(WRITE_DEADLINE, writer.write_all(frame))
            .await
            .map_err(|_| Error::session("write timed out"))?
            .map_err(|e| Error::session(format!("write failed: {e}")))
    }

    /// Periodic TCP-only reachability probe of both enabled endpoints.
    async fn probe_loop(self: Arc<Self>) {
        let period = self.servers.primary.health_check_interval();
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let primary = probe_endpoint(&self.servers.primary).await;
                    let backup = probe_endpoint(&self.servers.backup).await;
                    self.failover.apply_probe(primary, backup);
                }
            }
        }
    }
}

async fn probe_endpoint(server: &SourceEndpoint) -> Option<bool> {
    if !server.enabled {
        return None;
    }

    let healthy = matches!(
        timeout(
            server.health_check_timeout(),
            TcpStream::connect(&server.address)
        )
        .await,
        Ok(Ok(_))
    );

    tracing::debug!(endpoint = %server.name, healthy, "health probe");

    Some(healthy)
}
