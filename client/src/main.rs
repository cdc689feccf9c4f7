//! voiceshare client.
//!
//! What this does:
//! - discovers servers over UDP broadcast (or connects straight to --server)
//! - runs the control handshake (HELLO → JOIN), then heartbeats every 3 s
//! - receive path: media datagrams → per-source jitter buffers → mix → sink
//! - send path: capture frames → noise gate → encode → RTP datagrams
//! - reconnects with bounded backoff when the session drops
//!
//! Audio devices and the encoded-voice codec are external collaborators;
//! without them the client runs on the built-in stand-ins (silent capture,
//! discarding sink, linear-PCM codec at a short frame).

mod audio;
mod config;
mod net;
mod state;

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use audio::codec::{RawPcmFactory, SharedFactory};
use audio::engine::{self, DiscardSink, EngineConfig, SilentSource};
use audio::gate::{CaptureGate, GateConfig};
use audio::jitter::JitterConfig;
use audio::mixer::{Mixer, MixerConfig};
use config::Config;
use net::control::{self, ControlClient, PushEvent};
use net::discovery::ServerTable;
use net::media::MediaChannel;
use state::{ClientState, Phase};

/// Frame geometry for the built-in linear-PCM codec: 5 ms keeps a raw frame
/// under the media payload cap. An external codec runs the full 20 ms frame.
const PCM_FRAME_SAMPLES: usize = 240;
const PCM_FRAME_MS: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = Config::parse();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(ClientState::default());
    let table = Arc::new(ServerTable::default());

    // Discovery runs for the life of the process, independent of sessions.
    let client_id = if cfg.client_id != 0 { cfg.client_id } else { rand::random() };
    tokio::spawn(net::discovery::run_requester(
        cfg.discovery_port,
        client_id,
        cfg.display_name.clone(),
        table.clone(),
        shutdown_rx.clone(),
    ));

    let mut app = tokio::spawn(app_task(cfg, state, table, shutdown_rx));

    tokio::select! {
        r = &mut app => {
            if let Err(e) = r {
                warn!("app task join error: {e}");
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c");
            let _ = shutdown_tx.send(true);
        }
    }
    let _ = app.await;
    Ok(())
}

/// Connect → run session → reconnect with backoff, until shutdown.
async fn app_task(
    cfg: Config,
    state: Arc<ClientState>,
    table: Arc<ServerTable>,
    shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(10));
    while !*shutdown.borrow() {
        match run_session(&cfg, &state, &table, shutdown.clone()).await {
            Ok(()) => {
                backoff.reset();
            }
            Err(e) => {
                warn!("session ended: {e:#}");
                state.clear();
                backoff.sleep().await;
            }
        }
        if *shutdown.borrow() {
            break;
        }
    }
    info!("client stopped");
}

async fn run_session(
    cfg: &Config,
    state: &Arc<ClientState>,
    table: &Arc<ServerTable>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let server_addr = resolve_server(cfg, table, &mut shutdown).await?;

    state.set_phase(Phase::Connecting);
    let mut ctl = ControlClient::connect(server_addr).await?;
    let hello = ctl.hello(cfg.client_id, &cfg.display_name).await?;
    state.set_phase(Phase::Connected);
    info!(id = hello.assigned_id, "connected to {server_addr}");

    let media_socket = Arc::new(
        UdpSocket::bind(("0.0.0.0", cfg.media_port))
            .await
            .context("bind media socket")?,
    );
    let local_media_port = media_socket.local_addr()?.port();

    state.set_phase(Phase::Joining);
    let (ack, records) = ctl.join(local_media_port).await?;
    state.set_phase(Phase::InSession);
    state.set_peer_list(records);
    info!(source = ack.source, peers = state.peer_count(), "joined session");
    for peer in state.peers() {
        info!(id = peer.id, name = %peer.name, talking = peer.talking, "peer in session");
    }

    // Receive pipeline: per-source jitter buffers under the mixer.
    let factory: SharedFactory = Arc::new(RawPcmFactory { frame_samples: PCM_FRAME_SAMPLES });
    let mixer = Arc::new(Mixer::new(
        MixerConfig {
            frame_samples: PCM_FRAME_SAMPLES,
            jitter: JitterConfig { frame_samples: PCM_FRAME_SAMPLES, ..JitterConfig::default() },
            ..MixerConfig::default()
        },
        factory.clone(),
    ));
    mixer.set_self_source(ack.source);

    // Session-scoped tasks, all cancelled together on any exit path.
    let (sess_tx, sess_rx) = watch::channel(false);
    let (handle, mut pushes) = ctl.start(sess_rx.clone());
    let encoder = factory.new_encoder()?;
    let gate = CaptureGate::new(GateConfig {
        gate_enabled: !cfg.no_gate,
        noise_detection: !cfg.no_noise_detection,
        frame_ms: PCM_FRAME_MS as f32,
        ..GateConfig::default()
    });
    let media_server = SocketAddr::new(server_addr.ip(), hello.media_port);
    let media_tx = MediaChannel::new(
        media_socket.clone(),
        media_server,
        ack.source,
        encoder.payload_type(),
    );
    let muted = Arc::new(AtomicBool::new(cfg.muted));

    let tasks = vec![
        tokio::spawn(control::run_heartbeat(handle.clone(), sess_rx.clone())),
        tokio::spawn(net::media::run_receiver(media_socket.clone(), mixer.clone(), sess_rx.clone())),
        tokio::spawn(engine::run_capture(
            EngineConfig { frame_samples: PCM_FRAME_SAMPLES, frame_ms: PCM_FRAME_MS },
            SilentSource,
            gate,
            encoder,
            media_tx,
            muted,
            ack.base_timestamp,
            sess_rx.clone(),
        )),
        tokio::spawn(engine::run_playback(mixer.clone(), DiscardSink, PCM_FRAME_SAMPLES, sess_rx)),
    ];

    // Announce our audio state now that the pipeline is up. A dead writer
    // shows up as a Closed push moments later, so failures only get logged.
    if let Err(e) = handle.set_audio_active(true).await {
        warn!("audio-state announce failed: {e}");
    }
    if cfg.muted {
        if let Err(e) = handle.set_muted(true).await {
            warn!("mute announce failed: {e}");
        }
    }

    let result = session_loop(state, &handle, &mixer, &mut pushes, &mut shutdown).await;

    // Teardown: stop the session tasks, then release per-source state.
    let _ = sess_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    mixer.reset();
    state.clear();
    result
}

async fn session_loop(
    state: &Arc<ClientState>,
    handle: &control::ControlHandle,
    mixer: &Arc<Mixer>,
    pushes: &mut tokio::sync::mpsc::Receiver<PushEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let mut stats_tick = tokio::time::interval(Duration::from_secs(10));
    stats_tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = handle.leave().await;
                    return Ok(());
                }
            }
            ev = pushes.recv() => match ev {
                None | Some(PushEvent::Closed) => bail!("control connection closed"),
                Some(ev) => state.apply_push(&ev),
            },
            _ = stats_tick.tick() => {
                tracing::debug!(
                    phase = ?state.phase(),
                    peers = state.peer_count(),
                    streams = mixer.active_streams(),
                    "session alive"
                );
                for s in mixer.stream_stats() {
                    tracing::debug!(
                        source = s.source,
                        received = s.stats.received,
                        lost = s.stats.lost,
                        late = s.stats.late,
                        reordered = s.stats.reordered,
                        duplicates = s.stats.duplicates,
                        overruns = s.stats.overruns,
                        concealed = s.stats.concealed,
                        loss_rate = s.stats.loss_rate(),
                        jitter_ms = s.jitter_ms,
                        "stream stats"
                    );
                }
            }
        }
    }
}

/// Direct --server address, or the first discovered server.
async fn resolve_server(
    cfg: &Config,
    table: &Arc<ServerTable>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SocketAddr> {
    if let Some(server) = &cfg.server {
        return server.parse().context("parse --server address");
    }
    info!("waiting for server discovery");
    loop {
        if *shutdown.borrow() {
            bail!("shutdown before a server was found");
        }
        if let Some(server) = table.pick() {
            info!(name = %server.name, addr = %server.control_addr(), "connecting to discovered server");
            return Ok(server.control_addr());
        }
        sleep(Duration::from_millis(500)).await;
    }
}

/// Bounded exponential backoff between reconnect attempts.
struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, current: min }
    }

    fn reset(&mut self) {
        self.current = self.min;
    }

    async fn sleep(&mut self) {
        sleep(self.current).await;
        self.current = (self.current * 2).min(self.max);
    }
}
