//! Client side of the control channel.
//!
//! The handshake (HELLO, JOIN) runs sequentially on the freshly connected
//! stream; [`ControlClient::start`] then splits it into a reader task that
//! turns server pushes into [`PushEvent`]s and a writer task that drains a
//! queue, giving every sender (heartbeat task, user actions) one ordered
//! path onto the wire.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use vs_protocol::control::{
    ControlMessage, FrameAccumulator, Heartbeat, Hello, HelloAck, Join, JoinAck, MsgType,
    PeerState, TimeSync,
};
use vs_protocol::peer::PeerRecord;
use vs_protocol::wall_ms;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_DEADLINE: Duration = Duration::from_millis(250);

/// Server-push traffic surfaced to the session loop.
#[derive(Clone, Debug)]
pub enum PushEvent {
    PeerJoined(PeerRecord),
    PeerLeft(u32),
    PeerState(PeerState),
    HeartbeatAck { server_time_ms: u32 },
    TimeSync(TimeSync),
    /// The control stream is gone; the session is over.
    Closed,
}

pub struct ControlClient {
    stream: TcpStream,
    acc: FrameAccumulator,
    seq: u32,
}

impl ControlClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .context("control connect timed out")?
            .context("control connect")?;
        let _ = stream.set_nodelay(true);
        Ok(Self { stream, acc: FrameAccumulator::new(), seq: 1 })
    }

    pub async fn hello(&mut self, proposed_id: u32, name: &str) -> Result<HelloAck> {
        self.send(ControlMessage::Hello(Hello { proposed_id, name: name.to_string() }))
            .await?;
        match self.recv_type(MsgType::HelloAck).await? {
            ControlMessage::HelloAck(ack) if ack.result == 0 => Ok(ack),
            ControlMessage::HelloAck(ack) => bail!("hello rejected: result={}", ack.result),
            _ => unreachable!(),
        }
    }

    pub async fn join(&mut self, media_port: u16) -> Result<(JoinAck, Vec<PeerRecord>)> {
        self.send(ControlMessage::Join(Join { media_port })).await?;
        let ack = match self.recv_type(MsgType::JoinAck).await? {
            ControlMessage::JoinAck(ack) if ack.result == 0 => ack,
            ControlMessage::JoinAck(ack) => bail!("join rejected: result={}", ack.result),
            _ => unreachable!(),
        };
        let records = match self.recv_type(MsgType::PeerList).await? {
            ControlMessage::PeerList(records) => records,
            _ => unreachable!(),
        };
        Ok((ack, records))
    }

    async fn send(&mut self, msg: ControlMessage) -> Result<()> {
        let frame = msg.to_frame(self.seq);
        self.seq += 1;
        self.stream.write_all(&frame).await.context("control send")?;
        Ok(())
    }

    /// Read until a frame of the wanted type arrives, skipping anything
    /// else (a push can race the handshake).
    async fn recv_type(&mut self, want: MsgType) -> Result<ControlMessage> {
        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            if let Some((header, body)) = self.acc.next_frame()? {
                match ControlMessage::decode(header.msg_type, &body) {
                    Ok(msg) if msg.msg_type() == want => return Ok(msg),
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("skipping undecodable frame during handshake: {e}");
                        continue;
                    }
                }
            }
            let mut buf = [0u8; 2048];
            let n = tokio::time::timeout_at(deadline, self.stream.read(&mut buf))
                .await
                .map_err(|_| anyhow!("timed out waiting for {want:?}"))?
                .context("control read")?;
            if n == 0 {
                bail!("server closed the control stream");
            }
            self.acc.extend(&buf[..n]);
        }
    }

    /// Hand the stream to background reader/writer tasks.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> (ControlHandle, mpsc::Receiver<PushEvent>) {
        let (rd, wr) = self.stream.into_split();
        let seq = Arc::new(AtomicU32::new(self.seq));
        let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(64);
        let (push_tx, push_rx) = mpsc::channel::<PushEvent>(64);

        tokio::spawn(writer_task(wr, frame_rx));
        tokio::spawn(reader_task(rd, self.acc, push_tx, shutdown));

        (ControlHandle { tx: frame_tx, seq }, push_rx)
    }
}

/// Cloneable sender for post-handshake control traffic.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<Bytes>,
    seq: Arc<AtomicU32>,
}

impl ControlHandle {
    pub async fn send(&self, msg: ControlMessage) -> Result<()> {
        let frame = msg.to_frame(self.seq.fetch_add(1, Ordering::Relaxed));
        self.tx
            .send(frame)
            .await
            .map_err(|_| anyhow!("control writer stopped"))
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.send(ControlMessage::Heartbeat(Heartbeat { time_ms: wall_ms() })).await
    }

    pub async fn leave(&self) -> Result<()> {
        self.send(ControlMessage::Leave).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.send(if muted { ControlMessage::AudioMute } else { ControlMessage::AudioUnmute })
            .await
    }

    pub async fn set_audio_active(&self, active: bool) -> Result<()> {
        self.send(if active { ControlMessage::AudioStart } else { ControlMessage::AudioStop })
            .await
    }
}

async fn writer_task(mut wr: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if wr.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = wr.shutdown().await;
}

async fn reader_task(
    mut rd: OwnedReadHalf,
    mut acc: FrameAccumulator,
    push_tx: mpsc::Sender<PushEvent>,
    shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 2048];
    'link: loop {
        if *shutdown.borrow() {
            break;
        }
        let n = match timeout(READ_DEADLINE, rd.read(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("control read failed: {e}");
                break;
            }
        };
        acc.extend(&buf[..n]);
        loop {
            match acc.next_frame() {
                Ok(None) => break,
                Ok(Some((header, body))) => {
                    let Ok(msg) = ControlMessage::decode(header.msg_type, &body) else {
                        debug!(msg_type = header.msg_type, "dropping undecodable push");
                        continue;
                    };
                    if let Some(ev) = classify_push(msg) {
                        if push_tx.try_send(ev).is_err() {
                            // Session loop is behind; drop rather than stall the reader.
                        }
                    }
                }
                Err(e) => {
                    warn!("control framing error: {e}");
                    break 'link;
                }
            }
        }
    }
    let _ = push_tx.send(PushEvent::Closed).await;
}

fn classify_push(msg: ControlMessage) -> Option<PushEvent> {
    Some(match msg {
        ControlMessage::PeerJoin(record) => PushEvent::PeerJoined(record),
        ControlMessage::PeerLeave { id } => PushEvent::PeerLeft(id),
        ControlMessage::PeerState(state) => PushEvent::PeerState(state),
        ControlMessage::Heartbeat(hb) => PushEvent::HeartbeatAck { server_time_ms: hb.time_ms },
        ControlMessage::TimeSync(ts) => PushEvent::TimeSync(ts),
        other => {
            debug!(?other, "unexpected push message");
            return None;
        }
    })
}

/// Send a heartbeat every 3 s until the writer dies or shutdown flips.
pub async fn run_heartbeat(handle: ControlHandle, mut shutdown: watch::Receiver<bool>) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(vs_protocol::HEARTBEAT_INTERVAL_SECS));
    interval.tick().await; // immediate first tick is redundant after join
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                if handle.heartbeat().await.is_err() {
                    break;
                }
            }
        }
    }
}
