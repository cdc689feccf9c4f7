//! Control-plane tasks: TCP acceptor, per-connection loops, heartbeat sweep.
//!
//! Each accepted connection gets a reader loop (deadline-capped reads feeding
//! a [`FrameAccumulator`]) and a writer task draining the member's queue.
//! The member's table entry is removed on every exit path — EOF, read error,
//! framing error, LEAVE, shutdown, sweep — exactly once.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use vs_protocol::control::FrameAccumulator;
use vs_protocol::HEARTBEAT_TIMEOUT_SECS;

use crate::state::ServerState;

const READ_DEADLINE: Duration = Duration::from_millis(250);
const WRITER_QUEUE: usize = 64;

pub async fn run_acceptor(state: Arc<ServerState>, listener: TcpListener) {
    let mut shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            r = listener.accept() => match r {
                Ok((stream, peer)) => {
                    tokio::spawn(connection_task(state.clone(), stream, peer));
                }
                Err(e) => {
                    warn!("control accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!("control acceptor stopped");
}

async fn connection_task(state: Arc<ServerState>, stream: TcpStream, peer: std::net::SocketAddr) {
    let _ = stream.set_nodelay(true);

    let (tx, mut rx) = mpsc::channel::<Bytes>(WRITER_QUEUE);
    let conn = match state.membership.accept(peer, tx.clone()) {
        Ok(conn) => conn,
        Err(e) => {
            warn!(%peer, "rejecting control connection: {e}");
            return;
        }
    };

    let (mut rd, mut wr) = stream.into_split();

    // Single writer per connection: broadcasts and replies share one queue,
    // so frame boundaries never interleave.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if wr.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    let cleanup = {
        let membership = state.membership.clone();
        scopeguard::guard((), move |_| {
            membership.remove(conn);
        })
    };

    let mut acc = FrameAccumulator::new();
    let mut buf = [0u8; 2048];
    let shutdown = state.shutdown.clone();

    'conn: loop {
        if *shutdown.borrow() {
            break;
        }
        // The sweep may have reclaimed the entry while this peer was silent.
        if !state.membership.contains(conn) {
            debug!(%peer, "connection swept, closing");
            break;
        }
        let n = match timeout(READ_DEADLINE, rd.read(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!(%peer, "control read failed: {e}");
                break;
            }
        };
        acc.extend(&buf[..n]);
        loop {
            match acc.next_frame() {
                Ok(None) => break,
                Ok(Some((header, body))) => {
                    match state.handler.handle_frame(conn, &header, &body) {
                        Ok(out) => {
                            for frame in out.replies {
                                if tx.send(frame).await.is_err() {
                                    break 'conn;
                                }
                            }
                            if out.disconnect {
                                break 'conn;
                            }
                        }
                        Err(e) => {
                            debug!(%peer, "session error: {e}");
                            break 'conn;
                        }
                    }
                }
                Err(e) => {
                    warn!(%peer, "control framing error: {e}");
                    break 'conn;
                }
            }
        }
    }

    drop(cleanup);
    drop(tx);
    let _ = writer.await;
    debug!(%peer, "control connection closed");
}

/// Enforce the heartbeat timeout. The protocol's control multiplexer did
/// this on every wakeup; here a 1 s interval gives the same 10 s bound.
pub async fn run_sweeper(state: Arc<ServerState>) {
    let dead_after = Duration::from_secs(HEARTBEAT_TIMEOUT_SECS);
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let expired = state.membership.sweep(dead_after);
                if !expired.is_empty() {
                    info!(?expired, "members expired on heartbeat timeout");
                }
            }
        }
    }
    debug!("heartbeat sweeper stopped");
}
