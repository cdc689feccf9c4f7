//! voiceshare server: discovery responder, control plane, media fan-out.
//!
//! `Server::start` binds the three sockets and spawns the four long-lived
//! tasks; `Server::shutdown` flips the watch flag and joins them. Startup
//! failure releases everything bound so far and leaves the process state
//! untouched.

pub mod config;
pub mod control;
pub mod discovery;
pub mod media;
pub mod state;

use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use vs_control::{Membership, SessionHandler};
use vs_media::{MediaRelay, RelayConfig};

use crate::config::Config;
use crate::media::{CountersHandle, Directory, RelayCounters, UdpOut};
use crate::state::ServerState;

pub struct Server {
    pub server_id: u32,
    pub discovery_port: u16,
    pub control_port: u16,
    pub media_port: u16,
    counters: Arc<RelayCounters>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub async fn start(cfg: Config) -> Result<Server> {
        let bind_ip: IpAddr = cfg.bind.parse().context("parse bind address")?;

        let listener = TcpListener::bind((bind_ip, cfg.control_port))
            .await
            .context("bind control port")?;
        let media_socket = UdpSocket::bind((bind_ip, cfg.media_port))
            .await
            .context("bind media port")?;
        let discovery_socket = UdpSocket::bind((bind_ip, cfg.discovery_port))
            .await
            .context("bind discovery port")?;

        let control_port = listener.local_addr()?.port();
        let media_port = media_socket.local_addr()?.port();
        let discovery_port = discovery_socket.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let membership = Arc::new(Membership::new(cfg.max_peers));
        let server_id: u32 = rand::random();

        let state = Arc::new(ServerState {
            handler: SessionHandler::new(membership.clone(), media_port),
            cfg,
            server_id,
            membership,
            shutdown: shutdown_rx,
        });

        let media_socket = Arc::new(media_socket);
        let counters = Arc::new(RelayCounters::default());
        let relay = Arc::new(MediaRelay::new(
            RelayConfig::default(),
            Directory(state.membership.clone()),
            UdpOut(media_socket.clone()),
            CountersHandle(counters.clone()),
        ));

        let tasks = vec![
            tokio::spawn(discovery::run(state.clone(), discovery_socket, control_port, media_port)),
            tokio::spawn(control::run_acceptor(state.clone(), listener)),
            tokio::spawn(control::run_sweeper(state.clone())),
            tokio::spawn(media::run(state.clone(), media_socket, relay)),
        ];

        info!(
            server_id,
            discovery_port, control_port, media_port, "voiceshare server started"
        );

        Ok(Server {
            server_id,
            discovery_port,
            control_port,
            media_port,
            counters,
            shutdown_tx,
            tasks,
        })
    }

    /// Flip the running flag and join every task before dropping state.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!(
            rx = self.counters.rx_datagrams.load(Ordering::Relaxed),
            forwarded = self.counters.forwarded.load(Ordering::Relaxed),
            send_errors = self.counters.send_errors.load(Ordering::Relaxed),
            "voiceshare server stopped"
        );
    }
}
