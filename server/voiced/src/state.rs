use std::sync::Arc;

use tokio::sync::watch;

use vs_control::{Membership, SessionHandler};

use crate::config::Config;

/// Shared by every server task.
pub struct ServerState {
    pub cfg: Config,
    pub server_id: u32,
    pub membership: Arc<Membership>,
    pub handler: SessionHandler,
    /// Flipped to true exactly once, at shutdown.
    pub shutdown: watch::Receiver<bool>,
}
