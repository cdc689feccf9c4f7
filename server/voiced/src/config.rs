use clap::Parser;

use vs_protocol::{DEFAULT_CONTROL_PORT, DEFAULT_DISCOVERY_PORT, DEFAULT_MEDIA_PORT, MAX_PEERS};

#[derive(Parser, Debug, Clone)]
#[command(name = "vs-server", about = "voiceshare LAN voice chat server")]
pub struct Config {
    /// Server name announced in discovery responses.
    #[arg(long, env = "VS_SERVER_NAME", default_value = "voiceshare")]
    pub name: String,

    /// Address to bind all three sockets on.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    pub discovery_port: u16,

    #[arg(long, default_value_t = DEFAULT_CONTROL_PORT)]
    pub control_port: u16,

    #[arg(long, default_value_t = DEFAULT_MEDIA_PORT)]
    pub media_port: u16,

    #[arg(long, default_value_t = MAX_PEERS)]
    pub max_peers: usize,
}
