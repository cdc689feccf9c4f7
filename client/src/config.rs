use clap::Parser;

use vs_protocol::DEFAULT_DISCOVERY_PORT;

#[derive(Parser, Debug, Clone)]
#[command(name = "vs-client", about = "voiceshare LAN voice chat client")]
pub struct Config {
    /// Server control address (host:port). When unset, the client connects
    /// to the first server discovery finds.
    #[arg(long, env = "VS_SERVER")]
    pub server: Option<String>,

    /// Display name shown to other peers.
    #[arg(long, default_value = "User")]
    pub display_name: String,

    /// Session id to propose; 0 lets the server assign one.
    #[arg(long, default_value_t = 0)]
    pub client_id: u32,

    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    pub discovery_port: u16,

    /// Local UDP media port; 0 picks an ephemeral port.
    #[arg(long, default_value_t = 0)]
    pub media_port: u16,

    /// Start with the microphone muted.
    #[arg(long)]
    pub muted: bool,

    /// Disable the capture silence gate.
    #[arg(long)]
    pub no_gate: bool,

    /// Disable high-energy noise attenuation.
    #[arg(long)]
    pub no_noise_detection: bool,
}
