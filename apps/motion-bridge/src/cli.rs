use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "motion-bridge")]
#[command(about = "Short-range signaling bridge for WebRTC data channels")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a responder and an initiator in one process and exchange motion events
    Demo(DemoArgs),

    /// Print fresh session ids and the names they would advertise under
    SessionId {
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
}

#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Session id to advertise; generated when omitted
    #[arg(short, long)]
    pub session: Option<String>,

    /// Motion events the initiator sends once connected
    #[arg(short, long, default_value_t = 3)]
    pub messages: usize,

    /// Peer connection backend
    #[arg(long, value_enum, default_value_t = PeerBackend::Webrtc)]
    pub peers: PeerBackend,

    /// Overrides MOTION_BRIDGE_SCAN_TIMEOUT_MS
    #[arg(long)]
    pub scan_timeout_ms: Option<u64>,

    /// Overrides MOTION_BRIDGE_ANSWER_TIMEOUT_MS
    #[arg(long)]
    pub answer_timeout_ms: Option<u64>,

    /// Seconds to wait for every event to arrive
    #[arg(long, default_value_t = 20)]
    pub deadline_secs: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PeerBackend {
    /// webrtc-rs peer connections over host candidates
    Webrtc,
    /// In-process links with synthetic descriptions
    Loopback,
}
