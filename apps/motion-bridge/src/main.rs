mod cli;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use clap::Parser;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use motion_bridge::config::BridgeConfig;
use motion_bridge::lobby::{LobbyMessage, LobbySessionController};
use motion_bridge::motion::{MotionCooldown, MotionEvent};
use motion_bridge::peer::{
    LoopbackNetwork, PeerConnectionManager, PeerId, PeerLinkFactory, PeerNegotiator,
    WebRtcLinkFactory,
};
use motion_bridge::signaling::{SignalingEvent, SignalingService};
use motion_bridge::telemetry::init_tracing;
use motion_bridge::transport::{LoopbackRadio, SessionId};

use crate::cli::{Cli, Commands, DemoArgs, PeerBackend};

const RESPONDER_ID: &str = "responder";
const INITIATOR_ID: &str = "initiator";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = BridgeConfig::from_env();
    init_tracing(&config.log_filter);

    match cli.command {
        Commands::SessionId { count } => {
            for _ in 0..count.max(1) {
                let id = SessionId::generate();
                println!("{id}\t{}", id.advertised_name(&config.device_prefix));
            }
            Ok(())
        }
        Commands::Demo(args) => {
            if let Some(ms) = args.scan_timeout_ms {
                config.scan_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = args.answer_timeout_ms {
                config.answer_timeout = Duration::from_millis(ms);
            }
            run_demo(config, args).await
        }
    }
}

async fn run_demo(config: BridgeConfig, args: DemoArgs) -> Result<()> {
    let session = match args.session.as_deref() {
        Some(raw) => SessionId::parse(raw).context("invalid --session")?,
        None => SessionId::generate(),
    };
    let deadline = Duration::from_secs(args.deadline_secs);
    info!(session = %session, backend = ?args.peers, "starting demo");

    let (responder_factory, initiator_factory): (Arc<dyn PeerLinkFactory>, Arc<dyn PeerLinkFactory>) =
        match args.peers {
            PeerBackend::Webrtc => (
                Arc::new(WebRtcLinkFactory::new(config.rtc())),
                Arc::new(WebRtcLinkFactory::new(config.rtc())),
            ),
            PeerBackend::Loopback => {
                let network = LoopbackNetwork::new();
                (
                    Arc::new(network.factory(RESPONDER_ID)),
                    Arc::new(network.factory(INITIATOR_ID)),
                )
            }
        };
    let responder_peers = PeerConnectionManager::new(responder_factory, config.max_pending);
    let initiator_peers = PeerConnectionManager::new(initiator_factory, config.max_pending);

    let (inbox_tx, mut inbox) = mpsc::unbounded_channel::<(PeerId, LobbyMessage)>();
    let responder_lobby = LobbySessionController::new(
        RESPONDER_ID,
        responder_peers.clone(),
        Arc::new(move |from: &PeerId, message: &LobbyMessage| {
            let _ = inbox_tx.send((from.clone(), message.clone()));
        }),
        config.grace_period,
    );
    let initiator_lobby = LobbySessionController::new(
        INITIATOR_ID,
        initiator_peers.clone(),
        Arc::new(|from: &PeerId, message: &LobbyMessage| {
            info!(peer = %from, kind = %message.kind, "initiator received message");
        }),
        config.grace_period,
    );

    let radio = Arc::new(LoopbackRadio::with_prefix(config.device_prefix.clone()));
    let responder = SignalingService::new(radio.clone(), config.signaling());
    let initiator = SignalingService::new(radio, config.signaling());
    let mut responder_events = responder.subscribe();

    responder
        .start_responder_handshake(
            &session,
            Arc::new(PeerNegotiator::new(responder_peers.clone(), INITIATOR_ID)),
        )
        .await
        .context("responder failed to advertise")?;
    initiator
        .start_initiator_handshake(
            &session,
            Arc::new(PeerNegotiator::new(initiator_peers.clone(), RESPONDER_ID)),
        )
        .await
        .context("handshake failed")?;

    initiator
        .send_lobby_message(&serde_json::to_string(&LobbyMessage::player_info("initiator", true))?)
        .await?;
    let hello = wait_for_lobby_text(&mut responder_events, deadline).await?;
    info!(text = %hello, "lobby message over the short-range link");

    let responder_id = PeerId::from(RESPONDER_ID);
    let mut cooldown = MotionCooldown::new(Duration::from_millis(1));
    let mut sent = 0;
    while sent < args.messages {
        let event = MotionEvent::new(true, rand::thread_rng().gen_range(5.0..100.0), epoch_millis())?;
        if !cooldown.admit(&event) {
            tokio::time::sleep(Duration::from_millis(1)).await;
            continue;
        }
        initiator_lobby
            .send_to(&responder_id, &LobbyMessage::motion(&event)?)
            .await?;
        sent += 1;
    }

    for received in 0..args.messages {
        let (from, message) = tokio::time::timeout(deadline, inbox.recv())
            .await
            .context("timed out waiting for motion events")?
            .context("lobby handler went away")?;
        println!(
            "{} <- {}: {}",
            received + 1,
            from,
            serde_json::to_string(&message)?
        );
    }

    for (peer, entry) in responder_lobby.peers() {
        info!(peer = %peer, state = ?entry.state, "responder view");
    }

    initiator_peers.close_all_connections().await;
    responder_peers.close_all_connections().await;
    initiator.stop().await;
    responder.stop().await;
    drop(initiator_lobby);
    drop(responder_lobby);
    info!(session = %session, "demo finished");
    Ok(())
}

async fn wait_for_lobby_text(
    events: &mut broadcast::Receiver<SignalingEvent>,
    deadline: Duration,
) -> Result<String> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(SignalingEvent::LobbyMessage { text }) => return Ok(text),
                Ok(SignalingEvent::HandshakeFailed { reason }) => bail!("handshake failed: {reason}"),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "signaling events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => bail!("signaling service went away"),
            }
        }
    };
    tokio::time::timeout(deadline, wait)
        .await
        .context("timed out waiting for lobby message")?
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
