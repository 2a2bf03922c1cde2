//! Peercall CLI Application

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use peercall_core::prelude::*;
use peercall_core::IceServer;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Local participant id (random if omitted)
    #[arg(short, long, env = "PEERCALL_IDENTITY")]
    identity: Option<String>,

    /// STUN/TURN server URL; repeat for several (defaults to public STUN)
    #[arg(long = "ice-server", env = "PEERCALL_ICE_SERVERS", value_delimiter = ',')]
    ice_servers: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Negotiate a call between two in-process participants
    Loopback {
        /// Name of the called participant
        #[arg(long, default_value = "loopback-peer")]
        peer: String,

        /// Also send a video track
        #[arg(long)]
        video: bool,

        /// Seconds to wait for connectivity
        #[arg(long, default_value_t = 15)]
        timeout: u64,
    },

    /// Print the effective service configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peercall_cli=info,peercall_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let identity = match cli.identity.as_deref() {
        Some(raw) => PeerId::parse(raw)?,
        None => PeerId::new(generate_random_identity()),
    };
    let config = service_config(&cli.ice_servers);

    match cli.command {
        Commands::Loopback {
            peer,
            video,
            timeout,
        } => {
            let peer = PeerId::parse(&peer)?;
            if peer == identity {
                bail!("caller and callee must differ (both are {identity})");
            }
            handle_loopback(identity, peer, video, Duration::from_secs(timeout), config).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn service_config(ice_servers: &[String]) -> CallServiceConfig {
    let mut config = CallServiceConfig::default();
    if !ice_servers.is_empty() {
        config.transport = TransportConfig {
            ice_servers: ice_servers
                .iter()
                .map(|url| IceServer::new([url.as_str()]))
                .collect(),
        };
    }
    config
}

async fn handle_loopback(
    caller_id: PeerId,
    callee_id: PeerId,
    video: bool,
    timeout: Duration,
    config: CallServiceConfig,
) -> Result<()> {
    println!("📞 {caller_id} calling {callee_id} (loopback)");

    let (caller_channel, caller_outbound) = ChannelSignaling::new();
    let (callee_channel, callee_outbound) = ChannelSignaling::new();

    let caller = Arc::new(CallService::new(
        caller_id.clone(),
        Arc::new(WebRtcTransportFactory::new()?),
        SignalingHandler::new(Arc::new(caller_channel)),
        Arc::new(SurfaceBoard::new()),
        config.clone(),
    ));
    let callee = Arc::new(CallService::new(
        callee_id.clone(),
        Arc::new(WebRtcTransportFactory::new()?),
        SignalingHandler::new(Arc::new(callee_channel)),
        Arc::new(SurfaceBoard::new()),
        config,
    ));

    // Each side's outbound messages are the other's inbound
    let to_callee = callee.clone();
    tokio::spawn(async move { to_callee.serve(caller_outbound).await });
    let to_caller = caller.clone();
    tokio::spawn(async move { to_caller.serve(callee_outbound).await });

    let mut events = caller.subscribe_events();

    let mut local = LocalStream::new(format!("{caller_id}-media"))
        .with_track(LocalTrack::audio(format!("{caller_id}-audio")));
    if video {
        local = local.with_track(LocalTrack::video(format!("{caller_id}-video")));
    }
    let call_id = caller
        .place_call(callee_id.clone(), Some(&local))
        .await
        .context("failed to place call")?;
    println!("   Call {call_id} offered");

    let outcome = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(CallEvent::ConnectionStateChanged { state, .. }) => {
                    tracing::debug!(state = ?state, "Caller connection state");
                    if state == ConnectionState::Connected || state.is_terminal() {
                        return Ok(state);
                    }
                }
                Ok(CallEvent::SignalingFailed { error, .. }) => {
                    tracing::warn!("Signaling failed: {}", error);
                }
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
    })
    .await;

    let result = match outcome {
        Ok(Ok(ConnectionState::Connected)) => {
            println!("✅ Connected");
            Ok(())
        }
        Ok(Ok(state)) => Err(anyhow::anyhow!("connection ended in state {state:?}")),
        Ok(Err(e)) => Err(anyhow::anyhow!("event stream error: {e}")),
        Err(_) => Err(anyhow::anyhow!(
            "no connectivity within {}s",
            timeout.as_secs()
        )),
    };

    if let Some(call) = caller.call(&callee_id).await {
        println!("   Negotiation state: {:?}", call.state());
    }

    if let Err(e) = caller.hang_up(&callee_id).await {
        tracing::debug!("Hang up: {}", e);
    }
    caller.shutdown().await;
    callee.shutdown().await;
    println!("📞 Call ended");

    result
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "amber", "birch", "cedar", "delta", "ember", "fjord", "grove", "heron", "iris", "juniper",
        "kestrel", "larch", "maple", "nova", "onyx", "pine", "quill", "raven", "sage", "thistle",
        "umber", "vale", "willow", "yarrow", "zephyr",
    ];

    let mut rng = rand::thread_rng();
    let word = WORDS[rng.gen_range(0..WORDS.len())];
    format!("{word}-{:04}", rng.gen_range(0..10_000))
}
