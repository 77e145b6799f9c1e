//! huddle-client - headless client harness
//!
//! Drives the full session (connect, create or join, media, stats, files)
//! with a synthetic frame source and null audio devices, logging every
//! event. A GUI embeds the same [`huddle::client::ClientSession`] with real
//! sources and sinks.

use clap::Parser;
use huddle::client::media::{NullAudioSink, SilenceSource, TestPatternSource};
use huddle::client::{ClientEvent, ClientSession, MediaBindings};
use huddle::config::Config;
use log::{info, warn};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "huddle-client")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Conferencing client (headless)", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server address
    #[arg(long)]
    server: Option<String>,

    /// Server TCP control port
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Server UDP media port
    #[arg(long)]
    udp_port: Option<u16>,

    /// Camera index for the frame source
    #[arg(long)]
    camera: Option<u32>,

    /// Simulated packet loss in percent (0-100)
    #[arg(long)]
    drop_rate: Option<f64>,

    /// Display name
    #[arg(long)]
    name: Option<String>,

    /// Create a new meeting and host it
    #[arg(long, action, conflicts_with = "join")]
    create: bool,

    /// Join an existing meeting by code
    #[arg(long)]
    join: Option<String>,

    /// Admit every join request without asking (headless hosting)
    #[arg(long, action)]
    auto_admit: bool,

    /// Verbose logging
    #[arg(short, long, action)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::new()
        .parse_filters(&format!("huddle={}", log_level))
        .init();

    info!("huddle-client v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(server) = args.server {
        config.client.server = server;
    }
    if let Some(port) = args.tcp_port {
        config.client.tcp_port = port;
    }
    if let Some(port) = args.udp_port {
        config.client.udp_port = port;
    }
    if let Some(camera) = args.camera {
        config.client.camera = camera;
    }
    if let Some(rate) = args.drop_rate {
        config.client.drop_rate = rate;
    }
    if let Some(name) = args.name {
        config.client.name = name;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }
    if !args.create && args.join.is_none() {
        eprintln!("Pass --create to host a meeting or --join <code> to join one");
        std::process::exit(1);
    }

    // The camera index seeds the synthetic pattern so two headless
    // clients produce distinct streams
    let bindings = MediaBindings {
        frame_source: Box::new(TestPatternSource::new(640, 480, config.client.camera)),
        audio_source: Box::new(SilenceSource),
        frame_sink: None,
        audio_sink: Box::new(NullAudioSink),
    };
    let (mut session, events) = ClientSession::new(config.client.clone(), bindings);

    if let Err(e) = session.connect() {
        eprintln!("Failed to connect: {}", e);
        std::process::exit(1);
    }

    let handle = match session.handle() {
        Ok(h) => h,
        Err(e) => {
            eprintln!("Failed to obtain session handle: {}", e);
            std::process::exit(1);
        }
    };
    let auto_admit = args.auto_admit;
    std::thread::Builder::new()
        .name("event-log".into())
        .spawn(move || {
            for event in events {
                if auto_admit {
                    if let ClientEvent::JoinRequest { client_name } = &event {
                        info!("auto-admitting {:?}", client_name);
                        if let Err(e) = handle.allow_join(client_name) {
                            warn!("auto-admit failed: {}", e);
                        }
                    }
                }
                report(event);
            }
        })
        .expect("spawn event thread");

    let result = if let Some(code) = &args.join {
        session.join_meeting(code)
    } else {
        session.create_meeting().map(|code| {
            println!("Meeting code: {}", code);
        })
    };
    if let Err(e) = result {
        eprintln!("Failed to enter meeting: {}", e);
        std::process::exit(1);
    }

    session.run();
    info!("session ended");
}

fn report(event: ClientEvent) {
    match event {
        ClientEvent::StateChanged(state) => info!("state: {}", state),
        ClientEvent::MeetingCreated { code } => info!("meeting created: {}", code),
        ClientEvent::JoinRequest { client_name } => {
            info!("join request from {:?} (host UI decides)", client_name)
        }
        ClientEvent::ParticipantJoined { name, is_host } => {
            info!("participant joined: {:?} (host: {})", name, is_host)
        }
        ClientEvent::ParticipantLeft { name, is_host } => {
            info!("participant left: {:?} (host: {})", name, is_host)
        }
        ClientEvent::Chat {
            sender,
            message,
            is_private,
        } => {
            let tag = if is_private { " (private)" } else { "" };
            info!("chat{} {:?}: {}", tag, sender, message)
        }
        ClientEvent::CameraStatus {
            participant,
            enabled,
        } => info!("camera of {:?}: {}", participant, enabled),
        ClientEvent::QualityChanged { tier } => info!("quality -> {}", tier),
        ClientEvent::StatsUpdated(stats) => info!(
            "loss {:.1}% | jitter {:.1} ms | rtt {:.0} ms | send {:.1} fps | recv {:.1} fps | {:.0} kbps | {}",
            stats.loss_pct,
            stats.jitter_ms,
            stats.rtt_ms,
            stats.fps_sent,
            stats.fps_received,
            stats.bitrate_kbps,
            stats.tier
        ),
        ClientEvent::FileIncoming {
            sender,
            filename,
            filesize,
        } => info!("incoming file {:?} from {:?} ({} bytes)", filename, sender, filesize),
        ClientEvent::FileProgress {
            filename,
            bytes_done,
            total,
        } => info!("file {:?}: {}/{} bytes", filename, bytes_done, total),
        ClientEvent::FileComplete {
            filename,
            checksum_ok,
        } => {
            if checksum_ok {
                info!("file {:?} received, checksum OK", filename)
            } else {
                warn!("file {:?} received, checksum MISMATCH (file kept)", filename)
            }
        }
        ClientEvent::DuplicateName { name } => {
            warn!("display name {:?} is duplicated in this meeting", name)
        }
        ClientEvent::TransportError(message) => warn!("transport: {}", message),
    }
}
