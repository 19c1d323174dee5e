use clap::Parser;
use rtsp::client::{Client, ClientConfig, TransportMode};
use std::io;

#[derive(Parser)]
#[command(
    name = "rtsp-client",
    about = "Standalone RTSP client: connects, plays, and logs received access units"
)]
struct Args {
    /// RTSP URL to connect to (e.g. rtsp://camera.local:554/stream)
    url: String,

    /// Use interleaved TCP transport instead of UDP
    #[arg(long)]
    interleaved: bool,

    /// Digest username, if the server requires authentication
    #[arg(long)]
    username: Option<String>,

    /// Digest password, if the server requires authentication
    #[arg(long)]
    password: Option<String>,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = ClientConfig::default();
    if let (Some(username), Some(password)) = (args.username, args.password) {
        config.credentials = Some((username, password));
    }

    let client = match Client::connect(&args.url, config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to connect: {e}");
            return;
        }
    };

    if let Err(e) = client.options() {
        eprintln!("OPTIONS failed: {e}");
        return;
    }

    let sdp = match client.describe() {
        Ok(sdp) => sdp,
        Err(e) => {
            eprintln!("DESCRIBE failed: {e}");
            return;
        }
    };
    println!("Stream has {} track(s)", sdp.media.len());

    let mode = if args.interleaved { TransportMode::TcpInterleaved } else { TransportMode::Udp };
    for track in client.tracks() {
        if let Err(e) = client.setup(track.index, mode) {
            eprintln!("SETUP failed for track {}: {e}", track.index);
            return;
        }
    }

    client.on_access_unit(|track_index, au| {
        println!("track {track_index}: access unit, {} bytes, ts={}", au.data.len(), au.timestamp);
    });

    if let Err(e) = client.play(None) {
        eprintln!("PLAY failed: {e}");
        return;
    }

    println!("Playing {} — press Enter to stop", args.url);
    let mut input = String::new();
    io::stdin().read_line(&mut input).unwrap();

    let _ = client.teardown();
}
