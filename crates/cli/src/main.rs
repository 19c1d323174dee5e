use clap::Parser;
use rtsp::{Server, ServerConfig};
use std::io;

#[derive(Parser)]
#[command(
    name = "rtsp-server",
    about = "Standalone RTSP server for H.264 streams"
)]
struct Args {
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8554")]
    bind: String,

    /// Require Digest authentication with this username (needs --password too)
    #[arg(long)]
    username: Option<String>,

    /// Digest authentication password, paired with --username
    #[arg(long)]
    password: Option<String>,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = ServerConfig::default();
    if let (Some(username), Some(password)) = (args.username, args.password) {
        config.credentials = Some((username, password));
    }

    let mut server = Server::with_config(&args.bind, config);

    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {}", e);
        return;
    }

    println!("RTSP server on {} — press Enter to stop", args.bind);
    let mut input = String::new();
    io::stdin().read_line(&mut input).unwrap();

    server.stop();
}
