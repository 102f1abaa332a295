use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use tether::{NetEvent, Packet, PeerHost, Reliability, Runtime};

const TICK: Duration = Duration::from_millis(16);

#[derive(Parser)]
#[command(name = "tether-client")]
#[command(about = "Peer host streaming a position to an authority")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, default_value_t = 7777)]
    port: u16,

    #[arg(long, default_value_t = 5)]
    connect_timeout_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let _runtime = Runtime::init();
    let mut host = PeerHost::connect(
        &args.host,
        args.port,
        Duration::from_secs(args.connect_timeout_secs),
    )
    .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;

    // synthetic movement standing in for the input layer
    let mut angle = 0.0f32;

    loop {
        angle += 0.02;
        let x = 400.0 + angle.cos() * 120.0;
        let y = 300.0 + angle.sin() * 120.0;

        let mut update = Packet::new();
        update.append(x);
        update.append(y);
        if let Err(e) = host.send(&update, Reliability::Unreliable, 0) {
            log::warn!("send failed: {}", e);
        }

        for event in host.service(Duration::ZERO) {
            match event {
                NetEvent::Receive { mut packet, .. } => {
                    let reading = (
                        packet.read::<u32>(),
                        packet.read::<f32>(),
                        packet.read::<f32>(),
                    );
                    if let (Ok(sender), Ok(px), Ok(py)) = reading {
                        log::debug!("peer {} at ({:.1}, {:.1})", sender, px, py);
                    } else {
                        log::warn!("malformed broadcast update");
                    }
                }
                NetEvent::Disconnect { .. } => {
                    log::info!("connection closed by the authority");
                    return Ok(());
                }
                NetEvent::Connect { .. } => {}
            }
        }

        std::thread::sleep(TICK);
    }
}
