use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use tether::{AuthorityHost, NetEvent, Packet, Reliability, Runtime};

const SERVICE_TIMEOUT: Duration = Duration::from_millis(16);

#[derive(Parser)]
#[command(name = "tether-server")]
#[command(about = "Authority host relaying position updates to every peer")]
struct Args {
    #[arg(short, long, default_value_t = 7777)]
    port: u16,

    #[arg(short, long, default_value_t = 32)]
    max_peers: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let _runtime = Runtime::init();
    let mut host = AuthorityHost::bind(args.port, args.max_peers)
        .with_context(|| format!("failed to start on port {}", args.port))?;
    log::info!("serving on {}", host.local_addr());

    loop {
        for event in host.service(SERVICE_TIMEOUT) {
            match event {
                NetEvent::Connect { peer } => {
                    log::info!("peer {} joined ({} online)", peer, host.connected_count());
                }
                NetEvent::Disconnect { peer } => {
                    log::info!("peer {} left ({} online)", peer, host.connected_count());
                }
                NetEvent::Receive { peer, mut packet } => {
                    let (Ok(x), Ok(y)) = (packet.read::<f32>(), packet.read::<f32>()) else {
                        log::warn!("malformed position update from peer {}", peer);
                        continue;
                    };

                    let mut update = Packet::new();
                    update.append(peer);
                    update.append(x);
                    update.append(y);
                    if let Err(e) = host.broadcast(&update, Reliability::Unreliable, 0) {
                        log::warn!("broadcast failed: {}", e);
                    }
                }
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
