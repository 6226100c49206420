//! Two engines on loopback bouncing a counter back and forth.
//!
//! ```text
//! cargo run --example ping_pong -- 1000
//! ```

use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::info;
use quorum_io::{NetworkEngine, TransportConfig};

const GROUP: usize = 0;

fn engine(tx: mpsc::Sender<u64>) -> NetworkEngine {
    NetworkEngine::new(TransportConfig::default(), move |payload: &[u8]| {
        if let Ok(bytes) = <[u8; 8]>::try_from(payload) {
            let _ = tx.send(u64::from_be_bytes(bytes));
        }
    })
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let rounds: u64 = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("rounds must be a number")?,
        None => 100,
    };

    let (ping_tx, ping_rx) = mpsc::channel();
    let (pong_tx, pong_rx) = mpsc::channel();
    let mut ping = engine(ping_tx);
    let mut pong = engine(pong_tx);

    ping.init("127.0.0.1", 0, 2)?;
    pong.init("127.0.0.1", 0, 2)?;
    let ping_port = ping.local_addr().context("ping not listening")?.port();
    let pong_port = pong.local_addr().context("pong not listening")?.port();
    ping.start()?;
    pong.start()?;
    info!("ping on {}, pong on {}", ping_port, pong_port);

    let started = Instant::now();
    let timeout = Duration::from_secs(5);
    for n in 0..rounds {
        ping.add_message(GROUP, "127.0.0.1", pong_port, n.to_be_bytes().to_vec())?;
        let seen = pong_rx.recv_timeout(timeout).context("pong never heard ping")?;
        pong.add_message(GROUP, "127.0.0.1", ping_port, (seen + 1).to_be_bytes().to_vec())?;
        let back = ping_rx.recv_timeout(timeout).context("ping never heard pong")?;
        if back != n + 1 {
            bail!("round {}: expected {}, got {}", n, n + 1, back);
        }
    }

    let elapsed = started.elapsed();
    info!(
        "{} round trips in {:?} ({:?} each)",
        rounds,
        elapsed,
        elapsed / rounds.max(1) as u32
    );

    ping.stop();
    pong.stop();
    Ok(())
}
