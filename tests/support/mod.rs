//! Shared test harness: a lossy UDP relay (spec §8 scenario 2 — "inject a
//! UDP wrapper that drops roughly 10% of datagrams"). Not part of the
//! crate itself; only used by the integration tests in this directory.

use std::net::SocketAddr;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Binds a relay socket that forwards datagrams to/from `target`, dropping
/// each one independently with probability `drop_rate`. Acts as a
/// single-client NAT: the first peer address seen becomes "the client" and
/// is remembered for the reverse direction.
pub async fn spawn_lossy_relay(target: SocketAddr, drop_rate: f64, seed: u64) -> (SocketAddr, JoinHandle<()>) {
    let relay = UdpSocket::bind("127.0.0.1:0").await.expect("bind relay socket");
    let relay_addr = relay.local_addr().expect("relay local_addr");
    let relay = Arc::new(relay);
    let client_addr: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

    let handle = tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, from) = match relay.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };

            if rng.gen_bool(drop_rate) {
                continue;
            }

            if from == target {
                if let Some(client) = *client_addr.lock().await {
                    let _ = relay.send_to(&buf[..n], client).await;
                }
            } else {
                *client_addr.lock().await = Some(from);
                let _ = relay.send_to(&buf[..n], target).await;
            }
        }
    });

    (relay_addr, handle)
}
