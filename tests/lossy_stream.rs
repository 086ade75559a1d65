//! Large-stream transfer over a deliberately lossy path (spec §8 scenario
//! 2): KCP's ARQ layer must recover full, in-order delivery despite ~10%
//! datagram loss in both directions.

mod support;

use kcp_socket::{KcpConfig, KcpListener, KcpStream};

#[tokio::test]
async fn large_stream_survives_ten_percent_loss() {
    let _ = env_logger::try_init();

    let mut config = KcpConfig::default();
    config.mode = kcp_socket::Mode::Ethernet;

    let listener = KcpListener::bind(config.clone(), "127.0.0.1:0".parse().unwrap(), 4)
        .await
        .expect("listener bind");
    let server_addr = listener.local_addr().expect("listener local_addr");

    let (relay_addr, _relay) = support::spawn_lossy_relay(server_addr, 0.10, 42).await;

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
    let expected = payload.clone();

    let server = tokio::spawn(async move {
        let (stream, _peer) = listener.accept().await.expect("accept");
        let mut received = vec![0u8; expected.len()];
        stream.recvall(&mut received).await.expect("server recv full stream");
        assert_eq!(received, expected, "stream payload must survive lossy relay intact");
    });

    let client = KcpStream::connect(&config, relay_addr).await.expect("client connect via relay");
    client.sendall(&payload).await.expect("client send full stream");

    server.await.expect("server task");
    client.close(false).await.expect("client close");
}
