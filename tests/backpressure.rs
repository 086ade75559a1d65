//! Backpressure / water-line scenario (spec §3, §4.3, §8 scenario 4): a
//! sender pushing far more than the outstanding-segment water line must
//! still complete once the peer drains it, rather than erroring or
//! deadlocking.

use kcp_socket::{KcpConfig, KcpListener, KcpStream};

#[tokio::test]
async fn large_send_past_water_line_completes_once_drained() {
    let _ = env_logger::try_init();

    let mut config = KcpConfig::default();
    config.mode = kcp_socket::Mode::Loopback;
    config.water_line = 4; // tiny, so a sizeable payload will clamp sending_queue_not_full.

    let listener = KcpListener::bind(config.clone(), "127.0.0.1:0".parse().unwrap(), 4)
        .await
        .expect("listener bind");
    let server_addr = listener.local_addr().expect("listener local_addr");

    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 256) as u8).collect();
    let expected = payload.clone();

    let server = tokio::spawn(async move {
        let (stream, _peer) = listener.accept().await.expect("accept");
        let mut received = vec![0u8; expected.len()];
        stream.recvall(&mut received).await.expect("server recv full stream");
        assert_eq!(received, expected);
    });

    let client = KcpStream::connect(&config, server_addr).await.expect("client connect");
    let sent = client.sendall(&payload).await.expect("sendall past the water line");
    assert_eq!(sent, payload.len());

    server.await.expect("server task");
    client.close(false).await.expect("client close");
}
