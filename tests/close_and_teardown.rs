//! Graceful close ordering and idle-teardown semantics (spec §8 scenarios
//! 3 and 5, and spec §4.3/§4.4).

use std::time::Duration;

use kcp_socket::{KcpConfig, KcpListener, KcpSocketError, KcpStream};

#[tokio::test]
async fn graceful_close_delivers_pending_bytes_before_remote_sees_close() {
    let _ = env_logger::try_init();

    let mut config = KcpConfig::default();
    config.mode = kcp_socket::Mode::Loopback;

    let listener = KcpListener::bind(config.clone(), "127.0.0.1:0".parse().unwrap(), 4)
        .await
        .expect("listener bind");
    let server_addr = listener.local_addr().expect("listener local_addr");

    const MSG: &[u8] = b"final message before close";

    let server = tokio::spawn(async move {
        let (stream, _peer) = listener.accept().await.expect("accept");

        let mut buf = [0u8; MSG.len()];
        stream.recvall(&mut buf).await.expect("server must receive the pre-close payload");
        assert_eq!(&buf, MSG);

        // The CLOSE envelope follows the data; the next recv observes it.
        let mut tail = [0u8; 1];
        let err = stream.recvall(&mut tail).await.expect_err("recv after peer CLOSE must fail");
        assert!(matches!(err, KcpSocketError::RemoteHostClosed));
    });

    let client = KcpStream::connect(&config, server_addr).await.expect("client connect");
    client.sendall(MSG).await.expect("client send before close");
    client.close(false).await.expect("graceful close");

    server.await.expect("server task");
}

#[tokio::test]
async fn idle_session_tears_down_within_configured_window() {
    let _ = env_logger::try_init();

    let mut config = KcpConfig::default();
    config.mode = kcp_socket::Mode::Loopback;
    config.session_expire = Duration::from_millis(300);
    config.keepalive_interval = Duration::from_millis(50);

    let listener = KcpListener::bind(config.clone(), "127.0.0.1:0".parse().unwrap(), 4)
        .await
        .expect("listener bind");
    let server_addr = listener.local_addr().expect("listener local_addr");

    let server = tokio::spawn(async move {
        let (stream, _peer) = listener.accept().await.expect("accept");

        let mut initial = [0u8; 1];
        stream.recvall(&mut initial).await.expect("initial handshake byte");

        let mut buf = [0u8; 1];
        let result = tokio::time::timeout(Duration::from_secs(2), stream.recv(&mut buf)).await;
        let err = result.expect("teardown must happen well before the test timeout").expect_err("recv must observe idle teardown");
        assert!(matches!(err, KcpSocketError::NetworkTimeout));
    });

    // Establish the session, then drop the client outright: no further
    // datagrams (including keepalives) will ever reach the server side.
    let client = KcpStream::connect(&config, server_addr).await.expect("client connect");
    client.sendall(b"x").await.expect("initial handshake data");
    drop(client);

    server.await.expect("server task");
}
