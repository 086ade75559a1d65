//! End-to-end echo test (spec §8 scenario 1): a client connects to a
//! listener, sends a message, the server echoes it back, both sides close.

use kcp_socket::{KcpConfig, KcpListener, KcpStream};

#[tokio::test]
async fn echo_roundtrip() {
    let _ = env_logger::try_init();

    let mut config = KcpConfig::default();
    config.mode = kcp_socket::Mode::Loopback;

    let listener = KcpListener::bind(config.clone(), "127.0.0.1:0".parse().unwrap(), 8)
        .await
        .expect("listener bind");
    let server_addr = listener.local_addr().expect("listener local_addr");

    const MSG: &[u8] = b"hello kcp";

    let server = tokio::spawn(async move {
        let (stream, _peer) = listener.accept().await.expect("accept");
        let mut buf = [0u8; MSG.len()];
        stream.recvall(&mut buf).await.expect("server recv");
        stream.sendall(&buf).await.expect("server echo");
    });

    let client = KcpStream::connect(&config, server_addr).await.expect("client connect");
    client.sendall(MSG).await.expect("client send");

    let mut buf = [0u8; MSG.len()];
    client.recvall(&mut buf).await.expect("client recv echo");
    assert_eq!(&buf, MSG);

    server.await.expect("server task");
    client.close(false).await.expect("client close");
}
