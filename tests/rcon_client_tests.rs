//! RconClient tests against an in-process fake RCON server.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use valheim_runner::config::RconConfig;
use valheim_runner::error::{Error, Result};
use valheim_runner::transport::packet::{
    self, AUTH_FAILED_ID, SERVERDATA_AUTH, SERVERDATA_AUTH_RESPONSE, SERVERDATA_EXECCOMMAND,
    SERVERDATA_RESPONSE_VALUE,
};
use valheim_runner::transport::{PacketBuffer, RconClient, RconPacket, RconState, Transport};

const PASSWORD: &str = "rconpass";

async fn read_packet(stream: &mut TcpStream, buffer: &mut PacketBuffer) -> Option<RconPacket> {
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(packet) = buffer.next_packet().expect("client sent a valid packet") {
            return Some(packet);
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buffer.extend(&chunk[..n]);
    }
}

async fn write_packet(stream: &mut TcpStream, id: i32, kind: i32, body: &str) {
    let bytes = packet::encode(id, kind, body).expect("encode");
    stream.write_all(&bytes).await.expect("write");
}

/// Accept one client and answer its auth request, echoing the id when the
/// password matches.
async fn accept_and_auth(listener: &TcpListener) -> (TcpStream, PacketBuffer) {
    let (mut stream, _) = listener.accept().await.expect("accept");
    let mut buffer = PacketBuffer::new();

    let auth = read_packet(&mut stream, &mut buffer).await.expect("auth packet");
    assert_eq!(auth.kind, SERVERDATA_AUTH);

    // Real servers send an empty RESPONSE_VALUE ahead of the auth response
    write_packet(&mut stream, auth.id, SERVERDATA_RESPONSE_VALUE, "").await;
    let id = if auth.body == PASSWORD { auth.id } else { AUTH_FAILED_ID };
    write_packet(&mut stream, id, SERVERDATA_AUTH_RESPONSE, "").await;

    (stream, buffer)
}

/// Accept one client and answer its auth request with a fixed reply.
async fn accept_and_reply(listener: &TcpListener, reply: impl Fn(i32) -> (i32, i32)) -> TcpStream {
    let (mut stream, _) = listener.accept().await.expect("accept");
    let mut buffer = PacketBuffer::new();
    let auth = read_packet(&mut stream, &mut buffer).await.expect("auth packet");
    let (id, kind) = reply(auth.id);
    write_packet(&mut stream, id, kind, "").await;
    stream
}

async fn bind() -> (TcpListener, RconConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let mut config = RconConfig::new("127.0.0.1", port, PASSWORD);
    config.timeout = Duration::from_secs(2);
    (listener, config)
}

async fn wait_for_state(client: &RconClient, state: RconState) {
    let mut rx = client.subscribe();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|current| *current == state))
        .await
        .expect("state change timed out")
        .expect("client dropped");
}

#[tokio::test]
async fn test_connect_and_send_command() -> Result<()> {
    let (listener, config) = bind().await;

    let server = tokio::spawn(async move {
        let (mut stream, mut buffer) = accept_and_auth(&listener).await;
        let request = read_packet(&mut stream, &mut buffer).await.expect("command");
        assert_eq!(request.kind, SERVERDATA_EXECCOMMAND);
        assert_eq!(request.body, "players");
        write_packet(
            &mut stream,
            request.id,
            SERVERDATA_RESPONSE_VALUE,
            "Online players (1):\n- Ragnar",
        )
        .await;
        // Hold the socket until the client hangs up
        let _ = read_packet(&mut stream, &mut buffer).await;
    });

    let client = RconClient::new(config);
    client.connect().await?;
    assert_eq!(client.state(), RconState::Connected);
    assert!(client.is_connected());

    let response = client.send("players").await?;
    assert_eq!(response, "Online players (1):\n- Ragnar");
    assert_eq!(client.pending_count(), 0);

    client.disconnect().await?;
    assert_eq!(client.state(), RconState::Disconnected);

    server.await.expect("server task");
    Ok(())
}

#[tokio::test]
async fn test_wrong_password_fails_authentication() {
    let (listener, mut config) = bind().await;
    config.password = "not the password".to_string();

    tokio::spawn(async move {
        let (mut stream, mut buffer) = accept_and_auth(&listener).await;
        let _ = read_packet(&mut stream, &mut buffer).await;
    });

    let client = RconClient::new(config);
    let result = client.connect().await;

    assert_eq!(result, Err(Error::AuthFailed));
    assert_eq!(client.state(), RconState::Disconnected);
}

#[tokio::test]
async fn test_rejection_as_plain_response_fails_authentication() {
    let (listener, mut config) = bind().await;
    config.timeout = Duration::from_millis(500);

    tokio::spawn(async move {
        let mut stream =
            accept_and_reply(&listener, |_| (AUTH_FAILED_ID, SERVERDATA_RESPONSE_VALUE)).await;
        let _ = stream.read(&mut [0u8; 16]).await;
    });

    let client = RconClient::new(config);
    let result = client.connect().await;

    assert_eq!(result, Err(Error::AuthFailed));
    assert_eq!(client.state(), RconState::Disconnected);
}

#[tokio::test]
async fn test_auth_response_for_another_id_fails_authentication() {
    let (listener, config) = bind().await;

    tokio::spawn(async move {
        let mut stream = accept_and_reply(&listener, |id| (id + 1, SERVERDATA_AUTH_RESPONSE)).await;
        let _ = stream.read(&mut [0u8; 16]).await;
    });

    let client = RconClient::new(config);
    let result = client.connect().await;

    assert_eq!(result, Err(Error::AuthFailed));
    assert_eq!(client.state(), RconState::Disconnected);
}

#[tokio::test]
async fn test_connection_refused() {
    let (listener, config) = bind().await;
    drop(listener);

    let client = RconClient::new(config);
    let result = client.connect().await;

    assert!(matches!(result, Err(Error::ConnectionRefused(_))));
    assert_eq!(client.state(), RconState::Disconnected);
}

#[tokio::test]
async fn test_responses_matched_by_id() -> Result<()> {
    let (listener, config) = bind().await;

    tokio::spawn(async move {
        let (mut stream, mut buffer) = accept_and_auth(&listener).await;
        let first = read_packet(&mut stream, &mut buffer).await.expect("first");
        let second = read_packet(&mut stream, &mut buffer).await.expect("second");

        // Answer in reverse order
        for request in [second, first] {
            let body = format!("reply to {}", request.body);
            write_packet(&mut stream, request.id, SERVERDATA_RESPONSE_VALUE, &body).await;
        }
        let _ = read_packet(&mut stream, &mut buffer).await;
    });

    let client = RconClient::new(config);
    client.connect().await?;

    let (save, banned) = tokio::join!(client.send("save"), client.send("banned"));
    assert_eq!(save?, "reply to save");
    assert_eq!(banned?, "reply to banned");

    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_unanswered_command_times_out() -> Result<()> {
    let (listener, mut config) = bind().await;
    config.timeout = Duration::from_millis(200);

    tokio::spawn(async move {
        let (mut stream, mut buffer) = accept_and_auth(&listener).await;
        // Swallow everything without replying
        while read_packet(&mut stream, &mut buffer).await.is_some() {}
    });

    let client = RconClient::new(config);
    client.connect().await?;

    let result = client.send("save").await;
    assert!(matches!(result, Err(Error::Timeout(_))));
    assert_eq!(client.pending_count(), 0);

    // The connection itself is still usable
    assert!(client.is_connected());
    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_server_close_rejects_pending_requests() -> Result<()> {
    let (listener, config) = bind().await;

    tokio::spawn(async move {
        let (mut stream, mut buffer) = accept_and_auth(&listener).await;
        let _ = read_packet(&mut stream, &mut buffer).await;
        drop(stream);
    });

    let client = RconClient::new(config);
    client.connect().await?;

    let result = client.send("save").await;
    assert_eq!(result, Err(Error::Disconnected));
    wait_for_state(&client, RconState::Disconnected).await;

    // Later commands fail fast
    assert_eq!(client.send("save").await, Err(Error::Disconnected));
    Ok(())
}

#[tokio::test]
async fn test_corrupt_stream_is_a_protocol_error() -> Result<()> {
    let (listener, config) = bind().await;

    let server = tokio::spawn(async move {
        let (mut stream, mut buffer) = accept_and_auth(&listener).await;
        let _ = read_packet(&mut stream, &mut buffer).await;
        // A size field below the 10-byte minimum
        stream
            .write_all(&[5, 0, 0, 0, 1, 2, 3, 4, 5])
            .await
            .expect("write");

        // The client hangs up on its own
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest))
            .await
            .expect("client kept the socket open")
            .expect("read");
    });

    let client = RconClient::new(config);
    client.connect().await?;

    let result = client.send("save").await;
    assert!(matches!(result, Err(Error::Protocol(_))));
    wait_for_state(&client, RconState::Disconnected).await;

    server.await.expect("server task");
    Ok(())
}

#[tokio::test]
async fn test_oversized_command_keeps_connection() -> Result<()> {
    let (listener, config) = bind().await;

    tokio::spawn(async move {
        let (mut stream, mut buffer) = accept_and_auth(&listener).await;
        let request = read_packet(&mut stream, &mut buffer).await.expect("command");
        assert_eq!(request.body, "save");
        write_packet(&mut stream, request.id, SERVERDATA_RESPONSE_VALUE, "World saved").await;
        let _ = read_packet(&mut stream, &mut buffer).await;
    });

    let client = RconClient::new(config);
    client.connect().await?;

    let long = format!("say {}", "x".repeat(packet::MAX_BODY_LEN));
    let result = client.send(&long).await;
    assert!(matches!(result, Err(Error::InvalidCommand(_))));
    assert!(!result.unwrap_err().is_connection_loss());
    assert_eq!(client.pending_count(), 0);

    assert!(client.is_connected());
    assert_eq!(client.send("save").await?, "World saved");
    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_reconnect_after_server_close() -> Result<()> {
    let (listener, config) = bind().await;

    tokio::spawn(async move {
        // First connection is closed right after auth
        let (stream, _) = accept_and_auth(&listener).await;
        drop(stream);

        let (mut stream, mut buffer) = accept_and_auth(&listener).await;
        let request = read_packet(&mut stream, &mut buffer).await.expect("command");
        write_packet(&mut stream, request.id, SERVERDATA_RESPONSE_VALUE, "World saved").await;
        let _ = read_packet(&mut stream, &mut buffer).await;
    });

    let client = RconClient::new(config);
    client.connect().await?;
    wait_for_state(&client, RconState::Disconnected).await;

    client.connect().await?;
    assert_eq!(client.send("save").await?, "World saved");
    client.disconnect().await?;
    Ok(())
}
