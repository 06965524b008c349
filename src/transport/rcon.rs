use crate::config::RconConfig;
use crate::error::{Error, Result};
use crate::transport::packet::{
    self, PacketBuffer, RconPacket, SERVERDATA_EXECCOMMAND, SERVERDATA_RESPONSE_VALUE,
};
use crate::transport::pending::PendingRequests;
use crate::transport::{RconState, Transport};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// Highest id handed out before the counter wraps back to 1.
const MAX_REQUEST_ID: i32 = i32::MAX - 1;
const READ_CHUNK: usize = 4096;

/// Live socket of a connected client.
struct Connection {
    /// Distinguishes this socket from later ones in the same slot
    generation: u64,
    writer: OwnedWriteHalf,
    reader_task: JoinHandle<()>,
}

type ConnectionSlot = Arc<Mutex<Option<Connection>>>;

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// RconClient provides command access to a game server over Source RCON.
///
/// One client owns one TCP connection. Requests are correlated with
/// responses by id, so any number of tasks may call [`send`](Self::send)
/// concurrently through a shared reference.
///
/// # Example
///
/// ```no_run
/// use valheim_runner::config::RconConfig;
/// use valheim_runner::transport::{RconClient, Transport};
///
/// # async fn run() -> valheim_runner::Result<()> {
/// let client = RconClient::new(RconConfig::new("127.0.0.1", 2458, "secret"));
/// client.connect().await?;
/// let players = client.send("players").await?;
/// println!("{}", players);
/// client.disconnect().await?;
/// # Ok(())
/// # }
/// ```
pub struct RconClient {
    /// Connection parameters
    config: RconConfig,
    /// Current state, observable by subscribers
    state_tx: watch::Sender<RconState>,
    /// Requests waiting for a response
    pending: PendingRequests,
    /// Socket, present while connected
    connection: ConnectionSlot,
    /// Generation handed to the next socket
    generation: AtomicU64,
    /// Next request id
    next_id: AtomicI32,
}

impl RconClient {
    pub fn new(config: RconConfig) -> Self {
        let (state_tx, _) = watch::channel(RconState::Disconnected);
        Self {
            config,
            state_tx,
            pending: PendingRequests::new(),
            connection: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
            next_id: AtomicI32::new(1),
        }
    }

    pub fn config(&self) -> &RconConfig {
        &self.config
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<RconState> {
        self.state_tx.subscribe()
    }

    /// Number of requests waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn set_state(&self, state: RconState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(address = %self.config.address(), %state, "RCON state changed");
        }
    }

    /// Allocate the next request id: 1, 2, ... wrapping before `i32::MAX`.
    fn next_id(&self) -> i32 {
        let mut current = self.next_id.load(Ordering::Relaxed);
        loop {
            let next = if current >= MAX_REQUEST_ID { 1 } else { current + 1 };
            match self.next_id.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }

    #[tracing::instrument(skip(self), fields(address = %self.config.address()))]
    async fn open(&self) -> Result<()> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() && self.state() == RconState::Connected {
            return Ok(());
        }
        // Leftovers of a connection the server closed.
        connection.take();

        self.set_state(RconState::Connecting);
        let stream = match self.open_socket().await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        self.set_state(RconState::Authenticating);
        let (mut reader, mut writer) = stream.into_split();
        let mut buffer = PacketBuffer::new();
        if let Err(e) = self.authenticate(&mut reader, &mut writer, &mut buffer).await {
            let _ = writer.shutdown().await;
            self.fail(&e);
            return Err(e);
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let reader_task = tokio::spawn(read_loop(
            reader,
            buffer,
            ReaderContext {
                pending: self.pending.clone(),
                state_tx: self.state_tx.clone(),
                connection: Arc::clone(&self.connection),
                generation,
            },
        ));
        *connection = Some(Connection {
            generation,
            writer,
            reader_task,
        });

        self.set_state(RconState::Connected);
        tracing::info!("RCON connected");
        Ok(())
    }

    async fn open_socket(&self) -> Result<TcpStream> {
        let address = self.config.address();
        match tokio::time::timeout(self.config.timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                Err(Error::ConnectionRefused(address))
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed(format!("{}: {}", address, e))),
            Err(_) => Err(Error::ConnectionFailed(format!(
                "{}: timed out after {:?}",
                address, self.config.timeout
            ))),
        }
    }

    /// Send the password and wait for the matching auth response.
    async fn authenticate(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
        buffer: &mut PacketBuffer,
    ) -> Result<()> {
        let auth_id = self.next_id();
        let bytes = RconPacket::auth(auth_id, self.config.password.clone()).encode()?;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("Failed to send auth: {}", e)))?;

        let response = tokio::time::timeout(
            self.config.timeout,
            read_auth_response(reader, buffer),
        )
        .await
        .map_err(|_| Error::Timeout("No authentication response".to_string()))??;

        if response.is_auth_failure() || response.id != auth_id {
            tracing::warn!(sent = auth_id, received = response.id, "RCON authentication rejected");
            return Err(Error::AuthFailed);
        }
        Ok(())
    }

    /// Move to `Error`, then tear down to `Disconnected`.
    fn fail(&self, error: &Error) {
        tracing::warn!(error = %error, code = error.code(), "RCON connection failed");
        self.set_state(RconState::Error);
        self.pending.reject_all(error.clone());
        self.set_state(RconState::Disconnected);
    }

    async fn close(&self, reason: Error) {
        let connection = self.connection.lock().await.take();
        if let Some(mut connection) = connection {
            connection.reader_task.abort();
            let _ = connection.writer.shutdown().await;
            tracing::info!(address = %self.config.address(), "RCON disconnected");
        }
        let rejected = self.pending.reject_all(reason);
        if rejected > 0 {
            tracing::debug!(rejected, "Rejected pending RCON requests");
        }
        self.set_state(RconState::Disconnected);
    }

    #[tracing::instrument(skip(self), fields(address = %self.config.address()))]
    async fn execute(&self, command: &str) -> Result<String> {
        if self.state() != RconState::Connected {
            return Err(Error::Disconnected);
        }

        if command.len() > packet::MAX_BODY_LEN {
            return Err(Error::InvalidCommand(format!(
                "command is {} bytes, limit is {}",
                command.len(),
                packet::MAX_BODY_LEN
            )));
        }

        let id = self.next_id();
        let bytes = packet::encode(id, SERVERDATA_EXECCOMMAND, command)?;
        let response = self.pending.register(id);

        let written = {
            let mut connection = self.connection.lock().await;
            match connection.as_mut() {
                Some(connection) => connection.writer.write_all(&bytes).await,
                None => return Err(Error::Disconnected),
            }
        };
        if let Err(e) = written {
            tracing::warn!(error = %e, "RCON write failed");
            drop(response);
            self.close(Error::Disconnected).await;
            return Err(Error::Disconnected);
        }

        tracing::debug!(id, "Sent RCON command");
        response.wait(self.config.timeout).await
    }
}

#[async_trait]
impl Transport for RconClient {
    async fn connect(&self) -> Result<()> {
        self.open().await
    }

    async fn send(&self, command: &str) -> Result<String> {
        self.execute(command).await
    }

    async fn disconnect(&self) -> Result<()> {
        self.close(Error::Disconnected).await;
        Ok(())
    }

    fn state(&self) -> RconState {
        *self.state_tx.borrow()
    }
}

/// Read until an auth response arrives, skipping the empty
/// `RESPONSE_VALUE` some servers send first. A `-1` id ends the wait
/// whatever the packet type.
async fn read_auth_response(
    reader: &mut OwnedReadHalf,
    buffer: &mut PacketBuffer,
) -> Result<RconPacket> {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        while let Some(packet) = buffer.next_packet()? {
            let preamble = packet.kind == SERVERDATA_RESPONSE_VALUE && packet.body.is_empty();
            if packet.is_auth_failure() || !preamble {
                return Ok(packet);
            }
            tracing::trace!(id = packet.id, "Skipping empty response before auth response");
        }

        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("Failed to read auth response: {}", e)))?;
        if n == 0 {
            return Err(Error::Disconnected);
        }
        buffer.extend(&chunk[..n]);
    }
}

/// What the read task needs to route responses and tear down its socket.
struct ReaderContext {
    pending: PendingRequests,
    state_tx: watch::Sender<RconState>,
    connection: ConnectionSlot,
    generation: u64,
}

/// Background task: route responses to their requests until the socket
/// closes or the stream turns out to be corrupt.
async fn read_loop(mut reader: OwnedReadHalf, mut buffer: PacketBuffer, context: ReaderContext) {
    let ReaderContext {
        pending,
        state_tx,
        connection,
        generation,
    } = context;
    let mut chunk = vec![0u8; READ_CHUNK];

    let reason = 'read: loop {
        loop {
            match buffer.next_packet() {
                Ok(Some(packet)) => dispatch(&pending, packet),
                Ok(None) => break,
                Err(e) => break 'read e,
            }
        }

        match reader.read(&mut chunk).await {
            Ok(0) => break Error::Disconnected,
            Ok(n) => buffer.extend(&chunk[..n]),
            Err(e) => {
                tracing::debug!(error = %e, "RCON read failed");
                break Error::Disconnected;
            }
        }
    };

    if matches!(reason, Error::Protocol(_)) {
        tracing::error!(error = %reason, "Corrupt RCON stream, dropping connection");
        state_tx.send_replace(RconState::Error);
    } else {
        tracing::info!("RCON connection closed by server");
    }

    // Release the write half unless a newer socket already replaced it.
    // Dropping the connection aborts this task, so nothing below may await.
    let stale = {
        let mut slot = connection.lock().await;
        if slot.as_ref().is_some_and(|c| c.generation == generation) {
            slot.take()
        } else {
            None
        }
    };
    drop(stale);
    drop(reader);

    buffer.clear();
    pending.reject_all(reason);
    state_tx.send_replace(RconState::Disconnected);
}

fn dispatch(pending: &PendingRequests, packet: RconPacket) {
    if packet.kind != SERVERDATA_RESPONSE_VALUE {
        tracing::debug!(id = packet.id, kind = packet.kind, "Ignoring unexpected RCON packet");
        return;
    }
    if !pending.complete(packet.id, Ok(packet.body)) {
        tracing::debug!(id = packet.id, "Response for unknown or expired request");
    }
}
