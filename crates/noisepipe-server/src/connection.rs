//! Per-slot connection handler.
//!
//! Every slot in the pool runs one handler. A handler serves at most one
//! client at a time and walks a fixed cycle:
//!
//! ```text
//! Connecting --accept--> Reading --header--> Writing --reply--> Reading
//!      ^                    |                   |
//!      +---- EOF / error ---+---- error / protocol violation
//! ```
//!
//! When every slot is busy, further clients wait in the listen backlog until a
//! slot returns to `Connecting`.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use noisepipe_core::Error;

use crate::arbiter::DeviceRequest;
use crate::protocol::{Command, HEADER_LEN, RequestHeader, encode_reply, server_version};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for a client.
    Connecting,
    /// Waiting for the next request header.
    Reading,
    /// Sending a reply.
    Writing,
}

pub struct ConnectionHandler {
    slot: usize,
    listener: Arc<UnixListener>,
    device: mpsc::Sender<DeviceRequest>,
    stream: Option<UnixStream>,
    state: ConnectionState,
    request: [u8; HEADER_LEN],
    reply: Vec<u8>,
    close_after_write: bool,
    conn_id: Uuid,
    served: u64,
}

impl ConnectionHandler {
    pub fn new(slot: usize, listener: Arc<UnixListener>, device: mpsc::Sender<DeviceRequest>) -> Self {
        Self {
            slot,
            listener,
            device,
            stream: None,
            state: ConnectionState::Connecting,
            request: [0; HEADER_LEN],
            reply: Vec::new(),
            close_after_write: false,
            conn_id: Uuid::nil(),
            served: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Drive the state machine until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender also means shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                () = self.step() => {}
            }
        }
        if self.stream.is_some() {
            debug!("slot {}: closing {} on shutdown", self.slot, self.conn_id);
        }
    }

    async fn step(&mut self) {
        match self.state {
            ConnectionState::Connecting => self.accept().await,
            ConnectionState::Reading => self.read_request().await,
            ConnectionState::Writing => self.write_reply().await,
        }
    }

    async fn accept(&mut self) {
        match self.listener.accept().await {
            Ok((stream, _)) => {
                self.conn_id = Uuid::new_v4();
                self.served = 0;
                self.close_after_write = false;
                self.stream = Some(stream);
                self.state = ConnectionState::Reading;
                info!("slot {}: client {} connected", self.slot, self.conn_id);
            }
            Err(e) => {
                warn!("slot {}: accept failed: {e}", self.slot);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    async fn read_request(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            self.reset();
            return;
        };
        let read = stream.read_exact(&mut self.request).await;
        match read {
            Ok(_) => {
                let header = RequestHeader::decode(&self.request);
                self.reply = self.dispatch(header).await;
                self.state = ConnectionState::Writing;
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("slot {}: client {} disconnected", self.slot, self.conn_id);
                self.reset();
            }
            Err(e) => {
                warn!("slot {}: read from {} failed: {e}", self.slot, self.conn_id);
                self.reset();
            }
        }
    }

    async fn write_reply(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            self.reset();
            return;
        };
        let written = stream.write_all(&self.reply).await;
        if let Err(e) = written {
            debug!("slot {}: write to {} failed: {e}", self.slot, self.conn_id);
            self.reset();
            return;
        }
        self.served += 1;
        if self.close_after_write {
            self.reset();
        } else {
            self.state = ConnectionState::Reading;
        }
    }

    /// Build the full reply for one request header.
    async fn dispatch(&mut self, header: RequestHeader) -> Vec<u8> {
        let command = match Command::parse(header) {
            Ok(command) => command,
            Err(e) => {
                warn!("slot {}: client {}: {e}", self.slot, self.conn_id);
                self.close_after_write = true;
                return encode_reply(&Err(e));
            }
        };
        let result = match command {
            Command::ServerMajorVersion => Ok(server_version().0.to_le_bytes().to_vec()),
            Command::ServerMinorVersion => Ok(server_version().1.to_le_bytes().to_vec()),
            _ => self.forward(command).await,
        };
        debug!(
            "slot {}: client {} {command:?} -> {}",
            self.slot,
            self.conn_id,
            if result.is_ok() { "ok" } else { "error" }
        );
        encode_reply(&result)
    }

    async fn forward(&self, command: Command) -> Result<Vec<u8>, Error> {
        let (reply, response) = oneshot::channel();
        self.device
            .send(DeviceRequest { command, reply })
            .await
            .map_err(|_| Error::NotFound("device arbiter has stopped".into()))?;
        response
            .await
            .map_err(|_| Error::NotFound("device arbiter dropped the request".into()))?
    }

    fn reset(&mut self) {
        if self.stream.take().is_some() {
            debug!(
                "slot {}: released {} after {} replies",
                self.slot, self.conn_id, self.served
            );
        }
        self.reply.clear();
        self.close_after_write = false;
        self.state = ConnectionState::Connecting;
    }
}
