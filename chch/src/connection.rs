//! Client side of a CHCH connection.
//!
//! A background reader task owns the socket's read half and splits the
//! inbound stream in two: command responses go to a response channel that
//! only the in-flight request reads from, while broadcasts go straight to the
//! broadcast sink handed back by [`Connection::connect`]. Neither consumer can
//! steal the other's lines.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::protocol::{
    Broadcast, ClientCommand, Frame, MAX_REPLY_LEN, Response, ServerLine, read_line, write_line,
};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to server")]
    Connect(#[source] std::io::Error),
    #[error("failed to send to server")]
    Send(#[source] std::io::Error),
    #[error("connection is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("connection closed while waiting for a response")]
    Closed,
}

pub struct Connection {
    writer: Mutex<OwnedWriteHalf>,
    responses: Mutex<mpsc::UnboundedReceiver<Response>>,
    reader: JoinHandle<()>,
    closed: AtomicBool,
}

impl Connection {
    pub async fn connect<A>(
        addr: A,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Broadcast>), ConnectionError>
    where
        A: ToSocketAddrs,
    {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(ConnectionError::Connect)?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> (Self, mpsc::UnboundedReceiver<Broadcast>) {
        let (reader, writer) = stream.into_split();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(BufReader::new(reader), response_tx, broadcast_tx));

        let connection = Self {
            writer: Mutex::new(writer),
            responses: Mutex::new(response_rx),
            reader,
            closed: AtomicBool::new(false),
        };
        (connection, broadcast_rx)
    }

    /// Writes one command line. Failures are returned, never raised.
    pub async fn send(&self, command: &ClientCommand) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let mut writer = self.writer.lock().await;
        write_line(&mut *writer, command)
            .await
            .map_err(ConnectionError::Send)
    }

    /// Waits for the next command response, or `None` on timeout or close.
    pub async fn wait_for_command_response(&self, wait: Duration) -> Option<Response> {
        let mut responses = self.responses.lock().await;
        timeout(wait, responses.recv()).await.ok().flatten()
    }

    /// Sends `command` and waits for the response that answers it.
    ///
    /// Requests are serialized, so at most one command is in flight. Replies
    /// left behind by an earlier timed-out request are discarded first.
    pub async fn request(
        &self,
        command: &ClientCommand,
        wait: Duration,
    ) -> Result<Response, RequestError> {
        let mut responses = self.responses.lock().await;
        while let Ok(stale) = responses.try_recv() {
            debug!(?stale, "discarding stale response");
        }

        self.send(command).await?;
        match timeout(wait, responses.recv()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(RequestError::Closed),
            Err(_) => Err(RequestError::Timeout(wait)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.reader.is_finished()
    }

    /// Stops the reader and shuts the socket down. A pending
    /// [`wait_for_command_response`](Self::wait_for_command_response) then
    /// returns `None`. Safe to call repeatedly.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reader.abort();
        let mut writer = self.writer.lock().await;
        if let Err(error) = writer.shutdown().await {
            debug!(?error, "failed to shutdown connection cleanly");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    responses: mpsc::UnboundedSender<Response>,
    broadcasts: mpsc::UnboundedSender<Broadcast>,
) {
    loop {
        match read_line(&mut reader, MAX_REPLY_LEN).await {
            Ok(Some(Frame::Oversized)) => warn!("skipping oversized line from server"),
            Ok(Some(Frame::Line(line))) => match ServerLine::parse(&line) {
                ServerLine::Response(response) => {
                    if responses.send(response).is_err() {
                        break;
                    }
                }
                ServerLine::Broadcast(broadcast) => {
                    if broadcasts.send(broadcast).is_err() {
                        debug!("broadcast receiver dropped");
                    }
                }
            },
            Ok(None) => {
                debug!("server closed the connection");
                break;
            }
            Err(error) => {
                warn!(?error, "failed to read from server");
                break;
            }
        }
    }
}
