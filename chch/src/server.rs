use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use thiserror::Error;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{
        Broadcast, ClientCommand, ErrorCode, Frame, MAX_COMMAND_LEN, Response, read_line,
        write_line,
    },
    registry::{
        ChatMessage, JoinError, Membership, OutboundReceiver, Registry, RenameError,
        SessionHandle,
    },
};

/// Broadcast lines a session may have queued before it is treated as a slow
/// consumer. Direct replies have a separate budget of the same size.
pub const OUTBOUND_CAPACITY: usize = 256;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

struct ServerState {
    registry: Registry,
    next_id: AtomicU64,
}

impl Server {
    pub fn new(listener: TcpListener, registry: Registry) -> Self {
        Self {
            listener,
            state: Arc::new(ServerState {
                registry,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, state: &Arc<ServerState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, state).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    let (session, outbound) = SessionHandle::new(id, OUTBOUND_CAPACITY);
    let writer_task = tokio::spawn(drain_outbound(writer, outbound, peer));

    let handler = SessionHandler {
        registry: &state.registry,
        session,
        peer,
    };
    info!(%peer, session = id, "client connected");

    let result = handler.run(&mut reader).await;
    handler.close().await;
    drop(handler);

    let abort = writer_task.abort_handle();
    match timeout(WRITER_DRAIN_TIMEOUT, writer_task).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(%peer, error = ?err, "writer task ended abnormally"),
        Err(_) => {
            debug!(%peer, "client stopped reading; dropping queued lines");
            abort.abort();
        }
    }
    info!(%peer, session = id, "client disconnected");
    result
}

/// Writes queued lines to the socket until every sender is gone.
async fn drain_outbound(
    mut writer: OwnedWriteHalf,
    mut outbound: OutboundReceiver,
    peer: SocketAddr,
) {
    while let Some(queued) = outbound.recv().await {
        let line = queued.into_line();
        if let Err(err) = write_line(&mut writer, &line).await {
            debug!(%peer, ?err, "failed to deliver line to client");
            return;
        }
    }
    if let Err(err) = writer.shutdown().await {
        debug!(%peer, ?err, "failed to shutdown client writer cleanly");
    }
}

enum Flow {
    Continue,
    Close,
}

/// What a single command produced for the client.
enum Outcome {
    Silent,
    Reply(Response),
    Replay(Vec<Broadcast>),
    Quit,
}

#[derive(Debug, Error)]
enum CommandError {
    #[error("{0} requires a joined session")]
    NotJoined(&'static str),
    #[error("malformed {0} command")]
    Malformed(String),
    #[error("unknown command: {0}")]
    Unknown(String),
}

/// Per-connection protocol state machine.
///
/// The session is `Unjoined` until its first successful `JOIN`; the registry
/// holds the authoritative membership, so the handler asks it rather than
/// tracking a shadow copy.
struct SessionHandler<'a> {
    registry: &'a Registry,
    session: SessionHandle,
    peer: SocketAddr,
}

impl SessionHandler<'_> {
    async fn run<R>(&self, reader: &mut R) -> Result<()>
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        loop {
            select! {
                frame = read_line(reader, MAX_COMMAND_LEN) => {
                    let flow = match frame? {
                        None => return Ok(()),
                        Some(Frame::Line(line)) => self.handle_line(&line).await?,
                        Some(Frame::Oversized) => {
                            debug!(peer = %self.peer, "rejecting oversized line");
                            self.reject().await?;
                            Flow::Continue
                        }
                    };
                    if let Flow::Close = flow {
                        return Ok(());
                    }
                }
                _ = self.session.evicted() => {
                    warn!(peer = %self.peer, "session evicted; disconnecting");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_line(&self, line: &str) -> Result<Flow> {
        let command = ClientCommand::parse(line);
        debug!(peer = %self.peer, command = command.name(), "received command");

        match self.execute(command).await {
            Ok(Outcome::Silent) => {}
            Ok(Outcome::Reply(response)) => self.send(response.to_string()).await?,
            Ok(Outcome::Replay(lines)) => {
                for line in lines {
                    self.send(line.to_string()).await?;
                }
            }
            Ok(Outcome::Quit) => return Ok(Flow::Close),
            Err(err) => {
                debug!(peer = %self.peer, error = %err, "rejecting command");
                self.reject().await?;
            }
        }

        Ok(Flow::Continue)
    }

    async fn execute(&self, command: ClientCommand) -> Result<Outcome, CommandError> {
        match command {
            ClientCommand::Join { channel, username } => Ok(self.join(&channel, &username).await),
            ClientCommand::Nick { username } => {
                self.joined("NICK").await?;
                Ok(self.rename(&username).await)
            }
            ClientCommand::Message { text } => {
                let membership = self.joined("MESSAGE").await?;
                let message = ChatMessage {
                    username: membership.username,
                    text,
                };
                self.registry
                    .relay(&membership.channel, message, Some(self.session.id()))
                    .await;
                Ok(Outcome::Silent)
            }
            ClientCommand::ChanList => Ok(Outcome::Reply(Response::ChanList(
                self.registry.channels(),
            ))),
            ClientCommand::UsrList => {
                let membership = self.joined("USRLIST").await?;
                let users = self.registry.users(&membership.channel).await;
                Ok(Outcome::Reply(Response::UsrList(users)))
            }
            ClientCommand::History => {
                let membership = self.joined("HISTORY").await?;
                let replay = self
                    .registry
                    .history(&membership.channel)
                    .await
                    .into_iter()
                    .map(|ChatMessage { username, text }| Broadcast::Receive { username, text })
                    .collect();
                Ok(Outcome::Replay(replay))
            }
            ClientCommand::Quit => Ok(Outcome::Quit),
            ClientCommand::Malformed { keyword } => Err(CommandError::Malformed(keyword)),
            ClientCommand::Unknown { line } => Err(CommandError::Unknown(line)),
        }
    }

    async fn join(&self, channel: &str, username: &str) -> Outcome {
        match self.registry.try_join(channel, username, &self.session).await {
            Ok(previous) => {
                info!(peer = %self.peer, %channel, %username, "client joined");
                if let Some(previous) = previous {
                    self.announce_departure(&previous).await;
                }
                let joined = Broadcast::Joined {
                    username: username.to_string(),
                };
                self.registry
                    .broadcast(channel, &joined.to_string(), Some(self.session.id()))
                    .await;
                Outcome::Reply(Response::Ok)
            }
            Err(JoinError::ChannelNotFound) => {
                Outcome::Reply(Response::Error(ErrorCode::Unavailable))
            }
            Err(JoinError::UsernameTaken) => {
                Outcome::Reply(Response::Error(ErrorCode::UsernameTaken))
            }
        }
    }

    async fn rename(&self, username: &str) -> Outcome {
        match self.registry.rename(&self.session, username).await {
            Ok(previous) => {
                info!(peer = %self.peer, %previous, %username, "client renamed");
                Outcome::Reply(Response::Ok)
            }
            Err(RenameError::UsernameTaken) => {
                Outcome::Reply(Response::Error(ErrorCode::Unavailable))
            }
            Err(RenameError::NotJoined) => Outcome::Reply(Response::Error(ErrorCode::Malformed)),
        }
    }

    async fn joined(&self, command: &'static str) -> Result<Membership, CommandError> {
        self.registry
            .membership(&self.session)
            .await
            .ok_or(CommandError::NotJoined(command))
    }

    async fn reject(&self) -> Result<()> {
        self.send(Response::Error(ErrorCode::Malformed).to_string())
            .await
    }

    async fn send(&self, line: String) -> Result<()> {
        self.session.send(line).await?;
        Ok(())
    }

    async fn announce_departure(&self, membership: &Membership) {
        let left = Broadcast::Left {
            username: membership.username.clone(),
        };
        self.registry
            .broadcast(&membership.channel, &left.to_string(), Some(self.session.id()))
            .await;
    }

    /// Releases the session's membership; runs once per connection.
    async fn close(&self) {
        if let Some(membership) = self.registry.remove(&self.session).await {
            info!(
                peer = %self.peer,
                channel = %membership.channel,
                username = %membership.username,
                "client left"
            );
            self.announce_departure(&membership).await;
        }
    }
}
