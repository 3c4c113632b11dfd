//! Interactive command interpreter for the client.
//!
//! Lines starting with `/` are slash-commands, anything else is chat. User
//! feedback is written into the message log next to chat traffic, using the
//! `*** ` prefix for notices and `!!! ` for errors.

use std::{collections::VecDeque, time::Duration};

use anyhow::{Result, anyhow};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    connection::{Connection, RequestError},
    protocol::{Broadcast, ClientCommand, ErrorCode, Response},
};

pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(5000);
pub const MESSAGE_LOG_CAPACITY: usize = 200;

const HELP: &[&str] = &[
    "/join <channel> <username>  join a channel",
    "/nick <username>            change your username",
    "/usrlist                    list users in the current channel",
    "/chanlist                   list channels",
    "/exit                       leave the chat",
];

/// Bounded log of rendered lines; the oldest entry goes first when full.
///
/// Every entry gets a sequence number that keeps increasing across clears,
/// so a renderer can tell which lines it has not shown yet.
#[derive(Debug)]
pub struct MessageLog {
    entries: VecDeque<(u64, String)>,
    capacity: usize,
    next_seq: u64,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 0,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((self.next_seq, line.into()));
        self.next_seq += 1;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, line)| line.as_str())
    }

    /// Sequence number the next pushed line will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Lines pushed at or after `seq` that are still retained.
    pub fn since(&self, seq: u64) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(move |(entry_seq, _)| *entry_seq >= seq)
            .map(|(_, line)| line.as_str())
    }
}

/// A line of user input, parsed.
#[derive(Debug, PartialEq)]
pub enum Input {
    Join { channel: String, username: String },
    Nick { username: String },
    UsrList,
    ChanList,
    Help,
    Exit,
    Chat(String),
    Empty,
}

impl Input {
    /// Slash-command names are case-insensitive; arguments are kept as typed.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Input::Empty);
        }
        let Some(command) = line.strip_prefix('/') else {
            return Ok(Input::Chat(line.to_string()));
        };

        let parts: Vec<&str> = command.split_whitespace().collect();
        let name = parts.first().map(|name| name.to_lowercase()).unwrap_or_default();
        match (name.as_str(), parts.len()) {
            ("join", 3) => Ok(Input::Join {
                channel: parts[1].to_string(),
                username: parts[2].to_string(),
            }),
            ("nick", 2) => Ok(Input::Nick {
                username: parts[1].to_string(),
            }),
            ("usrlist", 1) => Ok(Input::UsrList),
            ("chanlist", 1) => Ok(Input::ChanList),
            ("help", _) => Ok(Input::Help),
            ("exit" | "quit", _) => Ok(Input::Exit),
            ("join", _) => Err(anyhow!("usage: /join <channel> <username>")),
            ("nick", _) => Err(anyhow!("usage: /nick <username>")),
            ("usrlist" | "chanlist", _) => Err(anyhow!("/{name} takes no arguments")),
            _ => Err(anyhow!("unknown command /{name}; try /help")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Exit,
}

pub struct Controller {
    connection: Connection,
    broadcasts: mpsc::UnboundedReceiver<Broadcast>,
    channels: Vec<String>,
    messages: MessageLog,
    channel: Option<String>,
    username: Option<String>,
    timeout: Duration,
}

impl Controller {
    pub fn new(connection: Connection, broadcasts: mpsc::UnboundedReceiver<Broadcast>) -> Self {
        Self::with_timeout(connection, broadcasts, RESPONSE_TIMEOUT)
    }

    pub fn with_timeout(
        connection: Connection,
        broadcasts: mpsc::UnboundedReceiver<Broadcast>,
        timeout: Duration,
    ) -> Self {
        Self {
            connection,
            broadcasts,
            channels: Vec::new(),
            messages: MessageLog::new(MESSAGE_LOG_CAPACITY),
            channel: None,
            username: None,
            timeout,
        }
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn notice(&mut self, text: impl AsRef<str>) {
        self.messages.push(format!("*** {}", text.as_ref()));
    }

    fn error(&mut self, text: impl AsRef<str>) {
        self.messages.push(format!("!!! {}", text.as_ref()));
    }

    /// Fetches the channel list without reporting anything to the user.
    pub async fn refresh_channels(&mut self) -> Result<(), RequestError> {
        match self.request(&ClientCommand::ChanList).await? {
            Response::ChanList(channels) => self.channels = channels,
            other => debug!(?other, "unexpected reply to CHANLIST"),
        }
        Ok(())
    }

    pub async fn handle_input(&mut self, line: &str) -> Control {
        let input = match Input::parse(line) {
            Ok(input) => input,
            Err(err) => {
                self.error(err.to_string());
                return Control::Continue;
            }
        };

        match input {
            Input::Empty => {}
            Input::Join { channel, username } => self.join(channel, username).await,
            Input::Nick { username } => self.nick(username).await,
            Input::UsrList => self.list_users().await,
            Input::ChanList => self.list_channels().await,
            Input::Help => {
                for line in HELP {
                    self.notice(line);
                }
            }
            Input::Chat(text) => self.chat(text).await,
            Input::Exit => {
                self.exit().await;
                return Control::Exit;
            }
        }
        Control::Continue
    }

    /// Next broadcast from the server, or `None` once the connection is gone.
    pub async fn next_broadcast(&mut self) -> Option<Broadcast> {
        self.broadcasts.recv().await
    }

    pub fn handle_broadcast(&mut self, broadcast: Broadcast) {
        match broadcast {
            Broadcast::Receive { username, text } => {
                self.messages.push(format!("<{username}> {text}"));
            }
            Broadcast::Joined { username } => self.notice(format!("{username} joined")),
            Broadcast::Left { username } => self.notice(format!("{username} left")),
            Broadcast::Unknown(line) => self.messages.push(line),
        }
    }

    async fn join(&mut self, channel: String, username: String) {
        let command = ClientCommand::Join {
            channel: channel.clone(),
            username: username.clone(),
        };
        match self.request(&command).await {
            Ok(Response::Ok) => {
                // The reader forwards broadcasts in arrival order, so anything
                // queued now predates the OK and belongs to the old channel.
                while let Ok(stale) = self.broadcasts.try_recv() {
                    debug!(?stale, "dropping broadcast from previous channel");
                }
                self.messages.clear();
                self.notice(format!("joined {channel} as {username}"));
                self.channel = Some(channel);
                self.username = Some(username);
                if let Err(err) = self.refresh_channels().await {
                    debug!(error = %err, "failed to refresh channels after join");
                }
                if let Err(err) = self.connection.send(&ClientCommand::History).await {
                    self.error(format!("failed to request history: {err}"));
                }
            }
            Ok(Response::Error(ErrorCode::Unavailable)) => {
                self.error(format!("channel {channel} does not exist"));
            }
            Ok(Response::Error(ErrorCode::UsernameTaken)) => {
                self.error(format!("username {username} is already taken in {channel}"));
            }
            Ok(other) => self.unexpected("join", other),
            Err(err) => self.request_failed("join", err),
        }
    }

    async fn nick(&mut self, username: String) {
        if self.channel.is_none() {
            self.error("join a channel first");
            return;
        }
        let command = ClientCommand::Nick {
            username: username.clone(),
        };
        match self.request(&command).await {
            Ok(Response::Ok) => {
                self.notice(format!("you are now known as {username}"));
                self.username = Some(username);
            }
            Ok(Response::Error(ErrorCode::Unavailable)) => {
                self.error(format!("username {username} is already taken"));
            }
            Ok(other) => self.unexpected("nick", other),
            Err(err) => self.request_failed("nick", err),
        }
    }

    async fn list_users(&mut self) {
        let Some(channel) = self.channel.clone() else {
            self.error("join a channel first");
            return;
        };
        match self.request(&ClientCommand::UsrList).await {
            Ok(Response::UsrList(users)) => {
                self.notice(format!("users in {channel}: {}", users.join(", ")));
            }
            Ok(other) => self.unexpected("usrlist", other),
            Err(err) => self.request_failed("usrlist", err),
        }
    }

    async fn list_channels(&mut self) {
        match self.request(&ClientCommand::ChanList).await {
            Ok(Response::ChanList(channels)) => {
                self.notice(format!("channels: {}", channels.join(", ")));
                self.channels = channels;
            }
            Ok(other) => self.unexpected("chanlist", other),
            Err(err) => self.request_failed("chanlist", err),
        }
    }

    async fn chat(&mut self, text: String) {
        let Some(username) = self.username.clone() else {
            self.error("join a channel first: /join <channel> <username>");
            return;
        };
        let command = ClientCommand::Message { text: text.clone() };
        match self.connection.send(&command).await {
            Ok(()) => self.messages.push(format!("<{username}> {text}")),
            Err(err) => self.error(format!("failed to send message: {err}")),
        }
    }

    pub async fn exit(&mut self) {
        if let Err(err) = self.connection.send(&ClientCommand::Quit).await {
            debug!(error = %err, "failed to send QUIT");
        }
        self.connection.close().await;
        self.notice("leaving chat");
    }

    async fn request(&self, command: &ClientCommand) -> Result<Response, RequestError> {
        self.connection.request(command, self.timeout).await
    }

    fn unexpected(&mut self, command: &str, response: Response) {
        warn!(command, %response, "unexpected response");
        self.error(format!("{command} failed: server replied {response}"));
    }

    fn request_failed(&mut self, command: &str, err: RequestError) {
        self.error(format!("{command} failed: {err}"));
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_keeps_latest_entries() {
        let mut log = MessageLog::new(MESSAGE_LOG_CAPACITY);
        for i in 0..250 {
            log.push(format!("line {i}"));
        }

        assert_eq!(log.len(), MESSAGE_LOG_CAPACITY);
        assert_eq!(log.iter().next(), Some("line 50"));
        assert_eq!(log.iter().last(), Some("line 249"));
    }

    #[test]
    fn since_survives_clear() {
        let mut log = MessageLog::new(4);
        log.push("a");
        log.push("b");
        let mark = log.next_seq();
        log.clear();
        log.push("c");

        assert!(log.since(0).eq(["c"]));
        assert!(log.since(mark).eq(["c"]));
        assert_eq!(log.since(log.next_seq()).count(), 0);
    }

    #[test]
    fn parses_slash_commands() {
        assert_eq!(
            Input::parse("/JOIN general alice").expect("join"),
            Input::Join {
                channel: "general".into(),
                username: "alice".into()
            }
        );
        assert_eq!(Input::parse("/usrlist").expect("usrlist"), Input::UsrList);
        assert_eq!(Input::parse("/exit").expect("exit"), Input::Exit);
        assert_eq!(Input::parse("   ").expect("empty"), Input::Empty);
        assert_eq!(
            Input::parse("hello /join").expect("chat"),
            Input::Chat("hello /join".into())
        );
    }

    #[test]
    fn rejects_bad_slash_commands() {
        assert!(Input::parse("/join general").is_err());
        assert!(Input::parse("/nick").is_err());
        assert!(Input::parse("/chanlist all").is_err());
        assert!(Input::parse("/dance").is_err());
        assert!(Input::parse("/").is_err());
    }
}
