//! Line-oriented CHCH wire protocol.
//!
//! Every command and reply is a single UTF-8 line terminated by `\n`. Lines
//! are decoded exactly once at the connection boundary into the closed enums
//! below; anything that does not fit becomes an explicit `Unknown` or
//! `Malformed` variant instead of falling through a default branch.

use std::{fmt, io};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Commands a client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Join { channel: String, username: String },
    Nick { username: String },
    Message { text: String },
    ChanList,
    UsrList,
    History,
    Quit,
    /// A known keyword with the wrong arguments.
    Malformed { keyword: String },
    /// Anything that is not a known keyword.
    Unknown { line: String },
}

impl ClientCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(LINE_ENDINGS);
        let (keyword, rest) = match line.split_once(' ') {
            Some((keyword, rest)) => (keyword, rest),
            None => (line, ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        match (keyword, args.as_slice()) {
            ("JOIN", [channel, username]) => ClientCommand::Join {
                channel: channel.to_string(),
                username: username.to_string(),
            },
            ("NICK", [username]) => ClientCommand::Nick {
                username: username.to_string(),
            },
            // Chat text is kept verbatim, inner spacing included.
            ("MESSAGE", _) if !rest.trim().is_empty() => ClientCommand::Message {
                text: rest.to_string(),
            },
            ("CHANLIST", []) => ClientCommand::ChanList,
            ("USRLIST", []) => ClientCommand::UsrList,
            ("HISTORY", []) => ClientCommand::History,
            ("QUIT", []) => ClientCommand::Quit,
            ("JOIN" | "NICK" | "MESSAGE" | "CHANLIST" | "USRLIST" | "HISTORY" | "QUIT", _) => {
                ClientCommand::Malformed {
                    keyword: keyword.to_string(),
                }
            }
            _ => ClientCommand::Unknown {
                line: line.to_string(),
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ClientCommand::Join { .. } => "JOIN",
            ClientCommand::Nick { .. } => "NICK",
            ClientCommand::Message { .. } => "MESSAGE",
            ClientCommand::ChanList => "CHANLIST",
            ClientCommand::UsrList => "USRLIST",
            ClientCommand::History => "HISTORY",
            ClientCommand::Quit => "QUIT",
            ClientCommand::Malformed { keyword } => keyword,
            ClientCommand::Unknown { .. } => "UNKNOWN",
        }
    }
}

impl fmt::Display for ClientCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientCommand::Join { channel, username } => write!(f, "JOIN {channel} {username}"),
            ClientCommand::Nick { username } => write!(f, "NICK {username}"),
            ClientCommand::Message { text } => write!(f, "MESSAGE {text}"),
            ClientCommand::ChanList => f.write_str("CHANLIST"),
            ClientCommand::UsrList => f.write_str("USRLIST"),
            ClientCommand::History => f.write_str("HISTORY"),
            ClientCommand::Quit => f.write_str("QUIT"),
            ClientCommand::Malformed { keyword } => f.write_str(keyword),
            ClientCommand::Unknown { line } => f.write_str(line),
        }
    }
}

/// Numeric code carried by an `ERROR` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// `0`: malformed, unknown, or out-of-state command.
    Malformed,
    /// `1`: channel not found on `JOIN`, name taken on `NICK`.
    Unavailable,
    /// `2`: username already taken on `JOIN`.
    UsernameTaken,
    Other(String),
}

impl ErrorCode {
    fn parse(code: &str) -> Self {
        match code {
            "0" => ErrorCode::Malformed,
            "1" => ErrorCode::Unavailable,
            "2" => ErrorCode::UsernameTaken,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Malformed => f.write_str("0"),
            ErrorCode::Unavailable => f.write_str("1"),
            ErrorCode::UsernameTaken => f.write_str("2"),
            ErrorCode::Other(code) => f.write_str(code),
        }
    }
}

/// Replies that directly answer the most recent client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Error(ErrorCode),
    ChanList(Vec<String>),
    UsrList(Vec<String>),
}

/// Server pushes that were not solicited by the preceding command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Broadcast {
    Receive { username: String, text: String },
    Joined { username: String },
    Left { username: String },
    Unknown(String),
}

/// Any line the server can send, classified by its prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    Response(Response),
    Broadcast(Broadcast),
}

impl ServerLine {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(LINE_ENDINGS);
        let (keyword, rest) = match line.split_once(' ') {
            Some((keyword, rest)) => (keyword, rest),
            None => (line, ""),
        };
        let names = || rest.split_whitespace().map(str::to_string).collect::<Vec<_>>();

        match keyword {
            "OK" if rest.is_empty() => ServerLine::Response(Response::Ok),
            "ERROR" => ServerLine::Response(Response::Error(ErrorCode::parse(rest.trim()))),
            "CHANLIST" => ServerLine::Response(Response::ChanList(names())),
            "USRLIST" => ServerLine::Response(Response::UsrList(names())),
            "RECEIVE" if !rest.is_empty() => {
                let (username, text) = rest.split_once(' ').unwrap_or((rest, ""));
                ServerLine::Broadcast(Broadcast::Receive {
                    username: username.to_string(),
                    text: text.to_string(),
                })
            }
            "JOINED" if !rest.is_empty() => ServerLine::Broadcast(Broadcast::Joined {
                username: rest.trim().to_string(),
            }),
            "LEFT" if !rest.is_empty() => ServerLine::Broadcast(Broadcast::Left {
                username: rest.trim().to_string(),
            }),
            _ => ServerLine::Broadcast(Broadcast::Unknown(line.to_string())),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok => f.write_str("OK"),
            Response::Error(code) => write!(f, "ERROR {code}"),
            Response::ChanList(names) => write_list(f, "CHANLIST", names),
            Response::UsrList(names) => write_list(f, "USRLIST", names),
        }
    }
}

impl fmt::Display for Broadcast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Broadcast::Receive { username, text } => write!(f, "RECEIVE {username} {text}"),
            Broadcast::Joined { username } => write!(f, "JOINED {username}"),
            Broadcast::Left { username } => write!(f, "LEFT {username}"),
            Broadcast::Unknown(line) => f.write_str(line),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, keyword: &str, names: &[String]) -> fmt::Result {
    f.write_str(keyword)?;
    for name in names {
        write!(f, " {name}")?;
    }
    Ok(())
}

/// Longest command line a client may send, not counting the `\n`.
pub const MAX_COMMAND_LEN: usize = 8 * 1024;

/// Longest line a client accepts from the server. Replies carry a username
/// prefix and whole member lists, so this is looser than the command limit.
pub const MAX_REPLY_LEN: usize = 1024 * 1024;

/// One unit read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    /// A line over the read limit; its bytes were discarded up to the next
    /// `\n`.
    Oversized,
}

/// Reads the next non-empty line, without its terminator.
///
/// At most `limit` bytes are buffered per line. Invalid UTF-8 is replaced
/// rather than rejected so a single bad line can be answered as malformed
/// instead of tearing down the connection.
pub async fn read_line<R>(reader: &mut R, limit: usize) -> io::Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        let bytes = (&mut *reader)
            .take(limit as u64 + 1)
            .read_until(b'\n', &mut buffer)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes > limit && buffer.last() != Some(&b'\n') {
            skip_line(reader).await?;
            return Ok(Some(Frame::Oversized));
        }

        let line = String::from_utf8_lossy(&buffer);
        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        return Ok(Some(Frame::Line(trimmed.to_string())));
    }
}

/// Consumes input through the next `\n` without keeping it.
async fn skip_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(());
        }
        match chunk.iter().position(|&byte| byte == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(());
            }
            None => {
                let len = chunk.len();
                reader.consume(len);
            }
        }
    }
}

pub async fn write_line<W, T>(writer: &mut W, line: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: fmt::Display + ?Sized,
{
    let mut encoded = line.to_string().into_bytes();
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
