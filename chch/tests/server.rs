use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use chch::{registry::Registry, server::Server};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(1);

struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::new(listener, Registry::new(["general", "random"]));
        let addr = server.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.task.await;
    }
}

struct Peer {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Peer {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    async fn joined(addr: SocketAddr, channel: &str, username: &str) -> Result<Self> {
        let mut peer = Self::connect(addr).await?;
        assert_eq!(peer.ask(&format!("JOIN {channel} {username}")).await?, "OK");
        Ok(peer)
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<String> {
        let line = timeout(READ_TIMEOUT, self.lines.next_line())
            .await??
            .expect("server closed the connection");
        Ok(line)
    }

    async fn ask(&mut self, line: &str) -> Result<String> {
        self.send(line).await?;
        self.recv().await
    }

    /// Asserts nothing arrives within a short window.
    async fn expect_silence(&mut self) {
        let next = timeout(Duration::from_millis(150), self.lines.next_line()).await;
        assert!(next.is_err(), "unexpected line: {next:?}");
    }
}

#[tokio::test]
async fn chanlist_works_before_join() -> Result<()> {
    let server = TestServer::start().await?;
    let mut peer = Peer::connect(server.addr).await?;

    assert_eq!(peer.ask("CHANLIST").await?, "CHANLIST general random");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn join_errors_follow_protocol_codes() -> Result<()> {
    let server = TestServer::start().await?;
    let _alice = Peer::joined(server.addr, "general", "alice").await?;
    let mut other = Peer::connect(server.addr).await?;

    assert_eq!(other.ask("JOIN nowhere bob").await?, "ERROR 1");
    assert_eq!(other.ask("JOIN general alice").await?, "ERROR 2");
    assert_eq!(other.ask("JOIN general").await?, "ERROR 0");
    assert_eq!(other.ask("USRLIST").await?, "ERROR 0");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_joins_for_one_name_admit_one_session() -> Result<()> {
    let server = TestServer::start().await?;
    let mut first = Peer::connect(server.addr).await?;
    let mut second = Peer::connect(server.addr).await?;

    let (a, b) = tokio::join!(first.ask("JOIN general alice"), second.ask("JOIN general alice"));
    let mut replies = vec![a?, b?];
    replies.sort();

    assert_eq!(replies, vec!["ERROR 2", "OK"]);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn messages_reach_others_but_not_sender() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = Peer::joined(server.addr, "general", "alice").await?;
    let mut bob = Peer::joined(server.addr, "general", "bob").await?;
    let mut carol = Peer::joined(server.addr, "random", "carol").await?;
    assert_eq!(alice.recv().await?, "JOINED bob");

    alice.send("MESSAGE hello").await?;

    assert_eq!(bob.recv().await?, "RECEIVE alice hello");
    alice.expect_silence().await;
    carol.expect_silence().await;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn history_replays_channel_messages_in_order() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = Peer::joined(server.addr, "general", "alice").await?;
    let mut eve = Peer::joined(server.addr, "random", "eve").await?;
    alice.send("MESSAGE first").await?;
    alice.send("MESSAGE second one").await?;
    eve.send("MESSAGE elsewhere").await?;
    // Round-trip so the messages above are processed before bob asks.
    assert_eq!(alice.ask("USRLIST").await?, "USRLIST alice");
    assert_eq!(eve.ask("USRLIST").await?, "USRLIST eve");

    let mut bob = Peer::joined(server.addr, "general", "bob").await?;
    bob.send("HISTORY").await?;

    assert_eq!(bob.recv().await?, "RECEIVE alice first");
    assert_eq!(bob.recv().await?, "RECEIVE alice second one");
    bob.expect_silence().await;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn nick_renames_within_channel() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = Peer::joined(server.addr, "general", "alice").await?;
    let mut bob = Peer::joined(server.addr, "general", "bob").await?;
    assert_eq!(alice.recv().await?, "JOINED bob");

    assert_eq!(bob.ask("NICK alice").await?, "ERROR 1");
    assert_eq!(bob.ask("NICK robert").await?, "OK");
    assert_eq!(bob.ask("USRLIST").await?, "USRLIST alice robert");

    bob.send("MESSAGE hi").await?;
    assert_eq!(alice.recv().await?, "RECEIVE robert hi");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn bad_commands_keep_the_connection_open() -> Result<()> {
    let server = TestServer::start().await?;
    let mut peer = Peer::connect(server.addr).await?;

    assert_eq!(peer.ask("DANCE").await?, "ERROR 0");
    assert_eq!(peer.ask("MESSAGE hi").await?, "ERROR 0");
    assert_eq!(peer.ask("NICK bob").await?, "ERROR 0");
    assert_eq!(peer.ask("JOIN general alice").await?, "OK");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn quit_announces_departure_and_frees_name() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = Peer::joined(server.addr, "general", "alice").await?;
    let mut bob = Peer::joined(server.addr, "general", "bob").await?;
    assert_eq!(alice.recv().await?, "JOINED bob");

    bob.send("QUIT").await?;
    assert_eq!(alice.recv().await?, "LEFT bob");
    assert_eq!(timeout(READ_TIMEOUT, bob.lines.next_line()).await??, None);

    let _again = Peer::joined(server.addr, "general", "bob").await?;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn dropped_socket_frees_username() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = Peer::joined(server.addr, "general", "alice").await?;
    let bob = Peer::joined(server.addr, "general", "bob").await?;
    assert_eq!(alice.recv().await?, "JOINED bob");

    drop(bob);
    assert_eq!(alice.recv().await?, "LEFT bob");

    let mut replacement = Peer::connect(server.addr).await?;
    assert_eq!(replacement.ask("JOIN general bob").await?, "OK");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn switching_channels_moves_the_session() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = Peer::joined(server.addr, "general", "alice").await?;
    let mut bob = Peer::joined(server.addr, "general", "bob").await?;
    assert_eq!(alice.recv().await?, "JOINED bob");

    assert_eq!(bob.ask("JOIN random bob").await?, "OK");
    assert_eq!(alice.recv().await?, "LEFT bob");
    assert_eq!(alice.ask("USRLIST").await?, "USRLIST alice");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn long_history_replay_does_not_evict_the_reader() -> Result<()> {
    const STORED: usize = 5_000;
    const LIVE: usize = 20;

    let server = TestServer::start().await?;
    let mut alice = Peer::joined(server.addr, "general", "alice").await?;
    let batch: Vec<String> = (0..STORED).map(|n| format!("MESSAGE stored {n}")).collect();
    alice.send(&batch.join("\n")).await?;
    assert_eq!(alice.ask("USRLIST").await?, "USRLIST alice");

    let mut bob = Peer::joined(server.addr, "general", "bob").await?;
    assert_eq!(alice.recv().await?, "JOINED bob");

    bob.send("HISTORY").await?;
    for n in 0..LIVE {
        alice.send(&format!("MESSAGE live {n}")).await?;
    }

    let mut received = 0;
    while received < STORED + LIVE {
        let line = bob.recv().await?;
        assert!(line.starts_with("RECEIVE alice "), "unexpected line: {line}");
        received += 1;
    }

    assert_eq!(bob.ask("USRLIST").await?, "USRLIST alice bob");
    alice.expect_silence().await;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn oversized_line_is_rejected_and_connection_survives() -> Result<()> {
    let server = TestServer::start().await?;
    let mut peer = Peer::joined(server.addr, "general", "alice").await?;

    let flood = "x".repeat(chch::protocol::MAX_COMMAND_LEN * 4);
    assert_eq!(peer.ask(&format!("MESSAGE {flood}")).await?, "ERROR 0");
    assert_eq!(peer.ask("USRLIST").await?, "USRLIST alice");

    server.stop().await;
    Ok(())
}
