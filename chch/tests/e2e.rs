use std::{fs, path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use assert_cmd::Command as AssertCommand;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    process::{Child, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const BINARY: &str = env!("CARGO_BIN_EXE_chch");

#[test]
fn server_without_channels_fails_to_start() {
    let dir = tempfile::tempdir().expect("tempdir");

    AssertCommand::cargo_bin("chch")
        .expect("binary")
        .args(["server", "--port", "0", "--channels"])
        .arg(dir.path().join("missing"))
        .env("RUST_LOG", "off")
        .assert()
        .failure();
}

#[test]
fn client_without_server_fails() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };

    AssertCommand::cargo_bin("chch")
        .expect("binary")
        .args(["client", "--host", "127.0.0.1", "--port"])
        .arg(port.to_string())
        .env("RUST_LOG", "off")
        .assert()
        .failure();
}

#[tokio::test]
async fn server_binary_serves_channels_from_directory() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for file in ["lobby.txt", "offtopic.txt"] {
        fs::write(dir.path().join(file), "")?;
    }

    let (mut server, mut stdout) = spawn_server(dir.path()).await?;
    let port = read_listening_port(&mut stdout).await?;
    let drain = tokio::spawn(async move {
        let mut lines = stdout.lines();
        while let Ok(Some(_)) = lines.next_line().await {}
    });

    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(b"CHANLIST\nJOIN lobby alice\nUSRLIST\n").await?;
    for expected in ["CHANLIST lobby offtopic", "OK", "USRLIST alice"] {
        let line = timeout(READ_TIMEOUT, lines.next_line())
            .await??
            .context("server closed the connection")?;
        assert_eq!(line, expected);
    }

    let _ = server.kill().await;
    let _ = server.wait().await;
    let _ = drain.await;
    Ok(())
}

async fn spawn_server(channels: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(BINARY);
    cmd.arg("server")
        .arg("--port")
        .arg("0")
        .arg("--channels")
        .arg(channels)
        .env("RUST_LOG", "info")
        .env("RUST_LOG_STYLE", "never")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;
    Ok((child, BufReader::new(stdout)))
}

async fn read_listening_port(stdout: &mut BufReader<ChildStdout>) -> Result<u16> {
    loop {
        let mut line = String::new();
        let bytes = timeout(READ_TIMEOUT, stdout.read_line(&mut line))
            .await
            .map_err(|_| anyhow!("timed out waiting for server banner"))??;
        if bytes == 0 {
            return Err(anyhow!("server exited before listening"));
        }
        if !line.contains("listening on") {
            continue;
        }
        let addr = line
            .trim()
            .split_whitespace()
            .last()
            .context("unexpected banner format")?;
        let port = addr
            .rsplit(':')
            .next()
            .context("banner missing port")?
            .parse()?;
        return Ok(port);
    }
}
