use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    connection::Connection,
    controller::{Control, Controller},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (connection, broadcasts) = Connection::connect((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;
    info!(host = %args.host, port = args.port, "connected");

    let mut controller = Controller::new(connection, broadcasts);
    if let Err(error) = controller.refresh_channels().await {
        warn!(%error, "failed to fetch channel list");
    }
    controller.notice("type /help for commands, /join <channel> <username> to start");

    let mut renderer = Renderer::default();
    let mut stdout = tokio::io::stdout();
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    renderer.render(&controller, &mut stdout).await?;

    loop {
        select! {
            line = input.next_line() => {
                let Some(line) = line? else {
                    controller.exit().await;
                    break;
                };
                if controller.handle_input(&line).await == Control::Exit {
                    break;
                }
            }
            broadcast = controller.next_broadcast() => {
                let Some(broadcast) = broadcast else {
                    controller.notice("server closed the connection");
                    break;
                };
                controller.handle_broadcast(broadcast);
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                controller.exit().await;
                break;
            }
        }
        renderer.render(&controller, &mut stdout).await?;
    }

    renderer.render(&controller, &mut stdout).await?;
    controller.close().await;
    Ok(())
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

/// Line-oriented view of the controller state.
///
/// Prints the channel bar whenever the channel list or current channel
/// changes, followed by any log lines not yet shown.
#[derive(Debug, Default)]
pub struct Renderer {
    shown: u64,
    channel_bar: Option<String>,
}

impl Renderer {
    pub async fn render<W>(&mut self, controller: &Controller, out: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let bar = channel_bar(controller.channels(), controller.channel());
        if self.channel_bar.as_deref() != Some(bar.as_str()) {
            write_line(out, &bar).await?;
            self.channel_bar = Some(bar);
        }

        for line in controller.messages().since(self.shown) {
            write_line(out, line).await?;
        }
        self.shown = controller.messages().next_seq();
        out.flush().await
    }
}

fn channel_bar(channels: &[String], current: Option<&str>) -> String {
    let names: Vec<String> = channels
        .iter()
        .map(|name| {
            if Some(name.as_str()) == current {
                format!("[{name}]")
            } else {
                name.clone()
            }
        })
        .collect();
    format!("channels: {}", names.join(" "))
}

async fn write_line<W>(out: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_bar_marks_current_channel() {
        let channels = vec!["general".to_string(), "random".to_string()];
        assert_eq!(
            channel_bar(&channels, Some("random")),
            "channels: general [random]"
        );
        assert_eq!(channel_bar(&channels, None), "channels: general random");
    }
}
