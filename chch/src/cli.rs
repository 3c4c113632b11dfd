use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::channels::DEFAULT_CHANNEL_DIR;

pub const DEFAULT_PORT: u16 = 4269;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server.
    Server(ServerArgs),
    /// Connect to a server and chat interactively.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory whose file names define the channels.
    #[arg(long, default_value = DEFAULT_CHANNEL_DIR)]
    pub channels: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Host to connect to.
    #[arg(short = 'H', long)]
    pub host: String,

    /// Port the server listens on.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}
