//! CHCH: a line-oriented chat with named channels.
//!
//! One binary runs either side of the conversation. Each module focuses on a
//! concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`protocol`] decodes and encodes the newline-delimited wire commands.
//! - [`channels`] reads the fixed channel set from a directory at startup.
//! - [`registry`] tracks channel membership and history and fans out
//!   broadcasts, one lock per channel.
//! - [`server`] accepts TCP connections and runs one protocol state machine
//!   per client.
//! - [`connection`] keeps the client's socket open and separates command
//!   responses from broadcasts.
//! - [`controller`] interprets user input and keeps the local channel list and
//!   message log.
//! - [`client`] wires stdin, the controller and stdout together.
//!
//! Integration tests under `tests/` drive a real server over TCP.

pub mod channels;
pub mod cli;
pub mod client;
pub mod connection;
pub mod controller;
pub mod protocol;
pub mod registry;
pub mod server;
