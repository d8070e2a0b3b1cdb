//! Infrastructure layer for the client.
//!
//! Contains the OS-facing adapters: the datagram transports and the TOML
//! configuration file.
//!
//! **Dependency rule**: the application layer programs against the
//! [`transport::DatagramTransport`] trait.  The only place it names a
//! concrete socket is `MiioClient::connect`.
//!
//! # Sub-modules
//!
//! - **`transport`** – the `DatagramTransport` trait, the tokio UDP
//!   implementation, and an in-memory implementation for tests.
//!
//! - **`config`** – TOML schema for the config file and its conversion into a
//!   runtime `SessionConfig`.

pub mod config;
pub mod transport;
