//! snell-server - an unofficial server for the Snell tunneling protocol.
//!
//! A client opens one TCP connection, authenticates with a pre-shared key
//! and asks the server to reach a target host; bytes then flow through an
//! AEAD-framed tunnel, optionally disguised as HTTP-upgrade or TLS traffic.
//!
//! The protocol engine lives in [`crypto`], [`obfs`], [`snell_stream`] and
//! [`session`]; [`tcp_server`] is the accept loop and [`config`] the INI and
//! flag surface.

pub mod address;
pub mod config;
pub mod crypto;
pub mod obfs;
pub mod resolver;
pub mod session;
pub mod snell_stream;
pub mod tcp_server;
