//! Serverless room-scoped chat for local networks.
//!
//! A node joins a named room, derives the room's symmetric key and UDP port
//! from the name alone, and exchanges encrypted text messages and file
//! attachments with every other node on the same LAN segment — no server,
//! no rendezvous, no persistence. Late joiners pull the room history from
//! whoever is already present.
//!
//! [`runtime::spawn_runtime`] is the entry point: it returns a
//! [`runtime::RuntimeHandle`] for request/response calls and a stream of
//! [`runtime::RuntimeEvent`]s, which is the entire surface a shell needs.

pub mod config;
pub mod runtime;
