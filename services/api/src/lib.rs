//! Parley Credential Service
//!
//! Hands out the two short-lived credentials a call attempt needs: the relay
//! (STUN/TURN) server list and a realtime token minted with the server-held
//! provider key. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod minter;
pub mod models;
pub mod router;
pub mod state;
