//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the loaded
//! configuration and the token minter shared by every handler.

use crate::{config::Config, minter::TokenMinter};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub minter: Arc<dyn TokenMinter>,
}
