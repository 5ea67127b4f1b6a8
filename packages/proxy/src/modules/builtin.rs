// packages/proxy/src/modules/builtin.rs
//! Bootstrap modules shipped with the proxy
//!
//! - **command**: owns the private command channel of a session
//! - **game-state**: tracks what is known about the session's connection,
//!   also registered as `tera-game-state`
//!
//! Other modules rely on both being initialised first.

use crate::modules::loader::{ModuleCatalog, ModuleContext, ModuleFactory, ProxyModule, SessionNotice};
use crate::session::proxy_session::SessionId;
use crate::utils::errors::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Catalog holding the bootstrap modules
pub fn builtin_catalog() -> ModuleCatalog {
    ModuleCatalog::new()
        .with("command", Arc::new(CommandFactory))
        .with("game-state", Arc::new(GameStateFactory))
        .with("tera-game-state", Arc::new(GameStateFactory))
}

pub struct CommandFactory;

impl ModuleFactory for CommandFactory {
    fn instantiate(&self, ctx: &ModuleContext<'_>) -> Result<Box<dyn ProxyModule>> {
        Ok(Box::new(CommandModule {
            session_id: ctx.session_id,
            channel_joined: false,
        }))
    }
}

/// Joins the private command channel once the client is logged in
pub struct CommandModule {
    session_id: SessionId,
    channel_joined: bool,
}

impl ProxyModule for CommandModule {
    fn on_notice(&mut self, notice: &SessionNotice) {
        if *notice == SessionNotice::HandshakeComplete && !self.channel_joined {
            self.channel_joined = true;
            debug!(session = %self.session_id, "Command channel ready");
        }
    }

    fn teardown(&mut self) {
        if self.channel_joined {
            debug!(session = %self.session_id, "Command channel closed");
        }
        self.channel_joined = false;
    }
}

pub struct GameStateFactory;

impl ModuleFactory for GameStateFactory {
    fn instantiate(&self, ctx: &ModuleContext<'_>) -> Result<Box<dyn ProxyModule>> {
        Ok(Box::new(GameStateModule {
            session_id: ctx.session_id,
            region: ctx.region.to_string(),
            state: GameState::default(),
        }))
    }
}

/// Connection facts gathered from session notices
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GameState {
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
    pub handshake_complete: bool,
    pub closing: bool,
}

impl GameState {
    pub fn apply(&mut self, notice: &SessionNotice) {
        match notice {
            SessionNotice::Routed {
                downstream,
                upstream,
            } => {
                self.client = Some(*downstream);
                self.server = Some(*upstream);
            }
            SessionNotice::HandshakeComplete => self.handshake_complete = true,
            SessionNotice::Closing => self.closing = true,
        }
    }
}

pub struct GameStateModule {
    session_id: SessionId,
    region: String,
    state: GameState,
}

impl ProxyModule for GameStateModule {
    fn on_notice(&mut self, notice: &SessionNotice) {
        self.state.apply(notice);
        debug!(session = %self.session_id, region = %self.region, "Game state: {:?}", self.state);
    }
}
