// src/api/mod.rs

pub mod health;
pub mod session;

use crate::config::Config;
use crate::services::SessionHandle;

// AppState definition
#[derive(Clone)]
pub struct AppState {
    pub session: SessionHandle,
    pub config: Config,
}
