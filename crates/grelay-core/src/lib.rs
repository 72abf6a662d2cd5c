mod auth;
mod core;
mod handler;
mod request;

pub use crate::auth::{AuthContext, AuthError, AuthProvider, MemoryAuth};
pub use crate::core::{Core, CoreConfig, CoreState, RELAY_PATHS};
pub use crate::handler::relay_handler;
pub use crate::request::{ParsedRequest, parse_request};
