pub mod accounts;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fallback;
pub mod model_catalog;
pub mod utils;

pub use accounts::AccountManager;
pub use auth::{DeviceFlow, QwenCredential, Refresher, TokenStore};
pub use config::CastorConfig;
pub use dispatch::{DispatchOutcome, Dispatcher, OutboundRequest};
pub use error::{CastorError, OauthError};
