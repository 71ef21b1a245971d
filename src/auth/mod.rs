pub mod credential;
pub mod device_flow;
pub(crate) mod endpoints;
pub mod lock;
pub mod refresher;
pub mod store;

pub use credential::{QwenCredential, is_expired_at};
pub use device_flow::{DeviceAuthResponse, DeviceFlow, DeviceFlowResult, PollOutcome, create_pkce};
pub use lock::{FileLock, LockGuard, LockOptions};
pub use refresher::{AccessOutcome, RefreshOutcome, Refresher};
pub use store::TokenStore;
