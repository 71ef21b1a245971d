pub mod identity;
pub mod model;
pub mod registry;

pub use identity::derive_account_key;
pub use model::{Account, AccountRegistry};
pub use registry::{AccountManager, GetActiveOptions, RuntimeAccount, UpsertOptions};
