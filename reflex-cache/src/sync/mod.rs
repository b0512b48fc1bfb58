//! Keeping subscribed regions current: push with polling fallback.

pub mod driver;
pub mod guard;
pub mod state;

pub use driver::{DriverHandle, SyncDriver};
pub use guard::ActivationGuard;
pub use state::{SyncPolicy, SyncState};
