pub mod client;
pub mod session;
pub mod supervisor;

pub use client::{DaemonClient, FilePosition};
pub use session::DaemonSessionManager;
pub use supervisor::{DaemonSessionInfo, DaemonStatus, DaemonSupervisor};
