//! PTY process handles and the shared session registry.

pub mod registry;
pub mod session;

pub use registry::SessionRegistry;
pub use session::{ExitInfo, PtySession, SessionError};
