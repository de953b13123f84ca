pub mod config;
pub mod error;
pub mod geometry;
pub mod launcher;
pub mod pty;
pub mod session;
pub mod shutdown;
mod watcher;

pub use error::SessionError;
pub use geometry::WindowSize;
pub use session::{DescriptiveFields, Session, SessionOptions};
pub use shutdown::{ExitStatus, ShutdownState};
