pub mod manager;
pub mod session;
pub mod store;
pub mod summarizer;
pub mod types;

pub use manager::SessionManager;
pub use session::Session;
pub use types::*;
