//! Anonymous visitor sessions.
//!
//! SYSTEM CONTEXT
//! ==============
//! Leaf component: establishes, persists and revalidates the visitor identity
//! every other part of the widget keys on. Owns two request/response calls
//! against the backend and nothing else on the network.

pub mod api;
pub mod fingerprint;
pub mod manager;
pub mod storage;
pub mod types;

pub use api::{HttpSessionApi, SessionApi};
pub use fingerprint::{DigestAlgorithm, EnvironmentSignals, ScreenGeometry, derive_fingerprint};
pub use manager::SessionManager;
pub use storage::{FINGERPRINT_KEY, FileStore, KeyValueStore, LoadError, MemoryStore, SESSION_KEY, StorageError};
pub use types::{AnonymousSession, CreateSessionRequest, CreatedSession, SessionError, UserInfo};
