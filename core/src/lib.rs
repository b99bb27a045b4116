/// Chatline - conversation state synchronizer for a chat client
///
/// Keeps a user's conversations consistent while a push channel (live messages,
/// presence) and pull requests (history, summaries) race against user actions
/// such as switching the selected peer, sending and reconnecting.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;
pub mod wire;

pub use config::{Config, SendRoute};
pub use error::{ChatError, FetchError, Result, TransportError, ValidationError};
pub use session::ChatSession;
pub use store::ConversationStore;
pub use types::{Change, ConnectionState, ConversationSummary, Message, Origin, SelectionState};
