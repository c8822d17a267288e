//! Observable client-side state: per-channel message lists, the
//! notification feed, and the admin conversation directory.

mod channel;
mod directory;
mod notifications;

pub use channel::{AppendOutcome, ChannelStore};
pub use directory::ConversationDirectory;
pub use notifications::NotificationStore;
