//! Cross-context messenger between the worker and open pages.
//!
//! Messages travel as JSON envelopes `{"type": ..., "payload": ...}` over
//! unbounded channels. Delivery is at most once per page with no
//! acknowledgements.

mod channel;
mod message;

pub use channel::{ClientInfo, Inbound, Messenger, PageChannel};
pub use message::{CacheStory, Message, OfflineStories, SyncSummary};
