//! Remote authority: the story backend and its wire types.

pub mod api_types;
mod client;
mod types;

pub use client::{RemoteAuthority, StoryApiClient};
pub use types::{NewStory, Story};
