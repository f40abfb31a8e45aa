//! Twitch EventSub (WebSocket) and Helix (REST) client.
//!
//! The entry point is [`client::TwitchClient`], built via
//! [`client::TwitchClient::builder`]. It wires together OAuth token
//! management ([`oauth`]), the event catalog ([`catalog`]), the Helix
//! request pipeline ([`helix`]), and the EventSub WebSocket session
//! ([`ws`]) to expose [`subscription::Subscription`] streams.

pub mod backoff;
pub mod catalog;
pub mod client;
pub mod error;
pub mod helix;
pub mod oauth;
pub mod ratelimit;
pub mod schema;
pub mod scope;
pub mod subscription;
pub mod ws;

pub use client::{ClientBuilder, TwitchClient};
pub use error::{Error, Result};
pub use subscription::Subscription;
