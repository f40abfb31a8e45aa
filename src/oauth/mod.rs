//! OAuth token lifecycle: flow strategies (C4) and the caching/validating
//! provider built on top of them (C5).

pub mod csrf;
pub mod flows;
pub mod provider;
pub mod token;

pub use flows::{
    AuthorizationCodeFlow, ClientCredentialsFlow, DeviceCodeFlow, DeviceCodeResponse,
    DevicePollOutcome, ImplicitFlow, Refreshable, TokenFlow,
};
pub use provider::{PeriodicValidationHandle, TokenProvider, TokenSource};
pub use token::{AccessToken, TokenKind};
