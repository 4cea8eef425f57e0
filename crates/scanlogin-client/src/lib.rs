//! scanlogin client - Backend transport and API calls
//!
//! [`Transport`] is the seam between the login flow and the network;
//! [`ApiClient`] speaks the backend's envelope protocol on top of it.

pub mod api;
pub mod transport;

pub use api::{ApiClient, MintedCode};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
