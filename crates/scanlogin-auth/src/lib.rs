//! scanlogin auth - QR code login flow
//!
//! This crate provides:
//! - A single-flight long-poll engine with tiered backoff
//! - The QR login session: code minting, expiry refresh and teardown
//! - One-time provider script loading shared between sessions
//! - A terminal widget that prints the login code as a QR code

pub mod engine;
pub mod script;
pub mod session;
pub mod terminal;
pub mod widget;

pub use engine::{CodeRenewer, PendingResult, PollEngine, PollStart, StatusSource};
pub use script::ScriptLoader;
pub use session::QrLogin;
pub use terminal::{qr_connect_url, TerminalWidget};
pub use widget::{RenderRequest, Widget};
