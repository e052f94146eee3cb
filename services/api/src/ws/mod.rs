//! Progress Push over WebSockets
//!
//! - `protocol`: the JSON messages exchanged with the browser.
//! - `session`: one connection per subscriber, forwarding a course's
//!   progress events until the client leaves or the course is deleted.

pub mod protocol;
pub mod session;

pub use session::ws_handler;
