//! HTTP service transport: sessions, pooling, and streaming results

pub mod message;
pub mod parser;
pub mod pool;
pub mod session;
pub mod streaming;

pub use message::{HttpRequest, HttpResponse};
pub use pool::{HttpSessionManager, PingReport, ServiceRequest};
pub use session::HttpSession;
pub use streaming::JsonRowStreamer;
