//! Protocol analyzers: content classification, TLS, HTTP/1, HTTP/2 and DNS,
//! fanned out by [`dispatcher::dispatch`] per reassembled connection.

#![warn(missing_docs)]

pub mod content;
pub mod dispatcher;
pub mod dns;
pub mod http;
pub mod http2;
pub mod tls;

pub use content::Content;
pub use dispatcher::dispatch;
pub use dns::Dns;
pub use http::HttpRequest;
pub use http2::Http2;
pub use tls::Tls;
