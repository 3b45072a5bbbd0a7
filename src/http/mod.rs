//! HTTP/1.1 message types, parsing, and response encoding.

pub mod encoder;
mod headers;
pub mod parser;
mod request;
mod response;

pub use headers::Headers;
pub use parser::{ParserEvent, ParserSession};
pub use request::{Request, RequestHead};
pub use response::{http_date, reason_phrase, Response, ResponseEvent};
