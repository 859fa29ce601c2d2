//! HTTP service dispatch and streaming row parsing

pub mod pool;
pub mod rows;

pub use pool::{HttpDispatcher, HttpMethod, HttpRequest, HttpResponse};
pub use rows::RowLexer;
