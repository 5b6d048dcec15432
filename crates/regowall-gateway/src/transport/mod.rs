//! Transport layer (HTTP).

pub mod http;
