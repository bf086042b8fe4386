//! Application-facing services: the bucket façade and the URL multiplexer.

pub mod bucket;
pub mod url_mux;
