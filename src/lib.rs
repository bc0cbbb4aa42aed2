#![forbid(unsafe_code)]

//! VideyLite server library: catalog storage, byte-range streaming with
//! deduplicated view counting, and the public HTTP surface.

pub mod blobs;
pub mod catalog;
pub mod config;
pub mod feeds;
pub mod range;
pub mod routes;
pub mod security;
pub mod streamer;
pub mod views;
