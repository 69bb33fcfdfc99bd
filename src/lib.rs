#![forbid(unsafe_code)]

//! ReelTube: short-video sharing backend.
//!
//! The library holds everything the `backend` binary wires together so the
//! HTTP surface can be exercised in tests against an in-memory database.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod media;
pub mod ranking;
pub mod security;
