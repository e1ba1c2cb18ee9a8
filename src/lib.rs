//! Vetrina: a pooled server-side-rendering gateway.
//!
//! The crate owns a fixed-size pool of reusable headless rendering
//! environments and the HTTP pipeline that classifies incoming requests,
//! pre-fetches route data, drives an environment through a render, and
//! falls back to client-side rendering whenever anything goes wrong.

pub mod application;
pub mod config;
pub mod infra;
