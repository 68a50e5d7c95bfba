//! Svcproxy - A label-selector service proxy
//!
//! This library provides a TCP proxy that:
//! - Exposes each registered service on its own external port
//! - Discovers backends by querying a label-selector API for running pods
//! - Spreads accepted connections across backends in strict round-robin order
//! - Relays bytes in both directions with half-close semantics
//! - Adds and removes services at runtime through a management API

pub mod admin;
pub mod config;
pub mod discovery;
pub mod error;
pub mod forward;
pub mod proxy;
pub mod registry;
pub mod rotator;
pub mod service;
