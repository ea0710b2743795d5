//! Relaygate - a reverse-proxy load balancer
//!
//! This library provides an HTTP load balancer that:
//! - Distributes requests over a pool of backends by round-robin or weighted selection
//! - Probes backends in the background and routes only to live ones
//! - Fails over once to a different backend when forwarding fails
//! - Optionally pins clients to a backend with sticky sessions
//! - Exposes an admin API for status and runtime backend changes

pub mod admin;
pub mod backend;
pub mod config;
pub mod error;
pub mod healthcheck;
pub mod loadbalancer;
pub mod pool;
pub mod proxy;
pub mod session;
pub mod tls;
pub mod upstream;
