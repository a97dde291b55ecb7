//! Gpugate - an inference gateway that shares one GPU between model servers
//!
//! This library provides a path-routing reverse proxy that:
//! - Routes HTTP traffic by request path to configured inference backends
//! - Answers 202 and wakes a backend in the background when it is not ready
//! - Puts idle backends to sleep through their sleep API to free GPU memory
//! - Stops idle backend containers entirely after a longer idle period
//! - Streams request and response bodies without buffering

pub mod activity;
pub mod admin;
pub mod config;
pub mod container;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod pool;
pub mod proxy;
pub mod registry;
