//! proxybox: lifecycle orchestration for a proxy platform.
//!
//! A [`app::ProxyBox`] builds inbounds, outbounds, providers, a router and
//! the control-plane services from one [`config::Options`] tree, starts
//! them in dependency order and tears everything down exactly once.

#![allow(clippy::too_many_arguments, clippy::type_complexity)]

pub mod adapter;
pub mod api;
pub mod app;
pub mod common;
pub mod config;
pub mod log;
pub mod proxy;
pub mod router;

pub use app::{BoxOptions, ProxyBox};
pub use common::error::BoxError;
