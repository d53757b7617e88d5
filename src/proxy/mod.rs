//! Built-in inbounds, outbounds and the subscription proxy provider.

pub mod inbound;
pub mod outbound;
pub mod provider;
