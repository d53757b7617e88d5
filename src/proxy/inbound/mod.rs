mod direct;

pub use direct::DirectInbound;
