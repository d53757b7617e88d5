mod block;
mod direct;

pub use block::BlockOutbound;
pub use direct::DirectOutbound;
