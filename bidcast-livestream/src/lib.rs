pub mod cache;
pub mod context;
pub mod packet;
pub mod queue;
pub mod recorder;
pub mod registry;
pub mod relay;
pub mod session;
pub mod stream;

pub use context::ServerContext;
pub use registry::StreamRegistry;
