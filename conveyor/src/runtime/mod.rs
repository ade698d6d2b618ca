mod builder;
mod supervisor;

pub use builder::QueueRuntimeBuilder;
pub use supervisor::QueueRuntime;
