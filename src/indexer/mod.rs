pub mod chunker;
pub mod cursor;
pub mod pipeline;
pub mod scheduler;
pub mod source;
