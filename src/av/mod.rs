pub mod cmd;
pub mod pipeline;
pub mod probe;
pub mod progress;
pub mod stills;
