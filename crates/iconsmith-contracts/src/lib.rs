pub mod errors;
pub mod events;
pub mod prompt;
pub mod providers;
pub mod quota;
pub mod request;
pub mod task;
pub mod wire;
