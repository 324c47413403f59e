pub mod contracts;
pub mod driver;
pub mod messaging;
pub mod metrics;
pub mod source;
