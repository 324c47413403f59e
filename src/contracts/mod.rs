pub mod message;
pub mod record_policy;

pub use message::Message;
pub use record_policy::RecordPolicy;
