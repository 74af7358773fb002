pub mod canonical;
pub mod encoder;
pub mod request;
pub mod upstream;

pub use canonical::{CanonicalEvent, Message, Part, Role, ToolServerDescriptor};
pub use encoder::encode;
pub use upstream::{decode_line, UpstreamEvent};
