pub mod lines;
pub mod sse;

pub use lines::LineReassembler;
pub use sse::{data_frame, done_frame, is_done_payload};
