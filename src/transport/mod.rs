mod http_transport;
mod retry_policy;

pub use http_transport::HttpTransport;
pub(crate) use retry_policy::retry_delay;
