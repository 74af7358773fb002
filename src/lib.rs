pub(crate) mod api;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod routing;
pub mod session;
pub mod state;
pub mod stream;
pub mod transport;
pub mod turn;

mod util;
