pub mod protocol;
pub mod ws;

pub use ws::{router, serve, start_server};
