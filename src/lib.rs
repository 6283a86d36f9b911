//! Browses the wallhaven picture catalog: paged thumbnail grids per
//! category, a progressive full-size preview, and ranged downloads.

pub mod backend;
pub mod config;
pub mod error;

pub use backend::events::{Event, EventReceiver};
pub use backend::viewer::Viewer;
pub use config::Config;
pub use error::{FetchError, Result};
