pub mod connection;
pub mod feed;
mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use connection::Database;
pub use feed::LocalRenderStore;
pub use models::{RenderRecord, RenderScope, RenderStatus};
