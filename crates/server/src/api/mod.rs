pub mod handlers;
pub mod middleware;
pub mod migrations;
pub mod routes;
pub mod watch;

pub use routes::create_router;
