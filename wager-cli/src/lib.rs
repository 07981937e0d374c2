pub mod app;
pub mod http;
pub mod telemetry;

pub use app::run as run_app;
