pub mod error;
pub mod routes;
pub mod webhook;

pub use error::{ApiError, ApiResult};
pub use routes::{router, ApiState};
pub use webhook::WebhookNotifier;
