pub mod auth;
pub mod rate_limit;
pub mod webhook;

pub use auth::{Claims, JwtAuth};
pub use rate_limit::RateLimiter;
pub use webhook::WebhookVerifier;
