//! HTTP front end: rate limit middleware and a JSON decision API.

mod api;
mod layer;
mod server;

pub use api::{ApiError, RateLimitBody, RateLimitReply};
pub use layer::{AuthenticatedUser, HttpLimitPolicy, RateLimitLayer, RateLimitRejection, RateLimitService};
pub use server::HttpServer;
