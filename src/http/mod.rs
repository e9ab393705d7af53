pub mod limiter;
pub mod oauth;
pub mod pool;
pub mod proxy;
pub mod response;

pub use limiter::TokenBucket;
pub use oauth::{AuthState, IssuedToken, TokenCache};
pub use pool::{ClientClass, ClientProfile, HttpPools};
pub use proxy::{ProxyAuth, ProxyConfig, ProxyEnvelope};
