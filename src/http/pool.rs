//! Pooled reqwest clients grouped into three tuning classes.
//!
//! Each class keeps its own map from an arbitrary key (normally the service
//! id) to a client. Requests made through the same key share the client and
//! therefore its connection pool.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;

use crate::notifications::error::{NotifyError, NotifyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientClass {
    /// General use.
    Default,
    /// Slow, long-tail cloud APIs.
    Cloud,
    /// Fast failure across many small endpoints.
    Webhook,
}

/// Connection tuning for one [`ClientClass`].
///
/// reqwest exposes idle-per-host and idle lifetime directly; `max_idle` and
/// `max_per_host` are carried for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientProfile {
    pub timeout: Duration,
    pub max_idle: usize,
    pub max_per_host: usize,
    pub max_idle_per_host: usize,
    pub idle_lifetime: Duration,
}

impl ClientClass {
    pub const ALL: [ClientClass; 3] = [ClientClass::Default, ClientClass::Cloud, ClientClass::Webhook];

    pub fn profile(&self) -> ClientProfile {
        match self {
            ClientClass::Default => ClientProfile {
                timeout: Duration::from_secs(30),
                max_idle: 100,
                max_per_host: 30,
                max_idle_per_host: 10,
                idle_lifetime: Duration::from_secs(90),
            },
            ClientClass::Cloud => ClientProfile {
                timeout: Duration::from_secs(60),
                max_idle: 200,
                max_per_host: 50,
                max_idle_per_host: 20,
                idle_lifetime: Duration::from_secs(120),
            },
            ClientClass::Webhook => ClientProfile {
                timeout: Duration::from_secs(15),
                max_idle: 50,
                max_per_host: 20,
                max_idle_per_host: 5,
                idle_lifetime: Duration::from_secs(60),
            },
        }
    }

    fn index(&self) -> usize {
        match self {
            ClientClass::Default => 0,
            ClientClass::Cloud => 1,
            ClientClass::Webhook => 2,
        }
    }
}

#[derive(Debug, Default)]
pub struct HttpPools {
    pools: [DashMap<String, Client>; 3],
    insecure_tls: bool,
}

static GLOBAL_POOLS: OnceLock<Arc<HttpPools>> = OnceLock::new();

impl HttpPools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pools whose clients skip TLS certificate verification. Test use only.
    pub fn insecure() -> Self {
        Self {
            insecure_tls: true,
            ..Self::default()
        }
    }

    /// Process-wide pools shared by every dispatcher that does not bring its own.
    pub fn global() -> Arc<HttpPools> {
        Arc::clone(GLOBAL_POOLS.get_or_init(|| Arc::new(HttpPools::new())))
    }

    /// Fetch the client cached under `key`, building it on first use.
    pub fn client(&self, class: ClientClass, key: &str) -> NotifyResult<Client> {
        let pool = &self.pools[class.index()];
        if let Some(client) = pool.get(key) {
            return Ok(client.clone());
        }
        let client = pool
            .entry(key.to_string())
            .or_try_insert_with(|| build_client(class, self.insecure_tls))?
            .clone();
        tracing::debug!(
            event = "http_client_created",
            class = ?class,
            key = %key,
            "created pooled HTTP client"
        );
        Ok(client)
    }

    pub fn len(&self, class: ClientClass) -> usize {
        self.pools[class.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.iter().all(DashMap::is_empty)
    }

    /// Drop one cached client; its idle connections close once in-flight
    /// requests holding clones finish.
    pub fn remove(&self, class: ClientClass, key: &str) -> bool {
        self.pools[class.index()].remove(key).is_some()
    }

    /// Drop every cached client so idle connections are released.
    pub fn close_idle(&self) {
        for pool in &self.pools {
            pool.clear();
        }
    }
}

fn build_client(class: ClientClass, insecure_tls: bool) -> NotifyResult<Client> {
    let profile = class.profile();
    let mut builder = Client::builder()
        .timeout(profile.timeout)
        .connect_timeout(profile.timeout.min(Duration::from_secs(10)))
        .pool_max_idle_per_host(profile.max_idle_per_host)
        .pool_idle_timeout(profile.idle_lifetime)
        .tcp_keepalive(Duration::from_secs(30))
        .user_agent(concat!("herald/", env!("CARGO_PKG_VERSION")))
        .https_only(false);
    if insecure_tls {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder
        .build()
        .map_err(|err| NotifyError::Transport(format!("failed to build HTTP client: {err}")))
}
