//! Lazily refreshed bearer tokens shared by every send of one service instance.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::notifications::error::NotifyResult;

/// Refresh this long before the issuer's expiry.
pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated {
        token: String,
        expires_at: Option<Instant>,
    },
    Reauthenticating,
}

/// A token handed back by a login or token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    /// `None` for tokens that do not expire (Matrix access tokens).
    pub expires_in: Option<Duration>,
}

#[derive(Debug)]
pub struct TokenCache {
    state: Mutex<AuthState>,
    refresh: tokio::sync::Mutex<()>,
    skew: Duration,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_SKEW)
    }
}

impl TokenCache {
    pub fn new(skew: Duration) -> Self {
        Self {
            state: Mutex::new(AuthState::Unauthenticated),
            refresh: tokio::sync::Mutex::new(()),
            skew,
        }
    }

    /// Cache pre-seeded with a caller-supplied token.
    pub fn with_token(token: impl Into<String>) -> Self {
        let cache = Self::default();
        cache.set(AuthState::Authenticated {
            token: token.into(),
            expires_at: None,
        });
        cache
    }

    pub fn state(&self) -> AuthState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or(AuthState::Unauthenticated)
    }

    /// The cached token when it is still valid past the refresh skew.
    pub fn current(&self) -> Option<String> {
        match self.state() {
            AuthState::Authenticated { token, expires_at } => match expires_at {
                Some(expires_at) if Instant::now() + self.skew >= expires_at => None,
                _ => Some(token),
            },
            _ => None,
        }
    }

    /// Return the cached token, or run `fetch` to obtain a new one.
    ///
    /// Only one refresh runs at a time; callers that queued behind it reuse
    /// its result.
    pub async fn token<F, Fut>(&self, fetch: F) -> NotifyResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = NotifyResult<IssuedToken>>,
    {
        if let Some(token) = self.current() {
            return Ok(token);
        }
        let _guard = self.refresh.lock().await;
        if let Some(token) = self.current() {
            return Ok(token);
        }

        let next = match self.state() {
            AuthState::Authenticated { .. } | AuthState::Reauthenticating => AuthState::Reauthenticating,
            _ => AuthState::Authenticating,
        };
        self.set(next);

        match fetch().await {
            Ok(issued) => {
                let expires_at = issued.expires_in.map(|ttl| Instant::now() + ttl);
                self.set(AuthState::Authenticated {
                    token: issued.token.clone(),
                    expires_at,
                });
                tracing::debug!(event = "token_refreshed", ttl = ?issued.expires_in, "cached a new access token");
                Ok(issued.token)
            }
            Err(err) => {
                self.set(AuthState::Unauthenticated);
                Err(err)
            }
        }
    }

    /// Forget the cached token, typically after the provider answered 401.
    pub fn invalidate(&self) {
        self.set(AuthState::Unauthenticated);
    }

    fn set(&self, next: AuthState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::notifications::error::NotifyError;

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let cache = Arc::new(TokenCache::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .token(|| async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(IssuedToken {
                            token: "abc".to_string(),
                            expires_in: Some(Duration::from_secs(3600)),
                        })
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "abc");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(cache.state(), AuthState::Authenticated { .. }));
    }

    #[tokio::test]
    async fn near_expiry_tokens_are_refreshed() {
        let cache = TokenCache::default();
        cache
            .token(|| async {
                Ok(IssuedToken {
                    token: "short".to_string(),
                    expires_in: Some(Duration::from_secs(30)),
                })
            })
            .await
            .unwrap();
        // 30s of life is inside the 60s skew.
        assert_eq!(cache.current(), None);
        let token = cache
            .token(|| async {
                Ok(IssuedToken {
                    token: "long".to_string(),
                    expires_in: None,
                })
            })
            .await
            .unwrap();
        assert_eq!(token, "long");
    }

    #[tokio::test]
    async fn failed_refresh_resets_state() {
        let cache = TokenCache::with_token("seed");
        assert_eq!(cache.current().as_deref(), Some("seed"));
        cache.invalidate();
        let err = cache
            .token(|| async { Err(NotifyError::from_status(401, "bad secret")) })
            .await
            .unwrap_err();
        assert!(err.is_auth());
        assert_eq!(cache.state(), AuthState::Unauthenticated);
    }
}
