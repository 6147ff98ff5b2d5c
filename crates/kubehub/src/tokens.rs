//! Service account tokens minted through the TokenRequest API and cached
//! until half their lifetime has passed.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use carto_api::{TokenError, TokenManager};
use chrono::{DateTime, Utc};
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::{Api, PostParams};
use kube::Client;
use metrics::counter;
use rand::Rng;
use rustc_hash::FxHashMap;
use secrecy::SecretString;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// A freshly minted token and when it stops working.
pub struct Minted {
    pub token: SecretString,
    pub expires: DateTime<Utc>,
}

/// Source of new tokens; the kube implementation posts a TokenRequest.
#[async_trait::async_trait]
pub trait TokenMinter: Send + Sync {
    async fn mint(&self, namespace: &str, name: &str) -> Result<Minted, String>;
}

pub struct KubeTokenMinter {
    client: Client,
    expiration_seconds: i64,
}

/// Requested token lifetime in seconds, saturating at `i64::MAX`.
fn expiration_seconds(expiration: Duration) -> i64 {
    i64::try_from(expiration.as_secs()).unwrap_or(i64::MAX)
}

impl KubeTokenMinter {
    pub fn new(client: Client, expiration: Duration) -> Self {
        Self { client, expiration_seconds: expiration_seconds(expiration) }
    }
}

#[async_trait::async_trait]
impl TokenMinter for KubeTokenMinter {
    async fn mint(&self, namespace: &str, name: &str) -> Result<Minted, String> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let request = TokenRequest {
            spec: TokenRequestSpec { expiration_seconds: Some(self.expiration_seconds), ..Default::default() },
            ..Default::default()
        };
        let issued = api.create_token_request(name, &PostParams::default(), &request).await.map_err(|e| e.to_string())?;
        let status = issued.status.ok_or_else(|| "token request returned no status".to_string())?;
        Ok(Minted { token: SecretString::new(status.token), expires: status.expiration_timestamp.0 })
    }
}

type Key = (String, String, String);

struct Cached {
    token: SecretString,
    expires: DateTime<Utc>,
    refresh_at: DateTime<Utc>,
}

/// Refresh point: half the lifetime plus up to a tenth of it as jitter.
fn refresh_point(issued: DateTime<Utc>, expires: DateTime<Utc>) -> DateTime<Utc> {
    let ttl = expires - issued;
    if ttl <= chrono::Duration::zero() {
        return issued;
    }
    let jitter_ms = rand::thread_rng().gen_range(0..=ttl.num_milliseconds() / 10);
    issued + ttl / 2 + chrono::Duration::milliseconds(jitter_ms)
}

/// Token cache keyed by service account namespace, name and uid.
pub struct TokenCache<M> {
    minter: M,
    entries: Mutex<FxHashMap<Key, Cached>>,
    gc_stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl<M: TokenMinter + 'static> TokenCache<M> {
    pub fn new(minter: M) -> Self {
        Self { minter, entries: Mutex::new(FxHashMap::default()), gc_stop: Mutex::new(None) }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Token for `sa` as of `now`, minting when absent or due for refresh.
    pub async fn token_at(&self, sa: &ServiceAccount, now: DateTime<Utc>) -> Result<SecretString, TokenError> {
        let namespace = sa.metadata.namespace.clone().unwrap_or_default();
        let name = sa.metadata.name.clone().unwrap_or_default();
        let Some(uid) = sa.metadata.uid.clone() else {
            return Err(TokenError::MissingUid(format!("{namespace}/{name}")));
        };
        let key = (namespace.clone(), name.clone(), uid);
        let sa_name = format!("{namespace}/{name}");

        let existing = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.get(&key).map(|c| (c.token.clone(), c.expires, c.refresh_at))
        };
        if let Some((token, _, refresh_at)) = &existing {
            if now < *refresh_at {
                return Ok(token.clone());
            }
        }

        match self.minter.mint(&namespace, &name).await {
            Ok(minted) => {
                counter!("token_refresh_total", 1u64);
                debug!(sa = %sa_name, expires = %minted.expires, "minted token");
                let cached = Cached { token: minted.token.clone(), expires: minted.expires, refresh_at: refresh_point(now, minted.expires) };
                self.entries.lock().unwrap_or_else(PoisonError::into_inner).insert(key, cached);
                Ok(minted.token)
            }
            Err(msg) => match existing {
                Some((token, expires, _)) if now < expires => {
                    warn!(sa = %sa_name, error = %msg, "token refresh failed, using cached token");
                    Ok(token)
                }
                _ => Err(TokenError::Request { sa: sa_name, msg }),
            },
        }
    }

    /// Drop entries that expired before `now`; returns how many went.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, c| c.expires > now);
        before - entries.len()
    }

    /// Spawn the eviction task; a running task is replaced.
    pub fn start(self: &Arc<Self>, every: Duration) {
        let (tx, mut rx) = oneshot::channel();
        if let Some(old) = self.gc_stop.lock().unwrap_or_else(PoisonError::into_inner).replace(tx) {
            let _ = old.send(());
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(cache) = weak.upgrade() else { break };
                        let evicted = cache.evict_expired(Utc::now());
                        if evicted > 0 {
                            info!(evicted, "expired tokens evicted");
                        }
                    }
                    _ = &mut rx => break,
                }
            }
            debug!("token gc stopped");
        });
    }

    pub fn stop(&self) {
        if let Some(tx) = self.gc_stop.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(());
        }
    }
}

impl<M> Drop for TokenCache<M> {
    fn drop(&mut self) {
        if let Some(tx) = self.gc_stop.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait::async_trait]
impl<M: TokenMinter + 'static> TokenManager for TokenCache<M> {
    async fn get_service_account_token(&self, sa: &ServiceAccount) -> Result<SecretString, TokenError> {
        self.token_at(sa, Utc::now()).await
    }
}
