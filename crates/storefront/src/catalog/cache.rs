use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use storefront_llm::BoxFuture;
use storefront_storage::{JsonStoreExt, KeyValueStore};

use super::error::CatalogResult;

/// Full validity window of a cached catalog.
pub const DEFAULT_CATALOG_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogSource {
    Origin,
    CacheFresh,
    CacheStaleFallback,
    StaticFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog<T> {
    pub items: Vec<T>,
    pub source: CatalogSource,
    pub warning: Option<String>,
}

impl<T> Catalog<T> {
    /// Fetched just now.
    pub fn from_origin(items: Vec<T>) -> Self {
        Self {
            items,
            source: CatalogSource::Origin,
            warning: None,
        }
    }

    /// Served from the store within its TTL.
    pub fn from_cache_fresh(items: Vec<T>) -> Self {
        Self {
            items,
            source: CatalogSource::CacheFresh,
            warning: None,
        }
    }

    /// Expired saved list kept because the origin failed; `warning` says why.
    pub fn from_cache_stale(items: Vec<T>, warning: String) -> Self {
        Self {
            items,
            source: CatalogSource::CacheStaleFallback,
            warning: Some(warning),
        }
    }

    /// Built-in defaults, used when neither the origin nor the store had a list.
    pub fn from_static_fallback(items: Vec<T>, warning: String) -> Self {
        Self {
            items,
            source: CatalogSource::StaticFallback,
            warning: Some(warning),
        }
    }

    /// True for both fresh and stale saved lists.
    pub fn from_cache(&self) -> bool {
        matches!(
            self.source,
            CatalogSource::CacheFresh | CatalogSource::CacheStaleFallback
        )
    }
}

/// Persisted form of a catalog: the items plus when they were fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedList<T> {
    pub items: Vec<T>,
    pub fetched_at: DateTime<Utc>,
}

impl<T> CachedList<T> {
    /// Stamps `items` with the current time.
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            fetched_at: Utc::now(),
        }
    }

    /// Timestamps from the future count as brand new.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    Fresh,
    RefreshInBackground,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    /// Past this age (but within `ttl`) the cache is still served and a refresh is
    /// started in the background.
    pub refresh_after: Option<Duration>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CATALOG_TTL)
    }
}

impl CachePolicy {
    /// Entries older than `ttl` are refetched; no background refresh.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            refresh_after: None,
        }
    }

    /// Entries older than `after` but within the TTL are served at once while a refresh
    /// runs in the background.
    pub fn with_background_refresh(mut self, after: Duration) -> Self {
        self.refresh_after = Some(after);
        self
    }

    fn freshness(&self, age: Duration) -> Freshness {
        if age >= self.ttl {
            return Freshness::Expired;
        }
        match self.refresh_after {
            Some(after) if age >= after => Freshness::RefreshInBackground,
            _ => Freshness::Fresh,
        }
    }
}

/// Where a catalog's items come from when the cache cannot answer.
pub trait CatalogOrigin<T>: Send + Sync {
    /// `false` means there is nothing to call; callers fall back without error.
    fn is_configured(&self) -> bool;

    fn fetch(&self) -> BoxFuture<'_, CatalogResult<Vec<T>>>;
}

struct CacheInner<T> {
    store: Arc<dyn KeyValueStore>,
    key: &'static str,
    policy: CachePolicy,
    origin: Arc<dyn CatalogOrigin<T>>,
    defaults: fn() -> Vec<T>,
    refreshing: AtomicBool,
}

/// Read-through cache persisted under one store key.
///
/// Fresh entries are served without touching the origin. Otherwise the origin is asked
/// and on failure the last known list (or the built-in defaults) is served instead;
/// only a forced refresh reports the failure.
pub struct ReadThroughCache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for ReadThroughCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> ReadThroughCache<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Cache saved under `key`. `defaults` backs the static fallback.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        key: &'static str,
        policy: CachePolicy,
        origin: Arc<dyn CatalogOrigin<T>>,
        defaults: fn() -> Vec<T>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                key,
                policy,
                origin,
                defaults,
                refreshing: AtomicBool::new(false),
            }),
        }
    }

    /// Store key the list is saved under.
    pub fn key(&self) -> &'static str {
        self.inner.key
    }

    pub fn policy(&self) -> CachePolicy {
        self.inner.policy
    }

    /// Saved list while fresh, else the origin, else the stale list or the defaults.
    /// 
    /// Errors only when `force_refresh` is set and the origin fails.
    pub async fn list(&self, force_refresh: bool) -> CatalogResult<Catalog<T>> {
        let inner = &self.inner;
        let cached = inner.load_cached();

        if let Some(cached) = cached.as_ref().filter(|_| !force_refresh) {
            match inner.policy.freshness(cached.age(Utc::now())) {
                Freshness::Fresh => return Ok(Catalog::from_cache_fresh(cached.items.clone())),
                Freshness::RefreshInBackground => {
                    self.spawn_refresh();
                    return Ok(Catalog::from_cache_fresh(cached.items.clone()));
                }
                Freshness::Expired => {}
            }
        }

        if !inner.origin.is_configured() {
            // Without an origin the saved list is all there is.
            return Ok(match cached {
                Some(cached) => Catalog::from_cache_fresh(cached.items),
                None => Catalog::from_static_fallback(
                    (inner.defaults)(),
                    format!("{} has no configured source; showing defaults", inner.key),
                ),
            });
        }

        match inner.fetch_and_store().await {
            Ok(items) => Ok(Catalog::from_origin(items)),
            Err(error) if force_refresh => Err(error),
            Err(error) => {
                tracing::warn!(key = inner.key, error = %error, "catalog fetch failed; serving fallback");
                Ok(match cached {
                    Some(cached) => Catalog::from_cache_stale(cached.items, error.to_string()),
                    None => Catalog::from_static_fallback((inner.defaults)(), error.to_string()),
                })
            }
        }
    }

    /// Last known list regardless of age, else the defaults.
    pub fn current_items(&self) -> Vec<T> {
        self.inner
            .load_cached()
            .map(|cached| cached.items)
            .unwrap_or_else(|| (self.inner.defaults)())
    }

    /// Stores `items` as a freshly fetched list.
    pub fn replace(&self, items: Vec<T>) {
        self.inner.store_items(items);
    }

    /// Removes the saved list.
    pub fn invalidate(&self) {
        if let Err(error) = self.inner.store.remove(self.inner.key) {
            tracing::warn!(key = self.inner.key, error = %error, "failed to drop cached catalog");
        }
    }

    fn spawn_refresh(&self) {
        if !self.inner.origin.is_configured() {
            return;
        }
        if self.inner.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tracing::debug!(key = inner.key, "refreshing catalog in background");
            if let Err(error) = inner.fetch_and_store().await {
                tracing::warn!(key = inner.key, error = %error, "background catalog refresh failed");
            }
            inner.refreshing.store(false, Ordering::Release);
        });
    }
}

impl<T> CacheInner<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn load_cached(&self) -> Option<CachedList<T>> {
        match self.store.load_json::<CachedList<T>>(self.key) {
            Ok(cached) => cached,
            Err(error) => {
                tracing::warn!(key = self.key, error = %error, "cached catalog unreadable; ignoring it");
                None
            }
        }
    }

    fn store_items(&self, items: Vec<T>) {
        if let Err(error) = self.store.save_json(self.key, &CachedList::new(items)) {
            tracing::warn!(key = self.key, error = %error, "failed to persist catalog");
        }
    }

    async fn fetch_and_store(&self) -> CatalogResult<Vec<T>> {
        let items = self.origin.fetch().await?;
        tracing::debug!(key = self.key, count = items.len(), "fetched catalog");
        self.store_items(items.clone());
        Ok(items)
    }
}
