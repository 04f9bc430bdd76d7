//! Scoped collaborator handles.
//!
//! A [`ScopeFactory`] hands out short-lived [`Scoped`] leases on a shared
//! collaborator. A bounded factory caps the number of live leases; each lease
//! gives its slot back when dropped, on success and error paths alike.

use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::error::JobError;

pub struct ScopeFactory<T: ?Sized> {
    inner: Arc<T>,
    leases: Option<Arc<Semaphore>>,
}

impl<T: ?Sized> Clone for ScopeFactory<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            leases: self.leases.clone(),
        }
    }
}

impl<T: ?Sized> ScopeFactory<T> {
    /// Factory without a lease limit.
    pub fn new(inner: Arc<T>) -> Self {
        Self {
            inner,
            leases: None,
        }
    }

    /// Factory allowing at most `max_leases` concurrent leases.
    pub fn bounded(inner: Arc<T>, max_leases: usize) -> Self {
        Self {
            inner,
            leases: Some(Arc::new(Semaphore::new(max_leases))),
        }
    }

    /// Waits for a free slot and returns a lease.
    pub async fn acquire(&self) -> Result<Scoped<T>, JobError> {
        let permit = match &self.leases {
            Some(leases) => Some(
                Arc::clone(leases)
                    .acquire_owned()
                    .await
                    .map_err(|_| JobError::Cancelled)?,
            ),
            None => None,
        };

        Ok(Scoped {
            value: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Free lease slots, or `None` for an unbounded factory.
    #[cfg(test)]
    fn available_leases(&self) -> Option<usize> {
        self.leases.as_ref().map(|s| s.available_permits())
    }
}

/// A live lease on a collaborator. Dereferences to the collaborator.
pub struct Scoped<T: ?Sized> {
    value: Arc<T>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl<T: ?Sized> Deref for Scoped<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> &'static str;
    }

    struct Hello;

    impl Greeter for Hello {
        fn greet(&self) -> &'static str {
            "hello"
        }
    }

    fn greeter() -> Arc<dyn Greeter> {
        Arc::new(Hello)
    }

    async fn failing_call(factory: &ScopeFactory<dyn Greeter>) -> Result<(), JobError> {
        let scoped = factory.acquire().await?;
        assert_eq!(scoped.greet(), "hello");
        Err(JobError::Transform("boom".into()))
    }

    #[tokio::test]
    async fn lease_is_released_on_error_path() {
        let factory = ScopeFactory::bounded(greeter(), 1);

        assert!(failing_call(&factory).await.is_err());
        assert_eq!(factory.available_leases(), Some(1));
    }

    #[tokio::test]
    async fn bounded_factory_limits_live_leases() {
        let factory = ScopeFactory::bounded(greeter(), 2);

        let first = factory.acquire().await.unwrap();
        let _second = factory.acquire().await.unwrap();
        assert_eq!(factory.available_leases(), Some(0));

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            factory.acquire(),
        )
        .await;
        assert!(blocked.is_err());

        drop(first);
        assert_eq!(factory.available_leases(), Some(1));
        assert!(factory.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn unbounded_factory_reports_no_limit() {
        let factory = ScopeFactory::new(greeter());
        let scoped = factory.acquire().await.unwrap();
        assert_eq!(scoped.greet(), "hello");
        assert_eq!(factory.available_leases(), None);
    }
}
