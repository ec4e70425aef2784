//! Disposal capabilities.
//!
//! A service is only disposed if its registration declares it, through
//! [`Recipe::disposable`](crate::recipe::Recipe::disposable),
//! [`Recipe::async_disposable`](crate::recipe::Recipe::async_disposable) or
//! [`Recipe::on_dispose`](crate::recipe::Recipe::on_dispose). Scoped
//! instances are disposed with their scope, singletons on
//! [`Container::shutdown`](crate::container::Container::shutdown).

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BoxError;
use crate::key::ServiceKey;
use crate::registry::{AnyInstance, BoxFuture, Disposer, downcast};

/// Synchronous teardown.
///
/// ```
/// use khidma_container::dispose::Dispose;
/// use khidma_container::error::BoxError;
///
/// struct AuditLog;
///
/// impl Dispose for AuditLog {
///     fn dispose(&self) -> Result<(), BoxError> {
///         // flush buffered entries
///         Ok(())
///     }
/// }
/// ```
pub trait Dispose: Send + Sync {
    fn dispose(&self) -> Result<(), BoxError>;
}

/// Asynchronous teardown, e.g. committing and closing a session.
#[async_trait]
pub trait AsyncDispose: Send + Sync {
    async fn dispose(&self) -> Result<(), BoxError>;
}

pub(crate) fn sync_disposer<T>(key: ServiceKey) -> Disposer
where
    T: ?Sized + Dispose + 'static,
{
    custom_disposer::<T, _>(key, |service: &T| service.dispose())
}

pub(crate) fn async_disposer<T>(key: ServiceKey) -> Disposer
where
    T: ?Sized + AsyncDispose + 'static,
{
    Arc::new(move |instance: AnyInstance| -> BoxFuture<'static, Result<(), BoxError>> {
        let service = downcast::<T>(&key, &instance);
        Box::pin(async move {
            match service {
                Ok(service) => service.dispose().await,
                Err(mismatch) => Err(Box::new(mismatch) as BoxError),
            }
        })
    })
}

pub(crate) fn custom_disposer<T, F>(key: ServiceKey, dispose: F) -> Disposer
where
    T: ?Sized + Send + Sync + 'static,
    F: Fn(&T) -> Result<(), BoxError> + Send + Sync + 'static,
{
    Arc::new(move |instance: AnyInstance| -> BoxFuture<'static, Result<(), BoxError>> {
        let outcome = match downcast::<T>(&key, &instance) {
            Ok(service) => dispose(&service),
            Err(mismatch) => Err(Box::new(mismatch) as BoxError),
        };
        Box::pin(std::future::ready(outcome))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::erase;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Session {
        closed: AtomicUsize,
    }

    impl Dispose for Session {
        fn dispose(&self) -> Result<(), BoxError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl AsyncDispose for Session {
        async fn dispose(&self) -> Result<(), BoxError> {
            tokio::task::yield_now().await;
            self.closed.fetch_add(10, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn sync_disposer_reaches_service() {
        let session = Arc::new(Session { closed: AtomicUsize::new(0) });
        let disposer = sync_disposer::<Session>(ServiceKey::of::<Session>());

        disposer(erase(session.clone())).await.unwrap();
        assert_eq!(session.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn async_disposer_is_awaited() {
        let session = Arc::new(Session { closed: AtomicUsize::new(0) });
        let disposer = async_disposer::<Session>(ServiceKey::of::<Session>());

        disposer(erase(session.clone())).await.unwrap();
        assert_eq!(session.closed.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn wrong_payload_reports_mismatch() {
        let disposer = sync_disposer::<Session>(ServiceKey::of::<Session>());
        let err = disposer(erase(Arc::new(5u8))).await.unwrap_err();
        assert!(err.to_string().contains("Type mismatch"));
    }
}
