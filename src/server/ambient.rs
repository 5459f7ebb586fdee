//! Task-local access to a running proxy.
//!
//! Code that cannot have a [`ProxyContext`] passed to it can look one up with
//! [`current`] while running inside [`scope`]. The binding belongs to the
//! future given to `scope` only. Tasks started with `tokio::spawn` do not see
//! it; [`spawn`] starts a task that re-binds the caller's context.

use super::runtime::ProxyContext;
use crate::error::StateError;
use std::future::Future;
use tokio::task::JoinHandle;

tokio::task_local! {
    static CURRENT_PROXY: ProxyContext;
}

/// Run `future` with `context` bound as the ambient proxy. Nested scopes
/// shadow the outer binding for their duration.
pub async fn scope<F>(context: ProxyContext, future: F) -> F::Output
where
    F: Future,
{
    CURRENT_PROXY.scope(context, future).await
}

pub fn current() -> Result<ProxyContext, StateError> {
    CURRENT_PROXY
        .try_with(ProxyContext::clone)
        .map_err(|_| StateError::NoAmbientProxy)
}

/// Spawn `future` on the runtime, inheriting the caller's ambient proxy if
/// there is one.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current() {
        Ok(context) => tokio::spawn(CURRENT_PROXY.scope(context, future)),
        Err(_) => tokio::spawn(future),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::runtime::Shared;
    use std::sync::Arc;

    fn context() -> ProxyContext {
        ProxyContext::new(Arc::new(Shared::default()))
    }

    #[tokio::test]
    async fn test_no_binding_outside_scope() {
        assert!(matches!(current(), Err(StateError::NoAmbientProxy)));
    }

    #[tokio::test]
    async fn test_binding_visible_inside_scope() {
        let found = scope(context(), async { current().is_ok() }).await;
        assert!(found);
        assert!(current().is_err());
    }

    #[tokio::test]
    async fn test_plain_spawn_does_not_inherit() {
        let inherited = scope(context(), async {
            tokio::spawn(async { current().is_ok() })
                .await
                .expect("task")
        })
        .await;

        assert!(!inherited);
    }

    #[tokio::test]
    async fn test_ambient_spawn_inherits() {
        let inherited = scope(context(), async {
            spawn(async { current().is_ok() }).await.expect("task")
        })
        .await;

        assert!(inherited);
    }

    #[tokio::test]
    async fn test_ambient_spawn_without_binding() {
        let inherited = spawn(async { current().is_ok() }).await.expect("task");
        assert!(!inherited);
    }
}
