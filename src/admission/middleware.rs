use crate::admission::{Decision, SlidingWindowLimiter, WindowKey};
use crate::error::AdmissionError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that gates requests through a [`SlidingWindowLimiter`].
///
/// `key_fn` extracts the [`WindowKey`] from each request (client address, project id, ...).
/// Requests without a key fail with [`AdmissionError::MissingKey`]; rejected requests fail with
/// [`AdmissionError::RateLimited`] and never reach the inner service.
pub struct AdmissionLayer<F> {
    limiter: Arc<SlidingWindowLimiter>,
    key_fn: Arc<F>,
}

impl<F> AdmissionLayer<F> {
    /// Create a new admission layer.
    pub fn new(limiter: Arc<SlidingWindowLimiter>, key_fn: F) -> Self {
        Self { limiter, key_fn: Arc::new(key_fn) }
    }

    pub fn limiter(&self) -> &Arc<SlidingWindowLimiter> {
        &self.limiter
    }
}

impl<F> Clone for AdmissionLayer<F> {
    fn clone(&self) -> Self {
        Self { limiter: Arc::clone(&self.limiter), key_fn: Arc::clone(&self.key_fn) }
    }
}

impl<F> std::fmt::Debug for AdmissionLayer<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionLayer").field("limiter", &self.limiter).finish_non_exhaustive()
    }
}

impl<S, F> Layer<S> for AdmissionLayer<F> {
    type Service = AdmissionService<S, F>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            limiter: Arc::clone(&self.limiter),
            key_fn: Arc::clone(&self.key_fn),
        }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
pub struct AdmissionService<S, F> {
    inner: S,
    limiter: Arc<SlidingWindowLimiter>,
    key_fn: Arc<F>,
}

impl<S: Clone, F> Clone for AdmissionService<S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            key_fn: Arc::clone(&self.key_fn),
        }
    }
}

impl<S: std::fmt::Debug, F> std::fmt::Debug for AdmissionService<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionService")
            .field("inner", &self.inner)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl<S, F, Req> Service<Req> for AdmissionService<S, F>
where
    S: Service<Req>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    S::Response: Send + 'static,
    F: Fn(&Req) -> Option<WindowKey>,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let Some(key) = (self.key_fn)(&req) else {
            return Box::pin(async { Err(AdmissionError::MissingKey) });
        };

        // The decision is taken before the inner call so a rejected request does no work.
        match self.limiter.check(&key) {
            Decision::Allowed { .. } => {
                let fut = self.inner.call(req);
                Box::pin(async move { fut.await.map_err(AdmissionError::Inner) })
            }
            Decision::Denied { retry_after } => {
                Box::pin(async move { Err(AdmissionError::RateLimited { key, retry_after }) })
            }
        }
    }
}
