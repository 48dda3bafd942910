//! System-under-test adapters.
//!
//! A SUT is described by explicit hook bindings rather than discovered by name:
//! `infer` is required, `setup` and `teardown` are optional and default to no-ops.
//! Each worker calls its factory once to build a private instance.

use futures::future::{FutureExt, LocalBoxFuture};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::Arc;

use crate::query::{Metrics, QueryId};
use crate::worker::WorkerKind;

/// What a worker hands to `infer`
#[derive(Debug, Clone)]
pub struct Request<P> {
    pub id: QueryId,
    /// `None` when the benchmark was given no payload set; the SUT builds its own
    /// input from `id` instead
    pub payload: Option<P>,
}

/// `infer` result: metrics to merge into the record, or the failure
pub type InferOutput = anyhow::Result<Metrics>;

type SyncHook = Box<dyn FnOnce() -> anyhow::Result<()>>;
type SyncInfer<P> = Arc<dyn Fn(Request<P>) -> InferOutput + Send + Sync>;

/// SUT served by a pool of OS threads inside one worker
pub struct SyncSut<P> {
    setup: Option<SyncHook>,
    infer: SyncInfer<P>,
    teardown: Option<SyncHook>,
}

impl<P> SyncSut<P> {
    pub fn new<F>(infer: F) -> Self
    where
        F: Fn(Request<P>) -> InferOutput + Send + Sync + 'static,
    {
        Self {
            setup: None,
            infer: Arc::new(infer),
            teardown: None,
        }
    }

    pub fn with_setup<F>(mut self, setup: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + 'static,
    {
        self.setup = Some(Box::new(setup));
        self
    }

    pub fn with_teardown<F>(mut self, teardown: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + 'static,
    {
        self.teardown = Some(Box::new(teardown));
        self
    }

    /// Run the setup hook, if any
    pub(crate) fn setup(&mut self) -> anyhow::Result<()> {
        match self.setup.take() {
            Some(setup) => setup(),
            None => Ok(()),
        }
    }

    pub(crate) fn infer_handle(&self) -> SyncInfer<P> {
        self.infer.clone()
    }

    /// Run the teardown hook, if any
    pub(crate) fn teardown(&mut self) -> anyhow::Result<()> {
        match self.teardown.take() {
            Some(teardown) => teardown(),
            None => Ok(()),
        }
    }
}

type AsyncHook = Box<dyn FnOnce() -> LocalBoxFuture<'static, anyhow::Result<()>>>;
type AsyncInfer<P> = Rc<dyn Fn(Request<P>) -> LocalBoxFuture<'static, InferOutput>>;

/// SUT served by cooperative tasks on a single-threaded runtime
pub struct AsyncSut<P> {
    setup: Option<AsyncHook>,
    infer: AsyncInfer<P>,
    teardown: Option<AsyncHook>,
}

impl<P: 'static> AsyncSut<P> {
    pub fn new<F, Fut>(infer: F) -> Self
    where
        F: Fn(Request<P>) -> Fut + 'static,
        Fut: Future<Output = InferOutput> + 'static,
    {
        Self {
            setup: None,
            infer: Rc::new(move |req| infer(req).boxed_local()),
            teardown: None,
        }
    }

    pub fn with_setup<F, Fut>(mut self, setup: F) -> Self
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        self.setup = Some(Box::new(move || setup().boxed_local()));
        self
    }

    pub fn with_teardown<F, Fut>(mut self, teardown: F) -> Self
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        self.teardown = Some(Box::new(move || teardown().boxed_local()));
        self
    }

    pub(crate) async fn setup(&mut self) -> anyhow::Result<()> {
        match self.setup.take() {
            Some(setup) => setup().await,
            None => Ok(()),
        }
    }

    pub(crate) fn infer_handle(&self) -> AsyncInfer<P> {
        self.infer.clone()
    }

    pub(crate) async fn teardown(&mut self) -> anyhow::Result<()> {
        match self.teardown.take() {
            Some(teardown) => teardown().await,
            None => Ok(()),
        }
    }
}

/// Builds one SUT per worker; the argument is the worker index
pub enum SutFactory<P> {
    Sync(Arc<dyn Fn(usize) -> anyhow::Result<SyncSut<P>> + Send + Sync>),
    Async(Arc<dyn Fn(usize) -> anyhow::Result<AsyncSut<P>> + Send + Sync>),
}

impl<P> SutFactory<P> {
    pub fn sync<F>(factory: F) -> Self
    where
        F: Fn(usize) -> anyhow::Result<SyncSut<P>> + Send + Sync + 'static,
    {
        SutFactory::Sync(Arc::new(factory))
    }

    pub fn asynchronous<F>(factory: F) -> Self
    where
        F: Fn(usize) -> anyhow::Result<AsyncSut<P>> + Send + Sync + 'static,
    {
        SutFactory::Async(Arc::new(factory))
    }

    pub fn kind(&self) -> WorkerKind {
        match self {
            SutFactory::Sync(_) => WorkerKind::Sync,
            SutFactory::Async(_) => WorkerKind::Async,
        }
    }
}

impl<P> Clone for SutFactory<P> {
    fn clone(&self) -> Self {
        match self {
            SutFactory::Sync(f) => SutFactory::Sync(f.clone()),
            SutFactory::Async(f) => SutFactory::Async(f.clone()),
        }
    }
}

/// Run a blocking `infer`, turning errors and panics into a failed outcome
pub(crate) fn call_sync<P>(
    infer: &(dyn Fn(Request<P>) -> InferOutput + Send + Sync),
    request: Request<P>,
) -> InferOutput {
    let id = request.id;
    match std::panic::catch_unwind(AssertUnwindSafe(|| infer(request))) {
        Ok(output) => output,
        Err(panic) => Err(anyhow::anyhow!(
            "infer panicked on query {}: {}",
            id,
            panic_message(panic.as_ref())
        )),
    }
}

/// Await an async `infer`, turning errors and panics into a failed outcome
pub(crate) async fn call_async(
    fut: LocalBoxFuture<'static, InferOutput>,
    id: QueryId,
) -> InferOutput {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(output) => output,
        Err(panic) => Err(anyhow::anyhow!(
            "infer panicked on query {}: {}",
            id,
            panic_message(panic.as_ref())
        )),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
