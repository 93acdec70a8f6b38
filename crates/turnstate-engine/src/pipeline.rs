//! Turn pipeline.
//!
//! Middleware runs in registration order around a final [`TurnHandler`]. Each
//! middleware receives a [`Next`] and decides when (or whether) the rest of
//! the chain runs, which lets state components do work both before and after
//! the bot logic.
//!
//! ```text
//!   activity ──► FrameManager ──► ChangeTracker ──► handler
//!                  pre_load          (nothing)         bot logic
//!                  save     ◄──────  save_changes ◄────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{Instrument, debug, info_span};

use crate::activity::Activity;
use crate::clock::{Clock, SystemClock};
use crate::context::TurnContext;
use crate::error::Result;

/// A component wrapped around every turn.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Handle the turn. Call `next.run(ctx)` to continue the chain.
    async fn on_turn(&self, ctx: &TurnContext, next: Next<'_>) -> Result<()>;
}

/// Bot logic at the end of the pipeline.
#[async_trait]
pub trait TurnHandler: Send + Sync {
    async fn on_turn(&self, ctx: &TurnContext) -> Result<()>;
}

/// [`TurnHandler`] backed by a closure. Build one with [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap a closure returning a boxed future as a [`TurnHandler`].
///
/// ```ignore
/// let handler = handler_fn(|ctx| async move { /* ... */ Ok(()) }.boxed());
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: for<'a> Fn(&'a TurnContext) -> BoxFuture<'a, Result<()>> + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> TurnHandler for FnHandler<F>
where
    F: for<'a> Fn(&'a TurnContext) -> BoxFuture<'a, Result<()>> + Send + Sync,
{
    async fn on_turn(&self, ctx: &TurnContext) -> Result<()> {
        (self.0)(ctx).await
    }
}

/// The remainder of the pipeline after the current middleware.
pub struct Next<'a> {
    middleware: &'a [Arc<dyn Middleware>],
    handler: &'a dyn TurnHandler,
}

impl<'a> Next<'a> {
    /// Run the remaining middleware, then the handler.
    pub async fn run(self, ctx: &TurnContext) -> Result<()> {
        match self.middleware.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    middleware: rest,
                    handler: self.handler,
                };
                head.on_turn(ctx, next).await
            }
            None => self.handler.on_turn(ctx).await,
        }
    }
}

/// Ordered middleware chain plus the clock handed to each turn.
#[derive(Clone)]
pub struct TurnPipeline {
    middleware: Vec<Arc<dyn Middleware>>,
    clock: Arc<dyn Clock>,
}

impl Default for TurnPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnPipeline {
    pub fn new() -> Self {
        Self {
            middleware: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for every context this pipeline creates.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Append a middleware. Middleware runs in the order it was added.
    pub fn use_middleware(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middleware.push(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Run one turn for `activity` in a fresh context.
    pub async fn run(&self, activity: Activity, handler: &dyn TurnHandler) -> Result<()> {
        let ctx = TurnContext::with_clock(activity, self.clock.clone());
        self.run_with_context(&ctx, handler).await
    }

    /// Run one turn in a caller-supplied context.
    pub async fn run_with_context(
        &self,
        ctx: &TurnContext,
        handler: &dyn TurnHandler,
    ) -> Result<()> {
        let span = info_span!(
            "turn",
            turn_id = %ctx.id(),
            activity_type = %ctx.activity().activity_type,
        );
        async {
            debug!(middleware = self.middleware.len(), "turn started");
            let next = Next {
                middleware: &self.middleware,
                handler,
            };
            let result = next.run(ctx).await;
            debug!(ok = result.is_ok(), "turn finished");
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use futures::FutureExt;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        short_circuit: bool,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn on_turn(&self, ctx: &TurnContext, next: Next<'_>) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:before", self.name));
            if !self.short_circuit {
                next.run(ctx).await?;
            }
            self.log.lock().unwrap().push(format!("{}:after", self.name));
            Ok(())
        }
    }

    fn activity() -> Activity {
        Activity::message("cli", "bot", "alice", "c1", "hi")
    }

    #[tokio::test]
    async fn middleware_wraps_handler_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = TurnPipeline::new();
        for name in ["a", "b"] {
            pipeline.use_middleware(Arc::new(Recorder {
                name,
                log: log.clone(),
                short_circuit: false,
            }));
        }

        let handler_log = log.clone();
        let handler = handler_fn(move |_ctx| {
            let log = handler_log.clone();
            async move {
                log.lock().unwrap().push("handler".into());
                Ok::<(), EngineError>(())
            }
            .boxed()
        });
        pipeline.run(activity(), &handler).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:before", "b:before", "handler", "b:after", "a:after"]
        );
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = TurnPipeline::new();
        pipeline.use_middleware(Arc::new(Recorder {
            name: "gate",
            log: log.clone(),
            short_circuit: true,
        }));

        let handler =
            handler_fn(|_ctx| async { Err::<(), _>(EngineError::Handler("ran".into())) }.boxed());
        pipeline.run(activity(), &handler).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["gate:before", "gate:after"]);
    }

    #[tokio::test]
    async fn handler_error_propagates() {
        let pipeline = TurnPipeline::new();
        let handler =
            handler_fn(|_ctx| async { Err::<(), _>(EngineError::Handler("boom".into())) }.boxed());
        let err = pipeline.run(activity(), &handler).await.unwrap_err();
        assert!(matches!(err, EngineError::Handler(msg) if msg == "boom"));
    }
}
