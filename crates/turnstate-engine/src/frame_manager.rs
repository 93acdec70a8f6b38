//! Frame manager middleware.
//!
//! Owns the bot's root frames. Before the handler runs it preloads the frame
//! set most likely to be needed for the activity type; after the handler
//! returns it saves every frame bot logic actually touched and records that
//! set for future predictions.
//!
//! Preloading never marks a frame as accessed, so a frame that was loaded but
//! not used is neither saved nor counted.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::{debug, instrument};

use crate::access::{AccessPatternCache, PreloadScorer, WeightedScorer, pattern_key};
use crate::context::TurnContext;
use crate::error::Result;
use crate::frame::Frame;
use crate::pipeline::{Middleware, Next};
use crate::root_frame::RootFrame;

/// Middleware that preloads, saves, and learns access patterns for frames.
pub struct FrameManagerMiddleware {
    frames: Vec<Arc<RootFrame>>,
    patterns: AccessPatternCache,
    scorer: Arc<dyn PreloadScorer>,
}

impl FrameManagerMiddleware {
    pub fn new(frames: Vec<Arc<RootFrame>>) -> Self {
        Self {
            frames,
            patterns: AccessPatternCache::default(),
            scorer: Arc::new(WeightedScorer::default()),
        }
    }

    /// Use a preconfigured (possibly shared) pattern table.
    pub fn with_access_patterns(mut self, patterns: AccessPatternCache) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn PreloadScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn frames(&self) -> &[Arc<RootFrame>] {
        &self.frames
    }

    pub fn access_patterns(&self) -> &AccessPatternCache {
        &self.patterns
    }

    /// Indices of this manager's frames named by `namespaces`, or `None` if
    /// any of them belongs to a different manager sharing the table.
    fn resolve(&self, namespaces: &[String]) -> Option<Vec<usize>> {
        namespaces
            .iter()
            .map(|ns| self.frames.iter().position(|frame| frame.namespace() == ns.as_str()))
            .collect()
    }

    /// Indices of the highest-scoring recorded set for this activity type.
    ///
    /// The first pattern reaching the top score wins; ties do not replace it.
    async fn predict(&self, activity_type: &str) -> Option<Vec<usize>> {
        let mut best: Option<(f64, Vec<usize>)> = None;
        for pattern in self.patterns.patterns(activity_type).await {
            let Some(indices) = self.resolve(&pattern.namespaces) else {
                continue;
            };
            let score = self
                .scorer
                .score(pattern.count, indices.len(), self.frames.len());
            let current = best.as_ref().map_or(0.0, |(top, _)| *top);
            if score > current {
                best = Some((score, indices));
            }
        }
        best.map(|(_, indices)| indices)
    }

    /// Load the predicted frames in parallel without marking them accessed.
    #[instrument(skip(self, ctx), fields(activity_type = %ctx.activity().activity_type))]
    pub async fn pre_load(&self, ctx: &TurnContext) -> Result<()> {
        let Some(indices) = self.predict(&ctx.activity().activity_type).await else {
            self.patterns.stats().record_cold();
            debug!("no access pattern; skipping preload");
            return Ok(());
        };
        self.patterns.stats().record_predicted();

        try_join_all(indices.iter().map(|&i| self.frames[i].load(ctx, false))).await?;
        debug!(frames = indices.len(), "frames preloaded");
        Ok(())
    }

    /// Record the accessed frame set and save those frames in parallel.
    #[instrument(skip(self, ctx), fields(activity_type = %ctx.activity().activity_type))]
    pub async fn save(&self, ctx: &TurnContext) -> Result<()> {
        let accessed: Vec<&Arc<RootFrame>> = self
            .frames
            .iter()
            .filter(|frame| frame.was_accessed(ctx))
            .collect();
        let namespaces: Vec<&str> = accessed.iter().map(|frame| frame.namespace()).collect();
        let key = pattern_key(&namespaces);
        self.patterns
            .record(&ctx.activity().activity_type, &namespaces)
            .await;

        try_join_all(accessed.iter().map(|frame| frame.save(ctx))).await?;
        debug!(frames = %key, "accessed frames saved");
        Ok(())
    }
}

#[async_trait]
impl Middleware for FrameManagerMiddleware {
    async fn on_turn(&self, ctx: &TurnContext, next: Next<'_>) -> Result<()> {
        self.pre_load(ctx).await?;
        next.run(ctx).await?;
        self.save(ctx).await
    }
}

// ── tests ────────────────────────────────────────────────────────────
