//! Integration tests for the turnstate-engine crate.
//!
//! Drive whole turns through `TurnPipeline` against an instrumented storage
//! double, plus one end-to-end run on SQLite in a temp directory.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::{Value, json};
use turnstate_engine::{
    Activity, ChangeCursor, ChangeTracker, ChangeTrackerConfig, ChangeTrackerMiddleware,
    ChildFrame, EngineError, Frame, FrameManagerMiddleware, FrameScope, ManualClock, RootFrame,
    Slot, SlotChangeListener, SlotDefinition, TurnContext, TurnPipeline, handler_fn,
};
use turnstate_store::{
    MemoryStorage, SqliteStorage, Storage, StoreError, StoreItems, StoreResult,
};

/// Memory storage that counts calls and can be told to fail writes.
#[derive(Default)]
struct CountingStorage {
    inner: MemoryStorage,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl CountingStorage {
    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for CountingStorage {
    async fn read(&self, keys: &[String]) -> StoreResult<StoreItems> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(keys).await
    }

    async fn write(&self, changes: StoreItems) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::InvalidArgument("storage offline".into()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(changes).await
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        self.inner.delete(keys).await
    }
}

fn message(from: &str, text: &str) -> Activity {
    Activity::message("cli", "bot", from, "c1", text)
}

/// Pipeline with a default frame manager over `frames`.
fn pipeline(frames: Vec<Arc<RootFrame>>) -> TurnPipeline {
    let mut pipeline = TurnPipeline::new();
    pipeline.use_middleware(Arc::new(FrameManagerMiddleware::new(frames)));
    pipeline
}

#[tokio::test]
async fn counter_persists_across_turns() {
    let storage = Arc::new(CountingStorage::default());
    let conversation = RootFrame::conversation(storage.clone(), None);
    let count: Slot<i64> = conversation
        .add(SlotDefinition::new("count").with_default_value(json!(0)))
        .unwrap();
    let pipeline = pipeline(vec![conversation]);

    let handler = handler_fn(move |ctx| {
        let count = count.clone();
        async move {
            let n = count.get(ctx).await?.unwrap_or_default();
            count.set(ctx, n + 1).await
        }
        .boxed()
    });
    for _ in 0..5 {
        pipeline.run(message("alice", "hi"), &handler).await.unwrap();
    }

    let items = storage
        .read(&["conversation/bot/cli/c1".to_string()])
        .await
        .unwrap();
    assert_eq!(items["conversation/bot/cli/c1"].data["count"]["value"], json!(5));
    assert_eq!(storage.writes(), 5);
}

#[tokio::test]
async fn preloaded_but_untouched_frame_is_not_written() {
    let storage = Arc::new(CountingStorage::default());
    let user = RootFrame::user(storage.clone(), None);
    let conversation = RootFrame::conversation(storage.clone(), None);
    let name: Slot<String> = user.add(SlotDefinition::new("name")).unwrap();
    let manager = Arc::new(FrameManagerMiddleware::new(vec![user.clone(), conversation.clone()]));

    // Teach the manager that message turns touch both frames.
    manager
        .access_patterns()
        .record("message", &["user", "conversation"])
        .await;

    let mut pipeline = TurnPipeline::new();
    pipeline.use_middleware(manager.clone());
    let handler = handler_fn(move |ctx| {
        let name = name.clone();
        async move { name.set(ctx, "Ada".into()).await }.boxed()
    });

    let ctx = TurnContext::new(message("alice", "hi"));
    pipeline.run_with_context(&ctx, &handler).await.unwrap();

    assert!(conversation.cached_state(&ctx).is_some(), "conversation was preloaded");
    assert!(!conversation.was_accessed(&ctx));
    assert_eq!(storage.writes(), 1, "only the user frame is saved");
    assert_eq!(storage.inner.keys(), vec!["user/bot/cli/alice".to_string()]);

    let patterns = manager.access_patterns().patterns("message").await;
    assert!(patterns.iter().any(|p| p.key == "user|" && p.count == 1));
}

#[tokio::test]
async fn users_get_distinct_records() {
    let storage = Arc::new(MemoryStorage::new());
    let user = RootFrame::user(storage.clone(), None);
    let name: Slot<String> = user.add(SlotDefinition::new("name")).unwrap();
    let pipeline = pipeline(vec![user]);

    let handler = handler_fn(move |ctx| {
        let name = name.clone();
        async move {
            let from = ctx.activity().from.id.clone();
            name.set(ctx, from).await
        }
        .boxed()
    });
    pipeline.run(message("alice", "hi"), &handler).await.unwrap();
    pipeline.run(message("bob", "hi"), &handler).await.unwrap();

    let mut keys = storage.keys();
    keys.sort();
    assert_eq!(keys, vec!["user/bot/cli/alice", "user/bot/cli/bob"]);
    let items = storage.read(&keys).await.unwrap();
    assert_eq!(items["user/bot/cli/bob"].data["name"]["value"], json!("bob"));
}

#[tokio::test]
async fn concurrent_first_loads_share_one_read() {
    let storage = Arc::new(CountingStorage::default());
    let user = RootFrame::user(storage.clone(), None);
    let a: Slot<u32> = user.add(SlotDefinition::new("a")).unwrap();
    let b: Slot<u32> = user.add(SlotDefinition::new("b")).unwrap();

    let ctx = TurnContext::new(message("alice", "hi"));
    let (ra, rb) = tokio::join!(a.get(&ctx), b.get(&ctx));
    assert_eq!(ra.unwrap(), None);
    assert_eq!(rb.unwrap(), None);
    assert_eq!(storage.reads(), 1);
}

#[tokio::test]
async fn failed_save_keeps_changes_pending() {
    let storage = Arc::new(CountingStorage::default());
    let user = RootFrame::user(storage.clone(), None);
    let count: Slot<u32> = user.add(SlotDefinition::new("count")).unwrap();

    let ctx = TurnContext::new(message("alice", "hi"));
    count.set(&ctx, 3).await.unwrap();

    storage.fail_writes(true);
    let err = user.save(&ctx).await.unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)));

    storage.fail_writes(false);
    user.save(&ctx).await.unwrap();
    assert_eq!(storage.writes(), 1);

    let next = TurnContext::new(message("alice", "hi"));
    assert_eq!(count.get(&next).await.unwrap(), Some(3));
}

#[tokio::test]
async fn handler_error_skips_save() {
    let storage = Arc::new(CountingStorage::default());
    let user = RootFrame::user(storage.clone(), None);
    let count: Slot<u32> = user.add(SlotDefinition::new("count")).unwrap();
    let pipeline = pipeline(vec![user]);

    let handler = handler_fn(move |ctx| {
        let count = count.clone();
        async move {
            count.set(ctx, 1).await?;
            Err::<(), _>(EngineError::Handler("bot crashed".into()))
        }
        .boxed()
    });
    let err = pipeline.run(message("alice", "hi"), &handler).await.unwrap_err();
    assert!(matches!(err, EngineError::Handler(_)));
    assert_eq!(storage.writes(), 0);
}

struct FailingListener;

#[async_trait]
impl SlotChangeListener for FailingListener {
    async fn slot_value_changed(
        &self,
        _ctx: &TurnContext,
        _tags: &[String],
        _value: &Value,
    ) -> turnstate_engine::Result<()> {
        Err(EngineError::Handler("listener down".into()))
    }
}

#[tokio::test]
async fn listener_failure_leaves_value_applied() {
    let user = RootFrame::user(Arc::new(MemoryStorage::new()), None);
    user.on_slot_value_changed(Arc::new(FailingListener));
    let name: Slot<String> = user
        .add(SlotDefinition::new("name").with_change_tags(["profile"]))
        .unwrap();

    let ctx = TurnContext::new(message("alice", "hi"));
    let err = name.set(&ctx, "Ada".into()).await.unwrap_err();
    assert!(matches!(err, EngineError::ChangeNotification { ref slot, .. } if slot == "name"));
    assert_eq!(name.get(&ctx).await.unwrap().as_deref(), Some("Ada"));
}

#[tokio::test]
async fn expired_value_reverts_to_default_in_later_turn() {
    let storage = Arc::new(MemoryStorage::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let conversation = RootFrame::conversation(storage, None);
    let count: Slot<i64> = conversation
        .add(
            SlotDefinition::new("count")
                .with_default_value(json!(0))
                .expire_after_seconds(10),
        )
        .unwrap();

    let first = TurnContext::with_clock(message("alice", "hi"), clock.clone());
    count.set(&first, 4).await.unwrap();
    conversation.save(&first).await.unwrap();

    clock.advance_seconds(11);
    let second = TurnContext::with_clock(message("alice", "hi"), clock.clone());
    assert_eq!(count.get(&second).await.unwrap(), Some(0));
    assert!(!count.has(&second).await.unwrap());
}

#[tokio::test]
async fn read_only_view_cannot_diverge() {
    let user = RootFrame::user(Arc::new(MemoryStorage::new()), None);
    let tags: Slot<Vec<String>> = user.add(SlotDefinition::new("tags")).unwrap();
    let view = tags.as_read_only();

    let ctx = TurnContext::new(message("alice", "hi"));
    tags.set(&ctx, vec!["a".into()]).await.unwrap();
    let mut copy = view.get(&ctx).await.unwrap().unwrap();
    copy.push("b".into());
    assert_eq!(tags.get(&ctx).await.unwrap().unwrap(), vec!["a".to_string()]);
}

#[tokio::test]
async fn end_to_end_on_sqlite_with_change_log() {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(
        SqliteStorage::open(dir.path().join("state.db"))
            .await
            .unwrap(),
    );

    let user = RootFrame::new(storage.clone(), FrameScope::User, None);
    let profile: Slot<Value> = user.add(SlotDefinition::new("profile")).unwrap();
    let profile_frame = ChildFrame::new(&profile);
    let name: Slot<String> = profile_frame
        .add(SlotDefinition::new("name").with_change_tags(["profile"]))
        .unwrap();
    let age: Slot<u32> = profile_frame
        .add(SlotDefinition::new("age").with_change_tags(["profile"]))
        .unwrap();

    let tracker = ChangeTrackerMiddleware::with_frames(
        storage.clone(),
        ChangeTrackerConfig::new(FrameScope::User),
        &[user.clone()],
    );
    let mut pipeline = TurnPipeline::new();
    pipeline
        .use_middleware(Arc::new(FrameManagerMiddleware::new(vec![user.clone()])))
        .use_middleware(tracker.clone());

    let handler = {
        let (name, age) = (name.clone(), age.clone());
        handler_fn(move |ctx| {
            let (name, age) = (name.clone(), age.clone());
            async move {
                match ctx.activity().text.as_deref() {
                    Some("name") => name.set(ctx, "Ada".into()).await,
                    Some("age") => age.set(ctx, 36).await,
                    _ => Ok(()),
                }
            }
            .boxed()
        })
    };
    for text in ["name", "age", "noop"] {
        pipeline.run(message("alice", text), &handler).await.unwrap();
    }

    let ctx = TurnContext::new(message("alice", "check"));
    assert_eq!(name.get(&ctx).await.unwrap().as_deref(), Some("Ada"));
    assert_eq!(age.get(&ctx).await.unwrap(), Some(36));
    assert_eq!(profile_frame.parent().map(|p| p.id()), Some(user.id()));

    let changes = tracker.find_changes(&ctx, "profile", None).await.unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].value, json!("Ada"));
    let later = tracker
        .find_changes(&ctx, "profile", Some(ChangeCursor::Sequence(changes[0].sequence)))
        .await
        .unwrap();
    assert_eq!(later.len(), 1);
    assert_eq!(later[0].value, json!(36));
}
