use super::*;
use crate::engine::{
    Dialog, DialogContext, DialogRegistry, DialogResult, Frame, Outcome, PersistedStack, Wait,
};
use crate::error::ErrorInfo;
use crate::message::CollectingSink;
use crate::routing::Matcher;
use crate::state::{Bag, ConversationIdentity, Partition, PrivateRecord, StateKey};
use crate::store::{
    ETag, InMemoryStateStore, Precondition, StateStore, StoreError, Versioned, Write,
};
use crate::value::{Val, ValType};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/* ===================== Test Dialogs ===================== */

/// Asks for a name, remembers it, then echoes until "bye"
struct Namer;

impl Dialog for Namer {
    fn start(&self, ctx: &mut DialogContext<'_>, _args: Val) -> DialogResult {
        ctx.say("What's your name?");
        ctx.wait(ValType::Str, "name");
        Ok(())
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, step: &str, outcome: Outcome) -> DialogResult {
        let input = outcome.into_result()?;
        let text = input.as_str().unwrap_or_default().to_string();
        match step {
            "name" => {
                ctx.user_data().set("name", &text)?;
                ctx.conversation_data().set("greeted", &true)?;
                ctx.say(format!("Nice to meet you, {text}"));
                ctx.wait(ValType::Str, "chat");
                Ok(())
            }
            "chat" if text == "bye" => {
                ctx.done(Val::str("finished"));
                Ok(())
            }
            "chat" if text == "explode" => {
                ctx.say("about to fail");
                Err(ErrorInfo::dialog("exploded"))
            }
            "chat" => {
                let turns: u32 = ctx.private_data().get("turns")?.unwrap_or(0);
                ctx.private_data().set("turns", &(turns + 1))?;
                ctx.say(format!("you said {text}"));
                ctx.wait(ValType::Str, "chat");
                Ok(())
            }
            _ => ctx.unknown_step(),
        }
    }
}

/// Runs `namer` as a child and survives its cancellation
struct Menu;

impl Dialog for Menu {
    fn start(&self, ctx: &mut DialogContext<'_>, _args: Val) -> DialogResult {
        ctx.call_catching("namer", Val::Null, "namer_done");
        Ok(())
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, step: &str, outcome: Outcome) -> DialogResult {
        match (step, outcome) {
            ("namer_done", Outcome::Error(error)) if error.is_canceled() => {
                ctx.say("back at the menu");
                ctx.wait(ValType::Str, "pick");
                Ok(())
            }
            (_, outcome) => {
                ctx.done(outcome.into_result()?);
                Ok(())
            }
        }
    }
}

fn registry() -> DialogRegistry {
    let mut registry = DialogRegistry::new();
    registry.register("namer", Namer).register("menu", Menu);
    registry
}

/* ===================== Test Stores ===================== */

/// Replays one captured load to simulate a turn that read before another saved
#[derive(Default)]
struct ReplayStore {
    inner: InMemoryStateStore,
    capture: AtomicBool,
    replay: Mutex<Option<Vec<Option<Versioned>>>>,
}

impl ReplayStore {
    fn capture_next_load(&self) {
        self.capture.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for ReplayStore {
    async fn load(&self, keys: &[StateKey]) -> Result<Vec<Option<Versioned>>, StoreError> {
        if let Some(stale) = self.replay.lock().await.take() {
            return Ok(stale);
        }
        let loaded = self.inner.load(keys).await?;
        if self.capture.swap(false, Ordering::SeqCst) {
            *self.replay.lock().await = Some(loaded.clone());
        }
        Ok(loaded)
    }

    async fn save(&self, writes: Vec<Write>) -> Result<Vec<ETag>, StoreError> {
        self.inner.save(writes).await
    }

    async fn delete(&self, key: &StateKey) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }
}

/// Every operation fails
struct BrokenStore;

#[async_trait]
impl StateStore for BrokenStore {
    async fn load(&self, _keys: &[StateKey]) -> Result<Vec<Option<Versioned>>, StoreError> {
        Err(StoreError::Backend(sqlx::Error::PoolTimedOut))
    }

    async fn save(&self, _writes: Vec<Write>) -> Result<Vec<ETag>, StoreError> {
        Err(StoreError::Backend(sqlx::Error::PoolTimedOut))
    }

    async fn delete(&self, _key: &StateKey) -> Result<bool, StoreError> {
        Err(StoreError::Backend(sqlx::Error::PoolTimedOut))
    }
}

/* ===================== Helpers ===================== */

fn identity() -> ConversationIdentity {
    ConversationIdentity::new("test", "conv-1", "alice")
}

fn config(root: &str) -> DispatchConfig {
    DispatchConfig {
        root_dialog: root.to_string(),
        ..Default::default()
    }
}

fn dispatcher<S: StateStore>(
    store: Arc<S>,
    sink: Arc<CollectingSink>,
    config: DispatchConfig,
) -> Dispatcher<S> {
    Dispatcher::new(store, sink, registry(), config)
}

async fn say<S: StateStore>(d: &Dispatcher<S>, text: &str) -> Result<TurnOutcome, DispatchError> {
    d.handle(InboundEvent::text(identity(), text)).await
}

async fn private_record<S: StateStore>(store: &S) -> Option<PrivateRecord> {
    let key = identity().key(Partition::PrivateConversation);
    store
        .load(&[key])
        .await
        .unwrap()
        .remove(0)
        .map(|v| serde_json::from_value(v.data).unwrap())
}

/// Write a private record directly, bypassing the dispatcher
async fn plant_record(store: &InMemoryStateStore, record: serde_json::Value) {
    store
        .save(vec![Write::new(
            identity().key(Partition::PrivateConversation),
            record,
            Precondition::Any,
        )])
        .await
        .unwrap();
}

/* ===================== Tests ===================== */

#[tokio::test]
async fn test_first_event_starts_root_and_saves_stack() {
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(store.clone(), sink.clone(), config("namer"));

    let outcome = say(&d, "hello").await.unwrap();

    assert_eq!(outcome, TurnOutcome::Suspended { depth: 1 });
    assert_eq!(sink.texts().await, vec!["What's your name?"]);
    let record = private_record(store.as_ref()).await.unwrap();
    let stack = record.stack.unwrap();
    assert_eq!(stack.active_dialog(), Some("namer"));
    assert_eq!(record.registry_fingerprint, Some(registry().fingerprint()));
}

#[tokio::test]
async fn test_bags_persist_with_their_own_lifetimes() {
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(store.clone(), sink.clone(), config("namer"));

    say(&d, "hello").await.unwrap();
    say(&d, "Ada").await.unwrap();
    say(&d, "one").await.unwrap();
    say(&d, "two").await.unwrap();

    assert_eq!(
        sink.texts().await,
        vec!["What's your name?", "Nice to meet you, Ada", "you said one", "you said two"]
    );

    let snapshot = d.snapshot(&identity()).await.unwrap();
    assert_eq!(snapshot.user.get::<String>("name").unwrap().as_deref(), Some("Ada"));
    assert_eq!(snapshot.conversation.get::<bool>("greeted").unwrap(), Some(true));
    assert_eq!(snapshot.private.unwrap().data.get::<u32>("turns").unwrap(), Some(2));

    // Same user in another conversation sees the user bag only
    let elsewhere = ConversationIdentity::new("test", "conv-2", "alice");
    let other = d.snapshot(&elsewhere).await.unwrap();
    assert_eq!(other.user.get::<String>("name").unwrap().as_deref(), Some("Ada"));
    assert!(other.conversation.is_empty());
    assert!(other.private.is_none());
}

#[tokio::test]
async fn test_completed_conversation_restarts_on_next_event() {
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(store.clone(), sink.clone(), config("namer"));

    say(&d, "hello").await.unwrap();
    say(&d, "Ada").await.unwrap();
    let outcome = say(&d, "bye").await.unwrap();

    assert_eq!(outcome, TurnOutcome::Completed(Val::str("finished")));
    assert!(private_record(store.as_ref()).await.unwrap().stack.is_none());

    sink.take().await;
    say(&d, "hello again").await.unwrap();
    assert_eq!(sink.texts().await, vec!["What's your name?"]);
}

#[tokio::test]
async fn test_stale_turn_conflicts_and_sends_nothing() {
    let store = Arc::new(ReplayStore::default());
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(store.clone(), sink.clone(), config("namer"));
    say(&d, "hello").await.unwrap();

    // The next turn's load is replayed to a later turn, which is then stale
    store.capture_next_load();
    say(&d, "Ada").await.unwrap();
    let saved = private_record(store.as_ref()).await.unwrap();
    sink.take().await;

    let err = say(&d, "Bob").await.unwrap_err();

    let DispatchError::Conflict { key } = err else {
        unreachable!("Expected conflict, got {:?}", err);
    };
    assert_eq!(key.partition, Partition::User);
    assert_eq!(sink.len().await, 0);
    assert_eq!(private_record(store.as_ref()).await.unwrap(), saved);
}

#[tokio::test]
async fn test_unhandled_error_saves_ended_conversation_and_replies() {
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(store.clone(), sink.clone(), config("namer"));
    say(&d, "hello").await.unwrap();
    say(&d, "Ada").await.unwrap();
    sink.take().await;

    let err = say(&d, "explode").await.unwrap_err();

    let DispatchError::Unhandled(error) = err else {
        unreachable!("Expected unhandled error, got {:?}", err);
    };
    assert_eq!(error.message, "exploded");
    assert_eq!(
        sink.texts().await,
        vec!["about to fail", "Sorry, something went wrong."]
    );
    assert!(private_record(store.as_ref()).await.unwrap().stack.is_none());
}

#[tokio::test]
async fn test_protocol_violation_saves_and_sends_nothing() {
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(store.clone(), sink.clone(), config("namer"));
    say(&d, "hello").await.unwrap();
    let before = store
        .load(&[identity().key(Partition::PrivateConversation)])
        .await
        .unwrap();
    sink.take().await;

    // The name wait expects text
    let err = d
        .handle(InboundEvent::data(identity(), Val::Num(42.0)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Protocol(crate::error::ProtocolViolation::TypeMismatch { .. })
    ));
    assert_eq!(sink.len().await, 0);
    let after = store
        .load(&[identity().key(Partition::PrivateConversation)])
        .await
        .unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_load_failure_is_fatal() {
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(Arc::new(BrokenStore), sink.clone(), config("namer"));

    let err = say(&d, "hello").await.unwrap_err();

    assert!(matches!(err, DispatchError::Storage(StoreError::Backend(_))));
    assert_eq!(sink.len().await, 0);
}

#[tokio::test]
async fn test_cancel_phrase_ends_conversation() {
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(store.clone(), sink.clone(), config("namer"));
    say(&d, "hello").await.unwrap();

    let outcome = say(&d, " Cancel ").await.unwrap();

    assert_eq!(outcome, TurnOutcome::Ended);
    assert!(private_record(store.as_ref()).await.unwrap().stack.is_none());
}

#[tokio::test]
async fn test_routed_interrupt_cancels_into_dialog() {
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(store.clone(), sink.clone(), config("menu"))
        .with_interrupt(Matcher::exact("menu"), Some("menu".to_string()));
    say(&d, "hello").await.unwrap();
    sink.take().await;

    let outcome = say(&d, "menu").await.unwrap();

    assert_eq!(outcome, TurnOutcome::Suspended { depth: 1 });
    assert_eq!(sink.texts().await, vec!["back at the menu"]);
}

#[tokio::test]
async fn test_interrupt_payload_cancels_everything() {
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(store.clone(), sink.clone(), config("menu"));
    say(&d, "hello").await.unwrap();

    let event = InboundEvent {
        identity: identity(),
        payload: Payload::Interrupt { target: None },
    };
    assert_eq!(d.handle(event).await.unwrap(), TurnOutcome::Ended);
}

#[tokio::test]
async fn test_expired_conversation_starts_over() {
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(
        store.clone(),
        sink.clone(),
        DispatchConfig {
            conversation_ttl_secs: Some(60),
            ..config("namer")
        },
    );
    say(&d, "hello").await.unwrap();

    let mut record = private_record(store.as_ref()).await.unwrap();
    record.updated_at = Utc::now() - Duration::hours(2);
    plant_record(&store, serde_json::to_value(&record).unwrap()).await;
    sink.take().await;

    // "Ada" would be taken as the name if the stack were resumed
    say(&d, "Ada").await.unwrap();
    assert_eq!(sink.texts().await, vec!["What's your name?"]);
}

fn retired_stack_record() -> PrivateRecord {
    let mut frame = Frame::new("retired");
    frame.wait = Some(Wait::new(ValType::Str, "next"));
    PrivateRecord::new(
        Some(PersistedStack {
            version: 1,
            frames: vec![frame],
        }),
        Bag::new(),
        "old-deployment".to_string(),
    )
}

#[tokio::test]
async fn test_incompatible_stack_is_reset_by_default() {
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(store.clone(), sink.clone(), config("namer"));
    plant_record(&store, serde_json::to_value(retired_stack_record()).unwrap()).await;

    let outcome = say(&d, "hello").await.unwrap();

    assert_eq!(outcome, TurnOutcome::Suspended { depth: 1 });
    assert_eq!(sink.texts().await, vec!["What's your name?"]);
}

#[tokio::test]
async fn test_incompatible_stack_can_fail_the_turn() {
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(
        store.clone(),
        sink.clone(),
        DispatchConfig {
            incompatible_state: IncompatibleStatePolicy::Fail,
            ..config("namer")
        },
    );
    plant_record(&store, serde_json::to_value(retired_stack_record()).unwrap()).await;

    let err = say(&d, "hello").await.unwrap_err();

    let DispatchError::IncompatibleState { reason } = err else {
        unreachable!("Expected incompatible state, got {:?}", err);
    };
    assert!(reason.contains("retired"));
}

#[tokio::test]
async fn test_corrupt_record_is_reported() {
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(store.clone(), sink.clone(), config("namer"));
    plant_record(&store, json!("not a record")).await;

    let err = say(&d, "hello").await.unwrap_err();

    assert!(matches!(err, DispatchError::CorruptState { .. }));
    assert_eq!(sink.len().await, 0);
}

#[tokio::test]
async fn test_reset_forgets_stack_but_keeps_user_bag() {
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(store.clone(), sink.clone(), config("namer"));
    say(&d, "hello").await.unwrap();
    say(&d, "Ada").await.unwrap();

    assert!(d.reset(&identity()).await.unwrap());

    let snapshot = d.snapshot(&identity()).await.unwrap();
    assert!(snapshot.private.is_none());
    assert_eq!(snapshot.user.get::<String>("name").unwrap().as_deref(), Some("Ada"));
}

#[tokio::test]
async fn test_separator_in_ids_keeps_conversations_apart() {
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(store.clone(), sink.clone(), config("namer"));
    let first = ConversationIdentity::new("teams", "19:abc", "29:u1");
    let second = ConversationIdentity::new("teams", "19", "abc:29:u1");

    d.handle(InboundEvent::text(first.clone(), "hi")).await.unwrap();
    d.handle(InboundEvent::text(first.clone(), "Ada")).await.unwrap();
    sink.take().await;

    let outcome = d
        .handle(InboundEvent::text(second.clone(), "hello"))
        .await
        .unwrap();

    assert_eq!(outcome, TurnOutcome::Suspended { depth: 1 });
    assert_eq!(sink.texts().await, vec!["What's your name?"]);
    let other = d.snapshot(&second).await.unwrap();
    assert!(other.user.is_empty());
    assert!(other.private.unwrap().data.is_empty());
}

#[tokio::test]
async fn test_huge_ttl_never_expires() {
    for ttl in [u64::MAX, i64::MAX as u64 / 100] {
        let store = Arc::new(InMemoryStateStore::new());
        let sink = Arc::new(CollectingSink::new());
        let d = dispatcher(
            store.clone(),
            sink.clone(),
            DispatchConfig {
                conversation_ttl_secs: Some(ttl),
                ..config("namer")
            },
        );

        say(&d, "hello").await.unwrap();
        say(&d, "Ada").await.unwrap();

        assert_eq!(
            sink.texts().await,
            vec!["What's your name?", "Nice to meet you, Ada"],
            "ttl {}",
            ttl
        );
    }
}

#[tokio::test]
async fn test_interrupt_payload_for_dialog_not_running_is_ignored() {
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(store.clone(), sink.clone(), config("menu"));
    say(&d, "hello").await.unwrap();
    let before = private_record(store.as_ref()).await.unwrap().stack;
    sink.take().await;

    let event = InboundEvent {
        identity: identity(),
        payload: Payload::Interrupt {
            target: Some("missing".to_string()),
        },
    };
    let outcome = d.handle(event).await.unwrap();

    assert_eq!(outcome, TurnOutcome::Suspended { depth: 2 });
    assert_eq!(sink.len().await, 0);
    assert_eq!(private_record(store.as_ref()).await.unwrap().stack, before);

    // The name wait is still the one answered next
    say(&d, "Ada").await.unwrap();
    assert_eq!(sink.texts().await, vec!["Nice to meet you, Ada"]);
}

fn empty_stack_record() -> PrivateRecord {
    PrivateRecord::new(
        Some(PersistedStack {
            version: 1,
            frames: vec![],
        }),
        Bag::new(),
        registry().fingerprint(),
    )
}

#[tokio::test]
async fn test_empty_stack_is_reset_by_default() {
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let d = dispatcher(store.clone(), sink.clone(), config("namer"));
    plant_record(&store, serde_json::to_value(empty_stack_record()).unwrap()).await;

    let outcome = say(&d, "hello").await.unwrap();

    assert_eq!(outcome, TurnOutcome::Suspended { depth: 1 });
    assert_eq!(sink.texts().await, vec!["What's your name?"]);
    let stack = private_record(store.as_ref()).await.unwrap().stack.unwrap();
    assert_eq!(stack.depth(), 1);
}

#[tokio::test]
async fn test_unresumable_stacks_can_fail_the_turn() {
    let mut running = Frame::new("namer");
    running.wait = None;
    let not_waiting = PrivateRecord::new(
        Some(PersistedStack {
            version: 1,
            frames: vec![running],
        }),
        Bag::new(),
        registry().fingerprint(),
    );

    for (record, expected) in [
        (empty_stack_record(), "no frames"),
        (not_waiting, "no pending wait"),
    ] {
        let store = Arc::new(InMemoryStateStore::new());
        let sink = Arc::new(CollectingSink::new());
        let d = dispatcher(
            store.clone(),
            sink.clone(),
            DispatchConfig {
                incompatible_state: IncompatibleStatePolicy::Fail,
                ..config("namer")
            },
        );
        plant_record(&store, serde_json::to_value(record).unwrap()).await;

        let err = say(&d, "hello").await.unwrap_err();

        let DispatchError::IncompatibleState { reason } = err else {
            unreachable!("Expected incompatible state, got {:?}", err);
        };
        assert!(reason.contains(expected), "{}", reason);
        assert_eq!(sink.len().await, 0);
    }
}
