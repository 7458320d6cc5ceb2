//! Self-contained example demonstrating a value entity and the
//! builder-based `EntityStoreBuilder` API.
//!
//! Run with: `cargo run --example counter`

use serde::{Deserialize, Serialize};
use valuefold::{
    CommandContext, CommandEnvelope, CommandMetadata, Effect, Empty, EntityStoreBuilder, Envelope,
    HandlerRegistry, Message, ValueEntity,
};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IncreaseValue {
    value: i64,
}

impl Message for IncreaseValue {
    const TYPE_TAG: &'static str = "com.example.IncreaseValue";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DecreaseValue {
    value: i64,
}

impl Message for DecreaseValue {
    const TYPE_TAG: &'static str = "com.example.DecreaseValue";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResetValue {}

impl Message for ResetValue {
    const TYPE_TAG: &'static str = "com.example.ResetValue";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GetCounter {}

impl Message for GetCounter {
    const TYPE_TAG: &'static str = "com.example.GetCounter";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CurrentCounter {
    value: i64,
}

impl Message for CurrentCounter {
    const TYPE_TAG: &'static str = "com.example.CurrentCounter";
}

// ---------------------------------------------------------------------------
// Counter entity
// ---------------------------------------------------------------------------

/// Persisted value of one counter.
#[derive(Debug, Clone, Default)]
struct CounterState {
    value: i64,
}

/// A counter that can be increased, decreased, or reset.
struct Counter;

impl Counter {
    fn increase(
        &self,
        state: &CounterState,
        cmd: IncreaseValue,
        ctx: &CommandContext<'_, CounterState>,
    ) -> Effect<CounterState, Empty> {
        if cmd.value < 0 {
            return ctx.effects().error(format!(
                "Increase requires a positive value. It was [{}].",
                cmd.value
            ));
        }
        ctx.effects()
            .update_state(CounterState {
                value: state.value + cmd.value,
            })
            .then_reply(Empty {})
    }

    fn decrease(
        &self,
        state: &CounterState,
        cmd: DecreaseValue,
        ctx: &CommandContext<'_, CounterState>,
    ) -> Effect<CounterState, Empty> {
        if cmd.value < 0 {
            return ctx.effects().error(format!(
                "Decrease requires a positive value. It was [{}].",
                cmd.value
            ));
        }
        ctx.effects()
            .update_state(CounterState {
                value: state.value - cmd.value,
            })
            .then_reply(Empty {})
    }

    fn reset(
        &self,
        _state: &CounterState,
        _cmd: ResetValue,
        ctx: &CommandContext<'_, CounterState>,
    ) -> Effect<CounterState, Empty> {
        ctx.effects().delete_state().then_reply(Empty {})
    }

    fn get_current_counter(
        &self,
        state: &CounterState,
        _cmd: GetCounter,
        ctx: &CommandContext<'_, CounterState>,
    ) -> Effect<CounterState, CurrentCounter> {
        ctx.effects().reply(CurrentCounter { value: state.value })
    }
}

impl ValueEntity for Counter {
    const ENTITY_TYPE: &'static str = "counter";
    type State = CounterState;

    fn new(_entity_id: &str) -> Self {
        Counter
    }

    fn empty_state() -> CounterState {
        CounterState::default()
    }

    fn handlers() -> HandlerRegistry<Self> {
        HandlerRegistry::new()
            .on("Increase", Self::increase)
            .on("Decrease", Self::decrease)
            .on("Reset", Self::reset)
            .on("GetCurrentCounter", Self::get_current_counter)
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = EntityStoreBuilder::new().entity_type::<Counter>().open()?;

    let meta = CommandMetadata::default().with_actor("example-runner");

    // Typed calls through the store.
    store
        .send::<Counter, _, Empty>("alpha", &IncreaseValue { value: 42 }, meta.clone())
        .await?;
    store
        .send::<Counter, _, Empty>("alpha", &DecreaseValue { value: 2 }, meta.clone())
        .await?;

    // Business rejection leaves the state untouched.
    let err = store
        .send::<Counter, _, Empty>("alpha", &IncreaseValue { value: -1 }, meta.clone())
        .await
        .expect_err("negative increase is rejected");
    println!("rejected: {err}");

    // Type-erased routing, as a transport would do it.
    let command = Envelope::pack(&IncreaseValue { value: 7 })?;
    let frame = CommandEnvelope::new("counter", "beta", command).with_metadata(meta.clone());
    store.dispatch(frame).await?;
    store
        .send::<Counter, _, Empty>("beta", &ResetValue {}, meta.clone())
        .await?;

    let alpha: CurrentCounter = store
        .send::<Counter, _, _>("alpha", &GetCounter {}, meta.clone())
        .await?;
    let beta: CurrentCounter = store.send::<Counter, _, _>("beta", &GetCounter {}, meta).await?;

    println!("alpha = {}", alpha.value);
    println!("beta  = {}", beta.value);

    assert_eq!(alpha.value, 40, "alpha should be 42 - 2");
    assert_eq!(beta.value, 0, "beta should be reset to 0");

    store.shutdown().await;
    println!("all assertions passed");

    Ok(())
}
