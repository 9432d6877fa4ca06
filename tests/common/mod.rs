// ABOUTME: Shared test fixtures for integration tests
// ABOUTME: Provides task bodies with scripted behavior and store seeding helpers

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use tideway::store::InMemoryStore;
use tideway::{RunContext, Work};

/// Adds one to its single numeric input.
pub struct PlusOne;

#[async_trait]
impl Work for PlusOne {
    async fn run(&self, _ctx: &RunContext, inputs: Vec<Value>) -> anyhow::Result<Value> {
        let x = inputs[0]
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("expected a number, got {}", inputs[0]))?;
        Ok(json!(x + 1))
    }
}

/// Sums the elements of its single array input.
pub struct Sum;

#[async_trait]
impl Work for Sum {
    async fn run(&self, _ctx: &RunContext, inputs: Vec<Value>) -> anyhow::Result<Value> {
        let items = inputs[0]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("expected an array, got {}", inputs[0]))?;
        let total: i64 = items.iter().filter_map(Value::as_i64).sum();
        Ok(json!(total))
    }
}

/// Integer division of one by the input. Division by zero fails on the first
/// attempt and returns 100 on any later attempt, so retry behavior can be
/// observed deterministically.
pub struct Inverter;

#[async_trait]
impl Work for Inverter {
    async fn run(&self, ctx: &RunContext, inputs: Vec<Value>) -> anyhow::Result<Value> {
        let x = inputs[0]
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("expected a number, got {}", inputs[0]))?;
        if x == 0 {
            if ctx.attempt >= 2 {
                return Ok(json!(100));
            }
            anyhow::bail!("division by zero");
        }
        Ok(json!(1 / x))
    }
}

/// Fails on the first attempt, succeeds on every later one.
pub struct FlakyOnce;

#[async_trait]
impl Work for FlakyOnce {
    async fn run(&self, ctx: &RunContext, _inputs: Vec<Value>) -> anyhow::Result<Value> {
        if ctx.attempt == 1 {
            anyhow::bail!("transient failure");
        }
        Ok(json!("recovered"))
    }
}

/// Fails every time.
pub struct AlwaysFails;

#[async_trait]
impl Work for AlwaysFails {
    async fn run(&self, _ctx: &RunContext, _inputs: Vec<Value>) -> anyhow::Result<Value> {
        anyhow::bail!("deliberate failure")
    }
}

/// Sleeps for the given duration, then returns null.
pub struct Napper(pub Duration);

#[async_trait]
impl Work for Napper {
    async fn run(&self, _ctx: &RunContext, _inputs: Vec<Value>) -> anyhow::Result<Value> {
        tokio::time::sleep(self.0).await;
        Ok(Value::Null)
    }
}

/// Cancels its own flow run through the store, as an external actor would,
/// then completes normally.
pub struct CancelsFlow {
    pub store: InMemoryStore,
    pub flow_run_id: String,
}

#[async_trait]
impl Work for CancelsFlow {
    async fn run(&self, _ctx: &RunContext, _inputs: Vec<Value>) -> anyhow::Result<Value> {
        self.store.cancel_flow_run(&self.flow_run_id).await;
        Ok(Value::Null)
    }
}

/// A store seeded with a single pending flow run.
pub async fn seeded_store(flow_run_id: &str) -> InMemoryStore {
    let store = InMemoryStore::new();
    store.insert_flow_run(flow_run_id).await;
    store
}
