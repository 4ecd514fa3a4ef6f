//! Counter node: streams `count` consecutive integers out of a single firing.
//!
//! Values go out through [`FireContext::emit`], so downstream nodes see each
//! one while the counter is still executing. The node polls the stop signal
//! between values and between sleep slices.

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};

use crate::node::{FireContext, Node, PortDefinition};
use crate::types::{PortData, PortType};

const SLEEP_SLICE: Duration = Duration::from_millis(10);

pub struct CounterNode {
    count: u64,
    interval: Duration,
}

impl CounterNode {
    pub fn new(count: u64, interval: Duration) -> Self {
        Self { count, interval }
    }

    pub fn from_params(params: &HashMap<String, serde_json::Value>) -> Result<Self> {
        let count = match params.get("count") {
            None => 10,
            Some(value) => match value.as_u64() {
                Some(count) => count,
                None => bail!("Counter: param 'count' must be a non-negative integer"),
            },
        };
        let interval_ms = match params.get("interval_ms") {
            None => 0,
            Some(value) => match value.as_u64() {
                Some(ms) => ms,
                None => bail!("Counter: param 'interval_ms' must be a non-negative integer"),
            },
        };

        Ok(Self::new(count, Duration::from_millis(interval_ms)))
    }

    fn pause(&self, ctx: &FireContext<'_>) {
        let deadline = Instant::now() + self.interval;
        while !ctx.is_stop_requested() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

impl Node for CounterNode {
    fn node_type(&self) -> &str {
        "Counter"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::optional(
            "start",
            PortType::Int,
            serde_json::json!(0),
        )]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("value", PortType::Int)]
    }

    fn fire(
        &self,
        inputs: &HashMap<String, PortData>,
        ctx: &FireContext<'_>,
    ) -> Result<HashMap<String, PortData>> {
        let start = inputs
            .get("start")
            .and_then(PortData::as_int)
            .unwrap_or_default();

        for step in 0..self.count {
            if ctx.is_stop_requested() {
                break;
            }
            ctx.emit("value", PortData::Int(start + step as i64))?;
            ctx.report_progress((step + 1) as f64 / self.count as f64);

            if !self.interval.is_zero() && step + 1 < self.count {
                self.pause(ctx);
            }
        }

        Ok(HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ProgressCell;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_counter_emits_each_value_and_reports_progress() {
        let node = CounterNode::new(3, Duration::ZERO);
        let stop = CancellationToken::new();
        let progress = ProgressCell::default();
        let emitted = Mutex::new(Vec::new());
        let emit = |port: &str, value: PortData| {
            assert_eq!(port, "value");
            emitted.lock().expect("emit log lock").push(value);
            Ok(())
        };
        let ctx = FireContext::new("counter", &stop, &progress, &emit);

        let inputs = HashMap::from([("start".to_string(), PortData::Int(5))]);
        let outputs = node.fire(&inputs, &ctx).expect("counter should fire");

        assert!(outputs.is_empty());
        assert_eq!(
            emitted.into_inner().expect("emit log lock"),
            vec![PortData::Int(5), PortData::Int(6), PortData::Int(7)]
        );
        assert_eq!(progress.get(), 1.0);
    }

    #[test]
    fn test_counter_stops_when_requested() {
        let node = CounterNode::new(1_000, Duration::from_secs(5));
        let stop = CancellationToken::new();
        let progress = ProgressCell::default();
        let emit = |_: &str, _: PortData| {
            stop.cancel();
            Ok(())
        };
        let ctx = FireContext::new("counter", &stop, &progress, &emit);

        let started = Instant::now();
        node.fire(&HashMap::new(), &ctx).expect("counter should stop cleanly");

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(progress.get() < 0.01);
    }

    #[test]
    fn test_counter_from_params_rejects_negative_count() {
        let params = HashMap::from([("count".to_string(), serde_json::json!(-1))]);
        let err = match CounterNode::from_params(&params) {
            Ok(_) => panic!("negative count should fail"),
            Err(err) => err,
        };
        assert_eq!(
            err.to_string(),
            "Counter: param 'count' must be a non-negative integer"
        );
    }
}
