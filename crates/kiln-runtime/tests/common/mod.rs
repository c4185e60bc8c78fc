//! Shared helpers for the runtime integration tests

#![allow(dead_code)]

use kiln_config::{FramesConfig, RuntimeConfig, StackConfig};
use kiln_runtime::{Collector, ExecutionContext, MemoryEventLogger, ObjectTag, Runtime, Value};
use std::sync::Arc;

/// Small limits so the stack and threshold paths are easy to reach
pub fn small_config() -> RuntimeConfig {
    RuntimeConfig {
        frames: Some(FramesConfig {
            small_call_threshold: Some(8),
            call_arguments_limit: Some(4096),
            multiple_values_limit: Some(16),
        }),
        stack: Some(StackConfig {
            operand_stack_slots: Some(8192),
            guard_slots: Some(256),
            guard_page: Some(false),
        }),
        ..Default::default()
    }
}

/// Runtime logging to memory, plus a context on the calling thread
pub fn setup(config: RuntimeConfig) -> (Arc<Runtime>, ExecutionContext, MemoryEventLogger) {
    let logger = MemoryEventLogger::new();
    let runtime = Runtime::builder(config)
        .events(Arc::new(logger.clone()))
        .build()
        .expect("runtime starts");
    let ctx = ExecutionContext::new(&runtime).expect("context starts");
    (runtime, ctx, logger)
}

/// Render a value by meaning rather than identity: integers by value,
/// strings by content
pub fn describe(heap: &dyn Collector, value: &Value) -> String {
    if let Ok(Some(n)) = value.as_integer(heap) {
        return n.to_string();
    }
    if let Value::Object(handle) = value {
        if heap.tag_of(*handle) == Ok(ObjectTag::String) {
            if let Ok(s) = heap.string(*handle) {
                return format!("{:?}", s);
            }
        }
    }
    value.to_string()
}
