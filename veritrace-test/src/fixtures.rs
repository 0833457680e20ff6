use serde_json::{json, Value};

pub struct TraceFixture {
    pub events: Vec<Value>,
    pub context_id: u64,
    pub sample_time: i64,
    pub significant_digits: f64,
}

fn value_event(timestamp: i64, context: u64, parent: i64, digits: f64) -> Value {
    json!({
        "name": "value",
        "timestamp": timestamp,
        "fields": {
            "context": context,
            "parent": parent,
            "mean": 1.0,
            "min": 0.5,
            "max": 2.0,
            "median": 1.0,
            "std": 0.1,
            "significant_digits": digits
        }
    })
}

/// One binary64 variable `x` sampled once under `main`.
pub fn single_variable_fixture() -> TraceFixture {
    TraceFixture {
        events: vec![
            json!({
                "name": "context",
                "timestamp": 0,
                "fields": {"id": 42, "file": "a.c", "function": "f", "line": 10, "name": "x", "type": "8"}
            }),
            json!({
                "name": "callpath",
                "timestamp": 0,
                "fields": {"id": 1, "parent": 0, "name": "main"}
            }),
            value_event(100, 42, 1, 6.0),
        ],
        context_id: 42,
        sample_time: 100,
        significant_digits: 6.0,
    }
}

/// Two variables under a nested callpath; `y` loses precision over time.
pub fn nested_fixture() -> Vec<Value> {
    vec![
        json!({"name": "context", "timestamp": 0,
               "fields": {"id": 1, "file": "solver.c", "function": "step", "line": 12, "name": "x", "type": "8"}}),
        json!({"name": "context", "timestamp": 0,
               "fields": {"id": 2, "file": "solver.c", "function": "step", "line": 20, "name": "y", "type": "4"}}),
        json!({"name": "callpath", "timestamp": 0, "fields": {"id": 1, "parent": 0, "name": "main"}}),
        json!({"name": "callpath", "timestamp": 0, "fields": {"id": 2, "parent": 1, "name": "solve"}}),
        value_event(10, 1, 2, 15.0),
        value_event(10, 2, 2, 7.0),
        value_event(50, 1, 2, 14.0),
        value_event(50, 2, 2, 2.0),
        value_event(90, 2, 2, 1.0),
    ]
}
