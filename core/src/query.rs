//! Coarsened read access to a (possibly still building) state system.
//!
//! Every window is evaluated at its two endpoints only and the smaller of
//! the present values is kept. A wide window can therefore miss extrema
//! strictly inside it; callers keep windows close to the display
//! resolution. Store errors never escape this module: they read as "no
//! data".

use crate::context::{type_name, Context};
use crate::event::{CONTEXTS_ROOT, PARENT_FIELD, VALUES_ROOT, VALUE_FIELDS};
use crate::storage::{FullState, Quark, StateSystem, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One emitted bucket of a [`Series`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub start: Timestamp,
    pub end: Timestamp,
    pub value: f64,
}

/// Clamp `[start, end]` to the store's known range. `None` when empty.
pub fn clamp_window(
    store: &dyn StateSystem,
    start: Timestamp,
    end: Timestamp,
) -> Option<(Timestamp, Timestamp)> {
    let start = start.max(store.start_time());
    let end = end.min(store.current_end_time());
    (start <= end).then_some((start, end))
}

fn min_present(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn double_at(store: &dyn StateSystem, time: Timestamp, quark: Quark) -> Option<f64> {
    store
        .query_single_state(time, quark)
        .ok()
        .and_then(|interval| interval.value.unbox_double().ok())
}

fn double_in(state: &FullState, quark: Quark) -> Option<f64> {
    state
        .get(quark.index())
        .and_then(|interval| interval.value.unbox_double().ok())
}

/// Approximate value of `field` of `variable` over a window.
pub fn range_value(
    store: &dyn StateSystem,
    variable: Quark,
    field: &str,
    window_start: Timestamp,
    window_end: Timestamp,
) -> Option<f64> {
    let (start, end) = clamp_window(store, window_start, window_end)?;
    let quark = store.quark_relative(variable, field).ok()?;
    min_present(double_at(store, start, quark), double_at(store, end, quark))
}

/// Upper bound on the buckets one series may emit; narrower requested
/// widths are widened to fit.
pub const MAX_SERIES_BUCKETS: i64 = 100_000;

/// Lazy, restartable bucketed view of one variable field.
#[derive(Clone)]
pub struct Series<'a> {
    store: &'a dyn StateSystem,
    variable: Quark,
    field: String,
    range: Option<(Timestamp, Timestamp)>,
    width: Timestamp,
}

/// Buckets of `bucket_width` over `[range_start, range_end]`, clamped to the
/// store's known range.
pub fn series<'a>(
    store: &'a dyn StateSystem,
    variable: Quark,
    field: &str,
    range_start: Timestamp,
    range_end: Timestamp,
    bucket_width: Timestamp,
) -> Series<'a> {
    let range = clamp_window(store, range_start, range_end);
    let span = range.map_or(0, |(start, end)| end.saturating_sub(start));
    let min_width = span / MAX_SERIES_BUCKETS + i64::from(span % MAX_SERIES_BUCKETS != 0);
    Series {
        store,
        variable,
        field: field.to_string(),
        range,
        width: bucket_width.max(min_width).max(1),
    }
}

impl<'a> Series<'a> {
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Effective bucket width.
    pub fn width(&self) -> Timestamp {
        self.width
    }

    /// Clamped range, `None` when it misses the store entirely.
    pub fn range(&self) -> Option<(Timestamp, Timestamp)> {
        self.range
    }

    /// Walk the buckets from scratch.
    pub fn iter(&self) -> SeriesIter<'_, 'a> {
        SeriesIter {
            series: self,
            cursor: self.range.map(|(start, _)| start),
        }
    }

    pub fn collect_buckets(&self) -> Vec<Bucket> {
        self.iter().collect()
    }
}

impl<'s, 'a> IntoIterator for &'s Series<'a> {
    type Item = Bucket;
    type IntoIter = SeriesIter<'s, 'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct SeriesIter<'s, 'a> {
    series: &'s Series<'a>,
    cursor: Option<Timestamp>,
}

impl Iterator for SeriesIter<'_, '_> {
    type Item = Bucket;

    fn next(&mut self) -> Option<Bucket> {
        let s = self.series;
        let (_, range_end) = s.range?;
        while let Some(start) = self.cursor {
            let end = if start >= range_end {
                // Only reachable for a point range.
                self.cursor = None;
                start
            } else {
                let end = start.saturating_add(s.width).min(range_end);
                self.cursor = (end < range_end).then_some(end);
                end
            };
            if let Some(value) = range_value(s.store, s.variable, &s.field, start, end) {
                return Some(Bucket { start, end, value });
            }
        }
        None
    }
}

/// One series per value field, in [`VALUE_FIELDS`] order.
pub fn series_all_fields<'a>(
    store: &'a dyn StateSystem,
    variable: Quark,
    range_start: Timestamp,
    range_end: Timestamp,
    bucket_width: Timestamp,
) -> Vec<Series<'a>> {
    VALUE_FIELDS
        .iter()
        .map(|field| series(store, variable, field, range_start, range_end, bucket_width))
        .collect()
}

/// Time covered by one display column.
pub fn resolution(range: Timestamp, display_width: i64) -> Timestamp {
    (range.max(0) / display_width.max(1)).max(1)
}

/// Default bucket width for drawing `[start, end]`: `multiplier` display
/// columns.
pub fn bucket_width(
    start: Timestamp,
    end: Timestamp,
    display_width: i64,
    multiplier: i64,
) -> Timestamp {
    resolution(end.saturating_sub(start), display_width).saturating_mul(multiplier.max(1))
}

/// One representative value of `field` per tracked variable, keyed by the
/// variable's quark (`values/<id>`).
pub fn get_values_range(
    store: &dyn StateSystem,
    start: Timestamp,
    end: Timestamp,
    field: &str,
) -> HashMap<Quark, f64> {
    let mut out = HashMap::new();
    let Some((start, end)) = clamp_window(store, start, end) else {
        return out;
    };
    let (Ok(start_state), Ok(end_state)) =
        (store.query_full_state(start), store.query_full_state(end))
    else {
        return out;
    };

    for variable in store.quarks(&[VALUES_ROOT, "*"]) {
        let Ok(quark) = store.quark_relative(variable, field) else {
            continue;
        };
        if let Some(value) = min_present(
            double_in(&start_state, quark),
            double_in(&end_state, quark),
        ) {
            out.insert(variable, value);
        }
    }
    out
}

/// Quark of `values/<context_id>`, if any value was recorded for it.
pub fn variable_quark(store: &dyn StateSystem, context_id: u64) -> Option<Quark> {
    store
        .quark_absolute(&[VALUES_ROOT, &context_id.to_string()])
        .ok()
}

/// Context id behind a `values/<id>` quark.
pub fn context_id_of(store: &dyn StateSystem, variable: Quark) -> Option<u64> {
    store.attribute_name(variable).ok()?.parse().ok()
}

/// Everything known about a variable at the store's current end time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDescription {
    pub id: u64,
    pub name: String,
    pub type_name: String,
    pub type_size: i32,
    pub file: String,
    pub function: String,
    pub line: i32,
    /// Callpath id of the latest sample.
    pub parent: Option<i64>,
    pub latest: BTreeMap<String, f64>,
}

pub fn describe_variable(store: &dyn StateSystem, context_id: u64) -> Option<VariableDescription> {
    let context_quark = store
        .quark_absolute(&[CONTEXTS_ROOT, &context_id.to_string()])
        .ok()?;
    let context = Context::extract_from_store(store, context_quark).ok()?;
    let at = store.current_end_time();

    let mut latest = BTreeMap::new();
    let mut parent = None;
    if let Some(variable) = variable_quark(store, context_id) {
        for field in VALUE_FIELDS {
            if let Some(value) = store
                .quark_relative(variable, field)
                .ok()
                .and_then(|q| double_at(store, at, q))
            {
                latest.insert(field.to_string(), value);
            }
        }
        parent = store
            .quark_relative(variable, PARENT_FIELD)
            .ok()
            .and_then(|q| store.query_single_state(at, q).ok())
            .and_then(|interval| interval.value.unbox_long().ok());
    }

    Some(VariableDescription {
        id: context.id,
        type_name: type_name(context.type_size).to_string(),
        type_size: context.type_size,
        name: context.name,
        file: context.file,
        function: context.function,
        line: context.line,
        parent,
        latest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStateSystem, StateValue};

    fn store_with(samples: &[(Timestamp, f64)], end: Timestamp) -> (MemoryStateSystem, Quark) {
        let store = MemoryStateSystem::new(0);
        let variable = store.quark_absolute_and_add(&[VALUES_ROOT, "42"]);
        let field = store
            .quark_relative_and_add(variable, "significant_digits")
            .unwrap();
        for &(t, v) in samples {
            store.modify_attribute(t, StateValue::Double(v), field).unwrap();
        }
        store.close_history(end);
        (store, variable)
    }

    #[test]
    fn test_range_value_takes_min_of_endpoints() {
        let (store, var) = store_with(&[(0, 5.0), (10, 3.0)], 20);
        assert_eq!(
            range_value(&store, var, "significant_digits", 0, 10),
            Some(3.0)
        );
    }

    #[test]
    fn test_range_value_with_absent_start() {
        let (store, var) = store_with(&[(10, 7.0)], 20);
        assert_eq!(
            range_value(&store, var, "significant_digits", 5, 10),
            Some(7.0)
        );
    }

    #[test]
    fn test_range_value_none_when_both_absent() {
        let (store, var) = store_with(&[(10, 7.0)], 20);
        assert_eq!(range_value(&store, var, "significant_digits", 0, 9), None);
        assert_eq!(range_value(&store, var, "mean", 0, 20), None);
    }

    #[test]
    fn test_range_value_clamps_window() {
        let (store, var) = store_with(&[(0, 4.0), (20, 9.0)], 20);
        assert_eq!(
            range_value(&store, var, "significant_digits", -50, 500),
            Some(4.0)
        );
        assert_eq!(range_value(&store, var, "significant_digits", 30, 40), None);
    }

    #[test]
    fn test_series_bucket_layout() {
        let (store, var) = store_with(&[(0, 1.0)], 100);
        let s = series(&store, var, "significant_digits", 0, 100, 25);
        let starts: Vec<_> = s.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![0, 25, 50, 75]);
        assert_eq!(s.collect_buckets().last().unwrap().end, 100);
    }

    #[test]
    fn test_series_last_bucket_may_be_short() {
        let (store, var) = store_with(&[(0, 1.0)], 100);
        let buckets = series(&store, var, "significant_digits", 0, 90, 40).collect_buckets();
        let bounds: Vec<_> = buckets.iter().map(|b| (b.start, b.end)).collect();
        assert_eq!(bounds, vec![(0, 40), (40, 80), (80, 90)]);
    }

    #[test]
    fn test_series_sees_only_bucket_endpoints() {
        // A value first appearing at 40 is invisible from [25, 50)'s start but
        // visible from its end.
        let (store, var) = store_with(&[(40, 2.0)], 100);
        let buckets = series(&store, var, "significant_digits", 0, 100, 25).collect_buckets();
        let starts: Vec<_> = buckets.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![25, 50, 75]);

        // A value alive only strictly inside a bucket is missed entirely.
        let store = MemoryStateSystem::new(0);
        let variable = store.quark_absolute_and_add(&[VALUES_ROOT, "1"]);
        let field = store.quark_relative_and_add(variable, "mean").unwrap();
        store.modify_attribute(40, StateValue::Double(2.0), field).unwrap();
        store.modify_attribute(45, StateValue::Null, field).unwrap();
        store.close_history(100);
        let buckets = series(&store, variable, "mean", 25, 50, 25).collect_buckets();
        assert!(buckets.is_empty());
    }

    #[test]
    fn test_series_is_restartable() {
        let (store, var) = store_with(&[(0, 1.0), (60, 0.5)], 100);
        let s = series(&store, var, "significant_digits", 0, 100, 25);
        let first: Vec<_> = s.iter().collect();
        let second: Vec<_> = (&s).into_iter().collect();
        assert_eq!(first, second);
        assert_eq!(first[1].value, 1.0);
        assert_eq!(first[2].value, 0.5);
    }

    #[test]
    fn test_series_point_range() {
        let (store, var) = store_with(&[(0, 1.0)], 100);
        let buckets = series(&store, var, "significant_digits", 30, 30, 0).collect_buckets();
        assert_eq!(
            buckets,
            vec![Bucket {
                start: 30,
                end: 30,
                value: 1.0
            }]
        );
    }

    #[test]
    fn test_series_clamps_extreme_ranges() {
        let (store, var) = store_with(&[(0, 1.0)], 100);
        let s = series(&store, var, "significant_digits", i64::MIN, i64::MAX, 25);
        assert_eq!(s.range(), Some((0, 100)));
        let starts: Vec<_> = s.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![0, 25, 50, 75]);

        let outside = series(&store, var, "significant_digits", 200, i64::MAX, 1);
        assert_eq!(outside.range(), None);
        assert!(outside.collect_buckets().is_empty());
    }

    #[test]
    fn test_series_caps_bucket_count() {
        let store = MemoryStateSystem::new(i64::MIN / 2);
        let variable = store.quark_absolute_and_add(&[VALUES_ROOT, "1"]);
        let field = store.quark_relative_and_add(variable, "mean").unwrap();
        store.modify_attribute(0, StateValue::Double(1.0), field).unwrap();
        store.close_history(i64::MAX / 2);

        let s = series(&store, variable, "mean", i64::MIN, i64::MAX, 1);
        assert!(s.width() > 1);
        assert!(s.iter().count() as i64 <= MAX_SERIES_BUCKETS);
    }

    #[test]
    fn test_bucket_width_saturates() {
        assert_eq!(bucket_width(0, 100, 10, 2), 20);
        assert_eq!(bucket_width(i64::MIN, i64::MAX, 1, 2), i64::MAX);
        assert_eq!(bucket_width(50, 10, 10, 2), 2);
        assert_eq!(bucket_width(0, 100, 10, -3), 10);
    }

    #[test]
    fn test_resolution_floor_is_one() {
        assert_eq!(resolution(10, 1000), 1);
        assert_eq!(resolution(10_000, 1000), 10);
        assert_eq!(resolution(10_000, 0), 10_000);
    }

    #[test]
    fn test_get_values_range_per_variable() {
        let store = MemoryStateSystem::new(0);
        let a = store.quark_absolute_and_add(&[VALUES_ROOT, "1"]);
        let b = store.quark_absolute_and_add(&[VALUES_ROOT, "2"]);
        let c = store.quark_absolute_and_add(&[VALUES_ROOT, "3"]);
        let fa = store.quark_relative_and_add(a, "mean").unwrap();
        let fb = store.quark_relative_and_add(b, "mean").unwrap();
        store.quark_relative_and_add(c, "min").unwrap();
        store.modify_attribute(0, StateValue::Double(5.0), fa).unwrap();
        store.modify_attribute(10, StateValue::Double(3.0), fa).unwrap();
        store.modify_attribute(10, StateValue::Double(7.0), fb).unwrap();
        store.close_history(10);

        let values = get_values_range(&store, 0, 10, "mean");
        assert_eq!(values.len(), 2);
        assert_eq!(values[&a], 3.0);
        assert_eq!(values[&b], 7.0);

        assert!(get_values_range(&store, 20, 30, "mean").is_empty());
    }

    #[test]
    fn test_get_values_range_on_disposed_store_is_empty() {
        let (store, _) = store_with(&[(0, 1.0)], 10);
        store.dispose();
        assert!(get_values_range(&store, 0, 10, "significant_digits").is_empty());
    }

    #[test]
    fn test_describe_variable_reads_context_and_latest_sample() {
        use crate::event::RawEvent;
        use crate::ingest::StateProvider;
        use serde_json::json;
        use std::sync::Arc;

        let store = Arc::new(MemoryStateSystem::new(0));
        let mut provider = StateProvider::new(store.clone());
        for event in [
            json!({"name": "context", "timestamp": 0,
                   "fields": {"id": 7, "file": "b.c", "function": "g", "line": 3, "name": "acc", "type": "4"}}),
            json!({"name": "callpath", "timestamp": 0, "fields": {"id": 1, "parent": 0, "name": "main"}}),
            json!({"name": "value", "timestamp": 20,
                   "fields": {"context": 7, "parent": 1, "mean": 2.0, "min": 1.0, "max": 3.0,
                              "median": 2.0, "std": 0.5, "significant_digits": 4.0}}),
        ] {
            let raw: RawEvent = serde_json::from_value(event).unwrap();
            provider.handle(&raw).unwrap();
        }
        provider.finish(20);

        let description = describe_variable(store.as_ref(), 7).unwrap();
        assert_eq!(description.name, "acc");
        assert_eq!(description.type_name, "binary32");
        assert_eq!(description.type_size, 4);
        assert_eq!(description.parent, Some(1));
        assert_eq!(description.latest["significant_digits"], 4.0);
        assert_eq!(context_id_of(store.as_ref(), variable_quark(store.as_ref(), 7).unwrap()), Some(7));
        assert!(describe_variable(store.as_ref(), 8).is_none());
    }
}
