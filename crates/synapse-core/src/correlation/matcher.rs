//! Event filter matching and correlation-context accumulation.
//!
//! Pure decisions over one event at a time: nothing here touches the
//! repository. A filter match is all-or-nothing; when any attribute or key
//! check fails the context is left exactly as it was.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use synapse_types::correlation::{
    ConsumptionMode, CorrelationContext, CorrelationKeyDefinition, EventConsumptionStrategy, EventFilter,
};
use synapse_types::event::CloudEvent;

use crate::expression::{is_runtime_expression, ExpressionEvaluator};

pub struct CorrelationMatcher {
    evaluator: Arc<dyn ExpressionEvaluator>,
    /// Compiled attribute patterns keyed by source text.
    patterns: DashMap<String, Regex>,
}

impl CorrelationMatcher {
    pub fn new(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self {
            evaluator,
            patterns: DashMap::new(),
        }
    }

    pub fn evaluator(&self) -> &Arc<dyn ExpressionEvaluator> {
        &self.evaluator
    }

    /// Whether `event` carries every selector attribute with the exact value.
    pub fn matches_selector(&self, selector: Option<&BTreeMap<String, String>>, event: &CloudEvent) -> bool {
        selector.is_none_or(|selector| {
            selector
                .iter()
                .all(|(name, expected)| event.attribute_str(name).as_deref() == Some(expected.as_str()))
        })
    }

    /// Match one filter against `event` given the keys resolved so far.
    ///
    /// Returns the keys the event resolves (including ones already known), or
    /// `None` when an attribute check fails or a key is missing, unexpected
    /// or inconsistent with `known`.
    pub fn match_filter(
        &self,
        filter: &EventFilter,
        event: &CloudEvent,
        known: &BTreeMap<String, String>,
    ) -> Option<BTreeMap<String, String>> {
        let document = event.to_value();
        for (name, pattern) in &filter.attributes {
            if !self.matches_attribute(name, pattern, event, &document) {
                return None;
            }
        }

        let mut resolved = BTreeMap::new();
        for definition in &filter.correlate {
            let value = self.resolve_key(definition, event, &document)?;
            if definition.expect.as_ref().is_some_and(|expected| *expected != value) {
                return None;
            }
            if known.get(&definition.key).is_some_and(|previous| *previous != value) {
                tracing::debug!(
                    event_id = %event.id,
                    key = definition.key.as_str(),
                    "correlation key mismatch"
                );
                return None;
            }
            resolved.insert(definition.key.clone(), value);
        }
        Some(resolved)
    }

    /// Feed `event` into `context`.
    ///
    /// The event is recorded against the first not-yet-satisfied filter it
    /// matches, together with its resolved keys. Returns whether it was
    /// recorded.
    pub fn try_correlate(
        &self,
        strategy: &EventConsumptionStrategy,
        context: &mut CorrelationContext,
        event: &CloudEvent,
    ) -> bool {
        if context.contains_event(&event.id) {
            return false;
        }
        for (index, filter) in candidate_filters(strategy) {
            if context.events.contains_key(&index) {
                continue;
            }
            if let Some(keys) = self.match_filter(filter, event, &context.keys) {
                context.events.insert(index, event.clone());
                context.keys.extend(keys);
                return true;
            }
        }
        false
    }

    /// Whether `context` satisfies the consumption strategy.
    pub fn is_satisfied(strategy: &EventConsumptionStrategy, context: &CorrelationContext) -> bool {
        match strategy.strategy {
            ConsumptionMode::All => {
                !strategy.filters.is_empty()
                    && (0..strategy.filters.len()).all(|index| context.events.contains_key(&index))
            }
            ConsumptionMode::Any => !context.events.is_empty(),
            ConsumptionMode::One => context.events.contains_key(&0),
        }
    }

    fn matches_attribute(&self, name: &str, pattern: &str, event: &CloudEvent, document: &Value) -> bool {
        let Some(actual) = event.attribute_str(name) else {
            return false;
        };
        if is_runtime_expression(pattern) {
            return match self.evaluator.evaluate_condition(pattern, document) {
                Ok(matched) => matched,
                Err(e) => {
                    tracing::debug!(attribute = name, error = %e, "attribute predicate failed");
                    false
                }
            };
        }
        match self.pattern(pattern) {
            Some(regex) => regex.is_match(&actual),
            None => false,
        }
    }

    fn resolve_key(
        &self,
        definition: &CorrelationKeyDefinition,
        event: &CloudEvent,
        document: &Value,
    ) -> Option<String> {
        if !is_runtime_expression(&definition.from) {
            return event.attribute_str(&definition.from);
        }
        match self.evaluator.evaluate(&definition.from, document) {
            Ok(Value::Null) => None,
            Ok(Value::String(s)) => Some(s),
            Ok(other) => Some(other.to_string()),
            Err(e) => {
                tracing::debug!(key = definition.key.as_str(), error = %e, "correlation key expression failed");
                None
            }
        }
    }

    /// Anchored, case-insensitive regex for a literal pattern.
    fn pattern(&self, source: &str) -> Option<Regex> {
        if let Some(cached) = self.patterns.get(source) {
            return Some(cached.clone());
        }
        match Regex::new(&format!("(?i)^(?:{source})$")) {
            Ok(regex) => {
                self.patterns.insert(source.to_string(), regex.clone());
                Some(regex)
            }
            Err(e) => {
                tracing::warn!(pattern = source, error = %e, "invalid attribute pattern");
                None
            }
        }
    }
}

impl std::fmt::Debug for CorrelationMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationMatcher")
            .field("cached_patterns", &self.patterns.len())
            .finish()
    }
}

/// Filters an event may satisfy under `strategy`, with their indexes.
fn candidate_filters(strategy: &EventConsumptionStrategy) -> impl Iterator<Item = (usize, &EventFilter)> {
    let limit = match strategy.strategy {
        ConsumptionMode::One => 1,
        ConsumptionMode::All | ConsumptionMode::Any => strategy.filters.len(),
    };
    strategy.filters.iter().enumerate().take(limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::WorkflowEvaluator;

    fn matcher() -> CorrelationMatcher {
        CorrelationMatcher::new(Arc::new(WorkflowEvaluator::new()))
    }

    fn filter(attributes: &[(&str, &str)], keys: &[(&str, &str)]) -> EventFilter {
        EventFilter {
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            correlate: keys
                .iter()
                .map(|(key, from)| CorrelationKeyDefinition {
                    key: key.to_string(),
                    from: from.to_string(),
                    expect: None,
                })
                .collect(),
        }
    }

    fn event(id: &str, event_type: &str, subject: &str) -> CloudEvent {
        CloudEvent::new(id, "/orders", event_type).with_subject(subject)
    }

    fn strategy(mode: ConsumptionMode, filters: Vec<EventFilter>) -> EventConsumptionStrategy {
        EventConsumptionStrategy {
            strategy: mode,
            filters,
        }
    }

    #[test]
    fn test_literal_attributes_are_case_insensitive_anchored_regexes() {
        let m = matcher();
        let f = filter(&[("type", "com.example.order.(created|updated)")], &[]);
        let known = BTreeMap::new();

        assert!(m.match_filter(&f, &event("1", "COM.EXAMPLE.ORDER.CREATED", "o-1"), &known).is_some());
        assert!(m.match_filter(&f, &event("2", "com.example.order.updated", "o-1"), &known).is_some());
        assert!(m.match_filter(&f, &event("3", "com.example.order.created.v2", "o-1"), &known).is_none());
    }

    #[test]
    fn test_expression_attribute_and_missing_attribute() {
        let m = matcher();
        let known = BTreeMap::new();
        let f = filter(&[("priority", "${ priority > 2 }")], &[]);

        let high = event("1", "t", "s").with_extension("priority", 5);
        let low = event("2", "t", "s").with_extension("priority", 1);
        assert!(m.match_filter(&f, &high, &known).is_some());
        assert!(m.match_filter(&f, &low, &known).is_none());
        // The attribute must be present, whatever the pattern.
        assert!(m.match_filter(&f, &event("3", "t", "s"), &known).is_none());
    }

    #[test]
    fn test_invalid_pattern_never_matches() {
        let m = matcher();
        let f = filter(&[("type", "(unclosed")], &[]);
        assert!(m.match_filter(&f, &event("1", "(unclosed", "s"), &BTreeMap::new()).is_none());
    }

    #[test]
    fn test_key_consistency() {
        let m = matcher();
        let f = filter(&[("type", "com.example.shipped")], &[("order", "subject")]);
        let known = BTreeMap::from([("order".to_string(), "o-1".to_string())]);

        let same = m.match_filter(&f, &event("1", "com.example.shipped", "o-1"), &known);
        assert_eq!(same.unwrap().get("order").map(String::as_str), Some("o-1"));
        assert!(m.match_filter(&f, &event("2", "com.example.shipped", "o-2"), &known).is_none());
    }

    #[test]
    fn test_key_from_expression_and_expect() {
        let m = matcher();
        let mut f = filter(&[], &[("tenant", "${ data.tenant }")]);
        let e = event("1", "t", "s").with_data(serde_json::json!({"tenant": "acme"}));
        let keys = m.match_filter(&f, &e, &BTreeMap::new()).unwrap();
        assert_eq!(keys["tenant"], "acme");

        f.correlate[0].expect = Some("globex".to_string());
        assert!(m.match_filter(&f, &e, &BTreeMap::new()).is_none());

        // A key the event cannot resolve fails the filter.
        let missing = event("2", "t", "s");
        assert!(m.match_filter(&filter(&[], &[("tenant", "${ data.tenant }")]), &missing, &BTreeMap::new()).is_none());
    }

    #[test]
    fn test_failed_match_leaves_context_untouched() {
        let m = matcher();
        let s = strategy(
            ConsumptionMode::All,
            vec![
                filter(&[("type", "a")], &[("order", "subject")]),
                filter(&[("type", "b")], &[("order", "subject")]),
            ],
        );
        let mut context = CorrelationContext::new("1");
        assert!(m.try_correlate(&s, &mut context, &event("1", "a", "o-1")));
        let snapshot = context.clone();

        assert!(!m.try_correlate(&s, &mut context, &event("2", "b", "o-2")));
        assert_eq!(context, snapshot);
        assert!(!CorrelationMatcher::is_satisfied(&s, &context));

        assert!(m.try_correlate(&s, &mut context, &event("3", "b", "o-1")));
        assert!(CorrelationMatcher::is_satisfied(&s, &context));
        assert_eq!(context.events[&0].id, "1");
        assert_eq!(context.events[&1].id, "3");
    }

    #[test]
    fn test_redelivered_event_is_not_recorded_twice() {
        let m = matcher();
        let s = strategy(ConsumptionMode::All, vec![filter(&[("type", "a")], &[]), filter(&[("type", "a")], &[])]);
        let mut context = CorrelationContext::new("1");
        let e = event("1", "a", "s");
        assert!(m.try_correlate(&s, &mut context, &e));
        assert!(!m.try_correlate(&s, &mut context, &e));
        assert_eq!(context.events.len(), 1);
    }

    #[test]
    fn test_any_and_one_strategies() {
        let m = matcher();
        let any = strategy(ConsumptionMode::Any, vec![filter(&[("type", "a")], &[]), filter(&[("type", "b")], &[])]);
        let mut context = CorrelationContext::new("1");
        assert!(m.try_correlate(&any, &mut context, &event("1", "b", "s")));
        assert!(CorrelationMatcher::is_satisfied(&any, &context));

        let one = strategy(ConsumptionMode::One, vec![filter(&[("type", "a")], &[]), filter(&[("type", "b")], &[])]);
        let mut context = CorrelationContext::new("2");
        assert!(!m.try_correlate(&one, &mut context, &event("2", "b", "s")));
        assert!(m.try_correlate(&one, &mut context, &event("3", "a", "s")));
        assert!(CorrelationMatcher::is_satisfied(&one, &context));
    }

    #[test]
    fn test_selector() {
        let m = matcher();
        let selector = BTreeMap::from([("source".to_string(), "/orders".to_string())]);
        assert!(m.matches_selector(Some(&selector), &event("1", "t", "s")));
        assert!(m.matches_selector(None, &event("1", "t", "s")));
        let other = CloudEvent::new("2", "/billing", "t");
        assert!(!m.matches_selector(Some(&selector), &other));
    }
}
