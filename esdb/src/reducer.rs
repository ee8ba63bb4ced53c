//! Combines every registered model's reducer output for one event into a
//! single `name → outcome` map.

use std::collections::HashMap;
use std::sync::Arc;

use crate::event::{Event, ReducerOutcome};
use crate::model::Model;

/// Runs every reducer named in `names` against `event`, in registration
/// order, collecting each outcome regardless of whether an earlier one
/// errored — no reducer short-circuits another.
#[must_use]
pub fn combine_reducers(
    models: &HashMap<String, Arc<dyn Model>>,
    names: &[String],
    event: &Event,
) -> HashMap<String, ReducerOutcome> {
    let mut outcomes = HashMap::with_capacity(names.len());
    for name in names {
        let Some(model) = models.get(name) else {
            continue;
        };
        outcomes.insert(name.clone(), model.reduce(event));
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TxConn;
    use crate::error::Result;
    use async_trait::async_trait;
    use serde_json::json;

    struct Always(ReducerOutcome);

    #[async_trait]
    impl Model for Always {
        fn name(&self) -> &str {
            "always"
        }

        fn reduce(&self, _event: &Event) -> ReducerOutcome {
            self.0.clone()
        }
    }

    #[async_trait]
    impl Model for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn reduce(&self, _event: &Event) -> ReducerOutcome {
            ReducerOutcome::Errored(json!("nope"))
        }

        async fn apply_changes(&self, _tx: &mut TxConn<'_>, _change: crate::event::Change) -> Result<()> {
            Ok(())
        }
    }

    struct Failing;

    #[test]
    fn collects_every_outcome_without_short_circuiting() {
        let mut models: HashMap<String, Arc<dyn Model>> = HashMap::new();
        models.insert("ok".to_string(), Arc::new(Always(ReducerOutcome::Changed(Default::default()))));
        models.insert("failing".to_string(), Arc::new(Failing));

        let event = Event::new(1, "inc", 0, json!({}));
        let names = vec!["ok".to_string(), "failing".to_string()];
        let outcomes = combine_reducers(&models, &names, &event);

        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes["ok"], ReducerOutcome::Changed(_)));
        assert!(matches!(outcomes["failing"], ReducerOutcome::Errored(_)));
    }

    #[test]
    fn unregistered_names_are_skipped() {
        let models: HashMap<String, Arc<dyn Model>> = HashMap::new();
        let event = Event::new(1, "inc", 0, json!({}));
        let outcomes = combine_reducers(&models, &["ghost".to_string()], &event);
        assert!(outcomes.is_empty());
    }
}
