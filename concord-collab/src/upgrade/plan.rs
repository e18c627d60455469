//! Migration steps, the step graph, and plan execution.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use concord_core::canonical_hash;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::UpgradeError;

/// One registered schema transform.
///
/// `migrate` must be pure: the same input always yields the same output.
pub trait MigrationStep: Send + Sync {
    fn id(&self) -> &str;
    fn from_schema(&self) -> &str;
    fn to_schema(&self) -> &str;
    fn migrate(&self, state: &Value) -> Result<Value, String>;

    /// Check the migrated state. Default accepts everything.
    fn validate(&self, _state: &Value) -> Result<(), String> {
        Ok(())
    }
}

type Transform = Box<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;
type Check = Box<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Closure-backed [`MigrationStep`].
pub struct FnStep {
    id: String,
    from: String,
    to: String,
    migrate: Transform,
    validate: Option<Check>,
}

impl FnStep {
    pub fn new<F>(id: impl Into<String>, from: impl Into<String>, to: impl Into<String>, migrate: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            migrate: Box::new(migrate),
            validate: None,
        }
    }

    pub fn with_validation<F>(mut self, check: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validate = Some(Box::new(check));
        self
    }
}

impl MigrationStep for FnStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn from_schema(&self) -> &str {
        &self.from
    }

    fn to_schema(&self) -> &str {
        &self.to
    }

    fn migrate(&self, state: &Value) -> Result<Value, String> {
        (self.migrate)(state)
    }

    fn validate(&self, state: &Value) -> Result<(), String> {
        match &self.validate {
            Some(check) => check(state),
            None => Ok(()),
        }
    }
}

/// A step as recorded in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub id: String,
    pub from_schema: String,
    pub to_schema: String,
}

/// An ordered, content-addressed migration plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    pub plan_id: String,
    pub from_schema: String,
    pub to_schema: String,
    pub steps: Vec<PlanStep>,
}

impl MigrationPlan {
    pub fn new(from_schema: impl Into<String>, to_schema: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        let from_schema = from_schema.into();
        let to_schema = to_schema.into();
        let plan_id = Self::compute_id(&from_schema, &to_schema, &steps);
        Self {
            plan_id,
            from_schema,
            to_schema,
            steps,
        }
    }

    fn compute_id(from: &str, to: &str, steps: &[PlanStep]) -> String {
        let steps: Vec<Value> = steps
            .iter()
            .map(|s| json!({"id": s.id, "from": s.from_schema, "to": s.to_schema}))
            .collect();
        let basis = json!({"from": from, "to": to, "steps": steps});
        format!("plan_{}", &canonical_hash(&basis)[..16])
    }

    /// True if `plan_id` matches the plan's content.
    pub fn is_consistent(&self) -> bool {
        self.plan_id == Self::compute_id(&self.from_schema, &self.to_schema, &self.steps)
    }
}

/// Registry of steps forming the schema graph.
#[derive(Default)]
pub struct StepRegistry {
    steps: Vec<Arc<dyn MigrationStep>>,
    by_id: HashMap<String, usize>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step. A later step with the same id replaces the earlier.
    pub fn register(&mut self, step: impl MigrationStep + 'static) -> &mut Self {
        let id = step.id().to_string();
        let step: Arc<dyn MigrationStep> = Arc::new(step);
        match self.by_id.get(&id) {
            Some(&i) => self.steps[i] = step,
            None => {
                self.by_id.insert(id, self.steps.len());
                self.steps.push(step);
            }
        }
        self
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn MigrationStep>> {
        self.by_id.get(id).map(|&i| &self.steps[i])
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Shortest step sequence `from → to` (breadth-first, registration order
    /// breaks ties).
    pub fn plan(&self, from: &str, to: &str) -> Result<MigrationPlan, UpgradeError> {
        if from == to {
            return Err(UpgradeError::AlreadyAtSchema(to.to_string()));
        }
        let mut came_from: HashMap<&str, usize> = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::from([from]);
        let mut queue: VecDeque<&str> = VecDeque::from([from]);

        while let Some(node) = queue.pop_front() {
            if node == to {
                break;
            }
            for (i, step) in self.steps.iter().enumerate() {
                if step.from_schema() == node && seen.insert(step.to_schema()) {
                    came_from.insert(step.to_schema(), i);
                    queue.push_back(step.to_schema());
                }
            }
        }

        if !came_from.contains_key(to) {
            return Err(UpgradeError::NoPath {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let mut steps = Vec::new();
        let mut cur = to;
        while cur != from {
            let step = &self.steps[came_from[cur]];
            steps.push(PlanStep {
                id: step.id().to_string(),
                from_schema: step.from_schema().to_string(),
                to_schema: step.to_schema().to_string(),
            });
            cur = step.from_schema();
        }
        steps.reverse();
        Ok(MigrationPlan::new(from, to, steps))
    }

    /// Run `plan` on a copy of `state`. Any step failure aborts the whole
    /// plan and leaves `state` untouched.
    pub fn execute(&self, plan: &MigrationPlan, state: &Value) -> Result<Value, UpgradeError> {
        if !plan.is_consistent() {
            return Err(UpgradeError::PlanMismatch(plan.plan_id.clone()));
        }
        let mut cur = state.clone();
        for planned in &plan.steps {
            let step = self
                .get(&planned.id)
                .ok_or_else(|| UpgradeError::MissingStep(planned.id.clone()))?;
            if step.from_schema() != planned.from_schema || step.to_schema() != planned.to_schema {
                return Err(UpgradeError::MissingStep(planned.id.clone()));
            }
            cur = step.migrate(&cur).map_err(|reason| UpgradeError::StepFailed {
                step: planned.id.clone(),
                reason,
            })?;
            step.validate(&cur).map_err(|reason| UpgradeError::StepFailed {
                step: planned.id.clone(),
                reason,
            })?;
            log::debug!("migration step {} applied", planned.id);
        }
        Ok(cur)
    }
}
