//! The catalogue of checks and actions, built once at startup.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use foursight_interchange::Kwargs;
use foursight_storage::validate_result_name;

use crate::error::CheckError;
use crate::protocol::{ActionFn, CheckFn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("names must not be empty")]
    EmptyName,
    #[error("'{name}' cannot be used as a result name: {message}")]
    UnstorableName { name: String, message: String },
    #[error("'{name}' is registered more than once")]
    Duplicate { name: String },
    #[error("check '{check}' links action '{action}', which is not registered")]
    UnknownAction { check: String, action: String },
    #[error("check '{check}' auto-queues its action but has none linked")]
    AutoActionWithoutAction { check: String },
    #[error("'{target}' parameter '{param}' defaults to a value outside its choices")]
    BadDefault { target: String, param: String },
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Value>,
    pub required: bool,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            choices: Vec::new(),
            required: false,
        }
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn choices<V: Into<Value>>(mut self, choices: impl IntoIterator<Item = V>) -> Self {
        self.choices = choices.into_iter().map(Into::into).collect();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn default_is_valid(&self) -> bool {
        match &self.default {
            Some(v) if !self.choices.is_empty() => self.choices.contains(v),
            _ => true,
        }
    }
}

/// `runs_to_start` → `Runs To Start`.
pub fn display_title(name: &str) -> String {
    name.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fill defaults and enforce required parameters and choices. Reserved
/// keys pass through untouched; unknown keys are rejected.
pub fn validate_kwargs(params: &[ParamSpec], kwargs: &Kwargs) -> Result<Kwargs, CheckError> {
    let mut out = kwargs.clone();

    for (key, _) in kwargs.user_args() {
        if !params.iter().any(|p| &p.name == key) {
            return Err(CheckError::Validation(format!("unexpected parameter '{}'", key)));
        }
    }

    for param in params {
        match kwargs.get(&param.name) {
            None | Some(Value::Null) => {
                if let Some(default) = &param.default {
                    out.insert(param.name.clone(), default.clone());
                } else if param.required {
                    return Err(CheckError::Validation(format!(
                        "missing required parameter '{}'",
                        param.name
                    )));
                }
            }
            Some(value) => {
                if !param.choices.is_empty() && !param.choices.contains(value) {
                    return Err(CheckError::Validation(format!(
                        "parameter '{}' must be one of {}, got {}",
                        param.name,
                        Value::Array(param.choices.clone()),
                        value
                    )));
                }
            }
        }
    }
    Ok(out)
}

fn defaults_of(params: &[ParamSpec]) -> Kwargs {
    let mut kwargs = Kwargs::new();
    for param in params {
        if let Some(default) = &param.default {
            kwargs.insert(param.name.clone(), default.clone());
        }
    }
    kwargs
}

/// A registered check.
#[derive(Clone)]
pub struct CheckDescriptor {
    pub name: String,
    pub title: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    pub linked_action: Option<String>,
    pub schedule_groups: BTreeSet<String>,
    /// Scheduled items carry `queue_action = <stage>`.
    pub auto_action: bool,
    pub handler: Arc<dyn CheckFn>,
}

impl CheckDescriptor {
    pub fn new(name: impl Into<String>, handler: impl CheckFn) -> Self {
        let name = name.into();
        Self {
            title: display_title(&name),
            name,
            description: String::new(),
            params: Vec::new(),
            linked_action: None,
            schedule_groups: BTreeSet::new(),
            auto_action: false,
            handler: Arc::new(handler),
        }
    }

    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.linked_action = Some(action.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.schedule_groups.insert(group.into());
        self
    }

    pub fn auto_action(mut self) -> Self {
        self.auto_action = true;
        self
    }

    pub fn default_kwargs(&self) -> Kwargs {
        defaults_of(&self.params)
    }

    pub fn validate(&self, kwargs: &Kwargs) -> Result<Kwargs, CheckError> {
        validate_kwargs(&self.params, kwargs)
    }
}

impl fmt::Debug for CheckDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("linked_action", &self.linked_action)
            .field("schedule_groups", &self.schedule_groups)
            .field("auto_action", &self.auto_action)
            .finish_non_exhaustive()
    }
}

/// A registered action.
#[derive(Clone)]
pub struct ActionDescriptor {
    pub name: String,
    pub title: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    pub handler: Arc<dyn ActionFn>,
}

impl ActionDescriptor {
    pub fn new(name: impl Into<String>, handler: impl ActionFn) -> Self {
        let name = name.into();
        Self {
            title: display_title(&name),
            name,
            description: String::new(),
            params: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn validate(&self, kwargs: &Kwargs) -> Result<Kwargs, CheckError> {
        validate_kwargs(&self.params, kwargs)
    }
}

impl fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    checks: Vec<CheckDescriptor>,
    actions: Vec<ActionDescriptor>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, descriptor: CheckDescriptor) -> &mut Self {
        self.checks.push(descriptor);
        self
    }

    pub fn action(&mut self, descriptor: ActionDescriptor) -> &mut Self {
        self.actions.push(descriptor);
        self
    }

    /// Checks and actions share one namespace since their results share
    /// one bucket.
    pub fn build(self) -> Result<Registry, RegistryError> {
        let mut names = BTreeSet::new();
        let all_names = self
            .checks
            .iter()
            .map(|c| c.name.as_str())
            .chain(self.actions.iter().map(|a| a.name.as_str()));
        for name in all_names {
            if name.trim().is_empty() {
                return Err(RegistryError::EmptyName);
            }
            if let Err(e) = validate_result_name(name) {
                return Err(RegistryError::UnstorableName {
                    name: name.to_string(),
                    message: e.to_string(),
                });
            }
            if !names.insert(name.to_string()) {
                return Err(RegistryError::Duplicate {
                    name: name.to_string(),
                });
            }
        }

        let actions: BTreeMap<String, Arc<ActionDescriptor>> = self
            .actions
            .into_iter()
            .map(|a| (a.name.clone(), Arc::new(a)))
            .collect();

        for action in actions.values() {
            if let Some(p) = action.params.iter().find(|p| !p.default_is_valid()) {
                return Err(RegistryError::BadDefault {
                    target: action.name.clone(),
                    param: p.name.clone(),
                });
            }
        }

        let mut checks = BTreeMap::new();
        for check in self.checks {
            match &check.linked_action {
                Some(action) if !actions.contains_key(action) => {
                    return Err(RegistryError::UnknownAction {
                        check: check.name.clone(),
                        action: action.clone(),
                    })
                }
                None if check.auto_action => {
                    return Err(RegistryError::AutoActionWithoutAction {
                        check: check.name.clone(),
                    })
                }
                _ => {}
            }
            if let Some(p) = check.params.iter().find(|p| !p.default_is_valid()) {
                return Err(RegistryError::BadDefault {
                    target: check.name.clone(),
                    param: p.name.clone(),
                });
            }
            checks.insert(check.name.clone(), Arc::new(check));
        }

        tracing::debug!(checks = checks.len(), actions = actions.len(), "registry built");
        Ok(Registry { checks, actions })
    }
}

/// Read-only after `RegistryBuilder::build`.
#[derive(Debug, Default)]
pub struct Registry {
    checks: BTreeMap<String, Arc<CheckDescriptor>>,
    actions: BTreeMap<String, Arc<ActionDescriptor>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get_check(&self, name: &str) -> Option<Arc<CheckDescriptor>> {
        self.checks.get(name).cloned()
    }

    pub fn get_action(&self, name: &str) -> Option<Arc<ActionDescriptor>> {
        self.actions.get(name).cloned()
    }

    /// Sorted by name.
    pub fn list_checks(&self) -> Vec<Arc<CheckDescriptor>> {
        self.checks.values().cloned().collect()
    }

    pub fn list_actions(&self) -> Vec<Arc<ActionDescriptor>> {
        self.actions.values().cloned().collect()
    }

    pub fn checks_in_group(&self, group: &str) -> Vec<Arc<CheckDescriptor>> {
        self.checks
            .values()
            .filter(|c| c.schedule_groups.contains(group))
            .cloned()
            .collect()
    }

    /// Every schedule group some check belongs to.
    pub fn groups(&self) -> BTreeSet<String> {
        self.checks
            .values()
            .flat_map(|c| c.schedule_groups.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use async_trait::async_trait;
    use foursight_interchange::{ActionResult, CheckResult, CheckStatus};
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl CheckFn for Noop {
        async fn run(
            &self,
            _conn: &Connection,
            _kwargs: &Kwargs,
            result: &mut CheckResult,
        ) -> Result<(), CheckError> {
            result.status = CheckStatus::Pass;
            Ok(())
        }
    }

    #[async_trait]
    impl ActionFn for Noop {
        async fn run(
            &self,
            _conn: &Connection,
            _kwargs: &Kwargs,
            _result: &mut ActionResult,
        ) -> Result<(), CheckError> {
            Ok(())
        }
    }

    #[test]
    fn titles() {
        assert_eq!(display_title("runs_to_start"), "Runs To Start");
        assert_eq!(display_title("x"), "X");
        assert_eq!(display_title("__odd__name"), "Odd Name");
    }

    #[test]
    fn builds_and_looks_up() {
        let mut builder = Registry::builder();
        builder
            .check(
                CheckDescriptor::new("runs_to_start", Noop)
                    .action("start_runs")
                    .group("ten_min_checks"),
            )
            .check(CheckDescriptor::new("health", Noop).group("hourly_checks"))
            .action(ActionDescriptor::new("start_runs", Noop));
        let registry = builder.build().unwrap();

        assert!(registry.get_check("runs_to_start").is_some());
        assert!(registry.get_action("start_runs").is_some());
        assert!(registry.get_check("start_runs").is_none());
        let group: Vec<String> = registry
            .checks_in_group("ten_min_checks")
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(group, vec!["runs_to_start"]);
        assert_eq!(
            registry.groups().into_iter().collect::<Vec<_>>(),
            vec!["hourly_checks", "ten_min_checks"]
        );
    }

    #[test]
    fn collisions_fail_across_kinds() {
        let mut builder = Registry::builder();
        builder
            .check(CheckDescriptor::new("same", Noop))
            .action(ActionDescriptor::new("same", Noop));
        assert_eq!(
            builder.build().unwrap_err(),
            RegistryError::Duplicate {
                name: "same".into()
            }
        );
    }

    #[test]
    fn names_that_cannot_key_results_fail() {
        for name in ["../escape", "a/b", ".."] {
            let mut builder = Registry::builder();
            builder.check(CheckDescriptor::new(name, Noop));
            assert!(
                matches!(builder.build(), Err(RegistryError::UnstorableName { .. })),
                "{name}"
            );
        }
        let mut builder = Registry::builder();
        builder.action(ActionDescriptor::new("x/y", Noop));
        assert!(matches!(
            builder.build(),
            Err(RegistryError::UnstorableName { .. })
        ));
    }

    #[test]
    fn unregistered_linked_action_fails() {
        let mut builder = Registry::builder();
        builder.check(CheckDescriptor::new("c", Noop).action("missing"));
        assert!(matches!(
            builder.build(),
            Err(RegistryError::UnknownAction { .. })
        ));
    }

    #[test]
    fn default_outside_choices_fails() {
        let mut builder = Registry::builder();
        builder.check(
            CheckDescriptor::new("c", Noop)
                .param(ParamSpec::new("mode").choices(["a", "b"]).default_value("z")),
        );
        assert!(matches!(
            builder.build(),
            Err(RegistryError::BadDefault { .. })
        ));
    }

    #[test]
    fn kwargs_validation() {
        let params = vec![
            ParamSpec::new("limit").default_value(50),
            ParamSpec::new("mode").choices(["spot", "all"]).default_value("spot"),
            ParamSpec::new("runs").required(),
        ];
        let mut kwargs = Kwargs::from_value(json!({"runs": ["r1"], "uuid": "x", "primary": true}))
            .unwrap();
        let filled = validate_kwargs(&params, &kwargs).unwrap();
        assert_eq!(filled.get("limit"), Some(&json!(50)));
        assert_eq!(filled.get("mode"), Some(&json!("spot")));
        assert_eq!(filled.get("uuid"), Some(&json!("x")));

        kwargs.insert("mode", "some");
        assert!(validate_kwargs(&params, &kwargs).is_err());
        kwargs.insert("mode", "all");
        kwargs.insert("typo", 1);
        assert!(validate_kwargs(&params, &kwargs)
            .unwrap_err()
            .to_string()
            .contains("typo"));

        let missing = Kwargs::new();
        assert!(validate_kwargs(&params, &missing)
            .unwrap_err()
            .to_string()
            .contains("runs"));
    }
}
