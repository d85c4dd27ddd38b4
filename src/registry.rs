use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::ticker::{TaskPriority, TickerId};

/// Error type for ticker function execution
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Ticker function not found: {0}")]
    FunctionNotFound(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Ticker function panicked")]
    Panicked,
}

/// Error type for registry configuration
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Duplicate function key: {0}")]
    DuplicateKey(String),

    #[error("Unresolved schedule placeholder '{placeholder}' for function {key}")]
    UnresolvedPlaceholder { key: String, placeholder: String },
}

pub type ExecutionResult = Result<(), ExecutionError>;

type BoxedTickerFn =
    Arc<dyn Fn(TickerContext) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send>> + Send + Sync>;

/// Identity and scheduled time of a single firing, passed to the callable
#[derive(Debug, Clone)]
pub struct TickerContext {
    pub ticker_id: Option<TickerId>,
    pub function_key: String,
    pub scheduled_at: DateTime<Utc>,
}

/// Schedule expression as declared at registration time.
///
/// `Placeholder` is the `%name%` form: a configuration key resolved once,
/// before the registry is sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleExpression {
    Cron(String),
    Placeholder(String),
}

impl ScheduleExpression {
    /// Parse a raw expression string; `%name%` denotes a late-bound
    /// configuration key, anything else is taken as a literal cron string.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.len() > 1 && trimmed.starts_with('%') && trimmed.ends_with('%') {
            ScheduleExpression::Placeholder(trimmed.trim_matches('%').to_string())
        } else {
            ScheduleExpression::Cron(trimmed.to_string())
        }
    }
}

struct RegisteredFunction {
    expression: Option<ScheduleExpression>,
    priority: TaskPriority,
    callable: BoxedTickerFn,
}

/// Mutable, configuration-time catalog of ticker functions.
///
/// Populated once during startup, then resolved into a [`SealedRegistry`];
/// no registrations are possible after sealing.
pub struct TickerRegistry {
    functions: HashMap<String, RegisteredFunction>,
    order: Vec<String>,
}

impl Default for TickerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TickerRegistry {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a ticker function under a unique key.
    ///
    /// `expression` may be a literal cron string, a `%name%` configuration
    /// placeholder, or `None` for functions only ever fired as one-shots.
    pub fn register<F, Fut>(
        &mut self,
        key: &str,
        expression: Option<&str>,
        priority: TaskPriority,
        callable: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(TickerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        if self.functions.contains_key(key) {
            return Err(RegistryError::DuplicateKey(key.to_string()));
        }

        let callable = Arc::new(callable);
        let boxed: BoxedTickerFn = Arc::new(move |ctx: TickerContext| {
            let callable = Arc::clone(&callable);
            Box::pin(async move { callable(ctx).await.map_err(ExecutionError::Execution) })
        });

        self.functions.insert(
            key.to_string(),
            RegisteredFunction {
                expression: expression
                    .filter(|e| !e.trim().is_empty())
                    .map(ScheduleExpression::parse),
                priority,
                callable: boxed,
            },
        );
        self.order.push(key.to_string());
        Ok(())
    }

    /// Resolve every `%placeholder%` expression through `lookup` and seal the
    /// registry.
    ///
    /// An unresolved placeholder is not fatal: the function stays registered
    /// but carries no schedule, so cron seeding skips it. This lets a
    /// deployment disable a job by leaving its configuration key unset.
    pub fn resolve<L>(self, lookup: L) -> SealedRegistry
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut resolved = HashMap::with_capacity(self.functions.len());

        for (key, function) in self.functions {
            let cron = match &function.expression {
                Some(ScheduleExpression::Cron(expr)) => Some(expr.clone()),
                Some(ScheduleExpression::Placeholder(name)) => match lookup(name) {
                    Some(value) if !value.trim().is_empty() => Some(value),
                    _ => {
                        let err = RegistryError::UnresolvedPlaceholder {
                            key: key.clone(),
                            placeholder: name.clone(),
                        };
                        warn!(error = %err, "Function will not be cron-scheduled");
                        None
                    }
                },
                None => None,
            };

            resolved.insert(
                key,
                SealedFunction {
                    cron,
                    priority: function.priority,
                    callable: function.callable,
                },
            );
        }

        SealedRegistry {
            functions: resolved,
            order: self.order,
        }
    }
}

pub(crate) struct SealedFunction {
    pub cron: Option<String>,
    pub priority: TaskPriority,
    pub callable: BoxedTickerFn,
}

/// Immutable catalog handed to the scheduler and dispatcher at startup.
///
/// Read-only after construction; shared by reference and safe to use from
/// any task without locking.
pub struct SealedRegistry {
    functions: HashMap<String, SealedFunction>,
    order: Vec<String>,
}

impl SealedRegistry {
    /// Declared `(key, cron)` pairs with a resolved expression, in insertion
    /// order. This is the input set for cron reconciliation.
    pub fn declared_cron(&self) -> Vec<(String, String)> {
        self.order
            .iter()
            .filter_map(|key| {
                let function = self.functions.get(key)?;
                function.cron.as_ref().map(|c| (key.clone(), c.clone()))
            })
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.functions.contains_key(key)
    }

    pub fn priority(&self, key: &str) -> TaskPriority {
        self.functions
            .get(key)
            .map(|f| f.priority)
            .unwrap_or_default()
    }

    /// Position of a key within the registration order, used as the final
    /// dispatch tie-break.
    pub fn insertion_index(&self, key: &str) -> usize {
        self.order
            .iter()
            .position(|k| k == key)
            .unwrap_or(usize::MAX)
    }

    pub(crate) fn callable(&self, key: &str) -> Option<BoxedTickerFn> {
        self.functions.get(key).map(|f| Arc::clone(&f.callable))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_ctx: TickerContext) -> impl Future<Output = Result<(), String>> + Send + 'static {
        async { Ok(()) }
    }

    #[test]
    fn parses_placeholder_expressions() {
        assert_eq!(
            ScheduleExpression::parse("%Report:Cron%"),
            ScheduleExpression::Placeholder("Report:Cron".to_string())
        );
        assert_eq!(
            ScheduleExpression::parse("0 0 * * *"),
            ScheduleExpression::Cron("0 0 * * *".to_string())
        );
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let mut registry = TickerRegistry::new();
        registry
            .register("daily-report", Some("0 0 * * *"), TaskPriority::High, noop)
            .unwrap();

        let err = registry
            .register("daily-report", None, TaskPriority::Normal, noop)
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateKey(key) if key == "daily-report"));
    }

    #[test]
    fn resolve_maps_placeholders_through_config() {
        let mut registry = TickerRegistry::new();
        registry
            .register("report", Some("%Report:Cron%"), TaskPriority::Normal, noop)
            .unwrap();

        let sealed =
            registry.resolve(|name| (name == "Report:Cron").then(|| "0 6 * * *".to_string()));

        assert_eq!(
            sealed.declared_cron(),
            vec![("report".to_string(), "0 6 * * *".to_string())]
        );
    }

    #[test]
    fn unresolved_placeholder_excludes_function_from_seeding() {
        let mut registry = TickerRegistry::new();
        registry
            .register("report", Some("%Report:Cron%"), TaskPriority::Normal, noop)
            .unwrap();
        registry
            .register("cleanup", Some("0 3 * * *"), TaskPriority::Low, noop)
            .unwrap();

        let sealed = registry.resolve(|_| None);

        assert_eq!(
            sealed.declared_cron(),
            vec![("cleanup".to_string(), "0 3 * * *".to_string())]
        );
        // Function stays registered and one-shot schedulable.
        assert!(sealed.contains("report"));
    }

    #[test]
    fn declared_cron_preserves_insertion_order() {
        let mut registry = TickerRegistry::new();
        for key in ["c", "a", "b"] {
            registry
                .register(key, Some("0 0 * * *"), TaskPriority::Normal, noop)
                .unwrap();
        }

        let sealed = registry.resolve(|_| None);
        let keys: Vec<String> = sealed.declared_cron().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
        assert_eq!(sealed.insertion_index("c"), 0);
        assert_eq!(sealed.insertion_index("b"), 2);
    }
}
