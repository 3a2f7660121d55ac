//! Runners: what a job executes for each task name, and what comes next.
//!
//! The engine talks to the object-safe [`Runner`] trait. Most runners are
//! written as chains: an enum of steps implementing [`ChainStep`] (a closed
//! transition table with a pure `next`) plus a [`ChainRunner`] that executes
//! one step. [`Chain`] adapts the latter to [`Runner`]. Single-step runners
//! can be plain async functions wrapped in [`FnRunner`].
//!
//! Runners are created fresh from a factory for every job execution, so
//! they must not carry per-job state. Anything a later step needs goes into
//! the job's [`Overrides`].

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use crate::domain::Overrides;
use crate::error::TaskError;

/// Task interface the engine drives.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Returns `true` if `task` is one of this runner's task names.
    fn knows(&self, task: &str) -> bool;

    /// The task after `task`, or `None` when the job is complete.
    fn next_task(&self, task: &str) -> Option<String>;

    /// Executes `task`. Mutations to `overrides` are carried to the next
    /// task.
    async fn run_task(
        &self,
        task: &str,
        args: &[Value],
        overrides: &mut Overrides,
    ) -> Result<Value, TaskError>;
}

/// A closed set of task names with a static transition table.
///
/// ```
/// use anchor_jobs::jobs::runner::ChainStep;
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// enum Anchor { Commit, Confirm }
///
/// impl ChainStep for Anchor {
///     fn name(&self) -> &'static str {
///         match self { Self::Commit => "commit", Self::Confirm => "confirm" }
///     }
///     fn parse(name: &str) -> Option<Self> {
///         match name { "commit" => Some(Self::Commit), "confirm" => Some(Self::Confirm), _ => None }
///     }
///     fn next(&self) -> Option<Self> {
///         match self { Self::Commit => Some(Self::Confirm), Self::Confirm => None }
///     }
/// }
///
/// assert_eq!(Anchor::parse("commit").and_then(|s| s.next()), Some(Anchor::Confirm));
/// ```
pub trait ChainStep: Copy + Send + Sync + 'static {
    /// Persisted task name.
    fn name(&self) -> &'static str;

    /// Inverse of [`name`](ChainStep::name).
    fn parse(name: &str) -> Option<Self>;

    /// Following step, or `None` for the last one.
    fn next(&self) -> Option<Self>;
}

/// Executes the steps of one chain.
#[async_trait]
pub trait ChainRunner: Send + Sync {
    type Step: ChainStep;

    async fn run(
        &self,
        step: Self::Step,
        args: &[Value],
        overrides: &mut Overrides,
    ) -> Result<Value, TaskError>;
}

/// Adapts a [`ChainRunner`] to [`Runner`].
#[derive(Debug, Clone)]
pub struct Chain<R>(pub R);

#[async_trait]
impl<R: ChainRunner> Runner for Chain<R> {
    fn knows(&self, task: &str) -> bool {
        R::Step::parse(task).is_some()
    }

    fn next_task(&self, task: &str) -> Option<String> {
        R::Step::parse(task)
            .and_then(|step| step.next())
            .map(|step| step.name().to_string())
    }

    async fn run_task(
        &self,
        task: &str,
        args: &[Value],
        overrides: &mut Overrides,
    ) -> Result<Value, TaskError> {
        let step = R::Step::parse(task)
            .ok_or_else(|| TaskError::failed(format!("unknown task '{task}'")))?;
        self.0.run(step, args, overrides).await
    }
}

/// Single-task runner backed by an async function.
///
/// The function receives a copy of the job's arguments and overrides; the
/// task it runs is named after the runner.
pub struct FnRunner<F, Fut> {
    task: String,
    f: Arc<F>,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnRunner<F, Fut> {
    pub fn new(task: impl Into<String>, f: Arc<F>) -> Self {
        Self {
            task: task.into(),
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Runner for FnRunner<F, Fut>
where
    F: Fn(Vec<Value>, Overrides) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    fn knows(&self, task: &str) -> bool {
        task == self.task
    }

    fn next_task(&self, _task: &str) -> Option<String> {
        None
    }

    async fn run_task(
        &self,
        task: &str,
        args: &[Value],
        overrides: &mut Overrides,
    ) -> Result<Value, TaskError> {
        if task != self.task {
            return Err(TaskError::failed(format!("unknown task '{task}'")));
        }
        (self.f)(args.to_vec(), overrides.clone()).await
    }
}

/// Builds a fresh runner instance.
pub type RunnerFactory = Arc<dyn Fn() -> Box<dyn Runner> + Send + Sync>;

/// Runner factories by name.
#[derive(Default)]
pub struct RunnerRegistry {
    factories: DashMap<String, RunnerFactory>,
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("RunnerRegistry")
            .field("runners", &names)
            .finish()
    }
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a raw factory. Returns `false` if `name` is taken.
    pub fn register(&self, name: impl Into<String>, factory: RunnerFactory) -> bool {
        match self.factories.entry(name.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(factory);
                true
            },
        }
    }

    /// Registers a chained runner built by `factory`.
    pub fn register_runner<R, F>(&self, name: impl Into<String>, factory: F) -> bool
    where
        R: ChainRunner + 'static,
        F: Fn() -> R + Send + Sync + 'static,
    {
        self.register(
            name,
            Arc::new(move || Box::new(Chain(factory())) as Box<dyn Runner>),
        )
    }

    /// Registers a single-task runner; the task carries the runner's name.
    pub fn register_runner_fn<F, Fut>(&self, name: impl Into<String>, f: F) -> bool
    where
        F: Fn(Vec<Value>, Overrides) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        let name = name.into();
        let task = name.clone();
        let f = Arc::new(f);
        self.register(
            name,
            Arc::new(move || {
                Box::new(FnRunner::<F, Fut>::new(task.clone(), f.clone())) as Box<dyn Runner>
            }),
        )
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Creates a fresh runner for `name`.
    pub fn instantiate(&self, name: &str) -> Option<Box<dyn Runner>> {
        let factory = self.factories.get(name).map(|entry| entry.value().clone())?;
        Some(factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Step {
        First,
        Second,
    }

    impl ChainStep for Step {
        fn name(&self) -> &'static str {
            match self {
                Self::First => "first",
                Self::Second => "second",
            }
        }

        fn parse(name: &str) -> Option<Self> {
            match name {
                "first" => Some(Self::First),
                "second" => Some(Self::Second),
                _ => None,
            }
        }

        fn next(&self) -> Option<Self> {
            match self {
                Self::First => Some(Self::Second),
                Self::Second => None,
            }
        }
    }

    struct Counter;

    #[async_trait]
    impl ChainRunner for Counter {
        type Step = Step;

        async fn run(
            &self,
            step: Step,
            _args: &[Value],
            overrides: &mut Overrides,
        ) -> Result<Value, TaskError> {
            overrides.insert(step.name().to_string(), json!(true));
            Ok(json!(step.name()))
        }
    }

    #[tokio::test]
    async fn chain_follows_transition_table() {
        let runner = Chain(Counter);
        assert!(runner.knows("first"));
        assert!(!runner.knows("third"));
        assert_eq!(runner.next_task("first").as_deref(), Some("second"));
        assert_eq!(runner.next_task("second"), None);

        let mut overrides = Overrides::new();
        let out = runner.run_task("first", &[], &mut overrides).await.unwrap();
        assert_eq!(out, json!("first"));
        assert_eq!(overrides.get("first"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn registry_rejects_duplicate_names() {
        let registry = RunnerRegistry::new();
        assert!(registry.register_runner("counter", || Counter));
        assert!(!registry.register_runner("counter", || Counter));
        assert!(registry.contains("counter"));
        assert!(registry.instantiate("missing").is_none());
    }

    #[tokio::test]
    async fn fn_runner_is_single_step() {
        let registry = RunnerRegistry::new();
        registry.register_runner_fn("echo", |args: Vec<Value>, _overrides: Overrides| async move {
            Ok::<_, TaskError>(json!(args))
        });
        let runner = registry.instantiate("echo").unwrap();
        assert!(runner.knows("echo"));
        assert_eq!(runner.next_task("echo"), None);
        let mut overrides = Overrides::new();
        let out = runner
            .run_task("echo", &[json!(1), json!("a")], &mut overrides)
            .await
            .unwrap();
        assert_eq!(out, json!([1, "a"]));
    }
}
