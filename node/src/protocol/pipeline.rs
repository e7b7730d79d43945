//! Task pipelines
//!
//! A pipeline is a [`Condition`] plus an ordered list of [`Task`]s run strictly
//! in sequence under the trade lock. The first failing task halts the run;
//! nothing is rolled back.

use async_trait::async_trait;
use tracing::debug;

use super::condition::Condition;
use super::messages::{Envelope, FromMessage};
use super::ProtocolServices;
use crate::error::{ProtocolError, ProtocolResult};
use crate::models::{Role, State, Trade};

/// Requests a task makes of the owning protocol, applied after a successful run
#[derive(Debug, Clone, Copy, Default)]
pub struct Effects {
    pub start_timeout: bool,
    pub stop_timeout: bool,
}

pub struct TaskContext<'a> {
    pub trade: &'a mut Trade,
    pub services: &'a ProtocolServices,
    pub envelope: Option<&'a Envelope>,
    /// Role of the message sender, once the condition identified it
    pub sender: Option<Role>,
    pub effects: Effects,
}

impl<'a> TaskContext<'a> {
    pub fn new(
        trade: &'a mut Trade,
        services: &'a ProtocolServices,
        envelope: Option<&'a Envelope>,
        sender: Option<Role>,
    ) -> Self {
        Self {
            trade,
            services,
            envelope,
            sender,
            effects: Effects::default(),
        }
    }

    /// The message being applied, as its concrete type
    pub fn message<T: FromMessage>(&self) -> ProtocolResult<&'a T> {
        let envelope = self
            .envelope
            .ok_or_else(|| ProtocolError::InvalidMessage("no message in context".into()))?;
        T::from_message(&envelope.message).ok_or_else(|| {
            ProtocolError::InvalidMessage(format!(
                "unexpected {} for this task",
                envelope.message.class_name()
            ))
        })
    }

    pub fn sender(&self) -> ProtocolResult<Role> {
        self.sender
            .ok_or_else(|| ProtocolError::InvalidMessage("sender not identified".into()))
    }
}

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()>;
}

/// Build a task list: `tasks![ProcessFoo, SendBar]`
macro_rules! tasks {
    ($($task:expr),* $(,)?) => {
        vec![$(Box::new($task) as Box<dyn $crate::protocol::pipeline::Task>),*]
    };
}
pub(crate) use tasks;

#[derive(Debug)]
pub struct TaskFailure {
    pub task: &'static str,
    pub error: ProtocolError,
}

pub async fn run_tasks(tasks: &[Box<dyn Task>], ctx: &mut TaskContext<'_>) -> Result<(), TaskFailure> {
    for task in tasks {
        debug!(
            trade_id = %crate::log_trade_id!(&ctx.trade.id),
            task = task.name(),
            "Running task"
        );
        task.run(ctx).await.map_err(|error| TaskFailure {
            task: task.name(),
            error,
        })?;
    }
    Ok(())
}

pub struct Pipeline {
    pub name: &'static str,
    pub condition: Condition,
    pub tasks: Vec<Box<dyn Task>>,
    /// Park the message until the trade reaches this state instead of retrying
    pub wait_for: Option<State>,
}

impl Pipeline {
    pub fn new(name: &'static str, condition: Condition, tasks: Vec<Box<dyn Task>>) -> Self {
        Self {
            name,
            condition,
            tasks,
            wait_for: None,
        }
    }

    pub fn wait_for(mut self, state: State) -> Self {
        self.wait_for = Some(state);
        self
    }
}

/// How a pipeline invocation ended
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Completed,
    /// Accepted without running tasks (terminal trade, or already past this step)
    Ignored,
    /// Same uid applied before; only re-acknowledged
    Duplicate,
    /// Parked until the trade reaches the state
    Deferred(State),
    /// Phase or state precondition not met yet
    NotReady(ProtocolError),
    /// Wrong trade or sender, or a local action that is not allowed
    Rejected(ProtocolError),
    Failed {
        task: &'static str,
        error: ProtocolError,
    },
    TimedOut {
        secs: u64,
    },
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            PipelineOutcome::Completed | PipelineOutcome::Ignored | PipelineOutcome::Duplicate
        )
    }

    pub fn into_result(self) -> ProtocolResult<()> {
        match self {
            PipelineOutcome::Completed
            | PipelineOutcome::Ignored
            | PipelineOutcome::Duplicate
            | PipelineOutcome::Deferred(_) => Ok(()),
            PipelineOutcome::NotReady(error)
            | PipelineOutcome::Rejected(error)
            | PipelineOutcome::Failed { error, .. } => Err(error),
            PipelineOutcome::TimedOut { secs } => Err(ProtocolError::Timeout { secs }),
        }
    }
}
