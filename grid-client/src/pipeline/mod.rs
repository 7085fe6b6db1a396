//! Execution plans
//!
//! An `ExecutionPlan` is an ordered, mutable chain of handlers. Each handler
//! receives the shared `ExecutionContext` and a `Next` pointing at the rest of
//! the chain. A handler that never calls `next` ends the chain early; that is
//! how breakers and auth handlers short-circuit.
//!
//! Plans run either asynchronously (`execute_async`) or on the calling thread
//! (`execute`). Both walk the same handlers with the same semantics.

pub mod handlers;

use async_trait::async_trait;
use std::any::TypeId;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, Result};

/// State shared by every handler in one execution
#[derive(Debug)]
pub struct ExecutionContext<I, O> {
    pub input: I,
    pub output: Option<O>,
    pub cancellation: CancellationToken,
}

impl<I, O> ExecutionContext<I, O> {
    pub fn new(input: I, cancellation: CancellationToken) -> Self {
        Self {
            input,
            output: None,
            cancellation,
        }
    }
}

/// One link of an execution plan
#[async_trait]
pub trait PipelineHandler<I, O>: Send + Sync + 'static {
    async fn invoke(&self, context: &mut ExecutionContext<I, O>, next: Next<'_, I, O>)
    -> Result<()>;
}

/// The remainder of a chain
///
/// `Next` is `Copy`, so a handler may run the rest of the chain more than once
/// (retries do).
pub struct Next<'a, I, O> {
    handlers: &'a [Arc<dyn PipelineHandler<I, O>>],
}

impl<I, O> Clone for Next<'_, I, O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I, O> Copy for Next<'_, I, O> {}

impl<'a, I, O> Next<'a, I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Runs the remaining handlers; a no-op at the end of the chain
    pub async fn run(self, context: &mut ExecutionContext<I, O>) -> Result<()> {
        let Some((handler, rest)) = self.handlers.split_first() else {
            return Ok(());
        };

        if context.cancellation.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        handler.invoke(context, Next { handlers: rest }).await
    }

    pub fn is_end(&self) -> bool {
        self.handlers.is_empty()
    }
}

struct Registered<I, O> {
    type_id: TypeId,
    name: &'static str,
    handler: Arc<dyn PipelineHandler<I, O>>,
}

impl<I, O> Clone for Registered<I, O> {
    fn clone(&self) -> Self {
        Self {
            type_id: self.type_id,
            name: self.name,
            handler: self.handler.clone(),
        }
    }
}

/// Ordered chain of handlers, at most one per handler type
pub struct ExecutionPlan<I, O> {
    handlers: Vec<Registered<I, O>>,
}

impl<I, O> Default for ExecutionPlan<I, O> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }
}

impl<I, O> Clone for ExecutionPlan<I, O> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<I, O> ExecutionPlan<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Type names of the handlers, in execution order
    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|r| r.name).collect()
    }

    pub fn contains<H: PipelineHandler<I, O>>(&self) -> bool {
        self.position_of::<H>().is_some()
    }

    fn position_of<H: PipelineHandler<I, O>>(&self) -> Option<usize> {
        let id = TypeId::of::<H>();
        self.handlers.iter().position(|r| r.type_id == id)
    }

    /// Inserts a handler at `index`
    ///
    /// # Errors
    /// `InvalidRequest` when `index` is past the end or a handler of the same
    /// type is already registered
    pub fn insert_handler<H: PipelineHandler<I, O>>(&mut self, index: usize, handler: H) -> Result<()> {
        if index > self.handlers.len() {
            return Err(ClientError::InvalidRequest(format!(
                "Handler index {} out of range (len {})",
                index,
                self.handlers.len()
            )));
        }

        if self.contains::<H>() {
            return Err(ClientError::InvalidRequest(format!(
                "Handler {} is already in the plan",
                std::any::type_name::<H>()
            )));
        }

        self.handlers.insert(
            index,
            Registered {
                type_id: TypeId::of::<H>(),
                name: std::any::type_name::<H>(),
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    pub fn append_handler<H: PipelineHandler<I, O>>(&mut self, handler: H) -> Result<()> {
        self.insert_handler(self.handlers.len(), handler)
    }

    pub fn prepend_handler<H: PipelineHandler<I, O>>(&mut self, handler: H) -> Result<()> {
        self.insert_handler(0, handler)
    }

    /// Inserts `handler` right after the handler of type `T`
    pub fn add_handler_after<T, H>(&mut self, handler: H) -> Result<()>
    where
        T: PipelineHandler<I, O>,
        H: PipelineHandler<I, O>,
    {
        let index = self.position_of::<T>().ok_or_else(|| {
            ClientError::InvalidRequest(format!(
                "Handler {} is not in the plan",
                std::any::type_name::<T>()
            ))
        })?;
        self.insert_handler(index + 1, handler)
    }

    /// Inserts `handler` right before the handler of type `T`
    pub fn add_handler_before<T, H>(&mut self, handler: H) -> Result<()>
    where
        T: PipelineHandler<I, O>,
        H: PipelineHandler<I, O>,
    {
        let index = self.position_of::<T>().ok_or_else(|| {
            ClientError::InvalidRequest(format!(
                "Handler {} is not in the plan",
                std::any::type_name::<T>()
            ))
        })?;
        self.insert_handler(index, handler)
    }

    /// Removes the handler at `index`
    pub fn remove_handler(&mut self, index: usize) -> Result<()> {
        if index >= self.handlers.len() {
            return Err(ClientError::InvalidRequest(format!(
                "Handler index {} out of range (len {})",
                index,
                self.handlers.len()
            )));
        }
        self.handlers.remove(index);
        Ok(())
    }

    /// Removes the handler of type `H`, returning whether one was present
    pub fn remove_handler_of<H: PipelineHandler<I, O>>(&mut self) -> bool {
        match self.position_of::<H>() {
            Some(index) => {
                self.handlers.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn clear_handlers(&mut self) {
        self.handlers.clear();
    }

    /// Runs the chain and returns the output left in the context
    ///
    /// # Errors
    /// - `NoHandlers` when the plan is empty
    /// - `Cancelled` when `cancellation` fires before a handler runs
    /// - whatever a handler returns
    pub async fn execute_async(&self, input: I, cancellation: CancellationToken) -> Result<O> {
        if self.handlers.is_empty() {
            return Err(ClientError::NoHandlers);
        }

        // Snapshot so plan edits during execution cannot affect this run
        let handlers: Vec<Arc<dyn PipelineHandler<I, O>>> =
            self.handlers.iter().map(|r| r.handler.clone()).collect();

        let mut context = ExecutionContext::new(input, cancellation);
        Next {
            handlers: &handlers,
        }
        .run(&mut context)
        .await?;

        context.output.ok_or_else(|| {
            ClientError::InternalError("Execution plan finished without an output".to_string())
        })
    }

    /// Runs the chain on the calling thread
    ///
    /// Drives the handlers on a private current-thread runtime, so it must not
    /// be called from inside an async context.
    pub fn execute(&self, input: I) -> Result<O> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ClientError::InternalError(format!("Failed to build runtime: {}", e)))?;

        runtime.block_on(self.execute_async(input, CancellationToken::new()))
    }
}
