//! Grid Server RPC interface
//!
//! One method per Grid Server operation. Callers depend on this trait only;
//! the SOAP transport in `soap` is one implementation and the breaker-guarded
//! wrapper in `breaker` is another.
//!
//! Calls are cancelled by dropping the returned future. Each implementation
//! bounds its own network time.

use async_trait::async_trait;
use grid_core::domain::lua::{GridServerStatus, JobRecord, LuaValue, ScriptExecution};
use grid_core::dto::command::GridCommand;

use crate::error::{ClientError, Result};

/// Operations exposed by a Grid Server
#[async_trait]
pub trait GridServerRpc: Send + Sync {
    async fn hello_world(&self) -> Result<String>;

    async fn get_version(&self) -> Result<String>;

    async fn get_status(&self) -> Result<GridServerStatus>;

    /// Opens a job and runs `script` inside it
    async fn open_job(&self, job: &JobRecord, script: &ScriptExecution) -> Result<Vec<LuaValue>>;

    /// Extends a job's expiration, returning the new expiration in seconds
    async fn renew_lease(&self, job_id: &str, expiration_in_seconds: f64) -> Result<f64>;

    /// Runs `script` inside an already open job
    async fn execute(&self, job_id: &str, script: &ScriptExecution) -> Result<Vec<LuaValue>>;

    async fn close_job(&self, job_id: &str) -> Result<()>;

    /// Opens a job, runs `script`, and closes the job when the script returns
    async fn batch_job(&self, job: &JobRecord, script: &ScriptExecution) -> Result<Vec<LuaValue>>;

    async fn get_expiration(&self, job_id: &str) -> Result<f64>;

    async fn get_all_jobs(&self) -> Result<Vec<JobRecord>>;

    /// Returns the number of jobs closed
    async fn close_expired_jobs(&self) -> Result<i32>;

    /// Returns the number of jobs closed
    async fn close_all_jobs(&self) -> Result<i32>;

    async fn diag(&self, diag_type: i32, job_id: &str) -> Result<Vec<LuaValue>>;
}

fn command_script(command: &GridCommand) -> Result<ScriptExecution> {
    command
        .to_script_execution()
        .map_err(|e| ClientError::InvalidRequest(format!("Failed to serialize command: {}", e)))
}

/// Sends a command into an open job
pub async fn execute_command(
    rpc: &dyn GridServerRpc,
    job_id: &str,
    command: &GridCommand,
) -> Result<Vec<LuaValue>> {
    let script = command_script(command)?;
    tracing::debug!(
        "Executing {:?} command as script {} in job {}",
        command.mode,
        script.name,
        job_id
    );
    rpc.execute(job_id, &script).await
}

/// Runs a command as a batch job
pub async fn batch_command(
    rpc: &dyn GridServerRpc,
    job: &JobRecord,
    command: &GridCommand,
) -> Result<Vec<LuaValue>> {
    let script = command_script(command)?;
    tracing::debug!(
        "Batching {:?} command as script {} in job {}",
        command.mode,
        script.name,
        job.id
    );
    rpc.batch_job(job, &script).await
}
