//! Breaker-guarded Grid Server RPC

use async_trait::async_trait;
use grid_core::domain::lua::{GridServerStatus, JobRecord, LuaValue, ScriptExecution};
use std::sync::Arc;

use crate::breaker::policy::CircuitBreakerPolicy;
use crate::error::Result;
use crate::rpc::GridServerRpc;

/// Routes every call of the inner RPC through a circuit breaker policy
#[derive(Clone)]
pub struct GuardedRpc {
    inner: Arc<dyn GridServerRpc>,
    policy: Arc<CircuitBreakerPolicy>,
}

impl GuardedRpc {
    pub fn new(inner: Arc<dyn GridServerRpc>, policy: Arc<CircuitBreakerPolicy>) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &Arc<CircuitBreakerPolicy> {
        &self.policy
    }
}

#[async_trait]
impl GridServerRpc for GuardedRpc {
    async fn hello_world(&self) -> Result<String> {
        self.policy.execute(|| self.inner.hello_world()).await
    }

    async fn get_version(&self) -> Result<String> {
        self.policy.execute(|| self.inner.get_version()).await
    }

    async fn get_status(&self) -> Result<GridServerStatus> {
        self.policy.execute(|| self.inner.get_status()).await
    }

    async fn open_job(&self, job: &JobRecord, script: &ScriptExecution) -> Result<Vec<LuaValue>> {
        self.policy
            .execute(|| self.inner.open_job(job, script))
            .await
    }

    async fn renew_lease(&self, job_id: &str, expiration_in_seconds: f64) -> Result<f64> {
        self.policy
            .execute(|| self.inner.renew_lease(job_id, expiration_in_seconds))
            .await
    }

    async fn execute(&self, job_id: &str, script: &ScriptExecution) -> Result<Vec<LuaValue>> {
        self.policy
            .execute(|| self.inner.execute(job_id, script))
            .await
    }

    async fn close_job(&self, job_id: &str) -> Result<()> {
        self.policy.execute(|| self.inner.close_job(job_id)).await
    }

    async fn batch_job(&self, job: &JobRecord, script: &ScriptExecution) -> Result<Vec<LuaValue>> {
        self.policy
            .execute(|| self.inner.batch_job(job, script))
            .await
    }

    async fn get_expiration(&self, job_id: &str) -> Result<f64> {
        self.policy
            .execute(|| self.inner.get_expiration(job_id))
            .await
    }

    async fn get_all_jobs(&self) -> Result<Vec<JobRecord>> {
        self.policy.execute(|| self.inner.get_all_jobs()).await
    }

    async fn close_expired_jobs(&self) -> Result<i32> {
        self.policy
            .execute(|| self.inner.close_expired_jobs())
            .await
    }

    async fn close_all_jobs(&self) -> Result<i32> {
        self.policy.execute(|| self.inner.close_all_jobs()).await
    }

    async fn diag(&self, diag_type: i32, job_id: &str) -> Result<Vec<LuaValue>> {
        self.policy
            .execute(|| self.inner.diag(diag_type, job_id))
            .await
    }
}
