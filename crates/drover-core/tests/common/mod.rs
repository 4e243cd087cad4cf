//! Shared harness for drover-core integration tests: a temp database, an
//! in-memory coordination layer, and helpers for the recurring setup steps.

// Not every test binary uses every helper.
#![allow(dead_code)]

use sqlx::PgPool;
use uuid::Uuid;

use drover_core::config::ControlConfig;
use drover_core::coordination::Coordination;
use drover_core::ingest::{self, IngestOutcome, ResultUpload};
use drover_core::registry::{self, ResourceUsage};
use drover_db::models::{
    CheckpointFrequency, PrivacyLevel, Subtask, SubtaskStatus, Task, Worker, WorkerStatus,
};
use drover_db::queries::tasks::{self as task_db, NewTask};
use drover_test_utils::{create_test_db, drop_test_db};

pub struct TestEnv {
    pub pool: PgPool,
    pub coord: Coordination,
    pub config: ControlConfig,
    db_name: String,
}

impl TestEnv {
    pub async fn new() -> Self {
        let (pool, db_name) = create_test_db().await;
        Self {
            pool,
            coord: Coordination::in_memory(),
            config: ControlConfig::default(),
            db_name,
        }
    }

    pub async fn teardown(self) {
        self.pool.close().await;
        drop_test_db(&self.db_name).await;
    }

    pub async fn create_task(&self, task_type: &str) -> Task {
        self.create_task_with(task_type, CheckpointFrequency::Medium, PrivacyLevel::Normal)
            .await
    }

    pub async fn create_task_with(
        &self,
        task_type: &str,
        frequency: CheckpointFrequency,
        privacy: PrivacyLevel,
    ) -> Task {
        task_db::insert_task(
            &self.pool,
            &NewTask {
                description: "implement the fleet dashboard feature",
                checkpoint_frequency: frequency,
                privacy_level: privacy,
                tool_preferences: &[],
                metadata: serde_json::json!({"task_type": task_type}),
            },
        )
        .await
        .expect("insert_task should succeed")
    }

    /// Register a worker and heartbeat it online with the given resources.
    pub async fn online_worker(
        &self,
        machine_id: &str,
        tools: &[&str],
        cpu: f32,
        mem: f32,
        disk: f32,
    ) -> Worker {
        let tools: Vec<String> = tools.iter().map(|t| t.to_string()).collect();
        let worker = registry::register_worker(
            &self.pool,
            &self.coord,
            &self.config,
            machine_id,
            machine_id,
            &serde_json::json!({"os": "linux"}),
            &tools,
        )
        .await
        .expect("register_worker should succeed");

        registry::heartbeat(
            &self.pool,
            &self.coord,
            &self.config,
            worker.id,
            WorkerStatus::Online,
            ResourceUsage {
                cpu_percent: Some(cpu),
                memory_percent: Some(mem),
                disk_percent: Some(disk),
            },
            None,
        )
        .await
        .expect("heartbeat should succeed");

        worker
    }

    /// Upload a successful result for a subtask.
    pub async fn upload_success(
        &self,
        subtask_id: Uuid,
        result: serde_json::Value,
    ) -> IngestOutcome {
        ingest::ingest_result(
            &self.pool,
            &self.coord,
            &self.config,
            subtask_id,
            ResultUpload {
                status: SubtaskStatus::Completed,
                result,
                execution_time: Some(4.2),
                error: None,
            },
        )
        .await
        .expect("result upload should succeed")
    }

    /// Upload a failed result for a subtask.
    pub async fn upload_failure(&self, subtask_id: Uuid, error: &str) -> IngestOutcome {
        ingest::ingest_result(
            &self.pool,
            &self.coord,
            &self.config,
            subtask_id,
            ResultUpload {
                status: SubtaskStatus::Failed,
                result: serde_json::json!({}),
                execution_time: Some(1.0),
                error: Some(error.to_owned()),
            },
        )
        .await
        .expect("failure upload should succeed")
    }

    pub async fn subtasks_of(&self, task_id: Uuid) -> Vec<Subtask> {
        drover_db::queries::subtasks::list_for_task(&self.pool, task_id)
            .await
            .expect("list_for_task should succeed")
    }

    pub async fn refreshed(&self, subtask_id: Uuid) -> Subtask {
        drover_db::queries::subtasks::get_subtask(&self.pool, subtask_id)
            .await
            .expect("get_subtask should succeed")
            .expect("subtask should exist")
    }

    pub async fn task(&self, task_id: Uuid) -> Task {
        task_db::get_task(&self.pool, task_id)
            .await
            .expect("get_task should succeed")
            .expect("task should exist")
    }
}

/// Find a subtask by name in a listing.
pub fn by_name<'a>(subtasks: &'a [Subtask], name: &str) -> &'a Subtask {
    subtasks
        .iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("no subtask named {name}"))
}
