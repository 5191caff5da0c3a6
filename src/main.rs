//! Sample host: a three-step sequential workflow behind the create/check
//! endpoint. Each task stands in for a slow out-of-process call; it sleeps,
//! then produces a GUID result that the orchestrator folds into the
//! composite output.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use duraflow::api::{self, ApiState};
use duraflow::client::{Client, SubmitOptions};
use duraflow::durable_info;
use duraflow::providers::fs::FsHistoryStore;
use duraflow::providers::HistoryStore;
use duraflow::{ActivityRegistry, OrchestrationContext, OrchestrationRegistry, Runtime};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskData {
    id: String,
    #[serde(default)]
    result: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowData {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task_one_data: Option<TaskData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task_two_data: Option<TaskData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task_three_data: Option<TaskData>,
}

async fn run_task(delay: Duration, input: String) -> Result<String, String> {
    let mut data: TaskData = serde_json::from_str(&input).map_err(|e| format!("bad task input: {e}"))?;
    tokio::time::sleep(delay).await;
    data.result = Uuid::new_v4().to_string();
    serde_json::to_string(&data).map_err(|e| e.to_string())
}

async fn task_workflow(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let mut data: WorkflowData = serde_json::from_str(&input).map_err(|e| format!("bad workflow input: {e}"))?;
    durable_info!(ctx, instance_id = %data.id, "task workflow started");
    let seed = serde_json::to_string(&TaskData {
        id: data.id.clone(),
        result: String::new(),
    })
    .map_err(|e| e.to_string())?;

    let one = ctx.schedule_activity("TaskOne", seed.clone()).await?;
    data.task_one_data = Some(serde_json::from_str(&one).map_err(|e| e.to_string())?);

    let two = ctx.schedule_activity("TaskTwo", seed.clone()).await?;
    data.task_two_data = Some(serde_json::from_str(&two).map_err(|e| e.to_string())?);

    let three = ctx.schedule_activity("TaskThree", seed).await?;
    data.task_three_data = Some(serde_json::from_str(&three).map_err(|e| e.to_string())?);

    durable_info!(ctx, instance_id = %data.id, "task workflow finished");
    serde_json::to_string(&data).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();

    let store: Arc<dyn HistoryStore> = Arc::new(FsHistoryStore::new("./duraflow-data", false));

    let activities = Arc::new(
        ActivityRegistry::builder()
            .register_result("TaskOne", |input| run_task(Duration::from_secs(2), input))
            .register_result("TaskTwo", |input| run_task(Duration::from_secs(2), input))
            .register_result("TaskThree", |input| run_task(Duration::from_secs(5), input))
            .build(),
    );
    let orchestrations = OrchestrationRegistry::builder()
        .register("TaskWorkflow", task_workflow)
        .build();

    let rt = Runtime::start_with_store(store.clone(), activities, orchestrations).await;

    let client = Client::new(store);
    let state = ApiState::new(client, "TaskWorkflow", SubmitOptions::default());
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
    info!("duraflow sample host listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    rt.shutdown().await;
    Ok(())
}
