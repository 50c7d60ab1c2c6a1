//! HTTP client for a running loom server, used by the `task` commands.

use anyhow::{Context, Result, bail};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

use loom_core::domain::{Task, TaskId, TaskSpec, TaskState, TaskView};

use crate::http::{CreateTaskResponse, ListTasksResponse};

pub struct LoomClient {
    base: String,
    http: Client,
}

impl LoomClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }

    pub async fn create(&self, spec: &TaskSpec) -> Result<TaskId> {
        let response = self
            .http
            .post(format!("{}/v1/tasks", self.base))
            .json(spec)
            .send()
            .await
            .context("POST /v1/tasks")?;
        let created: CreateTaskResponse = decode(response).await?;
        Ok(created.id)
    }

    pub async fn get(&self, id: TaskId, view: TaskView) -> Result<Task> {
        let response = self
            .http
            .get(format!("{}/v1/tasks/{id}", self.base))
            .query(&[("view", view.to_string())])
            .send()
            .await
            .with_context(|| format!("GET /v1/tasks/{id}"))?;
        decode(response).await
    }

    pub async fn list(
        &self,
        state: Option<TaskState>,
        name_prefix: Option<&str>,
        view: TaskView,
    ) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        let mut page_token: Option<TaskId> = None;
        loop {
            let mut query = vec![("view", view.to_string())];
            if let Some(state) = state {
                query.push(("state", state.to_string()));
            }
            if let Some(prefix) = name_prefix {
                query.push(("name_prefix", prefix.to_string()));
            }
            if let Some(token) = page_token {
                query.push(("page_token", token.to_string()));
            }
            let response = self
                .http
                .get(format!("{}/v1/tasks", self.base))
                .query(&query)
                .send()
                .await
                .context("GET /v1/tasks")?;
            let page: ListTasksResponse = decode(response).await?;
            tasks.extend(page.tasks);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(tasks),
            }
        }
    }

    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/v1/tasks/{id}:cancel", self.base))
            .json(&serde_json::json!({}))
            .send()
            .await
            .with_context(|| format!("POST /v1/tasks/{id}:cancel"))?;
        let _: serde_json::Value = decode(response).await?;
        Ok(())
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        match body.get("error").and_then(|e| e.as_str()) {
            Some(message) => bail!("server returned {status}: {message}"),
            None => bail!("server returned {status}"),
        }
    }
    response.json().await.context("decoding response body")
}
