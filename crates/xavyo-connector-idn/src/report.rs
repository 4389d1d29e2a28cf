//! Per-operation error collection and delivery.
//!
//! Errors collected during an operation are rendered into a plain-text report
//! and handed to an [`ErrorNotifier`]. Delivery is a side effect: a failed
//! notification is logged and never replaces the operation's own result.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::decode_jwt_claims;
use crate::client::IdnClient;
use crate::records::WorkflowRecord;
use crate::{IdnError, IdnResult};

/// Name of the workflow used to send error reports.
pub const REPORT_WORKFLOW_NAME: &str = "IdentityNow Management - Email sender";

/// Subject line of error report emails.
pub const REPORT_SUBJECT: &str = "IdentityNow Management error report";

/// Errors collected while running one operation.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Operation name.
    pub context: String,
    /// Operation input, as received.
    pub input: Value,
    /// Records processed.
    pub processed: usize,
    /// Records emitted to the sink.
    pub emitted: usize,
    errors: Vec<String>,
}

impl RunReport {
    pub fn new(context: impl Into<String>, input: Value) -> Self {
        Self {
            context: context.into(),
            input,
            processed: 0,
            emitted: 0,
            errors: Vec::new(),
        }
    }

    /// Logs and records a per-record failure.
    pub fn record_error(&mut self, subject: &str, err: &IdnError) {
        error!(context = %self.context, subject, error = %err, "Record failed");
        self.errors.push(format!("{subject}: {err}"));
    }

    #[must_use]
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// `IdnError::PartialRun` summarizing the failures, if there were any.
    #[must_use]
    pub fn partial_error(&self) -> Option<IdnError> {
        (!self.is_clean()).then(|| IdnError::PartialRun {
            failed: self.errors.len(),
            total: self.processed,
        })
    }

    /// Plain-text report body.
    #[must_use]
    pub fn render(&self) -> String {
        let mut lines = Vec::with_capacity(self.errors.len() + 3);
        lines.push(format!("Context: {}", self.context));
        lines.push(format!("Input: {}", self.input));
        lines.push("Errors:".to_string());
        lines.extend(self.errors.iter().cloned());
        lines.join("\n")
    }
}

/// Delivers run reports somewhere a human will read them.
#[async_trait]
pub trait ErrorNotifier: Send + Sync {
    /// Delivers a report that has at least one error.
    async fn notify(&self, report: &RunReport) -> IdnResult<()>;
}

/// Delivers a report if it has errors, logging delivery failures.
pub async fn flush_report(notifier: Option<&Arc<dyn ErrorNotifier>>, report: &RunReport) {
    let Some(notifier) = notifier else {
        return;
    };
    if report.is_clean() {
        return;
    }
    if let Err(e) = notifier.notify(report).await {
        warn!(context = %report.context, error = %e, "Failed to deliver error report");
    }
}

/// Sends reports by test-running an email workflow on the tenant.
pub struct WorkflowNotifier {
    client: Arc<IdnClient>,
    workflow: Mutex<Option<WorkflowRecord>>,
}

impl std::fmt::Debug for WorkflowNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowNotifier").finish_non_exhaustive()
    }
}

impl WorkflowNotifier {
    pub fn new(client: Arc<IdnClient>) -> Self {
        Self {
            client,
            workflow: Mutex::new(None),
        }
    }

    /// Finds the report workflow, creating it if the tenant has none.
    ///
    /// # Errors
    ///
    /// Propagates API errors, and `IdnError::InvalidResponse` if the API
    /// token does not carry an `identity_id` claim to own a new workflow.
    #[instrument(skip(self))]
    pub async fn ensure_workflow(&self) -> IdnResult<WorkflowRecord> {
        let mut cached = self.workflow.lock().await;
        if let Some(ref workflow) = *cached {
            return Ok(workflow.clone());
        }

        let existing = self
            .client
            .list_workflows()
            .await?
            .into_iter()
            .find(|w| w.name == REPORT_WORKFLOW_NAME);

        let workflow = match existing {
            Some(workflow) => {
                debug!(workflow_id = %workflow.id, "Email workflow already present");
                workflow
            }
            None => {
                let token = self.client.broker().api_token().await?;
                let claims = decode_jwt_claims(&token)?;
                let owner_id = claims
                    .get("identity_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        IdnError::InvalidResponse("API token has no identity_id claim".to_string())
                    })?;
                info!(owner_id, "Creating email workflow");
                self.client
                    .create_workflow(email_workflow_definition(REPORT_WORKFLOW_NAME, owner_id))
                    .await?
            }
        };

        *cached = Some(workflow.clone());
        Ok(workflow)
    }

    async fn recipient(&self, workflow: &WorkflowRecord) -> IdnResult<String> {
        if let Some(ref recipient) = self.client.config().report_recipient {
            return Ok(recipient.clone());
        }
        let owner_id = workflow.owner_id.as_deref().ok_or_else(|| {
            IdnError::InvalidResponse(format!("Workflow {} has no owner", workflow.id))
        })?;
        self.client
            .search_identity(owner_id)
            .await?
            .and_then(|owner| owner.email)
            .ok_or_else(|| IdnError::NotFound(format!("Email address of workflow owner {owner_id}")))
    }
}

#[async_trait]
impl ErrorNotifier for WorkflowNotifier {
    async fn notify(&self, report: &RunReport) -> IdnResult<()> {
        let workflow = self.ensure_workflow().await?;
        let recipient = self.recipient(&workflow).await?;
        self.client
            .test_workflow(
                &workflow.id,
                json!({
                    "recipients": [recipient],
                    "subject": REPORT_SUBJECT,
                    "body": report.render(),
                }),
            )
            .await?;
        info!(context = %report.context, errors = report.errors().len(), "Error report sent");
        Ok(())
    }
}

/// Workflow that emails its trigger's `body` to its `recipients`.
#[must_use]
pub fn email_workflow_definition(name: &str, owner_id: &str) -> Value {
    json!({
        "name": name,
        "owner": { "id": owner_id, "type": "IDENTITY" },
        "definition": {
            "start": "Send Email",
            "steps": {
                "End Step - Success": { "type": "success" },
                "Send Email": {
                    "actionId": "sp:send-email",
                    "attributes": {
                        "body.$": "$.trigger.body",
                        "context": {},
                        "recipientEmailList.$": "$.trigger.recipients",
                        "subject.$": "$.trigger.subject"
                    },
                    "nextStep": "End Step - Success",
                    "type": "action",
                    "versionNumber": 2
                }
            }
        },
        "trigger": {
            "type": "EXTERNAL",
            "attributes": { "id": "idn:external:id" }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_report() {
        let mut report = RunReport::new("account:list", json!({"type": "account"}));
        report.processed = 3;
        report.record_error("jane.doe", &IdnError::Validation("bad value".to_string()));
        report.record_error(
            "john.doe",
            &IdnError::Authorization {
                operation: "GET /v3/auth-users/x".to_string(),
                status: 401,
            },
        );

        let rendered = report.render();
        let lines: Vec<_> = rendered.lines().collect();
        assert_eq!(lines[0], "Context: account:list");
        assert_eq!(lines[1], r#"Input: {"type":"account"}"#);
        assert_eq!(lines[2], "Errors:");
        assert_eq!(lines.len(), 5);
        assert!(lines[3].starts_with("jane.doe: "));

        match report.partial_error() {
            Some(IdnError::PartialRun { failed, total }) => {
                assert_eq!(failed, 2);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_clean_report_has_no_error() {
        let report = RunReport::new("account:read", Value::Null);
        assert!(report.is_clean());
        assert!(report.partial_error().is_none());
    }

    #[test]
    fn test_workflow_definition_owner() {
        let definition = email_workflow_definition(REPORT_WORKFLOW_NAME, "owner-1");
        assert_eq!(definition["owner"]["id"], "owner-1");
        assert_eq!(definition["trigger"]["type"], "EXTERNAL");
    }
}
