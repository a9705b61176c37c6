//! ERP webhook ops: fire a signal into SAP S/4HANA or Oracle SCM Cloud.
//!
//! Endpoint and credentials come from the environment at lazy-load time, so
//! a misconfigured host surfaces as a load failure instead of a per-task
//! error. Rejections come back as soft `{error: …}` results: the controller
//! owns retry policy for these events.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use reqwest::Url;
use serde_json::{Value, json};

use crate::context::OpContext;
use crate::error::OpError;
use crate::{JsonMap, OpHandler};

const DEFAULT_SAP_HOST: &str = "https://my-sap-instance.com";
const DEFAULT_ORACLE_HOST: &str = "https://eg-dev.fa.us2.oraclecloud.com";

const SAP_NOTIFICATION_PATH: &str =
    "/sap/opu/odata/sap/API_QUALNOTIFICATION_SRV/A_QualityNotification";
const ORACLE_TRANSACTIONS_PATH: &str =
    "/fscmRestApi/resources/11.13.18.05/inventoryTransactions";

#[derive(Debug, Clone)]
struct WebhookTarget {
    endpoint: Url,
    user: Option<String>,
    pass: Option<String>,
}

impl WebhookTarget {
    fn from_env(
        host_var: &str,
        default_host: &str,
        path: &str,
        user_var: &str,
        pass_var: &str,
    ) -> Result<Self, String> {
        let host = std::env::var(host_var).unwrap_or_else(|_| default_host.to_string());
        let base = Url::parse(&host).map_err(|err| format!("{host_var} is not a URL: {err}"))?;
        let endpoint = base
            .join(path)
            .map_err(|err| format!("{host_var} cannot carry the endpoint path: {err}"))?;
        Ok(Self {
            endpoint,
            user: std::env::var(user_var).ok(),
            pass: std::env::var(pass_var).ok(),
        })
    }
}

pub(crate) fn load_sap(_ctx: &OpContext) -> Result<OpHandler, String> {
    let target = WebhookTarget::from_env(
        "SAP_HOST",
        DEFAULT_SAP_HOST,
        SAP_NOTIFICATION_PATH,
        "SAP_USER",
        "SAP_PASS",
    )?;
    Ok(OpHandler::new(move |ctx, payload| {
        Box::pin(run_sap(ctx, payload, target.clone()))
    }))
}

pub(crate) fn load_oracle(_ctx: &OpContext) -> Result<OpHandler, String> {
    let target = WebhookTarget::from_env(
        "ORACLE_HOST",
        DEFAULT_ORACLE_HOST,
        ORACLE_TRANSACTIONS_PATH,
        "ORA_USER",
        "ORA_PASS",
    )?;
    Ok(OpHandler::new(move |ctx, payload| {
        Box::pin(run_oracle(ctx, payload, target.clone()))
    }))
}

async fn post_signal(
    ctx: &OpContext,
    target: &WebhookTarget,
    body: Value,
    content_type: Option<&str>,
) -> Result<(u16, Value), String> {
    let mut req = ctx.http.post(target.endpoint.clone());
    if let Some(ct) = content_type {
        req = req.header(reqwest::header::CONTENT_TYPE, ct);
    }
    if let Some(user) = &target.user {
        req = req.basic_auth(user, target.pass.as_deref());
    }

    let res = req.json(&body).send().await.map_err(|err| err.to_string())?;
    let status = res.status().as_u16();
    let body = res
        .text()
        .await
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or(Value::Null);
    Ok((status, body))
}

/// Trigger a quality notification in S/4HANA via OData.
///
/// Payload: `{"material": "PART-123", "text": "Crack detected"}`.
async fn run_sap(
    ctx: Arc<OpContext>,
    payload: JsonMap,
    target: WebhookTarget,
) -> Result<Value, OpError> {
    let sap_payload = json!({
        "NotificationType": "Q1",
        "Material": payload.get("material").cloned().unwrap_or(Value::Null),
        "NotificationText": payload.get("text").cloned().unwrap_or(Value::Null),
        "Priority": "1",
    });

    match post_signal(&ctx, &target, sap_payload, None).await {
        Ok((201, body)) => Ok(json!({
            "status": "success",
            "sap_id": body["d"]["Notification"],
        })),
        Ok((status, body)) => Ok(json!({
            "error": format!("SAP Rejected: http {status}: {body}"),
        })),
        Err(err) => Ok(json!({ "error": err })),
    }
}

/// Adjust inventory via the Oracle SCM Cloud REST API.
///
/// Payload: `{"item": "A544", "qty": -1}`.
async fn run_oracle(
    ctx: Arc<OpContext>,
    payload: JsonMap,
    target: WebhookTarget,
) -> Result<Value, OpError> {
    let oracle_payload = json!({
        "TransactionType": "Material Issue",
        "ItemNumber": payload.get("item").cloned().unwrap_or(Value::Null),
        "TransactionQuantity": payload.get("qty").cloned().unwrap_or(Value::Null),
        "TransactionDate": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    });

    match post_signal(
        &ctx,
        &target,
        oracle_payload,
        Some("application/vnd.oracle.adf.resourceitem+json"),
    )
    .await
    {
        Ok((201, body)) => Ok(json!({
            "status": "success",
            "oracle_tx_id": body["TransactionId"],
        })),
        Ok((status, body)) => Ok(json!({
            "error": format!("Oracle Rejected: http {status}: {body}"),
        })),
        Err(err) => Ok(json!({ "error": err })),
    }
}
