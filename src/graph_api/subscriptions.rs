use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde_json::json;

use super::types::{RemoteSubscription, SubscriptionRequest};
use super::{classify_graph_error, read_graph_response, GraphClient, RemoteError};
use crate::types::AccessToken;

pub(super) async fn create(
    client: &GraphClient,
    token: &AccessToken,
    request: &SubscriptionRequest,
) -> Result<RemoteSubscription, RemoteError> {
    // Graph validates the notification URL synchronously inside this call.
    let response = client
        .client
        .post(client.url("subscriptions"))
        .bearer_auth(token.secret())
        .json(request)
        .send()
        .await?;
    read_graph_response(response).await
}

pub(super) async fn renew(
    client: &GraphClient,
    token: &AccessToken,
    subscription_id: &str,
    expires_at: DateTime<Utc>,
) -> Result<RemoteSubscription, RemoteError> {
    let body = json!({
        "expirationDateTime": expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    });
    let response = client
        .client
        .patch(client.url(&format!("subscriptions/{}", subscription_id)))
        .bearer_auth(token.secret())
        .json(&body)
        .send()
        .await?;
    read_graph_response(response).await
}

pub(super) async fn delete(
    client: &GraphClient,
    token: &AccessToken,
    subscription_id: &str,
) -> Result<(), RemoteError> {
    let response = client
        .client
        .delete(client.url(&format!("subscriptions/{}", subscription_id)))
        .bearer_auth(token.secret())
        .send()
        .await?;

    let status = response.status();
    if status.is_success() || status == StatusCode::NOT_FOUND {
        return Ok(());
    }
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    Err(classify_graph_error(status, &headers, &body))
}
