use url::Url;

use super::types::DeltaPage;
use super::{read_graph_response, DeltaRequest, GraphClient, RemoteError};
use crate::types::AccessToken;

const MESSAGE_FIELDS: &str = "id,internetMessageId,subject,from,toRecipients,bodyPreview,importance,isRead,hasAttachments,receivedDateTime,sentDateTime";

/// URL of the first delta request for a folder.
pub fn start_url(
    client: &GraphClient,
    user_id: &str,
    folder: &str,
) -> Result<String, RemoteError> {
    let mut url = Url::parse(&client.url(&format!(
        "users/{}/mailFolders/{}/messages/delta",
        user_id, folder
    )))
    .map_err(|e| RemoteError::InvalidRequest(format!("bad delta url: {}", e)))?;
    url.query_pairs_mut().append_pair("$select", MESSAGE_FIELDS);
    Ok(url.to_string())
}

pub(super) async fn delta_page(
    client: &GraphClient,
    token: &AccessToken,
    request: &DeltaRequest,
) -> Result<DeltaPage, RemoteError> {
    let (url, page_size) = match request {
        DeltaRequest::Start {
            user_id,
            folder,
            page_size,
        } => (start_url(client, user_id, folder)?, Some(*page_size)),
        // Next and delta links already carry every query parameter.
        DeltaRequest::Link(link) => (link.clone(), None),
    };

    let mut builder = client.client.get(&url).bearer_auth(token.secret());
    if let Some(size) = page_size {
        builder = builder.header("Prefer", format!("odata.maxpagesize={}", size));
    }

    let response = builder.send().await?;
    read_graph_response(response).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_url_selects_message_fields() {
        let client = GraphClient::new(reqwest::Client::new(), "https://graph.microsoft.com/v1.0/");
        let url = start_url(&client, "u-1", "inbox").unwrap();
        assert!(url.starts_with(
            "https://graph.microsoft.com/v1.0/users/u-1/mailFolders/inbox/messages/delta?"
        ));
        assert!(url.contains("receivedDateTime"));
    }
}
