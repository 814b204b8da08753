use axum::{
    extract::State,
    response::IntoResponse,
};
use common::http::{
    extract::Json,
    HttpResponseError,
    RequestDestination,
};
use http::StatusCode;
use model::{
    canonical_urls::types::CanonicalUrl,
    deployment_audit_log::types::DeploymentAuditLogEvent,
};
use serde::Deserialize;

use crate::{
    admin::must_be_admin_with_write_access,
    authentication::ExtractIdentity,
    LocalAppState,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCanonicalUrlRequest {
    request_destination: RequestDestination,
    url: Option<String>,
}

pub async fn update_canonical_url(
    State(st): State<LocalAppState>,
    ExtractIdentity(identity): ExtractIdentity,
    Json(request): Json<UpdateCanonicalUrlRequest>,
) -> Result<impl IntoResponse, HttpResponseError> {
    must_be_admin_with_write_access(&identity)?;

    let mut tx = st.application.begin(identity).await?;

    let mut audit_log_events = vec![];
    if let Some(url) = request.url.clone() {
        let canonical_url = CanonicalUrl {
            request_destination: request.request_destination,
            url: url.clone(),
        };
        st.application
            .set_canonical_url(&mut tx, canonical_url)
            .await?;
        audit_log_events.push(DeploymentAuditLogEvent::UpdateCanonicalUrl {
            request_destination: request.request_destination,
            url,
        });
    } else {
        st.application
            .unset_canonical_url(&mut tx, request.request_destination)
            .await?;
        audit_log_events.push(DeploymentAuditLogEvent::DeleteCanonicalUrl {
            request_destination: request.request_destination,
        });
    }

    st.application
        .commit_with_audit_log_events(tx, audit_log_events, "update_canonical_url")
        .await?;

    Ok(StatusCode::OK)
}
