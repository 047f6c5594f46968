//! OAuth client handlers
//!
//! Client lifecycle per API, secret rotation, token listing, and
//! revocation. Creation by policy installs the client on every OAuth/JWT
//! API the policy grants; partial failures return the first error and do
//! not roll back earlier writes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

use super::{api_error, modify_success, AdminContext, AdminResponse};
use crate::keys as keygen;
use crate::oauth::OAuthClient;

/// Outward-facing client representation.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientRequest {
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub policy_id: String,
    pub secret: String,
    pub meta_data: serde_json::Value,
    pub description: String,
}

impl ClientRequest {
    fn from_client(client: &OAuthClient) -> Self {
        Self {
            client_id: client.client_id.clone(),
            redirect_uri: client.redirect_uri.clone(),
            api_id: String::new(),
            policy_id: client.policy_id.clone(),
            secret: client.secret.clone(),
            meta_data: client.meta_data.clone(),
            description: client.description.clone(),
        }
    }
}

/// POST /tyk/oauth/clients/create
pub fn create_client(ctx: &AdminContext, body: &Bytes) -> AdminResponse {
    let request: ClientRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create OAuth client");
            return AdminResponse::json(500, &api_error("Unmarshalling failed"));
        }
    };

    let client = OAuthClient {
        client_id: if request.client_id.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            request.client_id.clone()
        },
        secret: if request.secret.is_empty() {
            keygen::generate_client_secret()
        } else {
            request.secret.clone()
        },
        redirect_uri: request.redirect_uri.clone(),
        policy_id: request.policy_id.clone(),
        meta_data: request.meta_data.clone(),
        description: request.description.clone(),
    };

    if !request.api_id.is_empty() {
        // install for the named API only
        let Some(spec) = ctx.registry.get(&request.api_id) else {
            tracing::error!(api_id = request.api_id, "Failed to create OAuth client: API doesn't exist");
            return AdminResponse::json(400, &api_error("API doesn't exist"));
        };
        if !spec.definition.use_oauth2 {
            return AdminResponse::json(400, &api_error("API is not OAuth2"));
        }
        if let Err(err) = ctx.oauth.set_client(&request.api_id, &client) {
            tracing::error!(api_id = request.api_id, error = %err, "Failed to create OAuth client");
            return AdminResponse::json(500, &api_error("Failure in storing client data."));
        }
    } else {
        // install for every OAuth-capable API the policy grants
        let Some(policy) = ctx.policies.get(&client.policy_id) else {
            tracing::error!(policy_id = client.policy_id, "Failed to create OAuth client: policy doesn't exist");
            return AdminResponse::json(400, &api_error("Policy doesn't exist"));
        };

        let mut any_oauth = false;
        for api_id in policy.access_rights.keys() {
            let Some(spec) = ctx.registry.get(api_id) else {
                tracing::error!(api_id, "Failed to create OAuth client: API doesn't exist");
                return AdminResponse::json(400, &api_error("API doesn't exist"));
            };
            if spec.definition.use_oauth2 || spec.definition.enable_jwt {
                any_oauth = true;
                if let Err(err) = ctx.oauth.set_client(api_id, &client) {
                    tracing::error!(api_id, error = %err, "Failed to create OAuth client");
                    return AdminResponse::json(500, &api_error("Failure in storing client data."));
                }
            }
        }
        if !any_oauth {
            return AdminResponse::json(400, &api_error("API is not OAuth2"));
        }
    }

    tracing::info!(
        client_id = client.client_id,
        policy_id = client.policy_id,
        "Created OAuth client"
    );
    AdminResponse::json(
        200,
        &serde_json::to_value(ClientRequest::from_client(&client)).unwrap(),
    )
}

/// GET /tyk/oauth/clients/{apiID}
pub fn list_clients(ctx: &AdminContext, api_id: &str) -> AdminResponse {
    if ctx.registry.get(api_id).is_none() {
        return AdminResponse::json(404, &api_error("API doesn't exist"));
    }
    match ctx.oauth.list_clients(api_id) {
        Ok(clients) => {
            let out: Vec<ClientRequest> = clients.iter().map(ClientRequest::from_client).collect();
            AdminResponse::json(200, &serde_json::to_value(out).unwrap())
        }
        Err(err) => AdminResponse::json(500, &api_error(err.to_string())),
    }
}

/// GET /tyk/oauth/clients/{apiID}/{clientID}
pub fn get_client(ctx: &AdminContext, api_id: &str, client_id: &str) -> AdminResponse {
    if ctx.registry.get(api_id).is_none() {
        return AdminResponse::json(404, &api_error("API doesn't exist"));
    }
    match ctx.oauth.get_client(api_id, client_id) {
        Ok(client) => AdminResponse::json(
            200,
            &serde_json::to_value(ClientRequest::from_client(&client)).unwrap(),
        ),
        Err(_) => AdminResponse::json(404, &api_error("OAuth Client ID not found")),
    }
}

/// PUT /tyk/oauth/clients/{apiID}/{clientID}
pub fn update_client(ctx: &AdminContext, api_id: &str, client_id: &str, body: &Bytes) -> AdminResponse {
    let request: ClientRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!(error = %e, "Failed to update OAuth client");
            return AdminResponse::json(500, &api_error("Unmarshalling failed"));
        }
    };

    if ctx.registry.get(api_id).is_none() {
        return AdminResponse::json(404, &api_error("API doesn't exist"));
    }

    if !request.policy_id.is_empty() {
        let Some(policy) = ctx.policies.get(&request.policy_id) else {
            return AdminResponse::json(404, &api_error("Policy doesn't exist"));
        };
        if !policy.access_rights.contains_key(api_id) {
            return AdminResponse::json(
                400,
                &api_error("Policy access rights doesn't contain API this OAuth client belongs to"),
            );
        }
    }

    match ctx.oauth.update_client(
        api_id,
        client_id,
        request.redirect_uri,
        request.policy_id,
        request.meta_data,
        request.description,
    ) {
        Ok(updated) => AdminResponse::json(
            200,
            &serde_json::to_value(ClientRequest::from_client(&updated)).unwrap(),
        ),
        Err(crate::error::GatewayError::NotFound(_)) => {
            AdminResponse::json(404, &api_error("OAuth Client ID not found"))
        }
        Err(err) => {
            tracing::error!(api_id, error = %err, "Failed to update OAuth client");
            AdminResponse::json(500, &api_error("Failure in storing client data"))
        }
    }
}

/// DELETE /tyk/oauth/clients/{apiID}/{clientID}
pub fn delete_client(ctx: &AdminContext, api_id: &str, client_id: &str) -> AdminResponse {
    if ctx.registry.get(api_id).is_none() {
        return AdminResponse::json(404, &api_error("API doesn't exist"));
    }
    match ctx.oauth.delete_client(api_id, client_id) {
        Ok(()) => AdminResponse::json(200, &modify_success(client_id, "deleted")),
        Err(_) => AdminResponse::json(404, &api_error("OAuth Client ID not found")),
    }
}

/// PUT /tyk/oauth/clients/{apiID}/{clientID}/rotate
pub fn rotate_client(ctx: &AdminContext, api_id: &str, client_id: &str) -> AdminResponse {
    if ctx.registry.get(api_id).is_none() {
        return AdminResponse::json(404, &api_error("API doesn't exist"));
    }
    match ctx.oauth.rotate_client(api_id, client_id) {
        Ok(rotated) => AdminResponse::json(
            200,
            &serde_json::to_value(ClientRequest::from_client(&rotated)).unwrap(),
        ),
        Err(crate::error::GatewayError::NotFound(_)) => {
            AdminResponse::json(404, &api_error("OAuth Client ID not found"))
        }
        Err(err) => {
            tracing::error!(api_id, error = %err, "Failed to rotate OAuth client");
            AdminResponse::json(500, &api_error("Failure in storing client data"))
        }
    }
}

/// GET /tyk/oauth/clients/{apiID}/{clientID}/tokens[?page=N]
pub fn client_tokens(
    ctx: &AdminContext,
    api_id: &str,
    client_id: &str,
    query: &HashMap<String, String>,
) -> AdminResponse {
    if ctx.registry.get(api_id).is_none() {
        return AdminResponse::json(404, &api_error("API doesn't exist"));
    }
    if ctx.oauth.get_client(api_id, client_id).is_err() {
        return AdminResponse::json(404, &api_error("OAuth Client ID not found"));
    }

    match query.get("page") {
        Some(page) => {
            let page = page.parse::<usize>().unwrap_or(1);
            let tokens = ctx.oauth.get_paginated_client_tokens(api_id, client_id, page);
            AdminResponse::json(200, &serde_json::to_value(&tokens).unwrap())
        }
        None => {
            let tokens = ctx.oauth.get_client_tokens(api_id, client_id);
            AdminResponse::json(200, &serde_json::to_value(&tokens).unwrap())
        }
    }
}

#[derive(Debug, Deserialize)]
struct RevokeRequest {
    #[serde(default)]
    token: String,
    #[serde(default)]
    api_id: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
}

/// POST /tyk/oauth/revoke
pub fn revoke_token(ctx: &AdminContext, body: &Bytes) -> AdminResponse {
    let request: RevokeRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(_) => return AdminResponse::json(400, &api_error("Request malformed")),
    };
    if request.token.is_empty() {
        return AdminResponse::json(400, &api_error("token is required"));
    }
    if ctx.registry.get(&request.api_id).is_none() {
        return AdminResponse::json(400, &api_error("API doesn't exist"));
    }

    if ctx.oauth.revoke_token(&request.api_id, &request.token) {
        AdminResponse::json(200, &super::api_ok("token revoked"))
    } else {
        AdminResponse::json(404, &api_error("token not found"))
    }
}

/// POST /tyk/oauth/revoke_all: requires the client secret.
pub fn revoke_all_tokens(ctx: &AdminContext, body: &Bytes) -> AdminResponse {
    let request: RevokeRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(_) => return AdminResponse::json(400, &api_error("Request malformed")),
    };
    if request.client_id.is_empty() || request.client_secret.is_empty() {
        return AdminResponse::json(400, &api_error("client_id and client_secret are required"));
    }
    if ctx.registry.get(&request.api_id).is_none() {
        return AdminResponse::json(400, &api_error("API doesn't exist"));
    }

    match ctx
        .oauth
        .revoke_all_tokens(&request.api_id, &request.client_id, &request.client_secret)
    {
        Ok(removed) => AdminResponse::json(200, &json!({"status": "ok", "tokens_revoked": removed})),
        Err(crate::error::GatewayError::NotFound(_)) => {
            AdminResponse::json(404, &api_error("OAuth Client ID not found"))
        }
        Err(err) => AdminResponse::json(400, &api_error(err.to_string())),
    }
}

/// DELETE /tyk/oauth/tokens?scope=lapsed
pub fn purge_lapsed_tokens(ctx: &AdminContext, query: &HashMap<String, String>) -> AdminResponse {
    if query.get("scope").map(|s| s.as_str()) != Some("lapsed") {
        return AdminResponse::json(400, &api_error("unknown scope"));
    }
    let api_ids: Vec<String> = ctx
        .registry
        .snapshot()
        .iter()
        .map(|s| s.definition.api_id.clone())
        .collect();
    let purged = ctx.oauth.purge_lapsed_tokens(&api_ids);
    AdminResponse::json(200, &json!({"status": "ok", "tokens_purged": purged}))
}
