//! Session/key handlers
//!
//! Key CRUD with hashed-or-plain addressing, policy application, quota
//! preservation, and the org-level session surface. Writes go through
//! the session manager; policy merges happen before every save.

use bytes::Bytes;
use serde_json::json;
use std::collections::HashMap;

use super::{api_error, modify_success, AdminContext, AdminResponse};
use crate::error::GatewayError;
use crate::keys as keygen;
use crate::session::{
    apply_policies, check_and_apply_trial_period, now_unix, set_basic_auth_password, SessionState,
};

/// Greatest lifetime across the APIs a session can reach.
fn apply_lifetime(ctx: &AdminContext, session: &SessionState) -> i64 {
    let mut lifetime = 0;
    for api_id in session.access_rights.keys() {
        if let Some(spec) = ctx.registry.get(api_id) {
            let candidate = session.lifetime(
                spec.definition.session_lifetime_respects_key_expiration,
                spec.definition.session_lifetime,
                ctx.config.force_global_session_lifetime,
                ctx.config.global_session_lifetime,
            );
            if candidate > lifetime {
                lifetime = candidate;
            }
        }
    }
    if session.access_rights.is_empty() && ctx.config.force_global_session_lifetime {
        lifetime = ctx.config.global_session_lifetime;
    }
    lifetime
}

fn apply_policies_and_save(
    ctx: &AdminContext,
    key_name: &str,
    session: &mut SessionState,
    hashed: bool,
) -> Result<(), GatewayError> {
    apply_policies(session, &ctx.policies)?;
    let lifetime = apply_lifetime(ctx, session);
    ctx.sessions.update_session(key_name, session, lifetime, hashed)
}

/// Create-or-update shared path: trial periods, quota resets, policy
/// application, and the master-key rule.
fn do_add_or_update(
    ctx: &AdminContext,
    key_name: &str,
    session: &mut SessionState,
    dont_reset: bool,
    hashed: bool,
) -> Result<(), GatewayError> {
    // last_updated feeds the rate limiter's period tracking, so it only
    // moves when counters are being reset
    if !dont_reset {
        session.last_updated = now_unix().to_string();
    }

    if !session.access_rights.is_empty() {
        let api_ids: Vec<String> = session.access_rights.keys().cloned().collect();
        for api_id in api_ids {
            let spec = ctx.registry.get(&api_id);
            if spec.is_none() {
                tracing::warn!(
                    api_id,
                    key = keygen::obfuscate(key_name),
                    "Can't find active API, storing anyway"
                );
            }

            if spec.is_some() {
                check_and_apply_trial_period(key_name, session, &ctx.policies, &ctx.sessions, hashed);
            }

            let dont_set_quota = spec
                .as_ref()
                .map(|s| s.definition.dont_set_quota_on_create)
                .unwrap_or(false);
            if !dont_set_quota && !dont_reset {
                ctx.sessions.reset_quota(key_name, session, hashed);
                session.quota_renews = now_unix() + session.quota_renewal_rate;
            }

            apply_policies_and_save(ctx, key_name, session, hashed)?;
        }
    } else {
        if !ctx.config.allow_master_keys {
            tracing::error!("Master keys disallowed in configuration, key not added");
            return Err(GatewayError::ValidationFailed(
                "Master keys not allowed".to_string(),
            ));
        }
        tracing::warn!("No API access rights set, adding key to ALL");
        for spec in ctx.registry.snapshot() {
            if !spec.definition.dont_set_quota_on_create && !dont_reset {
                ctx.sessions.reset_quota(key_name, session, hashed);
                session.quota_renews = now_unix() + session.quota_renewal_rate;
            }
            check_and_apply_trial_period(key_name, session, &ctx.policies, &ctx.sessions, hashed);
            apply_policies_and_save(ctx, key_name, session, hashed)?;
        }
    }

    tracing::info!(key = keygen::obfuscate(key_name), org_id = session.org_id, "Key added or updated");
    Ok(())
}

/// POST /tyk/keys/create: generate a key for the posted session.
pub fn create_key(ctx: &AdminContext, body: &Bytes) -> AdminResponse {
    let mut session: SessionState = match serde_json::from_slice(body) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "Key creation failed");
            return AdminResponse::json(500, &api_error("Unmarshalling failed"));
        }
    };

    let mut new_key = keygen::generate_token(&session.org_id, "");
    if session.hmac_enabled {
        session.hmac_secret = keygen::generate_client_secret();
    }

    if !session.certificate.is_empty() {
        // certificate-bound keys are deterministic per certificate
        new_key = keygen::generate_token(&session.org_id, &session.certificate);
        if ctx.sessions.session_detail(&session.org_id, &new_key, false).is_some() {
            return AdminResponse::json(
                500,
                &api_error(format!(
                    "Failed to create key - Key with given certificate already found: {}",
                    new_key
                )),
            );
        }
    }

    session.last_updated = now_unix().to_string();
    session.date_created = now_unix();

    if session.is_basic_auth() {
        set_basic_auth_password(&mut session, &ctx.config);
    }

    if let Err(err) = apply_policies(&mut session, &ctx.policies) {
        return AdminResponse::json(500, &api_error(format!("Failed to create key - {}", err)));
    }

    match do_add_or_update(ctx, &new_key, &mut session, false, false) {
        Ok(()) => {}
        Err(GatewayError::ValidationFailed(msg)) if msg.contains("Master keys") => {
            return AdminResponse::json(
                400,
                &api_error("Failed to create key, keys must have at least one Access Rights record set."),
            );
        }
        Err(err) => {
            return AdminResponse::json(500, &api_error(format!("Failed to create key - {}", err)));
        }
    }

    let mut response = json!({"key": new_key, "status": "ok", "action": "added"});
    if ctx.config.hash_keys {
        response["key_hash"] = json!(ctx.sessions.key_hash(&new_key));
    }

    tracing::info!(
        key = keygen::obfuscate(&new_key),
        org_id = session.org_id,
        "Generated new key"
    );
    AdminResponse::json(200, &response)
}

/// POST /tyk/keys/preview: dry-run policy application, nothing stored.
pub fn preview_key(ctx: &AdminContext, body: &Bytes) -> AdminResponse {
    let mut session: SessionState = match serde_json::from_slice(body) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "Key preview failed");
            return AdminResponse::json(500, &api_error("Unmarshalling failed"));
        }
    };

    session.last_updated = now_unix().to_string();
    session.date_created = now_unix();

    if let Err(err) = apply_policies(&mut session, &ctx.policies) {
        return AdminResponse::json(400, &api_error(err.to_string()));
    }

    AdminResponse::json(200, &serde_json::to_value(&session).unwrap())
}

/// GET /tyk/keys: list stored keys (disabled under hashed listing).
pub fn get_all_keys(ctx: &AdminContext, query: &HashMap<String, String>) -> AdminResponse {
    if ctx.config.hash_keys && !ctx.config.enable_hashed_keys_listing {
        return AdminResponse::json(
            400,
            &api_error("Hashed key listing is disabled in config (enable_hashed_keys_listing)"),
        );
    }
    let filter = query.get("filter").map(|s| s.as_str()).unwrap_or("");
    let keys = ctx.sessions.sessions(filter);
    AdminResponse::json(200, &json!({"keys": keys}))
}

/// POST/PUT /tyk/keys/{keyName}
pub fn add_or_update_key(
    ctx: &AdminContext,
    key_name: &str,
    method: &http::Method,
    body: &Bytes,
    query: &HashMap<String, String>,
) -> AdminResponse {
    let suppress_reset = query.get("suppress_reset").map(|v| v == "1").unwrap_or(false);
    let hashed = query.contains_key("hashed");
    let by_username = query.get("username").map(|v| v == "true").unwrap_or(false);

    let mut session: SessionState = match serde_json::from_slice(body) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "Couldn't decode new session object");
            return AdminResponse::json(400, &api_error("Request malformed"));
        }
    };

    if by_username && ctx.config.disable_key_actions_by_username {
        return AdminResponse::json(400, &api_error("Key actions by username are disabled"));
    }

    let mut key_name = key_name.to_string();
    if by_username {
        key_name = keygen::generate_token(&session.org_id, &key_name);
    }

    if let Err(err) = apply_policies(&mut session, &ctx.policies) {
        // mirror the store-anyway behavior for unknown policies on writes
        tracing::warn!(error = %err, "Policy application failed during key update");
    }

    let mut original: Option<SessionState> = None;
    if *method == http::Method::PUT {
        let Some(existing) = ctx.sessions.session_detail(&session.org_id, &key_name, hashed) else {
            tracing::error!("Could not find key when updating");
            return AdminResponse::json(404, &api_error("Key is not found"));
        };

        if session.certificate != existing.certificate {
            if session.certificate.is_empty() {
                return AdminResponse::json(
                    400,
                    &api_error("Key cannot be used without a certificate"),
                );
            }
            if ctx
                .store
                .get_key(&format!("cert-{}", session.certificate))
                .is_err()
            {
                return AdminResponse::json(
                    400,
                    &api_error("Key must be used with an existent certificate"),
                );
            }
        }

        session.date_created = existing.date_created;

        if suppress_reset {
            // keep renewal periods and the rate-limiter epoch intact
            session.quota_renews = existing.quota_renews;
            session.last_updated = existing.last_updated.clone();

            for (api_id, access) in &existing.access_rights {
                if access.limit.is_empty() {
                    continue;
                }
                if let Some(new_access) = session.access_rights.get_mut(api_id) {
                    if !new_access.limit.is_empty() {
                        new_access.limit.quota_renews = access.limit.quota_renews;
                    }
                }
            }
        }
        original = Some(existing);
    } else {
        session.date_created = now_unix();
        key_name = keygen::generate_token(&session.org_id, &key_name);
    }

    // a past expiry in the payload keeps the stored one
    if session.expires > 1 && now_unix() > session.expires {
        session.expires = original.as_ref().map(|o| o.expires).unwrap_or(0);
    }

    if session.is_basic_auth() {
        match *method {
            http::Method::POST => set_basic_auth_password(&mut session, &ctx.config),
            http::Method::PUT => {
                let changed = original
                    .as_ref()
                    .map(|o| o.basic_auth_data.password != session.basic_auth_data.password)
                    .unwrap_or(true);
                if changed {
                    set_basic_auth_password(&mut session, &ctx.config);
                }
            }
            _ => {}
        }
    } else if let Some(original) = original.as_ref().filter(|o| o.is_basic_auth()) {
        session.basic_auth_data = original.basic_auth_data.clone();
    }

    match do_add_or_update(ctx, &key_name, &mut session, suppress_reset, hashed) {
        Ok(()) => {}
        Err(GatewayError::ValidationFailed(msg)) if msg.contains("Master keys") => {
            return AdminResponse::json(
                400,
                &api_error("Failed to create key, keys must have at least one Access Rights record set."),
            );
        }
        Err(_) => {
            return AdminResponse::json(
                500,
                &api_error("Failed to create key, ensure security settings are correct."),
            );
        }
    }

    let action = if *method == http::Method::POST {
        "added"
    } else {
        "modified"
    };
    let mut response = json!({"key": key_name, "status": "ok", "action": action});
    if ctx.config.hash_keys && *method == http::Method::POST {
        if session.is_basic_auth() {
            response["key"] = json!("");
        }
        response["key_hash"] = json!(if hashed {
            key_name.clone()
        } else {
            ctx.sessions.key_hash(&key_name)
        });
    }
    AdminResponse::json(200, &response)
}

/// GET /tyk/keys/{keyName}
pub fn get_key(ctx: &AdminContext, key_name: &str, query: &HashMap<String, String>) -> AdminResponse {
    let hashed = query.contains_key("hashed");
    if hashed && !ctx.config.hash_keys {
        return AdminResponse::json(
            400,
            &api_error("Key requested by hash but key hashing is not enabled"),
        );
    }

    let org_id = query
        .get("api_id")
        .and_then(|api_id| ctx.registry.get(api_id))
        .map(|spec| spec.definition.org_id.clone())
        .unwrap_or_default();

    let Some(mut session) = ctx.sessions.session_detail(&org_id, key_name, hashed) else {
        return AdminResponse::json(404, &api_error("Key not found"));
    };

    if let Err(err) = apply_policies(&mut session, &ctx.policies) {
        tracing::warn!(error = %err, "Policy application failed during key read");
    }

    if session.quota_max != -1 {
        session.quota_remaining = ctx.sessions.quota_remaining(key_name, &session, hashed);
    }

    if session.is_basic_auth() {
        session.basic_auth_data.password.clear();
    }

    tracing::info!(key = keygen::obfuscate(key_name), "Retrieved key detail");
    AdminResponse::json(200, &serde_json::to_value(&session).unwrap())
}

/// DELETE /tyk/keys/{keyName}
pub fn delete_key(ctx: &AdminContext, key_name: &str, query: &HashMap<String, String>) -> AdminResponse {
    let hashed = query.contains_key("hashed");
    let reset_quota = query
        .get("reset_quota")
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true);

    let Some(session) = ctx.sessions.session_detail("", key_name, hashed) else {
        return AdminResponse::json(404, &api_error("There is no such key found"));
    };

    if reset_quota {
        ctx.sessions.reset_quota(key_name, &session, hashed);
    }

    if !ctx.sessions.remove_session("", key_name, hashed) {
        tracing::error!(key = keygen::obfuscate(key_name), "Failed to remove the key");
        return AdminResponse::json(400, &api_error("Failed to remove the key"));
    }

    tracing::info!(key = keygen::obfuscate(key_name), "Deleted key");
    AdminResponse::json(200, &modify_success(key_name, "deleted"))
}

// Org sessions are addressed raw; org IDs are never hashed.

/// POST/PUT /tyk/org/keys/{orgID}
pub fn org_add_or_update(
    ctx: &AdminContext,
    org_id: &str,
    body: &Bytes,
    query: &HashMap<String, String>,
) -> AdminResponse {
    let mut session: SessionState = match serde_json::from_slice(body) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "Couldn't decode new session object");
            return AdminResponse::json(400, &api_error("Request malformed"));
        }
    };
    session.org_id = org_id.to_string();

    let existed = ctx.sessions.session_detail(org_id, org_id, true).is_some();

    if query.get("reset_quota").map(|v| v == "1").unwrap_or(false) {
        ctx.sessions.reset_quota(org_id, &session, true);
        session.quota_renews = now_unix() + session.quota_renewal_rate;
    }

    session.last_updated = now_unix().to_string();
    if let Err(err) = ctx.sessions.update_session(org_id, &session, 0, true) {
        return AdminResponse::json(500, &api_error(err.to_string()));
    }

    let action = if existed { "modified" } else { "added" };
    AdminResponse::json(200, &modify_success(org_id, action))
}

/// GET /tyk/org/keys/{orgID}
pub fn org_get(ctx: &AdminContext, org_id: &str) -> AdminResponse {
    match ctx.sessions.session_detail(org_id, org_id, true) {
        Some(session) => AdminResponse::json(200, &serde_json::to_value(&session).unwrap()),
        None => AdminResponse::json(404, &api_error("Org not found")),
    }
}

/// DELETE /tyk/org/keys/{orgID}
pub fn org_delete(ctx: &AdminContext, org_id: &str) -> AdminResponse {
    if !ctx.sessions.remove_session(org_id, org_id, true) {
        return AdminResponse::json(404, &api_error("Org not found"));
    }
    AdminResponse::json(200, &modify_success(org_id, "deleted"))
}
