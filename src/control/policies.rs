//! Policy handlers
//!
//! File-backed policy CRUD. When policies are sourced from an external
//! service the local endpoints refuse writes.

use bytes::Bytes;
use std::path::PathBuf;

use super::{api_error, modify_success, AdminContext, AdminResponse};
use crate::session::Policy;

fn policy_path(ctx: &AdminContext, policy_id: &str) -> PathBuf {
    PathBuf::from(&ctx.config.policies.policy_path).join(format!("{}.json", policy_id))
}

fn blocked_by_policy_source(ctx: &AdminContext) -> Option<AdminResponse> {
    if ctx.config.policies.policy_source == "service" {
        return Some(AdminResponse::json(
            500,
            &api_error("Due to enabled service policy source, please use the Dashboard API"),
        ));
    }
    None
}

pub fn get_policy(ctx: &AdminContext, policy_id: &str) -> AdminResponse {
    match ctx.policies.get(policy_id) {
        Some(policy) => AdminResponse::json(200, &serde_json::to_value(&policy).unwrap()),
        None => AdminResponse::json(404, &api_error("Policy not found")),
    }
}

pub fn get_policy_list(ctx: &AdminContext) -> AdminResponse {
    let mut policies: Vec<Policy> = ctx.policies.all().into_values().collect();
    policies.sort_by(|a, b| a.id.cmp(&b.id));
    AdminResponse::json(200, &serde_json::to_value(&policies).unwrap())
}

pub fn add_or_update_policy(
    ctx: &AdminContext,
    policy_id: Option<&str>,
    body: &Bytes,
) -> AdminResponse {
    if let Some(blocked) = blocked_by_policy_source(ctx) {
        return blocked;
    }

    let mut policy: Policy = match serde_json::from_slice(body) {
        Ok(policy) => policy,
        Err(e) => {
            tracing::error!(error = %e, "Couldn't decode policy object");
            return AdminResponse::json(400, &api_error("Request malformed"));
        }
    };

    if let Some(policy_id) = policy_id {
        if !policy.id.is_empty() && policy.id != policy_id {
            return AdminResponse::json(
                400,
                &api_error("Request ID does not match that in policy! For Update operations these must match."),
            );
        }
        policy.id = policy_id.to_string();
    } else if policy.id.is_empty() {
        policy.id = uuid::Uuid::new_v4().simple().to_string();
    }

    let path = policy_path(ctx, &policy.id);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let bytes = match serde_json::to_vec_pretty(&policy) {
        Ok(bytes) => bytes,
        Err(e) => return AdminResponse::json(500, &api_error(format!("marshalling failed: {}", e))),
    };
    if let Err(e) = std::fs::write(&path, bytes) {
        tracing::error!(path = %path.display(), error = %e, "Failed to write policy file");
        return AdminResponse::json(500, &api_error("file object creation failed, write error"));
    }

    let action = if policy_id.is_some() { "modified" } else { "added" };
    ctx.policies.set(policy.clone());
    AdminResponse::json(200, &modify_success(&policy.id, action))
}

pub fn delete_policy(ctx: &AdminContext, policy_id: &str) -> AdminResponse {
    if let Some(blocked) = blocked_by_policy_source(ctx) {
        return blocked;
    }

    if ctx.policies.get(policy_id).is_none() {
        return AdminResponse::json(404, &api_error("Policy not found"));
    }

    let path = policy_path(ctx, policy_id);
    if path.exists() {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::error!(path = %path.display(), error = %e, "Failed to delete policy file");
            return AdminResponse::json(500, &api_error("Delete failed"));
        }
    }

    ctx.policies.remove(policy_id);
    AdminResponse::json(200, &modify_success(policy_id, "deleted"))
}
