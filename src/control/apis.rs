//! API definition handlers
//!
//! CRUD over the two coexisting definition forms. Classic routes reject
//! OAS-flagged APIs and vice versa; OAS mutations regenerate the Classic
//! companion so the two forms never diverge on disk. Version-graph
//! updates rewrite the base definition in the same operation.

use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

use super::{api_error, error_response, modify_success, AdminContext, AdminResponse};
use crate::apidef::oas::{get_api_url, ExtensionConfigParams, OasDocument};
use crate::apidef::ApiDefinition;
use crate::error::{GatewayError, Result};
use crate::headers::BASE_API_ID;
use crate::registry::{configure_version_definition, remove_version_child, VersionQueryParams};

pub fn get_api_list(ctx: &AdminContext) -> AdminResponse {
    let definitions: Vec<ApiDefinition> = ctx
        .registry
        .snapshot()
        .iter()
        .map(|s| s.definition.clone())
        .collect();
    AdminResponse::json(200, &serde_json::to_value(definitions).unwrap())
}

pub fn get_api_list_oas(ctx: &AdminContext, query: &HashMap<String, String>) -> AdminResponse {
    let public = query.get("mode").map(|m| m == "public").unwrap_or(false);
    let mut documents = Vec::new();
    for spec in ctx.registry.snapshot() {
        if !spec.definition.is_oas {
            continue;
        }
        let mut doc = spec.oas.clone().unwrap_or_default();
        doc.fill(&spec.definition);
        if public {
            doc.remove_tyk_extension();
        }
        documents.push(serde_json::to_value(&doc).unwrap());
    }
    AdminResponse::json(200, &Value::Array(documents))
}

pub fn get_api(
    ctx: &AdminContext,
    api_id: &str,
    oas_endpoint: bool,
    query: &HashMap<String, String>,
) -> AdminResponse {
    let Some(spec) = ctx.registry.get(api_id) else {
        tracing::error!(api_id, "API doesn't exist");
        return AdminResponse::json(404, &api_error("API not found"));
    };

    let response = if oas_endpoint {
        if !spec.definition.is_oas {
            return AdminResponse::json(
                400,
                &api_error("the requested API definition is in Classic format, please use the Classic API endpoint"),
            );
        }
        let mut doc = spec.oas.clone().unwrap_or_default();
        doc.fill(&spec.definition);
        if query.get("mode").map(|m| m == "public").unwrap_or(false) {
            doc.remove_tyk_extension();
        }
        AdminResponse::json(200, &serde_json::to_value(&doc).unwrap())
    } else {
        AdminResponse::json(200, &serde_json::to_value(&spec.definition).unwrap())
    };

    // announce the owning base iff it still lists this child
    match ctx.registry.confirmed_base_id(&spec.definition) {
        Some(base_id) => response.with_header(BASE_API_ID, &base_id),
        None => response,
    }
}

pub async fn add_api(
    ctx: &AdminContext,
    body: &Bytes,
    query: &HashMap<String, String>,
    oas_endpoint: bool,
) -> AdminResponse {
    if let Some(blocked) = blocked_in_dashboard_mode(ctx) {
        return blocked;
    }

    let version_params = VersionQueryParams::from_query(query);
    if let Err(err) = validate_version_params(ctx, &version_params) {
        let code = match err {
            GatewayError::Conflict(_) => 422,
            _ => 400,
        };
        return AdminResponse::json(code, &api_error(err.to_string()));
    }

    let (mut definition, oas_doc) = if oas_endpoint {
        let doc = match validated_oas_body(ctx, body, true) {
            Ok(doc) => doc,
            Err(err) => return AdminResponse::json(400, &api_error(err.to_string())),
        };
        let mut definition = ApiDefinition::default();
        doc.extract_to(&mut definition);
        (definition, Some(doc))
    } else {
        match serde_json::from_slice::<ApiDefinition>(body) {
            Ok(definition) => (definition, None),
            Err(e) => {
                tracing::error!(error = %e, "Couldn't decode new API definition object");
                return AdminResponse::json(400, &api_error("Request malformed"));
            }
        }
    };

    if let Err(err) = definition.validate() {
        return AdminResponse::json(400, &api_error(err.to_string()));
    }

    if definition.api_id.is_empty() {
        definition.generate_api_id();
    }

    // a version child points back at its owning base
    if let Some(base_api_id) = &version_params.base_api_id {
        definition.version_definition.base_id = base_api_id.clone();
    }

    // form mismatch against the live registry
    if let Some(existing) = ctx.registry.get(&definition.api_id) {
        if existing.definition.is_oas != oas_endpoint {
            let message = if existing.definition.is_oas {
                "the API is an OAS API, please use the OAS API endpoint"
            } else {
                "the API is a Classic API, please use the Classic API endpoint"
            };
            return AdminResponse::json(400, &api_error(message));
        }
    }

    let write_result = if let Some(mut doc) = oas_doc {
        definition.is_oas = true;
        let custom_domain = doc
            .get_tyk_extension()
            .and_then(|e| e.server.custom_domain.clone());
        doc.add_servers(&get_api_url(&definition, &ctx.config, custom_domain.as_deref()));
        if let Some(mut ext) = doc.get_tyk_extension().cloned() {
            ext.info.id = definition.api_id.clone();
            doc.set_tyk_extension(ext);
        }
        write_oas_and_definition(ctx, &definition, &doc)
    } else {
        definition.is_oas = false;
        write_definition(ctx, &definition)
    };
    if let Err(err) = write_result {
        let (code, body) = error_response(&err);
        return AdminResponse::json(code, &body);
    }

    if !version_params.is_empty() {
        if let Err(err) = rewrite_base_api(ctx, &version_params, &definition.api_id) {
            tracing::error!(error = %err, "Error occurred while updating the base API");
        }
    }

    ctx.coordinator.queue_reload();
    AdminResponse::json(200, &modify_success(&definition.api_id, "added"))
}

pub async fn update_api(
    ctx: &AdminContext,
    api_id: &str,
    body: &Bytes,
    oas_endpoint: bool,
) -> AdminResponse {
    if let Some(blocked) = blocked_in_dashboard_mode(ctx) {
        return blocked;
    }

    let Some(spec) = ctx.registry.get(api_id) else {
        return AdminResponse::json(404, &api_error("API not found"));
    };

    let (mut definition, oas_doc) = if oas_endpoint {
        if !spec.definition.is_oas {
            return AdminResponse::json(
                400,
                &api_error("the API is a Classic API, please use the Classic API endpoint"),
            );
        }
        let doc = match validated_oas_body(ctx, body, true) {
            Ok(doc) => doc,
            Err(err) => return AdminResponse::json(400, &api_error(err.to_string())),
        };
        let mut definition = ApiDefinition::default();
        doc.extract_to(&mut definition);
        (definition, Some(doc))
    } else {
        if spec.definition.is_oas {
            return AdminResponse::json(
                400,
                &api_error("the API is an OAS API, please use the OAS API endpoint"),
            );
        }
        match serde_json::from_slice::<ApiDefinition>(body) {
            Ok(definition) => (definition, None),
            Err(e) => {
                tracing::error!(error = %e, "Couldn't decode updated API definition object");
                return AdminResponse::json(400, &api_error("Request malformed"));
            }
        }
    };

    if !api_id.is_empty() && definition.api_id != api_id {
        tracing::error!("PUT operation on different APIIDs");
        return AdminResponse::json(
            400,
            &api_error("Request APIID does not match that in Definition! For Update operations these must match."),
        );
    }

    if let Err(err) = definition.validate() {
        return AdminResponse::json(400, &api_error(err.to_string()));
    }

    let write_result = if let Some(mut doc) = oas_doc {
        definition.is_oas = true;
        // keep the gateway-managed first server entry current
        let old_url = spec
            .oas
            .as_ref()
            .and_then(|o| o.servers.first())
            .map(|s| s.url.clone())
            .unwrap_or_default();
        let custom_domain = doc
            .get_tyk_extension()
            .and_then(|e| e.server.custom_domain.clone());
        doc.update_servers(
            &get_api_url(&definition, &ctx.config, custom_domain.as_deref()),
            &old_url,
        );
        write_oas_and_definition(ctx, &definition, &doc)
    } else {
        definition.is_oas = false;
        write_definition(ctx, &definition)
    };
    if let Err(err) = write_result {
        let (code, body) = error_response(&err);
        return AdminResponse::json(code, &body);
    }

    ctx.coordinator.queue_reload();
    AdminResponse::json(200, &modify_success(&definition.api_id, "modified"))
}

pub async fn delete_api(ctx: &AdminContext, api_id: &str) -> AdminResponse {
    if let Some(blocked) = blocked_in_dashboard_mode(ctx) {
        return blocked;
    }

    let Some(spec) = ctx.registry.get(api_id) else {
        return AdminResponse::json(404, &api_error("API not found"));
    };

    let def_path = definition_path(ctx, api_id);
    if !def_path.exists() {
        tracing::warn!(api_id, "Definition file does not exist");
        return AdminResponse::json(500, &api_error("Delete failed"));
    }
    let _ = std::fs::remove_file(&def_path);
    if spec.definition.is_oas {
        let _ = std::fs::remove_file(oas_path(ctx, api_id));
    }

    // the owning base drops exactly this child's entry
    let base_id = &spec.definition.version_definition.base_id;
    if !base_id.is_empty() {
        if let Some(base) = ctx.registry.get(base_id) {
            let mut base_def = base.definition.clone();
            if remove_version_child(&mut base_def.version_definition, api_id) {
                let result = if base_def.is_oas {
                    let mut doc = base.oas.clone().unwrap_or_default();
                    doc.fill(&base_def);
                    write_oas_and_definition(ctx, &base_def, &doc)
                } else {
                    write_definition(ctx, &base_def)
                };
                if let Err(err) = result {
                    tracing::error!(base_id, error = %err, "Error occurred while updating the base API");
                }
            }
        }
    }

    // surviving children lose their dangling back-pointer
    for child in ctx.registry.snapshot() {
        if child.definition.version_definition.base_id != api_id {
            continue;
        }
        let mut child_def = child.definition.clone();
        child_def.version_definition.base_id.clear();
        let result = if child_def.is_oas {
            let mut doc = child.oas.clone().unwrap_or_default();
            doc.fill(&child_def);
            write_oas_and_definition(ctx, &child_def, &doc)
        } else {
            write_definition(ctx, &child_def)
        };
        if let Err(err) = result {
            tracing::error!(child_id = child.api_id(), error = %err, "Error occurred while clearing a child's base reference");
        }
    }

    ctx.coordinator.queue_reload();
    AdminResponse::json(200, &modify_success(api_id, "deleted"))
}

pub async fn patch_oas(
    ctx: &AdminContext,
    api_id: &str,
    body: &Bytes,
    query: &HashMap<String, String>,
) -> AdminResponse {
    if let Some(blocked) = blocked_in_dashboard_mode(ctx) {
        return blocked;
    }

    let Some(spec) = ctx.registry.get(api_id) else {
        return AdminResponse::json(404, &api_error("API not found"));
    };
    if !spec.definition.is_oas {
        return AdminResponse::json(
            400,
            &api_error("the API is a Classic API, please use the Classic API endpoint"),
        );
    }

    let incoming = match OasDocument::from_slice(body) {
        Ok(doc) => doc,
        Err(err) => return AdminResponse::json(400, &api_error(err.to_string())),
    };

    let params = ExtensionConfigParams::from_query(query);

    // a body that already carries the extension, with no overrides, is a
    // plain update
    if incoming.get_tyk_extension().is_some() && params.is_none() {
        return update_api(ctx, api_id, body, true).await;
    }

    let mut current = spec.oas.clone().unwrap_or_default();
    current.fill(&spec.definition);

    let extension = incoming
        .get_tyk_extension()
        .cloned()
        .or_else(|| current.get_tyk_extension().cloned());

    let mut merged = incoming;
    let incoming_servers = std::mem::take(&mut merged.servers);
    merged.servers = OasDocument::retain_old_server_url(&current.servers, incoming_servers);
    if let Some(extension) = extension {
        merged.set_tyk_extension(extension);
    }

    if let Some(params) = params {
        if let Err(err) = merged.build_default_extension(&params, false) {
            return AdminResponse::json(400, &api_error(err.to_string()));
        }
    }

    let patched = match serde_json::to_vec(&merged) {
        Ok(bytes) => Bytes::from(patched_with_id(bytes, api_id)),
        Err(e) => return AdminResponse::json(500, &api_error(e.to_string())),
    };

    tracing::debug!(api_id, "PATCHing API");
    update_api(ctx, api_id, &patched, true).await
}

// The synthesized extension may predate the stored ID; pin it before the
// ID-match check in the update path.
fn patched_with_id(bytes: Vec<u8>, api_id: &str) -> Vec<u8> {
    let Ok(mut doc) = serde_json::from_slice::<OasDocument>(&bytes) else {
        return bytes;
    };
    if let Some(mut ext) = doc.get_tyk_extension().cloned() {
        ext.info.id = api_id.to_string();
        doc.set_tyk_extension(ext);
    }
    serde_json::to_vec(&doc).unwrap_or(bytes)
}

pub async fn import_oas(
    ctx: &AdminContext,
    body: &Bytes,
    query: &HashMap<String, String>,
) -> AdminResponse {
    if let Some(blocked) = blocked_in_dashboard_mode(ctx) {
        return blocked;
    }

    let mut doc = match OasDocument::from_slice(body) {
        Ok(doc) => doc,
        Err(err) => return AdminResponse::json(400, &api_error(err.to_string())),
    };

    if doc.get_tyk_extension().is_some() {
        return AdminResponse::json(
            400,
            &api_error("the import payload should not contain x-tyk-api-gateway"),
        );
    }

    if let Err(err) = doc.validate(&ctx.config) {
        return AdminResponse::json(400, &api_error(err.to_string()));
    }

    let params = ExtensionConfigParams::from_query(query).unwrap_or_default();
    if let Err(err) = doc.build_default_extension(&params, true) {
        return AdminResponse::json(400, &api_error(err.to_string()));
    }

    let rebuilt = match serde_json::to_vec(&doc) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => return AdminResponse::json(500, &api_error(e.to_string())),
    };

    add_api(ctx, &rebuilt, &HashMap::new(), true).await
}

pub fn export_oas(ctx: &AdminContext, api_id: Option<&str>, query: &HashMap<String, String>) -> AdminResponse {
    let public = query.get("mode").map(|m| m == "public").unwrap_or(false);
    let base_name = if public { "oas" } else { "TykOasApiDef" };

    match api_id {
        Some(api_id) => {
            let Some(spec) = ctx.registry.get(api_id) else {
                return AdminResponse::json(404, &api_error("API not found"));
            };
            if !spec.definition.is_oas {
                return AdminResponse::json(
                    400,
                    &api_error("the requested API definition is in Classic format, please use the Classic API endpoint"),
                );
            }
            let mut doc = spec.oas.clone().unwrap_or_default();
            doc.fill(&spec.definition);
            if public {
                doc.remove_tyk_extension();
            }
            AdminResponse::export(
                200,
                &serde_json::to_value(&doc).unwrap(),
                &format!("{}-{}.json", base_name, api_id),
            )
        }
        None => {
            let list = get_api_list_oas(ctx, query);
            let value: Value = serde_json::from_slice(&list.body).unwrap_or(Value::Null);
            AdminResponse::export(200, &value, &format!("{}.json", base_name))
        }
    }
}

/// OAS request-body validation chain: parse as OpenAPI 3, require the
/// vendor extension (non-import routes), schema-check the extension, and
/// run document validation.
fn validated_oas_body(ctx: &AdminContext, body: &Bytes, require_extension: bool) -> Result<OasDocument> {
    let doc = OasDocument::from_slice(body)?;
    if require_extension {
        doc.validate_tyk_extension()?;
    }
    doc.validate(&ctx.config)?;
    Ok(doc)
}

fn validate_version_params(ctx: &AdminContext, params: &VersionQueryParams) -> Result<()> {
    let Some(base_api_id) = &params.base_api_id else {
        return Ok(());
    };
    let base = ctx.registry.get(base_api_id);
    let base_version_name = base
        .as_ref()
        .map(|b| b.definition.version_definition.name.clone())
        .unwrap_or_default();
    params.validate(base.is_some(), &base_version_name)
}

/// Rewrite the base's version map for a freshly created child. One
/// registry artifact write; the swap happens at reload.
fn rewrite_base_api(ctx: &AdminContext, params: &VersionQueryParams, child_api_id: &str) -> Result<()> {
    let base_api_id = params.base_api_id.as_deref().unwrap_or_default();
    let base = ctx
        .registry
        .get(base_api_id)
        .ok_or_else(|| GatewayError::NotFound(format!("Base API {}", base_api_id)))?;

    let mut base_def = base.definition.clone();
    base_def.version_definition =
        configure_version_definition(base_def.version_definition, params, child_api_id);

    if base_def.is_oas {
        let mut doc = base.oas.clone().unwrap_or_default();
        doc.fill(&base_def);
        write_oas_and_definition(ctx, &base_def, &doc)
    } else {
        write_definition(ctx, &base_def)
    }
}

fn blocked_in_dashboard_mode(ctx: &AdminContext) -> Option<AdminResponse> {
    if ctx.config.use_db_app_configs {
        return Some(AdminResponse::json(
            500,
            &api_error("Due to enabled use_db_app_configs, please use the Dashboard API"),
        ));
    }
    None
}

fn definition_path(ctx: &AdminContext, api_id: &str) -> PathBuf {
    PathBuf::from(&ctx.config.app_path).join(format!("{}.json", api_id))
}

fn oas_path(ctx: &AdminContext, api_id: &str) -> PathBuf {
    PathBuf::from(&ctx.config.app_path).join(format!("{}-oas.json", api_id))
}

/// Persist a Classic definition; existing files are replaced.
pub(crate) fn write_definition(ctx: &AdminContext, definition: &ApiDefinition) -> Result<()> {
    write_json_file(&definition_path(ctx, &definition.api_id), definition)
}

/// Persist both forms of an OAS-flagged API.
pub(crate) fn write_oas_and_definition(
    ctx: &AdminContext,
    definition: &ApiDefinition,
    doc: &OasDocument,
) -> Result<()> {
    write_json_file(&definition_path(ctx, &definition.api_id), definition)?;
    write_json_file(&oas_path(ctx, &definition.api_id), doc)
}

fn write_json_file<T: serde::Serialize>(path: &PathBuf, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GatewayError::PersistenceFailure(e.to_string()))?;
    }
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| GatewayError::PersistenceFailure(format!("marshalling failed: {}", e)))?;
    std::fs::write(path, bytes).map_err(|e| {
        tracing::error!(path = %path.display(), error = %e, "Failed to write definition file");
        GatewayError::PersistenceFailure("file object creation failed, write error".to_string())
    })
}
