//! Loading and normalizing provider records from JSON or CSV.
//!
//! Field names in both source formats are inconsistent (snake_case,
//! camelCase, CSV headers like `Base_URL`/`APIKey`); this module performs a
//! single normalization pass onto the canonical [`Provider`] record so the
//! rest of the crate never has to think about source formatting again.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use super::types::{ApiKeyRef, ModelEntry, Provider, ProviderMetadata, RateLimits};

#[derive(Debug, Default)]
pub struct LoadedCatalog {
    pub providers: BTreeMap<String, Provider>,
    pub models: Vec<ModelEntry>,
    pub warnings: Vec<String>,
}

fn get_str<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| v.get(k)).and_then(|x| x.as_str())
}

fn get_f64(v: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find_map(|k| v.get(k))
        .and_then(|x| x.as_f64().or_else(|| x.as_str().and_then(|s| s.parse().ok())))
}

fn get_u32(v: &Value, keys: &[&str]) -> Option<u32> {
    get_f64(v, keys).map(|f| f.max(0.0) as u32)
}

fn get_bool(v: &Value, keys: &[&str]) -> bool {
    keys.iter()
        .find_map(|k| v.get(k))
        .and_then(|x| x.as_bool().or_else(|| x.as_str().map(|s| s.eq_ignore_ascii_case("true"))))
        .unwrap_or(false)
}

fn normalize_base_url(raw: &str, warnings: &mut Vec<String>) -> String {
    match reqwest::Url::parse(raw) {
        Ok(u) => u.to_string(),
        Err(_) => {
            warnings.push(format!("provider base_url did not parse as a URL: {raw}"));
            raw.to_string()
        }
    }
}

/// Normalize one provider-shaped JSON object into a [`Provider`]. `name`
/// may be supplied by the caller (e.g. derived from a CSV `Name` column or
/// a JSON map key) when the object itself doesn't carry one.
pub fn normalize_provider_value(
    name_hint: Option<&str>,
    v: &Value,
    warnings: &mut Vec<String>,
) -> Provider {
    let name = get_str(v, &["name", "Name"])
        .or(name_hint)
        .unwrap_or("unnamed")
        .to_string();
    let base_url_raw = get_str(v, &["base_url", "Base_URL", "baseUrl", "url"]).unwrap_or("");
    let base_url = normalize_base_url(base_url_raw, warnings);

    let api_key_literal = get_str(v, &["api_key", "APIKey", "apiKey"]).map(str::to_string);
    let api_key_env = get_str(v, &["api_key_env_var", "apiKeyEnvVar", "ApiKeyEnvVar"]).map(str::to_string);
    let api_key_ref = match (api_key_literal, api_key_env) {
        (Some(k), _) if !k.is_empty() => ApiKeyRef::Literal(k),
        (_, Some(env)) if !env.is_empty() => ApiKeyRef::EnvVar(env),
        _ => ApiKeyRef::None,
    };

    let upstream_model_id = get_str(
        v,
        &["upstream_model_id", "upstreamModelId", "model", "Model"],
    )
    .unwrap_or(&name)
    .to_string();

    let priority = get_f64(v, &["priority", "Priority"]).unwrap_or(100.0) as i64;
    let token_multiplier = get_f64(v, &["token_multiplier", "tokenMultiplier"]).unwrap_or(1.0);

    let meta_obj = v.get("metadata").cloned().unwrap_or_else(|| v.clone());
    let metadata = ProviderMetadata {
        is_free: get_bool(&meta_obj, &["is_free", "isFree"]),
        premium_model: get_bool(&meta_obj, &["premium_model", "premiumModel"]),
        tier: get_str(&meta_obj, &["tier", "Tier"]).map(str::to_string),
        cost_per_token: get_f64(&meta_obj, &["cost_per_token", "costPerToken"]).unwrap_or(0.0),
        premium_only: get_bool(&meta_obj, &["premium_only", "premiumOnly"]),
        paid_model: get_bool(&meta_obj, &["paid_model", "paidModel"]),
    };

    let rl_obj = v.get("rate_limits").cloned().unwrap_or_else(|| v.clone());
    let rate_limits = RateLimits {
        rpm: get_u32(&rl_obj, &["rpm", "RPM"]).unwrap_or(60),
        tpm: get_u32(&rl_obj, &["tpm", "TPM"]).unwrap_or(100_000),
        concurrent: get_u32(&rl_obj, &["concurrent", "Concurrent"]).unwrap_or(10),
    };

    let max_concurrent_requests = get_u32(v, &["capacity", "max_concurrent_requests"]).unwrap_or(10);

    let capabilities = v
        .get("capabilities")
        .and_then(|x| x.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|x| x.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    if name.is_empty() || base_url.is_empty() {
        warnings.push(format!(
            "provider {name:?} missing required field (name/base_url)"
        ));
    }

    Provider {
        name,
        base_url,
        api_key_ref,
        upstream_model_id,
        priority,
        token_multiplier,
        metadata,
        rate_limits,
        max_concurrent_requests,
        capabilities,
    }
}

/// Load the `{endpoints:{"<path>":{models:{"<id>":[<provider>,...]}}}}`
/// JSON shape.
pub fn load_json(raw: &str) -> anyhow::Result<LoadedCatalog> {
    let doc: Value = serde_json::from_str(raw)?;
    let mut out = LoadedCatalog::default();
    let endpoints = doc.get("endpoints").and_then(|v| v.as_object());
    let Some(endpoints) = endpoints else {
        anyhow::bail!("providers JSON missing top-level `endpoints` object");
    };

    for (endpoint_path, endpoint_val) in endpoints {
        let Some(models) = endpoint_val.get("models").and_then(|v| v.as_object()) else {
            continue;
        };
        for (logical_id, providers_arr) in models {
            let Some(arr) = providers_arr.as_array() else {
                continue;
            };
            let mut provider_names = Vec::new();
            for pv in arr {
                let provider = normalize_provider_value(None, pv, &mut out.warnings);
                provider_names.push(provider.name.clone());
                out.providers
                    .entry(provider.name.clone())
                    .or_insert(provider);
            }
            out.models.push(ModelEntry {
                logical_id: logical_id.clone(),
                endpoint_path: endpoint_path.clone(),
                providers: provider_names,
                owner: "system".to_string(),
                token_multiplier: 1.0,
            });
        }
    }
    Ok(out)
}

/// Load the CSV shape: one row per (provider, model, endpoint)
/// combination, headers including `Name, Base_URL, APIKey, Model(s) list
/// endpoint`.
pub fn load_csv(raw: &str) -> anyhow::Result<LoadedCatalog> {
    let mut out = LoadedCatalog::default();
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(raw.as_bytes());
    let headers = rdr.headers()?.clone();

    // Group providers by (endpoint, model) to build ModelEntry lists in the
    // order rows appear in the file.
    let mut grouped: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
    let mut order: Vec<(String, String)> = Vec::new();

    for result in rdr.records() {
        let record = result?;
        let mut obj = serde_json::Map::new();
        for (h, f) in headers.iter().zip(record.iter()) {
            obj.insert(h.to_string(), Value::String(f.to_string()));
        }
        let value = Value::Object(obj);
        let endpoint = get_str(
            &value,
            &[
                "endpoint",
                "Endpoint",
                "Model(s) list endpoint",
                "endpoint_path",
            ],
        )
        .unwrap_or("/v1/chat/completions")
        .to_string();
        let model = get_str(&value, &["model", "Model", "logical_id"]).unwrap_or("").to_string();

        let provider = normalize_provider_value(
            get_str(&value, &["Name", "name"]),
            &value,
            &mut out.warnings,
        );
        let key = (endpoint.clone(), model.clone());
        if !grouped.contains_key(&key) {
            order.push(key.clone());
        }
        grouped.entry(key).or_default().push(provider.name.clone());
        out.providers
            .entry(provider.name.clone())
            .or_insert(provider);
    }

    for (endpoint, model) in order {
        let providers = grouped.get(&(endpoint.clone(), model.clone())).cloned().unwrap_or_default();
        out.models.push(ModelEntry {
            logical_id: model,
            endpoint_path: endpoint,
            providers,
            owner: "system".to_string(),
            token_multiplier: 1.0,
        });
    }

    Ok(out)
}

pub fn load_from_path(path: &Path) -> anyhow::Result<LoadedCatalog> {
    let raw = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => load_csv(&raw),
        _ => load_json(&raw),
    }
}
