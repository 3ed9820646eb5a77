use crate::config::{ConfigError, PartialResponsePolicy, Settings};
use clap::ValueEnum;
use std::collections::BTreeMap;

/// Keys `/set` may change while the session runs.
pub const SETTABLE_KEYS: &[&str] = &["chat_model", "top_k", "partial_policy"];

/// Mask API keys for display
pub fn mask_api_key(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "*".repeat(chars.len())
    }
}

fn policy_name(policy: PartialResponsePolicy) -> String {
    policy
        .to_possible_value()
        .map(|v| v.get_name().to_string())
        .unwrap_or_default()
}

/// Current settings as display strings, API keys masked.
pub fn get_settings(settings: &Settings) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    let mut put = |key: &str, value: String| {
        map.insert(key.to_string(), value);
    };

    put(
        "provider",
        settings
            .provider
            .to_possible_value()
            .map(|v| v.get_name().to_string())
            .unwrap_or_default(),
    );
    if let Some(key) = &settings.openai_api_key {
        put("openai_api_key", mask_api_key(key));
    }
    put("openai_base_url", settings.openai_base_url.clone());
    if let Some(key) = &settings.claude_api_key {
        put("claude_api_key", mask_api_key(key));
    }
    put("claude_base_url", settings.claude_base_url.clone());
    put("ollama_host", settings.ollama_host.clone());
    put("chat_model", settings.chat_model.clone());
    put("caption_model", settings.caption_model.clone());
    put("embedding_model", settings.embedding_model.clone());
    put("caption_max_tokens", settings.caption_max_tokens.to_string());
    put("top_k", settings.top_k.to_string());
    put("embedding_batch_size", settings.embedding_batch_size.to_string());
    put("scratch_dir", settings.scratch_dir.display().to_string());
    put("partial_policy", policy_name(settings.partial_policy));
    put("plain", settings.plain.to_string());

    let h = &settings.heuristics;
    put("header_text_ratio", h.header_text_ratio.to_string());
    put("max_header_rows", h.max_header_rows.to_string());
    put("min_filled_fraction", h.min_filled_fraction.to_string());
    put("line_tolerance", h.line_tolerance.to_string());
    put("row_tol", h.row_tol.to_string());
    put("column_tolerance", h.column_tolerance.to_string());
    map
}

pub fn set_setting(settings: &mut Settings, key: &str, value: &str) -> Result<(), ConfigError> {
    let invalid = |key: &'static str, reason: String| ConfigError::Invalid { key, reason };
    match key {
        "chat_model" => {
            if value.trim().is_empty() {
                return Err(invalid("chat_model", "must not be empty".into()));
            }
            settings.chat_model = value.trim().to_string();
        }
        "top_k" => {
            let top_k: usize = value
                .parse()
                .map_err(|e| invalid("top_k", format!("{}", e)))?;
            if top_k == 0 {
                return Err(invalid("top_k", "must be at least 1".into()));
            }
            settings.top_k = top_k;
        }
        "partial_policy" => {
            settings.partial_policy = PartialResponsePolicy::from_str(value, true)
                .map_err(|e| invalid("partial_policy", e))?;
        }
        other => {
            return Err(ConfigError::UnknownKey(other.to_string()));
        }
    }
    Ok(())
}
