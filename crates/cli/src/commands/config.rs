use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tollgate_core::config::{AppConfig, LoadOptions, Setting, SETTINGS};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for setting in SETTINGS {
        let source = field_source(setting, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(setting.key, &setting.current_value(&config), source));
    }

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("tollgate.toml"), PathBuf::from("config/tollgate.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    setting: &Setting,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    let from_env = setting
        .env_vars
        .iter()
        .find(|var| env::var(var).is_ok_and(|value| !value.trim().is_empty()));
    if let Some(var) = from_env {
        return format!("env ({var})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, setting.key) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tollgate_core::config::SETTINGS;
    use toml::Value;

    use super::{contains_path, field_source};

    #[test]
    fn file_source_requires_the_full_key_path() {
        let doc: Value = "[workflow]\nrejection_policy = \"quorum\"\n".parse().expect("toml");
        let batch_size = SETTINGS
            .iter()
            .find(|setting| setting.key == "workflow.sweep_batch_size")
            .expect("known setting");

        assert!(contains_path(&doc, "workflow.rejection_policy"));
        assert!(!contains_path(&doc, "workflow.system_actor"));
        assert_eq!(field_source(batch_size, Some(&doc), Some(Path::new("tollgate.toml"))), "default");
    }
}
