use std::{collections::HashMap, fs};

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("docchat.toml") {
        apply_file_config(&mut settings, &raw);
    }

    if let Ok(v) = std::env::var("DOCCHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("APP__SERVER_URL") {
        settings.server_url = v;
    }

    settings
}

fn apply_file_config(settings: &mut Settings, raw: &str) {
    if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(raw) {
        if let Some(v) = file_cfg.get("server_url") {
            settings.server_url = v.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_local_backend() {
        assert_eq!(Settings::default().server_url, "http://127.0.0.1:5000");
    }

    #[test]
    fn file_config_overrides_server_url() {
        let mut settings = Settings::default();
        apply_file_config(&mut settings, "server_url = \"http://example.org:8080\"\n");
        assert_eq!(settings.server_url, "http://example.org:8080");
    }

    #[test]
    fn malformed_file_config_is_ignored() {
        let mut settings = Settings::default();
        apply_file_config(&mut settings, "server_url = [not toml");
        assert_eq!(settings.server_url, Settings::default().server_url);
    }
}
