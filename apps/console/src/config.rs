use std::{collections::HashMap, fs};

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_url: String,
    pub credential_file: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5500".into(),
            credential_file: "client.token".into(),
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("server_url") {
                settings.server_url = v.clone();
            }
            if let Some(v) = file_cfg.get("credential_file") {
                settings.credential_file = v.clone();
            }
        }
    }

    if let Ok(v) = std::env::var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_CREDENTIAL_FILE") {
        settings.credential_file = v;
    }

    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_the_local_backend() {
        let settings = Settings::default();
        assert_eq!(settings.server_url, "http://localhost:5500");
        assert_eq!(settings.credential_file, "client.token");
    }

    #[test]
    fn environment_overrides_the_defaults() {
        std::env::set_var("CHAT_SERVER_URL", "http://chat.example:9000");
        let settings = load_settings();
        assert_eq!(settings.server_url, "http://chat.example:9000");
        std::env::remove_var("CHAT_SERVER_URL");
    }
}
