use std::{collections::HashMap, fs};

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub agent_url: Option<String>,
    pub topic_capacity: usize,
    pub retention_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8080".into(),
            agent_url: None,
            topic_capacity: 256,
            retention_seconds: 300,
            sweep_interval_seconds: 60,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("controller.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("bind_addr") {
                settings.server_bind = v.clone();
            }
            if let Some(v) = file_cfg.get("agent_url") {
                settings.agent_url = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("topic_capacity") {
                if let Ok(parsed) = v.parse::<usize>() {
                    settings.topic_capacity = parsed;
                }
            }
            if let Some(v) = file_cfg.get("retention_seconds") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.retention_seconds = parsed;
                }
            }
            if let Some(v) = file_cfg.get("sweep_interval_seconds") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.sweep_interval_seconds = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Ok(v) = std::env::var("AGENT_URL") {
        settings.agent_url = Some(v);
    }
    if let Ok(v) = std::env::var("APP__AGENT_URL") {
        settings.agent_url = Some(v);
    }

    if let Ok(v) = std::env::var("APP__TOPIC_CAPACITY") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.topic_capacity = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__RETENTION_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.retention_seconds = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__SWEEP_INTERVAL_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.sweep_interval_seconds = parsed;
        }
    }

    settings
}
