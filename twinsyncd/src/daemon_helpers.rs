fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_var(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_var(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn log_status(name: &str, status: ProviderStatus) {
    match status {
        ProviderStatus::Ready => info!(provider = name, "provider ready"),
        ProviderStatus::Connected => info!(provider = name, "provider connected, not ready"),
        ProviderStatus::Unauthorized => {
            warn!(provider = name, "provider refused access, keeping it not ready")
        }
        ProviderStatus::Disconnected => warn!(provider = name, "provider unreachable"),
    }
}
