use std::path::PathBuf;

fn parse_env_bool(var: &str) -> Option<bool> {
    std::env::var(var).ok().and_then(|value| {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "1" | "true" | "yes" | "on" | "enable" | "enabled" => Some(true),
            "0" | "false" | "no" | "off" | "disable" | "disabled" => Some(false),
            _ => None,
        }
    })
}

fn non_empty_var(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn home_override() -> Option<PathBuf> {
    non_empty_var("WEBUI_FETCH_HOME").map(PathBuf::from)
}

pub fn env_name_override() -> Option<String> {
    non_empty_var("WEBUI_FETCH_ENV")
}

pub fn catalog_dir_override() -> Option<PathBuf> {
    non_empty_var("WEBUI_FETCH_CATALOG_DIR").map(PathBuf::from)
}

pub fn concurrency_override() -> Option<usize> {
    non_empty_var("WEBUI_FETCH_CONCURRENCY")
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

/// Kaggle kernels export `KAGGLE_KERNEL_RUN_TYPE`; `WEBUI_FETCH_KAGGLE` forces either way.
pub fn running_on_kaggle() -> bool {
    parse_env_bool("WEBUI_FETCH_KAGGLE")
        .unwrap_or_else(|| std::env::var_os("KAGGLE_KERNEL_RUN_TYPE").is_some())
}
