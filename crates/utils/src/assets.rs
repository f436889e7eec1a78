use directories::ProjectDirs;
use sha2::{Digest, Sha256};

const PROJECT_ROOT: &str = env!("CARGO_MANIFEST_DIR");

pub fn asset_dir() -> std::path::PathBuf {
    let path = if cfg!(debug_assertions) {
        std::path::PathBuf::from(PROJECT_ROOT).join("../../dev_assets")
    } else {
        ProjectDirs::from("dev", "loomworks", "loom")
            .expect("OS didn't give us a home directory")
            .data_dir()
            .to_path_buf()
    };

    // Ensure the directory exists
    if !path.exists() {
        std::fs::create_dir_all(&path).expect("Failed to create asset directory");
    }

    path
    // ✔ macOS → ~/Library/Application Support/loom
    // ✔ Linux → ~/.local/share/loom   (respects XDG_DATA_HOME)
    // ✔ Windows → %APPDATA%\loomworks\loom
}

/// Get the configuration directory path.
///
/// Respects the `LOOM_CONFIG_DIR` environment variable for custom locations.
/// Supports tilde expansion (e.g., `~/loom/config`).
///
/// Default: `{asset_dir}`
pub fn config_dir() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("LOOM_CONFIG_DIR") {
        let expanded = crate::path::expand_tilde(&path);
        if !expanded.exists() {
            std::fs::create_dir_all(&expanded).expect("Failed to create config directory");
        }
        return expanded;
    }
    asset_dir()
}

/// Get the database file path.
///
/// Respects the `LOOM_DATABASE_PATH` environment variable for custom locations.
/// Supports tilde expansion (e.g., `~/loom/db.sqlite`).
///
/// Default: `{asset_dir}/db.sqlite`
pub fn database_path() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("LOOM_DATABASE_PATH") {
        return crate::path::expand_tilde(&path);
    }
    asset_dir().join("db.sqlite")
}

/// Path to the port-range override file, if the user supplied one.
pub fn port_config_path() -> std::path::PathBuf {
    config_dir().join("ports.yaml")
}

/// Identifier for this installation, derived from the data directory.
///
/// Two installations on the same machine (different `LOOM_CONFIG_DIR`s)
/// get distinct identifiers, so per-installation files never collide.
pub fn install_id() -> String {
    let mut hasher = Sha256::new();
    hasher.update(config_dir().to_string_lossy().as_bytes());
    let hash = hasher.finalize();
    hash[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Path to the owned-pid file for this installation.
pub fn pid_file_path() -> std::path::PathBuf {
    config_dir().join(format!("loom-{}.pids", install_id()))
}

/// Path to the bundled production environment file (interpreter paths etc.).
pub fn production_env_path() -> std::path::PathBuf {
    asset_dir().join(".env.production")
}
