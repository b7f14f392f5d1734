//! Repository filesystem layout.
//!
//! Three directories under the configured repo path (startup data,
//! notification replay data, YANG modules), created on first init with
//! configured permissions. A per-module startup file is copied to the
//! running-datastore file on first attach of the module.

use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::PathBuf;

use vela::config::VelaConfig;
use vela::consts::{DATA_DIR, NOTIF_DIR, REPO_LOCK_FILE, YANG_DIR};

use crate::error::ShmResult;
use crate::store::ShmStore;

/// Path of the advisory repo lock file.
pub fn repo_lock_path(config: &VelaConfig) -> PathBuf {
    config.repo_path.join(REPO_LOCK_FILE)
}

/// Path of a module's startup datastore file.
pub fn startup_data_path(config: &VelaConfig, module: &str) -> PathBuf {
    config.repo_path.join(DATA_DIR).join(format!("{module}.startup"))
}

/// Path of a module's running-datastore file.
pub fn running_data_path(config: &VelaConfig, module: &str) -> PathBuf {
    config.shm_dir.join(format!("vela_{module}.running"))
}

/// Create the repository directories that do not exist yet.
pub fn init_dirs(config: &VelaConfig) -> ShmResult<()> {
    let dirs = [
        config.repo_path.clone(),
        config.repo_path.join(DATA_DIR),
        config.repo_path.join(NOTIF_DIR),
        config.repo_path.join(YANG_DIR),
    ];
    for dir in dirs {
        if !dir.exists() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(config.dir_mode)
                .create(&dir)?;
        }
    }
    Ok(())
}

/// Copy each module's startup file to its running-datastore file where
/// the latter does not exist yet. Returns how many copies were made.
pub fn ensure_running_data(store: &ShmStore, config: &VelaConfig) -> ShmResult<usize> {
    let mut copied = 0;
    for idx in 0..store.main().module_count() {
        let name = store.module_name(idx)?;
        let startup = startup_data_path(config, name);
        let running = running_data_path(config, name);
        if startup.exists() && !running.exists() {
            fs::copy(&startup, &running)?;
            fs::set_permissions(&running, fs::Permissions::from_mode(config.file_mode))?;
            tracing::debug!(module = name, "running datastore initialized from startup");
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModuleImport;

    fn test_config(dir: &std::path::Path) -> VelaConfig {
        VelaConfig {
            repo_path: dir.join("repo"),
            shm_dir: dir.join("shm"),
            ..Default::default()
        }
    }

    #[test]
    fn init_dirs_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.shm_dir).unwrap();
        init_dirs(&config).unwrap();

        assert!(config.repo_path.join(DATA_DIR).is_dir());
        assert!(config.repo_path.join(NOTIF_DIR).is_dir());
        assert!(config.repo_path.join(YANG_DIR).is_dir());
        // Idempotent.
        init_dirs(&config).unwrap();
    }

    #[test]
    fn startup_files_seed_running_data_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.shm_dir).unwrap();
        init_dirs(&config).unwrap();

        let (mut store, _) = ShmStore::open(&config.repo_path, 0o600).unwrap();
        store
            .add_modules(&[ModuleImport {
                name: "m1".to_owned(),
                ..Default::default()
            }])
            .unwrap();

        // No startup file yet: nothing copied.
        assert_eq!(ensure_running_data(&store, &config).unwrap(), 0);

        fs::write(startup_data_path(&config, "m1"), b"<startup/>").unwrap();
        assert_eq!(ensure_running_data(&store, &config).unwrap(), 1);
        assert_eq!(
            fs::read(running_data_path(&config, "m1")).unwrap(),
            b"<startup/>"
        );

        // Second attach leaves the running file alone.
        fs::write(running_data_path(&config, "m1"), b"<changed/>").unwrap();
        assert_eq!(ensure_running_data(&store, &config).unwrap(), 0);
        assert_eq!(
            fs::read(running_data_path(&config, "m1")).unwrap(),
            b"<changed/>"
        );
    }
}
