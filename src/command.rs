/// The child invocation: program, arguments and the environment additions
/// layered on top of the inherited environment.
use crate::config::LauncherConfig;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Extra variables; everything else is inherited from the launcher.
    pub env: Vec<(String, String)>,
}

impl ServerCommand {
    /// `<command> <package> [extra_args..] <db_path>` with the module path
    /// and cache directory variables pointing into `install_dir`.
    pub fn sqlite_server(config: &LauncherConfig, install_dir: &Path, db_path: &Path) -> Self {
        let mut args = Vec::with_capacity(config.server.extra_args.len() + 2);
        args.push(config.server.package.clone());
        args.extend(config.server.extra_args.iter().cloned());
        args.push(db_path.to_string_lossy().into_owned());

        let env_config = &config.environment;
        let cache_dir = install_dir.join(&env_config.cache_dir_name);
        let env = vec![
            (
                env_config.module_path_var.clone(),
                install_dir.to_string_lossy().into_owned(),
            ),
            (
                env_config.cache_dir_var.clone(),
                cache_dir.to_string_lossy().into_owned(),
            ),
        ];

        Self {
            program: config.server.command.clone(),
            args,
            env,
        }
    }
}
