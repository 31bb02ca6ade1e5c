use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use till_service::ServiceName;

use crate::config::{DesktopConfig, Endpoint};
use crate::platform::{CommandSpec, Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStrategy {
    /// Spawn an external command (interpreter or package manager).
    Command,
    /// Run the standalone server build on the bundled JS runtime, so no
    /// separate runtime install is needed.
    EmbeddedRuntime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub strategy: LaunchStrategy,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Applied on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub name: ServiceName,
    pub endpoint: Endpoint,
    pub launch: LaunchSpec,
}

impl ServiceDefinition {
    pub fn url(&self) -> String {
        self.endpoint.url()
    }

    pub fn health_url(&self) -> String {
        self.endpoint.health_url()
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port
    }
}

pub fn backend_definition(cfg: &DesktopConfig, interpreter: &Path) -> ServiceDefinition {
    let mut env = BTreeMap::new();
    env.insert("HOST".to_string(), cfg.backend.host.clone());
    env.insert("PORT".to_string(), cfg.backend.port.to_string());
    env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
    env.insert("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string());
    env.insert(
        "APP_ENV".to_string(),
        if cfg.dev { "development" } else { "production" }.to_string(),
    );

    ServiceDefinition {
        name: ServiceName::Backend,
        endpoint: cfg.backend.clone(),
        launch: LaunchSpec {
            strategy: LaunchStrategy::Command,
            program: interpreter.display().to_string(),
            args: vec![cfg.backend_entry.clone()],
            cwd: cfg.backend_dir.clone(),
            env,
        },
    }
}

/// Server entry of the standalone production build.
pub fn standalone_server_entry(cfg: &DesktopConfig) -> PathBuf {
    cfg.frontend_dir.join("server").join("server.js")
}

pub fn bundled_runtime(cfg: &DesktopConfig, platform: &dyn Platform) -> PathBuf {
    cfg.resources_dir
        .join("runtime")
        .join(platform.bundled_runtime_name())
}

pub fn frontend_definition(
    cfg: &DesktopConfig,
    platform: &dyn Platform,
    backend_url: &str,
) -> ServiceDefinition {
    let mut env = BTreeMap::new();
    env.insert("PORT".to_string(), cfg.frontend.port.to_string());
    env.insert("HOSTNAME".to_string(), cfg.frontend.host.clone());
    env.insert("NEXT_PUBLIC_API_URL".to_string(), backend_url.to_string());
    env.insert("API_BASE_URL".to_string(), backend_url.to_string());

    let entry = standalone_server_entry(cfg);
    let runtime = bundled_runtime(cfg, platform);

    let launch = if !cfg.dev && entry.is_file() && runtime.is_file() {
        // The standalone build keeps server.js apart from node_modules, which
        // sits one level above the server directory.
        let server_dir = entry.parent().unwrap_or(&cfg.frontend_dir);
        let modules = server_dir
            .parent()
            .unwrap_or(&cfg.frontend_dir)
            .join("node_modules");
        env.insert("NODE_ENV".to_string(), "production".to_string());
        env.insert("NODE_PATH".to_string(), modules.display().to_string());
        LaunchSpec {
            strategy: LaunchStrategy::EmbeddedRuntime,
            program: runtime.display().to_string(),
            args: vec![entry.display().to_string()],
            cwd: server_dir.to_path_buf(),
            env,
        }
    } else {
        let pm: CommandSpec = platform.package_manager();
        let mut args = pm.args;
        if cfg.dev {
            args.extend(["run".to_string(), "dev".to_string()]);
        } else {
            env.insert("NODE_ENV".to_string(), "production".to_string());
            args.push("start".to_string());
        }
        LaunchSpec {
            strategy: LaunchStrategy::Command,
            program: pm.program,
            args,
            cwd: cfg.frontend_dir.clone(),
            env,
        }
    };

    ServiceDefinition {
        name: ServiceName::Frontend,
        endpoint: cfg.frontend.clone(),
        launch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Posix, Windows};

    fn cfg(root: &Path) -> DesktopConfig {
        DesktopConfig::with_resources_dir(root.join("resources"))
    }

    #[test]
    fn backend_runs_entry_with_interpreter() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = cfg(tmp.path());
        let def = backend_definition(&cfg, Path::new("/venv/bin/python"));
        assert_eq!(def.launch.program, "/venv/bin/python");
        assert_eq!(def.launch.args, vec!["app.py"]);
        assert_eq!(def.launch.cwd, cfg.backend_dir);
        assert_eq!(def.launch.env.get("PORT").map(String::as_str), Some("5000"));
        assert_eq!(def.health_url(), "http://127.0.0.1:5000/api/health");
    }

    #[test]
    fn frontend_receives_backend_url() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = cfg(tmp.path());
        let def = frontend_definition(&cfg, &Posix, "http://127.0.0.1:5000");
        assert_eq!(
            def.launch.env.get("NEXT_PUBLIC_API_URL").map(String::as_str),
            Some("http://127.0.0.1:5000")
        );
        assert_eq!(def.launch.strategy, LaunchStrategy::Command);
        assert_eq!(def.launch.display(), "npm start");
    }

    #[test]
    fn dev_mode_uses_dev_script_even_with_standalone_build() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = cfg(tmp.path());
        cfg.dev = true;
        std::fs::create_dir_all(cfg.frontend_dir.join("server")).unwrap();
        std::fs::write(standalone_server_entry(&cfg), b"").unwrap();
        std::fs::create_dir_all(cfg.resources_dir.join("runtime")).unwrap();
        std::fs::write(bundled_runtime(&cfg, &Posix), b"").unwrap();

        let def = frontend_definition(&cfg, &Posix, "http://127.0.0.1:5000");
        assert_eq!(def.launch.display(), "npm run dev");
    }

    #[test]
    fn standalone_build_uses_embedded_runtime_with_shared_modules() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = cfg(tmp.path());
        std::fs::create_dir_all(cfg.frontend_dir.join("server")).unwrap();
        std::fs::write(standalone_server_entry(&cfg), b"").unwrap();
        std::fs::create_dir_all(cfg.resources_dir.join("runtime")).unwrap();
        std::fs::write(bundled_runtime(&cfg, &Posix), b"").unwrap();

        let def = frontend_definition(&cfg, &Posix, "http://127.0.0.1:5000");
        assert_eq!(def.launch.strategy, LaunchStrategy::EmbeddedRuntime);
        assert_eq!(
            def.launch.env.get("NODE_PATH").map(PathBuf::from),
            Some(cfg.frontend_dir.join("node_modules"))
        );
        assert_eq!(def.launch.cwd, cfg.frontend_dir.join("server"));
    }

    #[test]
    fn windows_goes_through_the_shell_for_npm() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = cfg(tmp.path());
        let def = frontend_definition(&cfg, &Windows, "http://127.0.0.1:5000");
        assert_eq!(def.launch.display(), "cmd /C npm.cmd start");
    }
}
