use std::{
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
};

use crate::config::DesktopConfig;
use crate::error::{Result, StartupError};
use crate::platform::{CommandSpec, Platform};

const EXPECTED_VERSION_PREFIX: &str = "Python 3";
const MAX_STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs short-lived helper commands (version checks, venv creation, pip).
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> impl Future<Output = std::io::Result<CommandOutput>> + Send;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> impl Future<Output = std::io::Result<CommandOutput>> + Send {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        async move {
            let out = cmd.output().await?;
            Ok(CommandOutput {
                success: out.status.success(),
                code: out.status.code(),
                stdout: String::from_utf8_lossy(&out.stdout).to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpreterSource {
    Bundled,
    ExistingEnvironment,
    CreatedEnvironment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInterpreter {
    pub path: PathBuf,
    pub source: InterpreterSource,
}

/// Where interpreters and the isolated environment live on disk.
#[derive(Debug, Clone)]
pub struct RuntimeLayout {
    pub bundled_interpreter: PathBuf,
    pub env_dir: PathBuf,
    pub backend_dir: PathBuf,
    pub requirements: PathBuf,
    pub marker_package: String,
}

impl RuntimeLayout {
    pub fn from_config(cfg: &DesktopConfig, platform: &dyn Platform) -> Self {
        let bundled_interpreter = cfg
            .resources_dir
            .join("python")
            .join(platform.environment_bin_dir())
            .join(platform.interpreter_name());

        // Installs under Program Files are not writable for regular users.
        let env_dir = if cfg.packaged && platform.is_windows() {
            dirs::data_dir()
                .map(|d| d.join("till").join("venv"))
                .unwrap_or_else(|| cfg.backend_dir.join("venv"))
        } else {
            cfg.backend_dir.join("venv")
        };

        Self {
            bundled_interpreter,
            env_dir,
            backend_dir: cfg.backend_dir.clone(),
            requirements: cfg.backend_dir.join("requirements.txt"),
            marker_package: cfg.marker_package.clone(),
        }
    }

    pub fn env_interpreter(&self, platform: &dyn Platform) -> PathBuf {
        self.env_dir
            .join(platform.environment_bin_dir())
            .join(platform.interpreter_name())
    }
}

fn tail(s: &str, max_bytes: usize) -> String {
    let s = s.trim();
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut start = s.len() - max_bytes;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    format!("…{}", &s[start..])
}

pub struct RuntimeLocator<R = SystemRunner> {
    layout: RuntimeLayout,
    platform: &'static dyn Platform,
    runner: R,
}

impl RuntimeLocator<SystemRunner> {
    pub fn new(layout: RuntimeLayout, platform: &'static dyn Platform) -> Self {
        Self::with_runner(layout, platform, SystemRunner)
    }
}

impl<R: CommandRunner> RuntimeLocator<R> {
    pub fn with_runner(layout: RuntimeLayout, platform: &'static dyn Platform, runner: R) -> Self {
        Self {
            layout,
            platform,
            runner,
        }
    }

    /// Bundled copy, then an existing environment, then a fresh environment
    /// built from a system interpreter.
    pub async fn resolve_interpreter(&self) -> Result<ResolvedInterpreter> {
        let mut tried = Vec::<String>::new();

        let bundled = &self.layout.bundled_interpreter;
        if bundled.is_file() {
            tracing::info!(path = %bundled.display(), "using bundled python");
            return Ok(ResolvedInterpreter {
                path: bundled.clone(),
                source: InterpreterSource::Bundled,
            });
        }
        tried.push(format!("bundled interpreter: {}", bundled.display()));

        let env_python = self.layout.env_interpreter(self.platform);
        if env_python.is_file() {
            if self.dependencies_installed() {
                tracing::debug!(path = %env_python.display(), "backend environment is ready");
            } else {
                tracing::info!(
                    env = %self.layout.env_dir.display(),
                    "backend dependencies missing; installing"
                );
                self.install_requirements(&env_python).await?;
            }
            return Ok(ResolvedInterpreter {
                path: env_python,
                source: InterpreterSource::ExistingEnvironment,
            });
        }
        tried.push(format!("virtual environment: {}", env_python.display()));

        for candidate in self.platform.interpreter_candidates() {
            if !self.check_version(&candidate).await {
                tried.push(format!("system interpreter: {}", candidate.display()));
                continue;
            }
            let resolved = self.resolve_full_path(&candidate).await;
            tracing::info!(
                interpreter = %resolved.display(),
                env = %self.layout.env_dir.display(),
                "creating backend environment"
            );
            self.create_environment(&resolved).await?;
            self.install_requirements(&env_python).await?;
            return Ok(ResolvedInterpreter {
                path: env_python,
                source: InterpreterSource::CreatedEnvironment,
            });
        }

        Err(StartupError::InterpreterNotFound { tried })
    }

    /// Filesystem check for the marker package; never runs the interpreter.
    pub fn dependencies_installed(&self) -> bool {
        self.platform
            .site_packages_dirs(&self.layout.env_dir)
            .iter()
            .any(|dir| dir.join(&self.layout.marker_package).exists())
    }

    async fn check_version(&self, candidate: &CommandSpec) -> bool {
        let mut args = candidate.args.clone();
        args.push("--version".to_string());
        match self.runner.run(&candidate.program, &args, None).await {
            // Python 2 printed its version on stderr.
            Ok(out) => {
                out.success
                    && (out.stdout.trim_start().starts_with(EXPECTED_VERSION_PREFIX)
                        || out.stderr.trim_start().starts_with(EXPECTED_VERSION_PREFIX))
            }
            Err(_) => false,
        }
    }

    /// Full path of `candidate` with its leading args, or the bare command.
    async fn resolve_full_path(&self, candidate: &CommandSpec) -> CommandSpec {
        let which = self.platform.which_command();
        let args = vec![candidate.program.clone()];
        let program = match self.runner.run(which, &args, None).await {
            Ok(out) if out.success => out
                .stdout
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| candidate.program.clone()),
            _ => candidate.program.clone(),
        };
        CommandSpec {
            program,
            args: candidate.args.clone(),
        }
    }

    async fn create_environment(&self, python: &CommandSpec) -> Result<()> {
        if let Some(parent) = self.layout.env_dir.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StartupError::environment(format!(
                    "create directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let mut args = python.args.clone();
        args.extend([
            "-m".to_string(),
            "venv".to_string(),
            self.layout.env_dir.display().to_string(),
        ]);
        let out = self
            .runner
            .run(&python.program, &args, None)
            .await
            .map_err(|e| StartupError::environment(format!("run {}: {e}", python.display())))?;
        if !out.success {
            return Err(StartupError::environment(format!(
                "`{} -m venv` exited with {:?}: {}",
                python.display(),
                out.code,
                tail(&out.stderr, MAX_STDERR_TAIL_BYTES)
            )));
        }
        Ok(())
    }

    async fn install_requirements(&self, env_python: &Path) -> Result<()> {
        let manifest = &self.layout.requirements;
        if !manifest.is_file() {
            return Err(StartupError::environment(format!(
                "dependency manifest not found: {}",
                manifest.display()
            )));
        }

        let program = env_python.display().to_string();
        let args = vec![
            "-m".to_string(),
            "pip".to_string(),
            "install".to_string(),
            "--disable-pip-version-check".to_string(),
            "-r".to_string(),
            manifest.display().to_string(),
        ];
        tracing::info!(manifest = %manifest.display(), "installing backend dependencies");
        let out = self
            .runner
            .run(&program, &args, Some(&self.layout.backend_dir))
            .await
            .map_err(|e| StartupError::environment(format!("run pip: {e}")))?;
        if !out.success {
            return Err(StartupError::environment(format!(
                "pip install -r {} exited with {:?}: {}",
                manifest.display(),
                out.code,
                tail(&out.stderr, MAX_STDERR_TAIL_BYTES)
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::platform::Posix;

    type Responder = dyn Fn(&str, &[String]) -> std::io::Result<CommandOutput> + Send + Sync;

    struct FakeRunner {
        calls: Mutex<Vec<String>>,
        respond: Box<Responder>,
    }

    impl FakeRunner {
        fn new(respond: impl Fn(&str, &[String]) -> std::io::Result<CommandOutput> + Send + Sync + 'static) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for &FakeRunner {
        fn run(
            &self,
            program: &str,
            args: &[String],
            _cwd: Option<&Path>,
        ) -> impl Future<Output = std::io::Result<CommandOutput>> + Send {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{program} {}", args.join(" ")));
            let res = (self.respond)(program, args);
            async move { res }
        }
    }

    fn ok(stdout: &str) -> std::io::Result<CommandOutput> {
        Ok(CommandOutput {
            success: true,
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    fn not_found() -> std::io::Result<CommandOutput> {
        Err(std::io::Error::from(std::io::ErrorKind::NotFound))
    }

    fn layout(root: &Path) -> RuntimeLayout {
        let mut cfg = DesktopConfig::with_resources_dir(root.join("resources"));
        cfg.backend_dir = root.join("backend");
        RuntimeLayout::from_config(&cfg, &Posix)
    }

    fn write_file(p: &Path) {
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, b"").unwrap();
    }

    fn make_env(layout: &RuntimeLayout, with_marker: bool) {
        write_file(&layout.env_interpreter(&Posix));
        let sp = layout.env_dir.join("lib/python3.12/site-packages");
        std::fs::create_dir_all(&sp).unwrap();
        if with_marker {
            std::fs::create_dir_all(sp.join(&layout.marker_package)).unwrap();
        }
    }

    #[tokio::test]
    async fn bundled_interpreter_short_circuits() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        write_file(&layout.bundled_interpreter);
        let runner = FakeRunner::new(|_, _| not_found());

        let locator = RuntimeLocator::with_runner(layout.clone(), &Posix, &runner);
        let got = locator.resolve_interpreter().await.unwrap();
        assert_eq!(got.source, InterpreterSource::Bundled);
        assert_eq!(got.path, layout.bundled_interpreter);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn existing_environment_with_dependencies_runs_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        make_env(&layout, true);
        let runner = FakeRunner::new(|_, _| not_found());

        let locator = RuntimeLocator::with_runner(layout.clone(), &Posix, &runner);
        for _ in 0..2 {
            let got = locator.resolve_interpreter().await.unwrap();
            assert_eq!(got.source, InterpreterSource::ExistingEnvironment);
        }
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn existing_environment_without_marker_installs_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        make_env(&layout, false);
        write_file(&layout.requirements);
        let runner = FakeRunner::new(|_, _| ok(""));

        let locator = RuntimeLocator::with_runner(layout.clone(), &Posix, &runner);
        locator.resolve_interpreter().await.unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("-m pip install"));
        assert!(calls[0].contains("requirements.txt"));
    }

    #[tokio::test]
    async fn system_interpreter_creates_environment_once() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        write_file(&layout.requirements);

        let env_layout = layout.clone();
        let runner = FakeRunner::new(move |program, args| match (program, args) {
            ("python3", [v]) if v == "--version" => ok("Python 3.12.1\n"),
            ("which", [c]) if c == "python3" => ok("/usr/bin/python3\n"),
            ("/usr/bin/python3", [m, venv, _]) if m == "-m" && venv == "venv" => {
                make_env(&env_layout, false);
                ok("")
            }
            (_, [m, pip, ..]) if m == "-m" && pip == "pip" => {
                make_env(&env_layout, true);
                ok("")
            }
            _ => not_found(),
        });

        let locator = RuntimeLocator::with_runner(layout.clone(), &Posix, &runner);
        let first = locator.resolve_interpreter().await.unwrap();
        assert_eq!(first.source, InterpreterSource::CreatedEnvironment);
        assert_eq!(first.path, layout.env_interpreter(&Posix));
        assert_eq!(runner.calls().len(), 4);

        let second = locator.resolve_interpreter().await.unwrap();
        assert_eq!(second.source, InterpreterSource::ExistingEnvironment);
        assert_eq!(runner.calls().len(), 4);
    }

    #[tokio::test]
    async fn which_failure_falls_back_to_bare_command() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        write_file(&layout.requirements);
        let runner = FakeRunner::new(|program, args| match (program, args) {
            ("python3", [v]) if v == "--version" => ok("Python 3.10.0"),
            ("python3", [m, ..]) if m == "-m" => ok(""),
            (_, [m, pip, ..]) if m == "-m" && pip == "pip" => ok(""),
            _ => not_found(),
        });

        let locator = RuntimeLocator::with_runner(layout, &Posix, &runner);
        locator.resolve_interpreter().await.unwrap();
        assert!(runner.calls().iter().any(|c| c.starts_with("python3 -m venv")));
    }

    #[tokio::test]
    async fn python2_is_not_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        let runner = FakeRunner::new(|_, args| {
            if args.last().is_some_and(|a| a == "--version") {
                Ok(CommandOutput {
                    success: true,
                    code: Some(0),
                    stdout: String::new(),
                    stderr: "Python 2.7.18".to_string(),
                })
            } else {
                not_found()
            }
        });

        let locator = RuntimeLocator::with_runner(layout, &Posix, &runner);
        let err = locator.resolve_interpreter().await.unwrap_err();
        match err {
            StartupError::InterpreterNotFound { tried } => {
                assert_eq!(tried.len(), 4);
                assert!(tried[0].starts_with("bundled interpreter"));
                assert!(tried[1].starts_with("virtual environment"));
                assert_eq!(tried[2], "system interpreter: python3");
                assert_eq!(tried[3], "system interpreter: python");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn failed_pip_install_is_an_environment_error() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        make_env(&layout, false);
        write_file(&layout.requirements);
        let runner = FakeRunner::new(|_, _| {
            Ok(CommandOutput {
                success: false,
                code: Some(1),
                stdout: String::new(),
                stderr: "No matching distribution found for flask".to_string(),
            })
        });

        let locator = RuntimeLocator::with_runner(layout, &Posix, &runner);
        let err = locator.resolve_interpreter().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Environment);
        assert!(err.to_string().contains("No matching distribution"));
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail("  short ", 10), "short");
        assert_eq!(tail("abcdef", 3), "…def");
    }
}
