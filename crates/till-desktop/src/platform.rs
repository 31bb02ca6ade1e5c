use std::path::{Path, PathBuf};

/// How a child is asked to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Graceful,
    Forceful,
}

/// A command line: program plus leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// OS differences the locator and supervisor care about.
pub trait Platform: Send + Sync + std::fmt::Debug {
    fn executable_suffix(&self) -> &'static str;

    /// Directory inside a virtual environment holding executables.
    fn environment_bin_dir(&self) -> &'static str;

    fn interpreter_name(&self) -> String {
        format!("python{}", self.executable_suffix())
    }

    /// System interpreter candidates, in order.
    fn interpreter_candidates(&self) -> Vec<CommandSpec>;

    /// Tool resolving a bare command to its full path.
    fn which_command(&self) -> &'static str;

    /// Candidate `site-packages` directories of an environment rooted at `env_dir`.
    fn site_packages_dirs(&self, env_dir: &Path) -> Vec<PathBuf>;

    /// Package manager command used to start the frontend.
    fn package_manager(&self) -> CommandSpec;

    fn kill_signal_sequence(&self) -> &'static [StopSignal];

    fn bundled_runtime_name(&self) -> String {
        format!("node{}", self.executable_suffix())
    }

    fn is_windows(&self) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Posix;

#[derive(Debug, Default, Clone, Copy)]
pub struct Windows;

impl Platform for Posix {
    fn executable_suffix(&self) -> &'static str {
        ""
    }

    fn environment_bin_dir(&self) -> &'static str {
        "bin"
    }

    fn interpreter_candidates(&self) -> Vec<CommandSpec> {
        vec![CommandSpec::new("python3"), CommandSpec::new("python")]
    }

    fn which_command(&self) -> &'static str {
        "which"
    }

    fn site_packages_dirs(&self, env_dir: &Path) -> Vec<PathBuf> {
        // lib/python3.X/site-packages; the minor version is not known up front.
        let lib = env_dir.join("lib");
        let Ok(rd) = std::fs::read_dir(&lib) else {
            return Vec::new();
        };
        let mut out: Vec<PathBuf> = rd
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("python"))
            .map(|e| e.path().join("site-packages"))
            .collect();
        out.sort();
        out
    }

    fn package_manager(&self) -> CommandSpec {
        CommandSpec::new("npm")
    }

    fn kill_signal_sequence(&self) -> &'static [StopSignal] {
        &[StopSignal::Graceful, StopSignal::Forceful]
    }

    fn is_windows(&self) -> bool {
        false
    }
}

impl Platform for Windows {
    fn executable_suffix(&self) -> &'static str {
        ".exe"
    }

    fn environment_bin_dir(&self) -> &'static str {
        "Scripts"
    }

    fn interpreter_candidates(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("py").arg("-3"),
            CommandSpec::new("python"),
            CommandSpec::new("python3"),
        ]
    }

    fn which_command(&self) -> &'static str {
        "where"
    }

    fn site_packages_dirs(&self, env_dir: &Path) -> Vec<PathBuf> {
        vec![env_dir.join("Lib").join("site-packages")]
    }

    fn package_manager(&self) -> CommandSpec {
        // npm ships as a .cmd shim, which needs the shell.
        CommandSpec::new("cmd").arg("/C").arg("npm.cmd")
    }

    fn kill_signal_sequence(&self) -> &'static [StopSignal] {
        &[StopSignal::Forceful]
    }

    fn is_windows(&self) -> bool {
        true
    }
}

pub fn current_platform() -> &'static dyn Platform {
    if cfg!(windows) {
        static P: Windows = Windows;
        &P
    } else {
        static P: Posix = Posix;
        &P
    }
}
