//! Process-level configuration read from the environment.

use std::path::{Path, PathBuf};

/// Settings that apply to every command of one opta process.
#[derive(Debug, Clone)]
pub struct OptaConfig {
    /// Per-user state directory (`~/.opta`).
    pub opta_home: PathBuf,

    /// Root of the packaged Terraform modules.
    pub modules_dir: PathBuf,

    /// Directory terraform runs in and `main.tf.json` is written to.
    pub workdir: PathBuf,

    /// Allow TCP ports and more than one port per k8s service.
    pub multiple_ports_supported: bool,

    /// Caller's KUBECONFIG. Read only, never rewritten.
    pub kubeconfig: Option<PathBuf>,

    pub disable_reporting: bool,

    /// Non-interactive run: prompts fail instead of blocking.
    pub ci: bool,

    pub version: String,
}

impl Default for OptaConfig {
    fn default() -> Self {
        Self {
            opta_home: PathBuf::from(".opta"),
            modules_dir: PathBuf::from("modules"),
            workdir: PathBuf::from("."),
            multiple_ports_supported: true,
            kubeconfig: None,
            disable_reporting: false,
            ci: false,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let v = v.trim().to_lowercase();
        !(v.is_empty() || v == "0" || v == "false" || v == "no")
    })
}

impl OptaConfig {
    /// Build the configuration from `OPTA_*` variables, `KUBECONFIG` and `CI`.
    pub fn from_env() -> Self {
        let workdir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

        let opta_home = match std::env::var_os("OPTA_HOME") {
            Some(home) => PathBuf::from(home),
            None => std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".opta"))
                .unwrap_or_else(|| workdir.join(".opta")),
        };

        let modules_dir = match std::env::var_os("OPTA_MODULES_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => Self::packaged_modules_dir().unwrap_or_else(|| workdir.join("modules")),
        };

        Self {
            opta_home,
            modules_dir,
            workdir,
            multiple_ports_supported: env_flag("OPTA_MULTIPLE_PORTS").unwrap_or(true),
            kubeconfig: std::env::var_os("KUBECONFIG").map(PathBuf::from),
            disable_reporting: env_flag("OPTA_DISABLE_REPORTING").unwrap_or(false),
            ci: env_flag("CI").unwrap_or(false),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// `modules/` next to the running binary, when it exists.
    fn packaged_modules_dir() -> Option<PathBuf> {
        let exe = std::env::current_exe().ok()?;
        let dir = exe.parent()?.join("modules");
        dir.is_dir().then_some(dir)
    }

    pub fn with_opta_home(mut self, path: impl Into<PathBuf>) -> Self {
        self.opta_home = path.into();
        self
    }

    pub fn with_modules_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.modules_dir = path.into();
        self
    }

    pub fn with_workdir(mut self, path: impl Into<PathBuf>) -> Self {
        self.workdir = path.into();
        self
    }

    pub fn multiple_ports(mut self, enabled: bool) -> Self {
        self.multiple_ports_supported = enabled;
        self
    }

    pub fn ci(mut self, ci: bool) -> Self {
        self.ci = ci;
        self
    }

    pub fn kubeconfigs_dir(&self) -> PathBuf {
        self.opta_home.join("kubeconfigs")
    }

    /// Where the generated `main.tf.json` goes.
    pub fn main_tf_path(&self) -> PathBuf {
        self.workdir.join("main.tf.json")
    }

    pub fn module_source_dir(&self, module_dir: &str) -> PathBuf {
        self.modules_dir.join(Path::new(module_dir))
    }
}
