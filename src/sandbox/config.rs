use serde::Deserialize;

/// Configuration for the sandbox container.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    /// Container CLI used to launch runs (`docker`, or a compatible one such as `podman`).
    pub runtime: String,
    pub image: String,
    /// Interpreter command line; the program file name is appended.
    pub interpreter: String,
    pub memory: String,
    pub cpus: f64,
    pub pids_limit: u32,
    /// Ping the Docker daemon before each run and report `SandboxUnavailable` early.
    pub probe_daemon: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "python:3.12-slim".to_string(),
            interpreter: "python".to_string(),
            memory: "512m".to_string(),
            cpus: 1.0,
            pids_limit: 256,
            probe_daemon: true,
        }
    }
}

/// Raw `[sandbox]` table of `.anvil/anvil.toml`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SandboxSection {
    pub runtime: Option<String>,
    pub image: Option<String>,
    pub interpreter: Option<String>,
    pub memory: Option<String>,
    pub cpus: Option<f64>,
    pub pids_limit: Option<u32>,
    pub probe_daemon: Option<bool>,
}

impl SandboxConfig {
    /// Overlay the values present in `section` onto `self`.
    pub fn apply(&mut self, section: SandboxSection) {
        if let Some(runtime) = section.runtime {
            self.runtime = runtime;
        }
        if let Some(image) = section.image {
            self.image = image;
        }
        if let Some(interpreter) = section.interpreter {
            self.interpreter = interpreter;
        }
        if let Some(memory) = section.memory {
            self.memory = memory;
        }
        if let Some(cpus) = section.cpus {
            self.cpus = cpus;
        }
        if let Some(pids_limit) = section.pids_limit {
            self.pids_limit = pids_limit;
        }
        if let Some(probe_daemon) = section.probe_daemon {
            self.probe_daemon = probe_daemon;
        }
    }

    /// Interpreter argv, e.g. `python -u` → `["python", "-u"]`.
    pub fn interpreter_argv(&self) -> Vec<String> {
        self.interpreter
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.image.trim().is_empty() {
            warnings.push("sandbox.image is empty".to_string());
        }
        if self.interpreter_argv().is_empty() {
            warnings.push("sandbox.interpreter is empty".to_string());
        }
        if self.cpus <= 0.0 {
            warnings.push(format!("sandbox.cpus must be positive (got {})", self.cpus));
        }
        if self.pids_limit == 0 {
            warnings.push("sandbox.pids_limit of 0 leaves the process count unbounded".to_string());
        }
        warnings
    }
}
