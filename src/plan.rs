use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Deserialize;
use tracing::info;

use crate::config::{ConfigError, DispatchConfig};
use crate::work::{Failure, Location, WorkItem};

/// A YAML file listing external commands to run as one dispatch batch.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub items: Vec<PlanItem>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PlanItem {
    pub name: String,

    /// Program followed by its arguments; no shell is involved.
    pub command: Vec<String>,

    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl Plan {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let plan: Plan = serde_yaml::from_str(text)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dispatch.validate()?;
        for (idx, item) in self.items.iter().enumerate() {
            if item.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("items[{idx}] has an empty name")));
            }
            if item.command.first().map_or(true, |p| p.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "item '{}' has an empty command",
                    item.name
                )));
            }
        }
        Ok(())
    }

    /// One [`CommandItem`] per plan entry, located at `<source>#items[i]`.
    pub fn work_items(&self, source: &str) -> Vec<Box<dyn WorkItem>> {
        self.items
            .iter()
            .enumerate()
            .map(|(idx, item)| {
                Box::new(CommandItem {
                    name: item.name.clone(),
                    command: item.command.clone(),
                    cwd: item.cwd.clone(),
                    location: Location::new(format!("{source}#items[{idx}]")),
                }) as Box<dyn WorkItem>
            })
            .collect()
    }
}

/// Runs one external program to completion; a non-zero exit is a failure.
#[derive(Debug, Clone)]
pub struct CommandItem {
    pub name: String,
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub location: Location,
}

impl WorkItem for CommandItem {
    fn run(self: Box<Self>) -> Result<(), Failure> {
        let CommandItem {
            name,
            command,
            cwd,
            location,
        } = *self;
        let Some((program, args)) = command.split_first() else {
            return Err(Failure::at(
                format!("item '{name}' has an empty command"),
                location,
            ));
        };

        // stdout belongs to the caller's report; the child's output is
        // captured and relayed through the log on stderr.
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = cwd.as_deref() {
            cmd.current_dir(dir);
        }

        let output = match cmd.spawn().and_then(|child| child.wait_with_output()) {
            Ok(output) => output,
            Err(err) => {
                return Err(Failure::at(
                    format!("item '{name}' failed to start '{program}': {err}"),
                    location,
                ))
            }
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!(item = %name, "{line}");
        }

        if output.status.success() {
            return Ok(());
        }
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "<signal>".to_string());
        Err(Failure::at(
            format!("item '{name}' exited with status {code}"),
            location,
        ))
    }

    fn label(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn location(&self) -> Option<Location> {
        Some(self.location.clone())
    }
}
