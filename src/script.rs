//! Automation hooks and the runner that turns them into printer actions.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BedloopError, Result};
use crate::printer::PrinterControl;
use crate::storage::{FileLocator, Set};

/// Points in the print cycle where user gcode can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Hook {
    Activate,
    PrintStart,
    PrintSuccess,
    PrintCancel,
    Cooldown,
    Finish,
    AwaitingMaterial,
    Deactivate,
}

impl Hook {
    pub const ALL: [Hook; 8] = [
        Hook::Activate,
        Hook::PrintStart,
        Hook::PrintSuccess,
        Hook::PrintCancel,
        Hook::Cooldown,
        Hook::Finish,
        Hook::AwaitingMaterial,
        Hook::Deactivate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::Activate => "ACTIVATE",
            Hook::PrintStart => "PRINT_START",
            Hook::PrintSuccess => "PRINT_SUCCESS",
            Hook::PrintCancel => "PRINT_CANCEL",
            Hook::Cooldown => "COOLDOWN",
            Hook::Finish => "FINISH",
            Hook::AwaitingMaterial => "AWAITING_MATERIAL",
            Hook::Deactivate => "DEACTIVATE",
        }
    }
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Hook {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Hook::ALL
            .into_iter()
            .find(|h| h.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown hook {s}"))
    }
}

pub const CONTEXT_VERSION: u32 = 1;

/// Printer state as last reported to the driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentState {
    pub path: Option<String>,
    /// Loaded material per tool index.
    pub materials: Vec<Option<String>>,
    pub bed_temp: Option<f64>,
}

/// Symbols available to hook scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptContext {
    pub version: u32,
    pub current: CurrentState,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub external: Map<String, Value>,
}

impl Default for ScriptContext {
    fn default() -> Self {
        Self {
            version: CONTEXT_VERSION,
            current: CurrentState::default(),
            metadata: Map::new(),
            external: Map::new(),
        }
    }
}

impl ScriptContext {
    /// Looks up a dotted name such as `current.bed_temp` or `external.nozzle`.
    pub fn lookup(&self, name: &str) -> Option<String> {
        let root = serde_json::to_value(self).ok()?;
        let pointer = format!("/{}", name.replace('.', "/"));
        match root.pointer(&pointer)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Substitutes `${name}` placeholders. Unknown names are left as-is.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let name = &after[..end];
                    match self.lookup(name) {
                        Some(value) => out.push_str(&value),
                        None => out.push_str(&rest[start..start + 3 + end]),
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// What the driver asks of the outside world.
pub trait ScriptRunner: Send {
    /// Runs the gcode configured for `hook`. Returns the path of the file
    /// sent to the printer, or `None` if the hook has nothing to run.
    fn run_script_for_event(&mut self, hook: Hook, ctx: &ScriptContext) -> Result<Option<PathBuf>>;

    /// Starts printing `set`. Returns false if the printer refused.
    fn start_print(&mut self, set: &Set, ctx: &ScriptContext) -> Result<bool>;
}

/// Writes configured hook gcode to files and hands them to a printer.
pub struct FileScriptRunner<P> {
    scripts: HashMap<Hook, String>,
    script_dir: PathBuf,
    locator: FileLocator,
    printer: P,
}

impl<P: PrinterControl> FileScriptRunner<P> {
    pub fn new(script_dir: impl Into<PathBuf>, locator: FileLocator, printer: P) -> Self {
        Self {
            scripts: HashMap::new(),
            script_dir: script_dir.into(),
            locator,
            printer,
        }
    }

    pub fn with_script(mut self, hook: Hook, gcode: impl Into<String>) -> Self {
        self.scripts.insert(hook, gcode.into());
        self
    }

    /// Loads `<hook>.gcode` files (e.g. `print_success.gcode`) from `dir`.
    pub fn load_scripts(mut self, dir: &Path) -> Result<Self> {
        for hook in Hook::ALL {
            let path = dir.join(format!("{}.gcode", hook.as_str().to_ascii_lowercase()));
            if path.is_file() {
                self.scripts.insert(hook, fs::read_to_string(&path)?);
                tracing::debug!(hook = %hook, path = %path.display(), "Loaded hook script");
            }
        }
        Ok(self)
    }

    pub fn printer(&self) -> &P {
        &self.printer
    }
}

impl<P: PrinterControl> ScriptRunner for FileScriptRunner<P> {
    fn run_script_for_event(&mut self, hook: Hook, ctx: &ScriptContext) -> Result<Option<PathBuf>> {
        let Some(script) = self.scripts.get(&hook).filter(|s| !s.trim().is_empty()) else {
            return Ok(None);
        };
        let gcode = ctx.render(script);

        fs::create_dir_all(&self.script_dir)?;
        let path = self
            .script_dir
            .join(format!("bedloop_{}.gcode", hook.as_str().to_ascii_lowercase()));
        fs::write(&path, gcode)?;
        self.printer.print_file(&path, false)?;
        tracing::info!(hook = %hook, path = %path.display(), "Running hook script");
        Ok(Some(path))
    }

    fn start_print(&mut self, set: &Set, _ctx: &ScriptContext) -> Result<bool> {
        if set.sd {
            self.printer.print_file(Path::new(&set.path), true)?;
            return Ok(true);
        }
        let Some(path) = set.resolved_path(&self.locator) else {
            tracing::warn!(path = %set.path, "File to print no longer exists");
            return Ok(false);
        };
        self.printer
            .print_file(path, false)
            .map_err(|e| BedloopError::Script(format!("{}: {e}", set.path)))?;
        Ok(true)
    }
}
