//! Naming and tagging of result files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{offset::Local, DateTime};

use serde::{ser::SerializeMap, Serialize, Serializer};

/// `OutputManager` names result files after the settings of the run that produced them.
///
/// Each run creates one with all of its settings, usually via the `settings!` macro. Settings
/// marked important end up in the file name; all of them end up in the `.params` file written
/// next to the results. A timestamp keeps names unique.
#[derive(Debug, Clone)]
pub struct OutputManager {
    settings: BTreeMap<String, String>,
    important: Vec<String>,
    timestamp: DateTime<Local>,
}

impl OutputManager {
    pub fn new() -> Self {
        OutputManager {
            settings: BTreeMap::new(),
            important: Vec::new(),
            timestamp: Local::now(),
        }
    }

    /// Register setting `name` with `value`. `important` settings are included in generated file
    /// names.
    pub fn register<V: Serialize + std::fmt::Debug>(&mut self, name: &str, value: &V, important: bool) {
        let value = serde_json::to_string(value).expect("unable to serialize");
        if let Some(prev) = self.settings.insert(name.into(), value) {
            panic!(
                "Setting {:?} previously registered with value {:?}",
                name, prev
            );
        }
        if important {
            self.important.push(name.into());
        }
    }

    /// The results (`.log`) and params (`.params`) file names, in that order.
    pub fn gen_file_names(&self) -> (String, String) {
        (self.gen_file_name("log"), self.gen_file_name("params"))
    }

    /// A file name with extension `ext` (without the dot).
    pub fn gen_file_name(&self, ext: &str) -> String {
        let mut base = self
            .important
            .iter()
            .map(|setting| self.setting_for_name(setting))
            .collect::<Vec<_>>()
            .join("-");

        if !base.is_empty() {
            base.push('-');
        }
        base.push_str(&self.timestamp.format("%Y-%m-%d-%H-%M-%S").to_string());
        base.push('.');
        base.push_str(ext);

        base
    }

    fn setting_for_name(&self, setting: &str) -> String {
        let val = self
            .settings
            .get(setting)
            .expect("important setting not defined");

        let val = val.trim().replace(' ', "_").replace('"', "").replace('\'', "");

        format!("{}{}", setting, val)
    }

    /// Write the `.params` file into `dir` and return the path of the results file next to it.
    pub fn create_files(&self, dir: &Path) -> Result<PathBuf, failure::Error> {
        let (log, params) = self.gen_file_names();
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(&params), serde_json::to_string_pretty(self)?)?;
        Ok(dir.join(log))
    }
}

impl Default for OutputManager {
    fn default() -> Self {
        OutputManager::new()
    }
}

impl Serialize for OutputManager {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.settings.len()))?;
        for (k, v) in &self.settings {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __settings_helper {
    ($manager:ident ,) => {};
    ($manager:ident, $name:ident : $value:expr, $($tail:tt)*) => {{
        $manager.register(stringify!($name), &$value, false);
        $crate::__settings_helper!($manager, $($tail)*);
    }};
    ($manager:ident, * $name:ident : $value:expr, $($tail:tt)*) => {{
        $manager.register(stringify!($name), &$value, true);
        $crate::__settings_helper!($manager, $($tail)*);
    }};
}

/// Build an `OutputManager` from `[*] name: value,` pairs. A leading `*` marks the setting as
/// important. Every pair, including the last, ends with a comma.
///
/// ```rust,ignore
/// let settings = settings! {
///     * bench: "redis",
///     * num: 4,
///     * dram_ratio: 0.2,
///     ncpus: 4,
/// };
/// ```
#[macro_export]
macro_rules! settings {
    ($($tail:tt)*) => {{
        let mut manager = $crate::output::OutputManager::new();

        $crate::__settings_helper!(manager, $($tail)*);

        manager
    }}
}
