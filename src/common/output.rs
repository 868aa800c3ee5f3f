//! Utilities for naming and tagging generated output.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{offset::Local, DateTime};
use serde::{de::DeserializeOwned, ser::SerializeMap, Serialize, Serializer};

/// Suffix of the file recording all settings of a run.
pub const PARAMS_SUFFIX: &str = "params";

/// `RunSettings` records all of the settings of one run of a routine.
///
/// Each routine creates a `RunSettings` at the beginning, usually with the `settings!` macro.
/// It is then used to name output files and directories and to write a `.params` file
/// containing every setting, so that a result can always be traced back to what produced it.
///
/// Generated names are unique because they include a timestamp. They also contain the values
/// of every setting marked as `important`, in registration order.
#[derive(Debug, Clone)]
pub struct RunSettings {
    settings: BTreeMap<String, String>,
    important: Vec<String>,
    timestamp: DateTime<Local>,
}

impl RunSettings {
    /// Create a new `RunSettings` containing no settings.
    pub fn new() -> Self {
        RunSettings {
            settings: BTreeMap::new(),
            important: Vec::new(),
            timestamp: Local::now(),
        }
    }

    /// Register a new setting called `name` with value `value`. If `important` is set, the value
    /// is included in generated names.
    ///
    /// # Panics
    ///
    /// If `name` is already registered.
    pub fn register<V: Serialize>(&mut self, name: &str, value: &V, important: bool) {
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

    /// The name shared by all output of this run: important settings, then the timestamp.
    pub fn gen_base_name(&self) -> String {
        let mut base = String::new();

        for setting in self.important.iter() {
            self.append_setting(&mut base, setting);
            base.push('-');
        }

        base.push_str(&self.timestamp.format("%Y-%m-%d-%H-%M-%S").to_string());

        base
    }

    /// Generate a file name with the given extension (without the leading dot, e.g. `csv`).
    pub fn gen_file_name(&self, ext: &str) -> String {
        format!("{}.{}", self.gen_base_name(), ext)
    }

    /// Helper to add the given setting to the given string. The caller should ensure that the
    /// setting is registered.
    fn append_setting(&self, string: &mut String, setting: &str) {
        let val = self
            .settings
            .get(setting)
            .expect("important setting not defined");

        // sanitize
        let val: String = val
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '"' | '\'' | '/' => '_',
                c => c,
            })
            .collect();

        string.push_str(setting);
        string.push_str(&val);
    }

    /// Returns the value of setting `setting` deserialized to a `D`.
    pub fn get<D: DeserializeOwned>(&self, setting: &str) -> Result<D, failure::Error> {
        let value = self
            .settings
            .get(setting)
            .ok_or_else(|| failure::format_err!("no such setting: {}", setting))?;
        Ok(serde_json::from_str(value)?)
    }

    /// Write all settings as JSON to a `.params` file in `dir`. Returns the path of the file.
    pub fn write_params(&self, dir: &Path) -> Result<PathBuf, failure::Error> {
        let path = dir.join(self.gen_file_name(PARAMS_SUFFIX));
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

impl Serialize for RunSettings {
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
    ($manager:ident, ) => {};
    ($manager:ident, $name:ident : $value:expr, $($tail:tt)*) => {{
        $manager.register(stringify!($name), &$value, false);
        $crate::__settings_helper!($manager, $($tail)*);
    }};
    ($manager:ident, * $name:ident : $value:expr, $($tail:tt)*) => {{
        $manager.register(stringify!($name), &$value, true);
        $crate::__settings_helper!($manager, $($tail)*);
    }};
}

/// A convenience macro for creating a `RunSettings` with the given settings. The syntax is `[*]
/// name: value,` where `name` is the name of the setting, `value` is any serializable
/// expression, and the optional `*` marks the setting as important. Every entry, including the
/// last, must end with a comma.
///
/// ```rust,ignore
/// let settings = settings! {
///     * exp: "sweep",
///     * site: "lyon",
///     nodes: 2,
///     walltime: "00:10:00",
/// };
/// ```
#[macro_export]
macro_rules! settings {
    ($($tail:tt)*) => {{
        let mut manager = crate::common::output::RunSettings::new();

        $crate::__settings_helper!(manager, $($tail)*);

        manager
    }}
}

#[cfg(test)]
mod test {
    #[test]
    fn names_include_important_settings() {
        let settings = settings! {
            * exp: "sweep",
            nodes: 2,
            * site: "lyon",
            walltime: "00:10:00",
        };

        let name = settings.gen_file_name("csv");
        assert!(name.starts_with("exp_sweep_-site_lyon_-"), "{}", name);
        assert!(name.ends_with(".csv"));
        assert!(!name.contains("nodes"));
    }

    #[test]
    fn get_round_trips_values() {
        let settings = settings! {
            nodes: 3usize,
            image: Some("wheezy-x64-nfs"),
        };

        assert_eq!(settings.get::<usize>("nodes").unwrap(), 3);
        assert_eq!(
            settings.get::<Option<String>>("image").unwrap().as_deref(),
            Some("wheezy-x64-nfs")
        );
        assert!(settings.get::<usize>("missing").is_err());
    }

    #[test]
    #[should_panic]
    fn duplicate_setting_panics() {
        let _ = settings! {
            nodes: 1,
            nodes: 2,
        };
    }

    #[test]
    fn params_file_contains_all_settings() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings! {
            * exp: "storagebench",
            count: 200,
        };

        let path = settings.write_params(dir.path()).unwrap();
        assert!(path.to_str().unwrap().ends_with(".params"));

        let contents: std::collections::BTreeMap<String, String> =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(contents["count"], "200");
        assert_eq!(contents["exp"], "\"storagebench\"");
    }
}
