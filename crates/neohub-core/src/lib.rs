pub mod hub_ipc;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/neohub.sock";
pub const SOCKET_PATH_ENV: &str = "NEOHUB_SOCKET";

/// Socket path shared by the hub and the CLI. `NEOHUB_SOCKET` wins over the default.
pub fn resolve_socket_path() -> PathBuf {
    match env::var(SOCKET_PATH_ENV) {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
        _ => PathBuf::from(DEFAULT_SOCKET_PATH),
    }
}

/// A request to open (or focus) an editor, sent by the CLI to the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRequest {
    #[serde(deserialize_with = "deserialize_abs_path")]
    pub wd: PathBuf,
    #[serde(deserialize_with = "deserialize_abs_path")]
    pub bin: PathBuf,
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    pub path: Option<String>,
    #[serde(default)]
    pub opts: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl RunRequest {
    pub fn new(
        wd: impl Into<PathBuf>,
        bin: impl Into<PathBuf>,
        name: Option<String>,
        path: Option<String>,
        opts: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            wd: wd.into(),
            bin: bin.into(),
            name: name.filter(|value| !value.is_empty()),
            path: path.filter(|value| !value.is_empty()),
            opts,
            env,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.wd
    }
}

fn deserialize_abs_path<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
where
    D: Deserializer<'de>,
{
    struct AbsPathVisitor;

    impl<'de> Visitor<'de> for AbsPathVisitor {
        type Value = PathBuf;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("an absolute path or a file:// url")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let path = if value.starts_with("file:") {
                let url = Url::parse(value)
                    .map_err(|err| E::custom(format!("invalid file url '{value}': {err}")))?;
                url.to_file_path()
                    .map_err(|_| E::custom(format!("file url has no local path: {value}")))?
            } else {
                PathBuf::from(value)
            };
            if !path.is_absolute() {
                return Err(E::custom(format!("expected an absolute path, got '{value}'")));
            }
            Ok(path)
        }

        fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_str(&value)
        }
    }

    deserializer.deserialize_str(AbsPathVisitor)
}

fn deserialize_non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|value| !value.is_empty()))
}
