use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::warn;

pub const PROVIDER_ENV_FILE_NAME: &str = "provider.env";

/// Environment-override layer: real process variables win over `provider.env`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    file_values: BTreeMap<String, String>,
    use_process_env: bool,
}

impl EnvOverrides {
    /// Reads `provider.env`; a missing or unreadable file contributes nothing.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let file_values = match fs::read_to_string(path) {
            Ok(raw) => parse_env_file(&raw),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(error) => {
                warn!(path = %path.display(), %error, "ignoring unreadable provider env file");
                BTreeMap::new()
            }
        };

        Self {
            file_values,
            use_process_env: true,
        }
    }

    /// Override layer built only from explicit values; process env is ignored.
    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            file_values: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
            use_process_env: false,
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        if self.use_process_env {
            if let Some(value) = std::env::var(name)
                .ok()
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
            {
                return Some(value);
            }
        }

        self.file_values
            .get(name)
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }

    /// First non-empty value among `names`, checked in order.
    pub fn first_of(&self, names: &[String]) -> Option<(String, String)> {
        names
            .iter()
            .find_map(|name| self.get(name).map(|value| (name.clone(), value)))
    }
}

fn parse_env_file(raw: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        values.insert(key.to_owned(), unquote(value.trim()).to_owned());
    }
    values
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
