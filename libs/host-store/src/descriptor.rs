//! Connection descriptor parsing.
//!
//! A descriptor is a whitespace-separated list of `key=value` tokens,
//! e.g. `type=sqlite name=hosts.db user=keatest password=keatest`.
//! `type` selects the backend and is mandatory; `name` is required by
//! every backend but its absence is reported by the factory so that an
//! unknown `type` wins over a missing `name`.

use crate::StoreError;

/// Parsed connection descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub backend: String,
    pub name: Option<String>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Descriptor {
    /// Parses a descriptor string.
    ///
    /// Malformed tokens (no `=`, empty value, unknown or repeated keys)
    /// and a missing `type` fail with [`StoreError::InvalidParameter`].
    pub fn parse(input: &str) -> Result<Self, StoreError> {
        let mut desc = Descriptor::default();

        for token in input.split_whitespace() {
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| StoreError::InvalidParameter(token.to_string()))?;
            if value.is_empty() {
                return Err(StoreError::InvalidParameter(token.to_string()));
            }

            let slot = match key {
                "type" if desc.backend.is_empty() => {
                    desc.backend = value.to_string();
                    continue;
                }
                "name" => &mut desc.name,
                "host" => &mut desc.host,
                "user" => &mut desc.user,
                "password" => &mut desc.password,
                _ => return Err(StoreError::InvalidParameter(token.to_string())),
            };
            if slot.replace(value.to_string()).is_some() {
                return Err(StoreError::InvalidParameter(token.to_string()));
            }
        }

        if desc.backend.is_empty() {
            return Err(StoreError::InvalidParameter(
                "missing backend type".to_string(),
            ));
        }
        Ok(desc)
    }
}
