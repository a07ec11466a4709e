// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed driver options with a compile-time default, an ephemeral runtime
//! layer and a persistent layer surviving restarts.
//!
//! The persistent layer is a JSON document at a caller-chosen path, playing
//! the role the registry key plays for a driver. Setting an option
//! persistently writes the document first; the ephemeral value is only
//! updated once the write succeeded.

use std::collections::BTreeMap;
use std::path::PathBuf;

use base::warn;
use serde::Deserialize;
use serde::Serialize;
use sync::Mutex;

use crate::Error;
use crate::Result;

/// Longest accepted string option value.
pub const MAX_OPT_STRING_LENGTH: usize = 256;

/// A typed option value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int64(i64),
    String(String),
}

impl OptionValue {
    fn type_name(&self) -> &'static str {
        match self {
            OptionValue::Bool(_) => "bool",
            OptionValue::Int64(_) => "int64",
            OptionValue::String(_) => "string",
        }
    }

    /// Coerces `self` to the type of `target`. Strings are parsed; any other
    /// type mismatch is rejected.
    fn coerce_to(&self, target: &OptionValue) -> Result<OptionValue> {
        if std::mem::discriminant(self) == std::mem::discriminant(target) {
            return Ok(self.clone());
        }
        let OptionValue::String(s) = self else {
            return Err(Error::InvalidParameter(format!(
                "expected a {} value",
                target.type_name()
            )));
        };
        match target {
            OptionValue::Bool(_) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(OptionValue::Bool(true)),
                "0" | "false" | "no" | "off" => Ok(OptionValue::Bool(false)),
                _ => Err(Error::InvalidParameter(format!(
                    "cannot parse {:?} as a bool",
                    s
                ))),
            },
            OptionValue::Int64(_) => s
                .trim()
                .parse::<i64>()
                .map(OptionValue::Int64)
                .map_err(|_| {
                    Error::InvalidParameter(format!("cannot parse {:?} as an integer", s))
                }),
            OptionValue::String(_) => unreachable!("same discriminant handled above"),
        }
    }
}

struct OptionDef {
    name: &'static str,
    default: fn() -> OptionValue,
}

// Keep the table sorted by name.
static DRIVER_OPTIONS: &[OptionDef] = &[
    OptionDef {
        name: "DbgPrintEnabled",
        default: || OptionValue::Bool(true),
    },
    OptionDef {
        name: "EtwLoggingEnabled",
        default: || OptionValue::Bool(true),
    },
    OptionDef {
        name: "LogLevel",
        default: || OptionValue::Int64(2),
    },
    OptionDef {
        name: "NewMappingsAllowed",
        default: || OptionValue::Bool(true),
    },
    OptionDef {
        name: "WppLoggingEnabled",
        default: || OptionValue::Bool(false),
    },
];

fn find_option(name: &str) -> Option<&'static OptionDef> {
    DRIVER_OPTIONS
        .iter()
        .find(|opt| opt.name.eq_ignore_ascii_case(name))
}

/// One option as reported by [`OptionsStore::list`].
#[derive(Clone, Debug, PartialEq)]
pub struct OptionEntry {
    pub name: &'static str,
    pub value: OptionValue,
    pub default: OptionValue,
}

/// The driver option store.
pub struct OptionsStore {
    persistent_path: Option<PathBuf>,
    values: Mutex<BTreeMap<&'static str, OptionValue>>,
}

impl OptionsStore {
    /// Creates a store with every option at its default and no persistent
    /// layer.
    pub fn new() -> OptionsStore {
        OptionsStore::with_persistent_path(None)
    }

    /// Creates a store backed by the JSON document at `path`. Persisted
    /// values are loaded immediately; a missing document is treated as
    /// empty.
    pub fn with_persistent_path(path: Option<PathBuf>) -> OptionsStore {
        let store = OptionsStore {
            persistent_path: path,
            values: Mutex::new(
                DRIVER_OPTIONS
                    .iter()
                    .map(|opt| (opt.name, (opt.default)()))
                    .collect(),
            ),
        };
        store.reload();
        store
    }

    fn read_document(&self) -> BTreeMap<String, OptionValue> {
        let Some(path) = &self.persistent_path else {
            return BTreeMap::new();
        };
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("discarding malformed option store {}: {}", path.display(), e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        }
    }

    fn write_document(&self, doc: &BTreeMap<String, OptionValue>) -> Result<()> {
        let Some(path) = &self.persistent_path else {
            return Err(Error::InvalidParameter(
                "no persistent option store configured".to_string(),
            ));
        };
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| Error::ResourceExhausted(e.to_string()))?;
        std::fs::write(path, bytes).map_err(|e| Error::ResourceExhausted(e.to_string()))
    }

    /// Reads an option. With `persistent` set, only the persisted layer is
    /// consulted and an unset option reports not-found.
    pub fn get(&self, name: &str, persistent: bool) -> Result<OptionValue> {
        let opt = find_option(name).ok_or(Error::NotFound)?;
        if persistent {
            let doc = self.read_document();
            return doc.get(opt.name).cloned().ok_or(Error::NotFound);
        }
        Ok(self.values.lock()[opt.name].clone())
    }

    /// Convenience accessor for boolean options that are consulted on hot
    /// paths.
    pub fn get_bool(&self, name: &str) -> bool {
        matches!(self.get(name, false), Ok(OptionValue::Bool(true)))
    }

    /// Sets an option, coercing string values to the option's type. With
    /// `persistent` set, the document is written first and the ephemeral
    /// value only changes if that write succeeded.
    pub fn set(&self, name: &str, value: OptionValue, persistent: bool) -> Result<()> {
        let opt = find_option(name).ok_or(Error::NotFound)?;
        if let OptionValue::String(s) = &value {
            if s.len() > MAX_OPT_STRING_LENGTH {
                return Err(Error::InvalidParameter(format!(
                    "option value exceeds {} characters",
                    MAX_OPT_STRING_LENGTH
                )));
            }
        }
        let value = value.coerce_to(&(opt.default)())?;

        if persistent {
            let mut doc = self.read_document();
            doc.insert(opt.name.to_string(), value.clone());
            self.write_document(&doc)?;
        }

        self.values.lock().insert(opt.name, value);
        Ok(())
    }

    /// Restores an option to its default. With `persistent` set, the
    /// persisted value is removed first.
    pub fn reset(&self, name: &str, persistent: bool) -> Result<()> {
        let opt = find_option(name).ok_or(Error::NotFound)?;
        if persistent {
            let mut doc = self.read_document();
            if doc.remove(opt.name).is_some() {
                self.write_document(&doc)?;
            }
        }
        self.values.lock().insert(opt.name, (opt.default)());
        Ok(())
    }

    /// Lists options. With `persistent` set, only the options present in the
    /// persisted layer are returned, carrying their persisted values.
    pub fn list(&self, persistent: bool) -> Vec<OptionEntry> {
        if persistent {
            let doc = self.read_document();
            DRIVER_OPTIONS
                .iter()
                .filter_map(|opt| {
                    doc.get(opt.name).map(|value| OptionEntry {
                        name: opt.name,
                        value: value.clone(),
                        default: (opt.default)(),
                    })
                })
                .collect()
        } else {
            let values = self.values.lock();
            DRIVER_OPTIONS
                .iter()
                .map(|opt| OptionEntry {
                    name: opt.name,
                    value: values[opt.name].clone(),
                    default: (opt.default)(),
                })
                .collect()
        }
    }

    /// Reapplies the persisted layer on top of the current values, skipping
    /// entries that fail coercion.
    pub fn reload(&self) {
        let doc = self.read_document();
        let mut values = self.values.lock();
        for (name, value) in doc {
            let Some(opt) = find_option(&name) else {
                warn!("ignoring unknown persisted option: {}", name);
                continue;
            };
            match value.coerce_to(&(opt.default)()) {
                Ok(value) => {
                    values.insert(opt.name, value);
                }
                Err(e) => warn!("could not load option {}: {}", name, e),
            }
        }
    }
}

impl Default for OptionsStore {
    fn default() -> OptionsStore {
        OptionsStore::new()
    }
}
