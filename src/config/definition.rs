//! Generator definitions and parse outcomes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Layer a generator belongs to.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorCategory {
    Primitive,
    Simple,
    Complex,
}

impl GeneratorCategory {
    /// All categories, in document order.
    pub const ALL: [Self; 3] = [Self::Primitive, Self::Simple, Self::Complex];

    /// Key of the category's array in a configuration document.
    #[must_use]
    pub const fn section(self) -> &'static str {
        match self {
            Self::Primitive => "primitives",
            Self::Simple => "simples",
            Self::Complex => "complexes",
        }
    }
}

impl fmt::Display for GeneratorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive => write!(f, "primitive"),
            Self::Simple => write!(f, "simple"),
            Self::Complex => write!(f, "complex"),
        }
    }
}

/// Declared type of a parameter value.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamType {
    Long,
    Integer,
    Double,
    String,
    Boolean,
}

impl FromStr for ParamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" => Ok(Self::Long),
            "integer" | "int" => Ok(Self::Integer),
            "double" | "float" => Ok(Self::Double),
            "string" => Ok(Self::String),
            "boolean" | "bool" => Ok(Self::Boolean),
            other => Err(format!("unknown parameter type '{other}'")),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Long => "Long",
            Self::Integer => "Integer",
            Self::Double => "Double",
            Self::String => "String",
            Self::Boolean => "Boolean",
        };
        f.write_str(s)
    }
}

/// One `(type, value)` parameter, kept as text until a generator is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    /// Declared type.
    pub param_type: ParamType,
    /// Raw value.
    pub value: String,
}

impl Param {
    #[must_use]
    pub fn new(param_type: ParamType, value: impl Into<String>) -> Self {
        Self {
            param_type,
            value: value.into(),
        }
    }

    fn raw_as(&self, wanted: &[ParamType]) -> Result<&str, String> {
        if wanted.contains(&self.param_type) {
            Ok(self.value.trim())
        } else {
            Err(format!("expected {}, declared {}", wanted[0], self.param_type))
        }
    }

    /// Value of a Long or Integer parameter.
    pub fn as_i64(&self) -> Result<i64, String> {
        let raw = self.raw_as(&[ParamType::Long, ParamType::Integer])?;
        raw.parse().map_err(|_| format!("'{raw}' is not an integer"))
    }

    /// Value of an Integer parameter.
    pub fn as_i32(&self) -> Result<i32, String> {
        let raw = self.raw_as(&[ParamType::Integer, ParamType::Long])?;
        raw.parse().map_err(|_| format!("'{raw}' is not a 32-bit integer"))
    }

    /// Value of a numeric parameter as a float.
    pub fn as_f64(&self) -> Result<f64, String> {
        let raw = self.raw_as(&[ParamType::Double, ParamType::Long, ParamType::Integer])?;
        raw.parse().map_err(|_| format!("'{raw}' is not a number"))
    }

    /// Value of a Boolean parameter.
    pub fn as_bool(&self) -> Result<bool, String> {
        let raw = self.raw_as(&[ParamType::Boolean])?;
        match raw.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(format!("'{raw}' is not a boolean")),
        }
    }

    /// Raw value of any parameter.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

/// A validated, enabled generator entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorDefinition {
    /// Unique name across the document.
    pub name: String,
    /// Primitive, simple or complex.
    pub category: GeneratorCategory,
    /// Concrete kind, e.g. `PEG_Co_ResponseTime`.
    pub type_name: String,
    /// Refresh interval in milliseconds; primitives only.
    pub runtime_ms: Option<u64>,
    /// Always true for parsed definitions; disabled entries are skipped.
    pub enabled: bool,
    /// Ordered parameters; simple and complex only.
    pub params: Vec<Param>,
}

impl GeneratorDefinition {
    /// A primitive generator definition.
    #[must_use]
    pub fn primitive(
        name: impl Into<String>,
        type_name: impl Into<String>,
        runtime_ms: u64,
    ) -> Self {
        Self {
            name: name.into(),
            category: GeneratorCategory::Primitive,
            type_name: type_name.into(),
            runtime_ms: Some(runtime_ms),
            enabled: true,
            params: Vec::new(),
        }
    }

    /// A simple or complex generator definition.
    #[must_use]
    pub fn derived(
        category: GeneratorCategory,
        name: impl Into<String>,
        type_name: impl Into<String>,
        params: Vec<Param>,
    ) -> Self {
        Self {
            name: name.into(),
            category,
            type_name: type_name.into(),
            runtime_ms: None,
            enabled: true,
            params,
        }
    }

    /// Refresh interval, if any.
    #[must_use]
    pub fn runtime(&self) -> Option<Duration> {
        self.runtime_ms.map(Duration::from_millis)
    }
}

/// Definitions plus every recoverable problem found while producing them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseOutcome {
    /// Definitions that passed validation, in document order.
    pub definitions: Vec<GeneratorDefinition>,
    /// Problems found, in document order.
    pub errors: Vec<ConfigError>,
}

impl ParseOutcome {
    /// An outcome holding only one error.
    #[must_use]
    pub fn failed(error: ConfigError) -> Self {
        Self {
            definitions: Vec::new(),
            errors: vec![error],
        }
    }

    /// Concatenates two outcomes, `self` first.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.definitions.extend(other.definitions);
        self.errors.extend(other.errors);
        self
    }

    /// True if no error was found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Definitions of one category.
    pub fn of_category(
        &self,
        category: GeneratorCategory,
    ) -> impl Iterator<Item = &GeneratorDefinition> {
        self.definitions.iter().filter(move |d| d.category == category)
    }

    /// True if a definition with this name was kept.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.definitions.iter().any(|d| d.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_type_is_case_insensitive() {
        assert_eq!("LONG".parse::<ParamType>().unwrap(), ParamType::Long);
        assert_eq!("boolean".parse::<ParamType>().unwrap(), ParamType::Boolean);
        assert_eq!(" Double ".parse::<ParamType>().unwrap(), ParamType::Double);
        assert!("Decimal".parse::<ParamType>().is_err());
    }

    #[test]
    fn param_conversions() {
        assert_eq!(Param::new(ParamType::Long, "500").as_i64().unwrap(), 500);
        assert_eq!(Param::new(ParamType::Integer, " 3 ").as_i32().unwrap(), 3);
        let ratio = Param::new(ParamType::Double, "0.75").as_f64().unwrap();
        assert!((ratio - 0.75).abs() < f64::EPSILON);
        assert!(Param::new(ParamType::Boolean, "TRUE").as_bool().unwrap());
        assert!(Param::new(ParamType::String, "500").as_i64().is_err());
        assert!(Param::new(ParamType::Long, "abc").as_i64().is_err());
    }

    #[test]
    fn merge_keeps_order() {
        let a = ParseOutcome {
            definitions: vec![GeneratorDefinition::primitive("a", "PEG_Vm_Cpu", 100)],
            errors: vec![ConfigError::InvalidStructure { reason: "x".into() }],
        };
        let b = ParseOutcome {
            definitions: vec![GeneratorDefinition::primitive("b", "PEG_Vm_Ram", 100)],
            errors: Vec::new(),
        };
        let merged = a.merge(b);
        let names: Vec<_> = merged.definitions.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(merged.errors.len(), 1);
        assert!(!merged.is_clean());
    }
}
