//! Call arguments: positional values plus keyword values.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Dynamically-typed argument and result value.
///
/// `MsgPack`-native so binary data survives the wire without base64.
pub use rmpv::Value;

/// Errors from building or reading typed arguments.
#[derive(Debug, thiserror::Error)]
pub enum ArgError {
    #[error("missing positional argument {index}")]
    Missing { index: usize },
    #[error("missing keyword argument '{name}'")]
    MissingKeyword { name: String },
    #[error("invalid argument {position}: {source}")]
    Invalid {
        position: String,
        #[source]
        source: rmpv::ext::Error,
    },
}

/// Arguments of a single call, in the shape the handler receives them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl CallArgs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    #[must_use]
    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Sets a keyword argument, replacing any previous value for `name`.
    #[must_use]
    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Appends any serializable value as a positional argument.
    ///
    /// # Errors
    ///
    /// Returns `ArgError::Invalid` if `value` cannot be represented as a `Value`.
    pub fn try_with_arg<T: Serialize>(mut self, value: T) -> Result<Self, ArgError> {
        let position = self.args.len().to_string();
        let value = rmpv::ext::to_value(value).map_err(|source| ArgError::Invalid { position, source })?;
        self.args.push(value);
        Ok(self)
    }

    /// Reads positional argument `index` as `T`.
    ///
    /// # Errors
    ///
    /// Returns `ArgError::Missing` if there is no such argument, or
    /// `ArgError::Invalid` if it does not deserialize as `T`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, ArgError> {
        let value = self.args.get(index).ok_or(ArgError::Missing { index })?;
        rmpv::ext::from_value(value.clone()).map_err(|source| ArgError::Invalid {
            position: index.to_string(),
            source,
        })
    }

    /// Reads keyword argument `name` as `T`.
    ///
    /// # Errors
    ///
    /// Returns `ArgError::MissingKeyword` if absent, or `ArgError::Invalid`
    /// if it does not deserialize as `T`.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<T, ArgError> {
        let value = self.kwargs.get(name).ok_or_else(|| ArgError::MissingKeyword {
            name: name.to_string(),
        })?;
        rmpv::ext::from_value(value.clone()).map_err(|source| ArgError::Invalid {
            position: format!("'{name}'"),
            source,
        })
    }

    /// Number of arguments, positional and keyword.
    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len() + self.kwargs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

impl From<Vec<Value>> for CallArgs {
    fn from(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: BTreeMap::new(),
        }
    }
}

/// Builds `CallArgs` from positional values: `args![2, 3]`, `args!["hello"]`.
#[macro_export]
macro_rules! args {
    () => {
        $crate::CallArgs::new()
    };
    ($($arg:expr),+ $(,)?) => {
        $crate::CallArgs::new()$(.with_arg($arg))+
    };
}
