//! Addressing scheme for interception points.
//!
//! A [`HookTarget`] names either a managed method on a host service type or an
//! exported symbol in a loaded native library. The tuple of its fields is the
//! registry key, so two targets compare equal exactly when every field does.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An addressable interception point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookTarget {
    /// A method on a managed host service type.
    ///
    /// `parameter_signature` disambiguates overloads. An empty signature is a
    /// valid key of its own and does not act as a wildcard.
    ManagedMethod {
        type_name: String,
        method_name: String,
        parameter_signature: String,
    },

    /// An exported function in a native library.
    NativeSymbol {
        library_name: String,
        symbol_name: String,
    },
}

impl HookTarget {
    /// Builds a managed-method target.
    ///
    /// # Example
    ///
    /// ```
    /// use appvirt::hook::target::HookTarget;
    ///
    /// let target = HookTarget::managed("host.ActivityManager", "startActivity", "(String)int");
    /// assert_eq!(target.to_string(), "host.ActivityManager#startActivity(String)int");
    /// ```
    pub fn managed(
        type_name: impl Into<String>,
        method_name: impl Into<String>,
        parameter_signature: impl Into<String>,
    ) -> Self {
        Self::ManagedMethod {
            type_name: type_name.into(),
            method_name: method_name.into(),
            parameter_signature: parameter_signature.into(),
        }
    }

    /// Builds a native-symbol target.
    pub fn native(library_name: impl Into<String>, symbol_name: impl Into<String>) -> Self {
        Self::NativeSymbol {
            library_name: library_name.into(),
            symbol_name: symbol_name.into(),
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Self::NativeSymbol { .. })
    }
}

impl fmt::Display for HookTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ManagedMethod {
                type_name,
                method_name,
                parameter_signature,
            } => write!(f, "{}#{}{}", type_name, method_name, parameter_signature),
            Self::NativeSymbol {
                library_name,
                symbol_name,
            } => write!(f, "{}!{}", library_name, symbol_name),
        }
    }
}
