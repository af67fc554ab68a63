use crate::ConvError;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Value of an operator attribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    Bool(bool),
    Int(i32),
    Float(f32),
    Ints(Vec<i32>),
    Floats(Vec<f32>),
    String(String),
}

impl Attribute {
    fn kind(&self) -> &'static str {
        match self {
            Attribute::Bool(_) => "bool",
            Attribute::Int(_) => "int",
            Attribute::Float(_) => "float",
            Attribute::Ints(_) => "ints",
            Attribute::Floats(_) => "floats",
            Attribute::String(_) => "string",
        }
    }
}

/// Rust types stored as an [Attribute].
pub trait AttributeValue: Sized {
    /// Name of the attribute kind, used in error messages.
    const KIND: &'static str;

    fn from_attribute(attribute: &Attribute) -> Option<Self>;
    fn into_attribute(self) -> Attribute;
}

macro_rules! impl_attribute_value {
    ($ty:ty, $variant:ident, $kind:literal) => {
        impl AttributeValue for $ty {
            const KIND: &'static str = $kind;

            fn from_attribute(attribute: &Attribute) -> Option<Self> {
                match attribute {
                    Attribute::$variant(value) => Some(value.clone()),
                    _ => None,
                }
            }

            fn into_attribute(self) -> Attribute {
                Attribute::$variant(self)
            }
        }
    };
}

impl_attribute_value!(bool, Bool, "bool");
impl_attribute_value!(i32, Int, "int");
impl_attribute_value!(f32, Float, "float");
impl_attribute_value!(Vec<i32>, Ints, "ints");
impl_attribute_value!(Vec<f32>, Floats, "floats");
impl_attribute_value!(String, String, "string");

/// Description of a graph operator: its type, named input and output slots, and attributes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OpDesc {
    op_type: String,
    inputs: BTreeMap<String, Vec<String>>,
    outputs: BTreeMap<String, Vec<String>>,
    attrs: HashMap<String, Attribute>,
}

impl OpDesc {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            ..Default::default()
        }
    }

    /// Bind variables to an input slot.
    pub fn with_input(mut self, slot: &str, names: &[&str]) -> Self {
        self.inputs
            .insert(slot.into(), names.iter().map(|name| name.to_string()).collect());
        self
    }

    /// Bind variables to an output slot.
    pub fn with_output(mut self, slot: &str, names: &[&str]) -> Self {
        self.outputs
            .insert(slot.into(), names.iter().map(|name| name.to_string()).collect());
        self
    }

    pub fn with_attr<T: AttributeValue>(mut self, name: &str, value: T) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    /// Names of the declared input slots.
    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.keys().map(String::as_str)
    }

    /// Variables bound to an input slot, empty when the slot isn't declared.
    pub fn input(&self, slot: &str) -> &[String] {
        self.inputs.get(slot).map(Vec::as_slice).unwrap_or_default()
    }

    /// Variables bound to an output slot, empty when the slot isn't declared.
    pub fn output(&self, slot: &str) -> &[String] {
        self.outputs.get(slot).map(Vec::as_slice).unwrap_or_default()
    }

    /// Whether at least one variable is bound to the input slot.
    pub fn has_input(&self, slot: &str) -> bool {
        !self.input(slot).is_empty()
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    /// Read an attribute, `None` when absent.
    ///
    /// An attribute stored with another kind is an error rather than absent.
    pub fn attr<T: AttributeValue>(&self, name: &str) -> Result<Option<T>, ConvError> {
        let Some(attribute) = self.attrs.get(name) else {
            return Ok(None);
        };

        T::from_attribute(attribute).map(Some).ok_or_else(|| {
            ConvError::invalid(format!(
                "attribute `{name}` of `{}` is a {}, expected a {}",
                self.op_type,
                attribute.kind(),
                T::KIND
            ))
        })
    }

    /// Read an attribute, falling back to the type default when absent.
    pub fn get_attr_if_exists<T: AttributeValue + Default>(
        &self,
        name: &str,
    ) -> Result<T, ConvError> {
        Ok(self.attr(name)?.unwrap_or_default())
    }

    pub fn set_attr<T: AttributeValue>(&mut self, name: &str, value: T) {
        self.attrs.insert(name.into(), value.into_attribute());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_attribute_defaults() {
        let op = OpDesc::new("conv2d");

        assert_eq!(op.get_attr_if_exists::<f32>("Scale_in").unwrap(), 0.0);
        assert_eq!(op.get_attr_if_exists::<String>("fuse_activation").unwrap(), "");
        assert!(op.attr::<Vec<f32>>("Scale_weights").unwrap().is_none());
    }

    #[test]
    fn wrong_kind_is_an_error() {
        let op = OpDesc::new("conv2d").with_attr("groups", 2.0f32);

        assert!(matches!(
            op.attr::<i32>("groups"),
            Err(ConvError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn declared_but_empty_slot_has_no_input() {
        let op = OpDesc::new("conv2d")
            .with_input("Input", &["x"])
            .with_input("Bias", &[]);

        assert!(op.has_input("Input"));
        assert!(!op.has_input("Bias"));
        assert_eq!(op.input_names().collect::<Vec<_>>(), vec!["Bias", "Input"]);
        assert!(op.input("Filter").is_empty());
    }
}
