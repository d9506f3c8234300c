//! # UAVObject Fields
//!
//! A field is a typed, possibly multi-element value belonging to an object.
//!
//! The layout of every field is declared at compile time as a [`FieldDef`];
//! a [`Field`] pairs that declaration with the field's little-endian bytes.
//! Keeping the bytes in wire form makes packing a plain copy, while typed
//! reads and writes go through [`FieldValue`].
//!
//! ## Element widths
//!
//! | Type | Bytes per element |
//! |------|-------------------|
//! | INT8, UINT8, ENUM | 1 |
//! | INT16, UINT16 | 2 |
//! | INT32, UINT32, FLOAT32 | 4 |
//! | STRING | capacity given at declaration |

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{GcsError, Result};

/// Element names of a scalar field
pub const SCALAR: &[&str] = &["0"];

/// Field data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int8,
    Int16,
    Int32,
    UInt8,
    UInt16,
    UInt32,
    Float32,
    /// One byte per element, the index into the option list
    Enum,
    /// Fixed-capacity, zero-padded string
    String(usize),
}

impl FieldType {
    /// Size in bytes of one element of this type
    pub const fn element_size(&self) -> usize {
        match self {
            FieldType::Int8 | FieldType::UInt8 | FieldType::Enum => 1,
            FieldType::Int16 | FieldType::UInt16 => 2,
            FieldType::Int32 | FieldType::UInt32 | FieldType::Float32 => 4,
            FieldType::String(capacity) => *capacity,
        }
    }

    fn integer_bounds(&self) -> Option<(i64, i64)> {
        match self {
            FieldType::Int8 => Some((i8::MIN as i64, i8::MAX as i64)),
            FieldType::Int16 => Some((i16::MIN as i64, i16::MAX as i64)),
            FieldType::Int32 => Some((i32::MIN as i64, i32::MAX as i64)),
            FieldType::UInt8 => Some((0, u8::MAX as i64)),
            FieldType::UInt16 => Some((0, u16::MAX as i64)),
            FieldType::UInt32 => Some((0, u32::MAX as i64)),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Int8 => write!(f, "INT8"),
            FieldType::Int16 => write!(f, "INT16"),
            FieldType::Int32 => write!(f, "INT32"),
            FieldType::UInt8 => write!(f, "UINT8"),
            FieldType::UInt16 => write!(f, "UINT16"),
            FieldType::UInt32 => write!(f, "UINT32"),
            FieldType::Float32 => write!(f, "FLOAT32"),
            FieldType::Enum => write!(f, "ENUM"),
            FieldType::String(capacity) => write!(f, "STRING[{}]", capacity),
        }
    }
}

/// Compile-time declaration of a field
///
/// # Examples
///
/// ```
/// use uavtalk_gcs::uavobject::field::{FieldDef, FieldType, SCALAR};
///
/// const PERIOD: FieldDef = FieldDef::new("UpdatePeriod", "ms", FieldType::UInt8, SCALAR);
/// assert_eq!(PERIOD.num_bytes(), 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub units: &'static str,
    pub field_type: FieldType,
    /// One name per element; scalars use [`SCALAR`]
    pub elements: &'static [&'static str],
    /// Permitted symbolic values, ENUM only
    pub options: &'static [&'static str],
}

impl FieldDef {
    /// Declare a numeric or string field
    pub const fn new(
        name: &'static str,
        units: &'static str,
        field_type: FieldType,
        elements: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            units,
            field_type,
            elements,
            options: &[],
        }
    }

    /// Declare an ENUM field
    pub const fn enumeration(
        name: &'static str,
        units: &'static str,
        elements: &'static [&'static str],
        options: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            units,
            field_type: FieldType::Enum,
            elements,
            options,
        }
    }

    pub const fn num_elements(&self) -> usize {
        self.elements.len()
    }

    /// Serialized width: element count × element width
    pub const fn num_bytes(&self) -> usize {
        self.elements.len() * self.field_type.element_size()
    }

    /// Check the declaration is self-consistent
    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GcsError::Catalog("field with empty name".to_string()));
        }
        if self.elements.is_empty() {
            return Err(GcsError::Catalog(format!(
                "field '{}' must have at least one element",
                self.name
            )));
        }
        for (i, element) in self.elements.iter().enumerate() {
            if self.elements[..i].contains(element) {
                return Err(GcsError::Catalog(format!(
                    "field '{}' repeats element name '{}'",
                    self.name, element
                )));
            }
        }
        match self.field_type {
            FieldType::Enum => {
                if self.options.is_empty() || self.options.len() > 256 {
                    return Err(GcsError::Catalog(format!(
                        "enum field '{}' must declare between 1 and 256 options",
                        self.name
                    )));
                }
            }
            FieldType::String(0) => {
                return Err(GcsError::Catalog(format!(
                    "string field '{}' has zero capacity",
                    self.name
                )));
            }
            _ => {
                if !self.options.is_empty() {
                    return Err(GcsError::Catalog(format!(
                        "non-enum field '{}' declares options",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A single typed element value
///
/// ENUM elements are read back as [`FieldValue::Enum`] holding the option
/// name. Writes accept any variant that converts losslessly to the field's
/// type: integers into any numeric field within range, option names or
/// indices into ENUM fields, text into STRING fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    Float32(f32),
    Enum(String),
    String(String),
}

impl FieldValue {
    /// Integer view of a numeric value
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int8(v) => Some(*v as i64),
            FieldValue::Int16(v) => Some(*v as i64),
            FieldValue::Int32(v) => Some(*v as i64),
            FieldValue::UInt8(v) => Some(*v as i64),
            FieldValue::UInt16(v) => Some(*v as i64),
            FieldValue::UInt32(v) => Some(*v as i64),
            FieldValue::Float32(v) if v.is_finite() && v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    /// Floating point view of a numeric value
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float32(v) => Some(*v as f64),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    /// Text view of an ENUM or STRING value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Enum(s) | FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            FieldValue::Int8(_) => "INT8",
            FieldValue::Int16(_) => "INT16",
            FieldValue::Int32(_) => "INT32",
            FieldValue::UInt8(_) => "UINT8",
            FieldValue::UInt16(_) => "UINT16",
            FieldValue::UInt32(_) => "UINT32",
            FieldValue::Float32(_) => "FLOAT32",
            FieldValue::Enum(_) => "ENUM",
            FieldValue::String(_) => "STRING",
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int8(v) => write!(f, "{}", v),
            FieldValue::Int16(v) => write!(f, "{}", v),
            FieldValue::Int32(v) => write!(f, "{}", v),
            FieldValue::UInt8(v) => write!(f, "{}", v),
            FieldValue::UInt16(v) => write!(f, "{}", v),
            FieldValue::UInt32(v) => write!(f, "{}", v),
            FieldValue::Float32(v) => write!(f, "{}", v),
            FieldValue::Enum(s) | FieldValue::String(s) => write!(f, "{}", s),
        }
    }
}

macro_rules! impl_from_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(value: $ty) -> Self {
                    FieldValue::$variant(value)
                }
            }
        )*
    };
}

impl_from_value! {
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    f32 => Float32,
    String => String,
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

/// A field instance: declaration plus its serialized bytes
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    def: &'static FieldDef,
    data: Vec<u8>,
}

impl Field {
    /// Create a zero-initialized field
    pub fn new(def: &'static FieldDef) -> Self {
        Self {
            def,
            data: vec![0u8; def.num_bytes()],
        }
    }

    pub fn def(&self) -> &'static FieldDef {
        self.def
    }

    pub fn name(&self) -> &'static str {
        self.def.name
    }

    pub fn units(&self) -> &'static str {
        self.def.units
    }

    pub fn field_type(&self) -> FieldType {
        self.def.field_type
    }

    pub fn num_elements(&self) -> usize {
        self.def.num_elements()
    }

    pub fn element_names(&self) -> &'static [&'static str] {
        self.def.elements
    }

    pub fn options(&self) -> &'static [&'static str] {
        self.def.options
    }

    /// Serialized width in bytes
    pub fn num_bytes(&self) -> usize {
        self.data.len()
    }

    /// Resolve an element name to its index
    pub fn element_index(&self, element: &str) -> Result<usize> {
        self.def
            .elements
            .iter()
            .position(|name| *name == element)
            .ok_or_else(|| GcsError::UnknownElement {
                field: self.def.name.to_string(),
                element: element.to_string(),
            })
    }

    /// Read one element
    ///
    /// # Errors
    ///
    /// - `ElementOutOfRange` if `index` is not below the element count
    /// - `ValueOutOfRange` if an ENUM element holds an index outside the
    ///   declared options (only possible after unpacking foreign bytes)
    pub fn get_value(&self, index: usize) -> Result<FieldValue> {
        let bytes = self.element_bytes(index)?;
        let value = match self.def.field_type {
            FieldType::Int8 => FieldValue::Int8(bytes[0] as i8),
            FieldType::UInt8 => FieldValue::UInt8(bytes[0]),
            FieldType::Int16 => FieldValue::Int16(i16::from_le_bytes([bytes[0], bytes[1]])),
            FieldType::UInt16 => FieldValue::UInt16(u16::from_le_bytes([bytes[0], bytes[1]])),
            FieldType::Int32 => FieldValue::Int32(i32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ])),
            FieldType::UInt32 => FieldValue::UInt32(u32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ])),
            FieldType::Float32 => FieldValue::Float32(f32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ])),
            FieldType::Enum => {
                let option = self.def.options.get(bytes[0] as usize).ok_or_else(|| {
                    GcsError::ValueOutOfRange {
                        field: self.def.name.to_string(),
                        value: bytes[0].to_string(),
                    }
                })?;
                FieldValue::Enum(option.to_string())
            }
            FieldType::String(_) => {
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                FieldValue::String(String::from_utf8_lossy(&bytes[..end]).into_owned())
            }
        };
        Ok(value)
    }

    /// Read one element addressed by element name
    pub fn get_value_by_name(&self, element: &str) -> Result<FieldValue> {
        self.get_value(self.element_index(element)?)
    }

    /// Read the option index stored in an ENUM element
    pub fn get_enum_index(&self, index: usize) -> Result<u8> {
        if self.def.field_type != FieldType::Enum {
            return Err(GcsError::TypeMismatch {
                field: self.def.name.to_string(),
                expected: self.def.field_type.to_string(),
                found: "ENUM".to_string(),
            });
        }
        Ok(self.element_bytes(index)?[0])
    }

    /// Every element, in order
    ///
    /// ENUM elements holding an undeclared index are reported as their raw
    /// `UInt8` value instead of failing.
    pub fn values(&self) -> Vec<FieldValue> {
        (0..self.num_elements())
            .map(|i| {
                self.get_value(i)
                    .unwrap_or_else(|_| FieldValue::UInt8(self.data[i]))
            })
            .collect()
    }

    /// Write one element
    ///
    /// The field is left untouched when the write fails.
    ///
    /// # Errors
    ///
    /// - `ElementOutOfRange` for a bad element index
    /// - `UnknownOption` for an ENUM name not in the option list
    /// - `ValueOutOfRange` for a number outside the type's range, an ENUM
    ///   index outside the options, or a string longer than its capacity
    /// - `TypeMismatch` when the value cannot represent the field type
    pub fn set_value(&mut self, index: usize, value: impl Into<FieldValue>) -> Result<()> {
        let value = value.into();
        self.check_index(index)?;
        let encoded = self.encode_element(&value)?;
        let width = self.def.field_type.element_size();
        self.data[index * width..(index + 1) * width].copy_from_slice(&encoded);
        Ok(())
    }

    /// Write one element addressed by element name
    pub fn set_value_by_name(&mut self, element: &str, value: impl Into<FieldValue>) -> Result<()> {
        let index = self.element_index(element)?;
        self.set_value(index, value)
    }

    /// Serialize into `buf`, returning the number of bytes written
    pub fn pack(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.data.len();
        if buf.len() < n {
            return Err(GcsError::BufferTooShort {
                needed: n,
                available: buf.len(),
            });
        }
        buf[..n].copy_from_slice(&self.data);
        Ok(n)
    }

    /// Deserialize from `buf`, returning the number of bytes consumed
    pub fn unpack(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.data.len();
        if buf.len() < n {
            return Err(GcsError::BufferTooShort {
                needed: n,
                available: buf.len(),
            });
        }
        self.data.copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.num_elements() {
            return Err(GcsError::ElementOutOfRange {
                field: self.def.name.to_string(),
                index,
                count: self.num_elements(),
            });
        }
        Ok(())
    }

    fn element_bytes(&self, index: usize) -> Result<&[u8]> {
        self.check_index(index)?;
        let width = self.def.field_type.element_size();
        Ok(&self.data[index * width..(index + 1) * width])
    }

    fn out_of_range(&self, value: &FieldValue) -> GcsError {
        GcsError::ValueOutOfRange {
            field: self.def.name.to_string(),
            value: value.to_string(),
        }
    }

    fn mismatch(&self, value: &FieldValue) -> GcsError {
        GcsError::TypeMismatch {
            field: self.def.name.to_string(),
            expected: self.def.field_type.to_string(),
            found: value.kind().to_string(),
        }
    }

    fn integer(&self, value: &FieldValue) -> Result<i64> {
        match value {
            FieldValue::Float32(v) if !v.is_finite() || v.fract() != 0.0 => {
                Err(self.mismatch(value))
            }
            FieldValue::Enum(_) | FieldValue::String(_) => Err(self.mismatch(value)),
            other => other.as_i64().ok_or_else(|| self.out_of_range(value)),
        }
    }

    fn encode_element(&self, value: &FieldValue) -> Result<Vec<u8>> {
        let field_type = self.def.field_type;

        if let Some((min, max)) = field_type.integer_bounds() {
            let v = self.integer(value)?;
            if v < min || v > max {
                return Err(self.out_of_range(value));
            }
            let encoded = match field_type {
                FieldType::Int8 => (v as i8).to_le_bytes().to_vec(),
                FieldType::UInt8 => (v as u8).to_le_bytes().to_vec(),
                FieldType::Int16 => (v as i16).to_le_bytes().to_vec(),
                FieldType::UInt16 => (v as u16).to_le_bytes().to_vec(),
                FieldType::Int32 => (v as i32).to_le_bytes().to_vec(),
                _ => (v as u32).to_le_bytes().to_vec(),
            };
            return Ok(encoded);
        }

        match field_type {
            FieldType::Float32 => {
                let v = value.as_f64().ok_or_else(|| self.mismatch(value))?;
                Ok((v as f32).to_le_bytes().to_vec())
            }
            FieldType::Enum => match value {
                FieldValue::Enum(name) | FieldValue::String(name) => {
                    let index = self
                        .def
                        .options
                        .iter()
                        .position(|option| option == name)
                        .ok_or_else(|| GcsError::UnknownOption {
                            field: self.def.name.to_string(),
                            option: name.clone(),
                        })?;
                    Ok(vec![index as u8])
                }
                other => {
                    let index = self.integer(other)?;
                    if index < 0 || index as usize >= self.def.options.len() {
                        return Err(self.out_of_range(other));
                    }
                    Ok(vec![index as u8])
                }
            },
            FieldType::String(capacity) => match value {
                FieldValue::Enum(text) | FieldValue::String(text) => {
                    if text.len() > capacity {
                        return Err(self.out_of_range(value));
                    }
                    let mut encoded = vec![0u8; capacity];
                    encoded[..text.len()].copy_from_slice(text.as_bytes());
                    Ok(encoded)
                }
                other => Err(self.mismatch(other)),
            },
            _ => Err(self.mismatch(value)),
        }
    }
}

/// Name → position lookup shared by every instance of an object class
pub type FieldIndex = HashMap<&'static str, usize>;

pub(crate) fn build_index(defs: &'static [FieldDef]) -> Result<FieldIndex> {
    let mut index = HashMap::with_capacity(defs.len());
    for (position, def) in defs.iter().enumerate() {
        def.validate()?;
        if index.insert(def.name, position).is_some() {
            return Err(GcsError::Catalog(format!("duplicate field name '{}'", def.name)));
        }
    }
    Ok(index)
}

/// The ordered fields of one object
///
/// Order is the on-wire layout. Pack and unpack walk the vector directly;
/// name lookups go through the shared [`FieldIndex`].
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSet {
    fields: Vec<Field>,
    index: Arc<FieldIndex>,
}

impl FieldSet {
    pub(crate) fn new(defs: &'static [FieldDef], index: Arc<FieldIndex>) -> Self {
        Self {
            fields: defs.iter().map(Field::new).collect(),
            index,
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Field> {
        self.fields.iter()
    }

    /// Sum of all field widths
    pub fn num_bytes(&self) -> usize {
        self.fields.iter().map(Field::num_bytes).sum()
    }

    pub fn field(&self, name: &str) -> Result<&Field> {
        let position = self.position(name)?;
        Ok(&self.fields[position])
    }

    pub fn field_mut(&mut self, name: &str) -> Result<&mut Field> {
        let position = self.position(name)?;
        Ok(&mut self.fields[position])
    }

    /// Read element `index` of field `name`
    pub fn get(&self, name: &str, index: usize) -> Result<FieldValue> {
        self.field(name)?.get_value(index)
    }

    /// Write element `index` of field `name`
    pub fn set(&mut self, name: &str, index: usize, value: impl Into<FieldValue>) -> Result<()> {
        self.field_mut(name)?.set_value(index, value)
    }

    /// Write the same value into every element of field `name`
    pub fn set_all(&mut self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        let value = value.into();
        let field = self.field_mut(name)?;
        let mut staged = field.clone();
        for index in 0..staged.num_elements() {
            staged.set_value(index, value.clone())?;
        }
        *field = staged;
        Ok(())
    }

    /// Concatenated packing of every field in declared order
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.num_bytes()];
        let mut offset = 0;
        for field in &self.fields {
            let n = field.num_bytes();
            buf[offset..offset + n].copy_from_slice(&field.data);
            offset += n;
        }
        buf
    }

    /// Unpack every field from `buf`
    ///
    /// The length is checked up front so a short buffer leaves all fields
    /// untouched.
    pub fn unpack(&mut self, buf: &[u8]) -> Result<()> {
        let needed = self.num_bytes();
        if buf.len() < needed {
            return Err(GcsError::BufferTooShort {
                needed,
                available: buf.len(),
            });
        }
        let mut offset = 0;
        for field in &mut self.fields {
            offset += field.unpack(&buf[offset..])?;
        }
        Ok(())
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| GcsError::UnknownField(name.to_string()))
    }
}
