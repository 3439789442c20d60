use crate::codec::definition::{Kind, MessageDefinition};
use crate::error::ProtocolError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use hashbrown::HashMap;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

/// A single argument value, tagged by wire kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Float32s(Vec<f32>),
    Float64s(Vec<f64>),
}

impl Value {
    /// Coerces the value into the declared kind of its argument slot.
    /// Numeric values convert between the scalar kinds; everything else must
    /// already match.
    fn coerce(self, kind: Kind) -> Option<Value> {
        match (kind, self) {
            (Kind::Int32, Value::Int(v)) => Some(Value::Int(v)),
            (Kind::Int32, Value::Float(v)) => Some(Value::Int(v as i32)),
            (Kind::Float64, Value::Float(v)) => Some(Value::Float(v)),
            (Kind::Float64, Value::Int(v)) => Some(Value::Float(f64::from(v))),
            (Kind::Utf8String, value @ Value::Str(_)) => Some(value),
            (Kind::Bytes, value @ Value::Bytes(_)) => Some(value),
            (Kind::Float32Vector, value @ Value::Float32s(_)) => Some(value),
            (Kind::Float64Vector, value @ Value::Float64s(_)) => Some(value),
            _ => None,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    /// Truncates to the signed 32-bit range carried on the wire.
    fn from(v: i64) -> Value {
        Value::Int(v as i32)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Value {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Value {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Value {
        Value::Float32s(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Value {
        Value::Float64s(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Float32s(v) => write!(f, "{:?}", v),
            Value::Float64s(v) => write!(f, "{:?}", v),
        }
    }
}

/// One message instance: a definition plus values for its arguments.
///
/// Constructed by the sender, packed to bytes, and unpacked read-only on the
/// receiving side. Packing is deterministic: identical definitions and
/// identical values produce identical bytes.
#[derive(Debug, Clone)]
pub struct Message {
    definition: Arc<MessageDefinition>,
    values: HashMap<String, Value>,
}

impl Message {
    /// Creates an empty message of the named type.
    pub fn new(name: &str) -> Result<Message, ProtocolError> {
        Ok(Message::from_definition(MessageDefinition::fetch(name)?))
    }

    pub(crate) fn from_definition(definition: Arc<MessageDefinition>) -> Message {
        Message {
            definition,
            values: HashMap::new(),
        }
    }

    /// Creates a reserved protocol message. The registry always contains the
    /// reserved definitions, so this cannot fail.
    pub(crate) fn reserved(name: &str) -> Message {
        Message::new(name).expect("reserved definitions are always registered")
    }

    #[inline]
    pub fn definition(&self) -> &MessageDefinition {
        &self.definition
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.definition.name()
    }

    /// Sets one argument, coercing the value to the declared kind.
    pub fn set<V: Into<Value>>(&mut self, name: &str, value: V) -> Result<(), ProtocolError> {
        let kind = self
            .definition
            .argument_kind(name)
            .ok_or_else(|| ProtocolError::UnknownArgument {
                message: self.name().to_string(),
                argument: name.to_string(),
            })?;
        let value = value.into().coerce(kind).ok_or_else(|| ProtocolError::KindMismatch {
            argument: name.to_string(),
            expected: kind,
        })?;
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    /// Chainable `set`, for building messages in one expression.
    pub fn with<V: Into<Value>>(mut self, name: &str, value: V) -> Result<Message, ProtocolError> {
        self.set(name, value)?;
        Ok(self)
    }

    /// Raw access to an argument value, if set.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn i32(&self, name: &str) -> Result<i32, ProtocolError> {
        match self.require(name)? {
            Value::Int(v) => Ok(*v),
            _ => Err(self.mismatch(name)),
        }
    }

    pub fn f64(&self, name: &str) -> Result<f64, ProtocolError> {
        match self.require(name)? {
            Value::Float(v) => Ok(*v),
            _ => Err(self.mismatch(name)),
        }
    }

    pub fn str(&self, name: &str) -> Result<&str, ProtocolError> {
        match self.require(name)? {
            Value::Str(v) => Ok(v),
            _ => Err(self.mismatch(name)),
        }
    }

    pub fn bytes(&self, name: &str) -> Result<&[u8], ProtocolError> {
        match self.require(name)? {
            Value::Bytes(v) => Ok(v),
            _ => Err(self.mismatch(name)),
        }
    }

    pub fn f32s(&self, name: &str) -> Result<&[f32], ProtocolError> {
        match self.require(name)? {
            Value::Float32s(v) => Ok(v),
            _ => Err(self.mismatch(name)),
        }
    }

    pub fn f64s(&self, name: &str) -> Result<&[f64], ProtocolError> {
        match self.require(name)? {
            Value::Float64s(v) => Ok(v),
            _ => Err(self.mismatch(name)),
        }
    }

    fn require(&self, name: &str) -> Result<&Value, ProtocolError> {
        if self.definition.argument_kind(name).is_none() {
            return Err(ProtocolError::UnknownArgument {
                message: self.name().to_string(),
                argument: name.to_string(),
            });
        }
        self.values.get(name).ok_or_else(|| ProtocolError::MissingArgument {
            message: self.name().to_string(),
            argument: name.to_string(),
        })
    }

    fn mismatch(&self, name: &str) -> ProtocolError {
        ProtocolError::KindMismatch {
            argument: name.to_string(),
            expected: self
                .definition
                .argument_kind(name)
                .expect("mismatch reported for a declared argument"),
        }
    }

    /// Packs the message body: the message id, then the fixed part in sorted
    /// argument order (scalars inline, variable kinds as length
    /// placeholders), then the variable payloads in the same order.
    pub fn pack(&self) -> Result<Vec<u8>, ProtocolError> {
        let definition = &self.definition;
        let mut body = Vec::with_capacity(4 + definition.fixed_size());
        body.write_u32::<LittleEndian>(definition.id()).expect("vec write");

        let mut variable: Vec<&Value> = Vec::new();

        for (name, kind) in definition.arguments() {
            let value = self.values.get(name).ok_or_else(|| ProtocolError::MissingArgument {
                message: self.name().to_string(),
                argument: name.to_string(),
            })?;

            match (kind, value) {
                (Kind::Int32, Value::Int(v)) => body.write_i32::<LittleEndian>(*v).expect("vec write"),
                (Kind::Float64, Value::Float(v)) => body.write_f64::<LittleEndian>(*v).expect("vec write"),
                (Kind::Utf8String, Value::Str(v)) => {
                    body.write_u32::<LittleEndian>(v.len() as u32).expect("vec write");
                    variable.push(value);
                }
                (Kind::Bytes, Value::Bytes(v)) => {
                    body.write_u32::<LittleEndian>(v.len() as u32).expect("vec write");
                    variable.push(value);
                }
                (Kind::Float32Vector, Value::Float32s(v)) => {
                    body.write_u32::<LittleEndian>((v.len() * 4) as u32).expect("vec write");
                    variable.push(value);
                }
                (Kind::Float64Vector, Value::Float64s(v)) => {
                    body.write_u32::<LittleEndian>((v.len() * 8) as u32).expect("vec write");
                    variable.push(value);
                }
                _ => {
                    return Err(ProtocolError::KindMismatch {
                        argument: name.to_string(),
                        expected: kind,
                    });
                }
            }
        }

        for value in variable {
            match value {
                Value::Str(v) => body.extend_from_slice(v.as_bytes()),
                Value::Bytes(v) => body.extend_from_slice(v),
                Value::Float32s(v) => {
                    for element in v {
                        body.write_f32::<LittleEndian>(*element).expect("vec write");
                    }
                }
                Value::Float64s(v) => {
                    for element in v {
                        body.write_f64::<LittleEndian>(*element).expect("vec write");
                    }
                }
                _ => unreachable!("only variable kinds are deferred"),
            }
        }

        Ok(body)
    }

    /// Unpacks a message body. The leading id selects the definition; the
    /// fixed part supplies scalars and the variable payload lengths.
    pub fn unpack(data: &[u8]) -> Result<Message, ProtocolError> {
        let mut cursor = Cursor::new(data);
        let id = cursor.read_u32::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?;
        let definition = MessageDefinition::fetch_by_id(id)?;

        let mut message = Message::from_definition(definition.clone());
        let mut variable: Vec<(&str, Kind, usize)> = Vec::new();

        for (name, kind) in definition.arguments() {
            if kind.is_variable() {
                let len = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| ProtocolError::Truncated)? as usize;
                variable.push((name, kind, len));
                continue;
            }
            let value = match kind {
                Kind::Int32 => Value::Int(
                    cursor
                        .read_i32::<LittleEndian>()
                        .map_err(|_| ProtocolError::Truncated)?,
                ),
                Kind::Float64 => Value::Float(
                    cursor
                        .read_f64::<LittleEndian>()
                        .map_err(|_| ProtocolError::Truncated)?,
                ),
                _ => unreachable!("scalar kinds only"),
            };
            message.values.insert(name.to_string(), value);
        }

        let mut offset = cursor.position() as usize;
        for (name, kind, len) in variable {
            let end = offset.checked_add(len).ok_or(ProtocolError::Truncated)?;
            if end > data.len() {
                return Err(ProtocolError::Truncated);
            }
            let raw = &data[offset..end];

            let value = match kind {
                Kind::Utf8String => Value::Str(String::from_utf8(raw.to_vec()).map_err(|_| {
                    ProtocolError::InvalidUtf8 {
                        argument: name.to_string(),
                    }
                })?),
                Kind::Bytes => Value::Bytes(raw.to_vec()),
                Kind::Float32Vector => Value::Float32s(read_vector(name, raw, 4, |chunk| {
                    f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
                })?),
                Kind::Float64Vector => Value::Float64s(read_vector(name, raw, 8, |chunk| {
                    f64::from_le_bytes([
                        chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
                    ])
                })?),
                _ => unreachable!("variable kinds only"),
            };

            message.values.insert(name.to_string(), value);
            offset = end;
        }

        if offset != data.len() {
            return Err(ProtocolError::TrailingBytes(data.len() - offset));
        }

        Ok(message)
    }
}

fn read_vector<T, F: Fn(&[u8]) -> T>(
    name: &str,
    raw: &[u8],
    element: usize,
    decode: F,
) -> Result<Vec<T>, ProtocolError> {
    if raw.len() % element != 0 {
        return Err(ProtocolError::UnevenVector {
            argument: name.to_string(),
            len: raw.len(),
            element,
        });
    }
    Ok(raw.chunks_exact(element).map(decode).collect())
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Message<{}:{}>", self.definition.id(), self.definition.name())?;
        if self.definition.arguments().next().is_none() {
            return Ok(());
        }
        write!(f, "(")?;
        for (index, (name, _)) in self.definition.arguments().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            match self.values.get(name) {
                Some(value) => write!(f, "{}={}", name, value)?,
                None => write!(f, "{}=?", name)?,
            }
        }
        write!(f, ")")
    }
}
