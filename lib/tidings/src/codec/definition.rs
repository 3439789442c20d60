use crate::error::{ConfigError, ProtocolError};
use hashbrown::HashMap;
use indexmap::IndexMap;
use lazy_static::lazy_static;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Binary kind of a single message argument.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Kind {
    Int32,
    Float64,
    Utf8String,
    Bytes,
    Float32Vector,
    Float64Vector,
}

impl Kind {
    /// Width of this kind's slot in the fixed part of a message body.
    /// Variable-length kinds occupy a four byte length placeholder there.
    pub(crate) fn fixed_size(self) -> usize {
        match self {
            Kind::Float64 => 8,
            _ => 4,
        }
    }

    /// True for kinds whose payload lives in the variable part of the body.
    pub(crate) fn is_variable(self) -> bool {
        match self {
            Kind::Int32 | Kind::Float64 => false,
            _ => true,
        }
    }
}

/// Immutable schema for one message type: a stable id, a name, and named
/// typed arguments.
///
/// Arguments are stored sorted by name so the wire order is deterministic
/// and independent of declaration order. Ids are handed out monotonically in
/// registration order, starting at 1; peers that register identical
/// definitions in identical order therefore agree on every id.
#[derive(Debug)]
pub struct MessageDefinition {
    id: u32,
    name: String,
    arguments: Vec<(String, Kind)>,
    fixed_size: usize,
}

impl MessageDefinition {
    /// Registers a new definition and returns it. Fails if the name is
    /// already taken or any name fails validation.
    pub fn register(name: &str, arguments: &[(&str, Kind)]) -> Result<Arc<MessageDefinition>, ConfigError> {
        REGISTRY.write().expect("registry lock poisoned").register(name, arguments)
    }

    /// Fetches the definition registered under `name`.
    pub fn fetch(name: &str) -> Result<Arc<MessageDefinition>, ProtocolError> {
        REGISTRY
            .read()
            .expect("registry lock poisoned")
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| ProtocolError::Unregistered(name.to_string()))
    }

    /// Fetches the definition a wire id refers to.
    pub(crate) fn fetch_by_id(id: u32) -> Result<Arc<MessageDefinition>, ProtocolError> {
        REGISTRY
            .read()
            .expect("registry lock poisoned")
            .by_id
            .get(&id)
            .cloned()
            .ok_or(ProtocolError::UnknownId(id))
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Iterates `(name, kind)` pairs in wire order (sorted by name).
    pub fn arguments(&self) -> impl Iterator<Item = (&str, Kind)> {
        self.arguments.iter().map(|(name, kind)| (name.as_str(), *kind))
    }

    /// Kind of the named argument, if declared.
    pub fn argument_kind(&self, name: &str) -> Option<Kind> {
        self.arguments
            .binary_search_by(|(argument, _)| argument.as_str().cmp(name))
            .ok()
            .map(|index| self.arguments[index].1)
    }

    /// Size of the fixed part of the body, message id excluded.
    pub(crate) fn fixed_size(&self) -> usize {
        self.fixed_size
    }
}

struct Registry {
    by_name: HashMap<String, Arc<MessageDefinition>>,
    by_id: HashMap<u32, Arc<MessageDefinition>>,
    next_id: u32,
}

lazy_static! {
    static ref REGISTRY: RwLock<Registry> = RwLock::new(Registry::with_reserved());
}

impl Registry {
    /// Every process starts with the six reserved handshake and keepalive
    /// messages occupying ids 1 through 6.
    fn with_reserved() -> Registry {
        let mut registry = Registry {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            next_id: 1,
        };

        let reserved: [(&str, &[(&str, Kind)]); 6] = [
            ("_ping", &[]),
            ("_pong", &[]),
            ("_welcome", &[("salt", Kind::Utf8String)]),
            (
                "_login",
                &[
                    ("major", Kind::Int32),
                    ("minor", Kind::Int32),
                    ("password", Kind::Utf8String),
                    ("revision", Kind::Int32),
                    ("username", Kind::Utf8String),
                ],
            ),
            ("_loginReject", &[("reason", Kind::Utf8String)]),
            ("_loginAccept", &[]),
        ];

        for (name, arguments) in reserved.iter() {
            registry
                .register(name, arguments)
                .expect("reserved definitions are valid");
        }

        registry
    }

    fn register(&mut self, name: &str, arguments: &[(&str, Kind)]) -> Result<Arc<MessageDefinition>, ConfigError> {
        if !valid_message_name(name) {
            return Err(ConfigError::BadMessageName(name.to_string()));
        }
        if self.by_name.contains_key(name) {
            return Err(ConfigError::DuplicateDefinition(name.to_string()));
        }

        let mut sorted: Vec<(String, Kind)> = Vec::with_capacity(arguments.len());
        for (argument, kind) in arguments {
            if !valid_argument_name(argument) {
                return Err(ConfigError::BadArgumentName(argument.to_string()));
            }
            sorted.push((argument.to_string(), *kind));
        }
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        for window in sorted.windows(2) {
            if window[0].0 == window[1].0 {
                return Err(ConfigError::DuplicateArgument {
                    message: name.to_string(),
                    argument: window[0].0.clone(),
                });
            }
        }

        let fixed_size = sorted.iter().map(|(_, kind)| kind.fixed_size()).sum();

        let definition = Arc::new(MessageDefinition {
            id: self.next_id,
            name: name.to_string(),
            arguments: sorted,
            fixed_size,
        });

        self.next_id += 1;
        self.by_name.insert(name.to_string(), definition.clone());
        self.by_id.insert(definition.id, definition.clone());

        Ok(definition)
    }
}

fn valid_message_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn valid_argument_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Staged message definitions.
///
/// Additions are collected and checked for duplicates first; nothing touches
/// the registry until `instantiate` registers everything in insertion order.
/// Both peers must instantiate identical definitions in identical order to
/// agree on message ids; peers whose sequences differ interoperate only for
/// the shared prefix.
pub struct DefinitionList {
    definitions: IndexMap<String, Vec<(String, Kind)>>,
}

impl DefinitionList {
    pub fn new() -> DefinitionList {
        DefinitionList {
            definitions: IndexMap::new(),
        }
    }

    /// Adds a definition to the list.
    pub fn add(&mut self, name: &str, arguments: &[(&str, Kind)]) -> Result<(), ConfigError> {
        if self.definitions.contains_key(name) {
            return Err(ConfigError::DuplicateDefinition(name.to_string()));
        }
        let arguments = arguments
            .iter()
            .map(|(argument, kind)| (argument.to_string(), *kind))
            .collect();
        self.definitions.insert(name.to_string(), arguments);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Registers every staged definition, in insertion order.
    pub fn instantiate(self) -> Result<(), ConfigError> {
        for (name, arguments) in &self.definitions {
            let borrowed: Vec<(&str, Kind)> = arguments
                .iter()
                .map(|(argument, kind)| (argument.as_str(), *kind))
                .collect();
            MessageDefinition::register(name, &borrowed)?;
        }
        Ok(())
    }

    /// Loads a definition list from a text file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<DefinitionList, ConfigError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Parses the definition-list text format: one message per line as
    /// `<name> [arg=type ...]` with types `int`, `float`, `str`, `bytes`,
    /// `?f` and `?d`. A `#` starts a comment; blank lines are skipped.
    pub fn parse(text: &str) -> Result<DefinitionList, ConfigError> {
        let mut list = DefinitionList::new();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = match raw.find('#') {
                Some(position) => &raw[..position],
                None => raw,
            };

            let mut tokens = content.split_whitespace();
            let name = match tokens.next() {
                Some(name) => name,
                None => continue,
            };

            let mut arguments: Vec<(String, Kind)> = Vec::new();
            for token in tokens {
                let (argument, type_token) = match token.find('=') {
                    Some(position) => (&token[..position], &token[position + 1..]),
                    None => {
                        return Err(ConfigError::BadLine {
                            line,
                            text: token.to_string(),
                        });
                    }
                };
                let kind = match type_token {
                    "int" => Kind::Int32,
                    "float" => Kind::Float64,
                    "str" => Kind::Utf8String,
                    "bytes" => Kind::Bytes,
                    "?f" => Kind::Float32Vector,
                    "?d" => Kind::Float64Vector,
                    _ => {
                        return Err(ConfigError::UnknownType {
                            line,
                            token: type_token.to_string(),
                        });
                    }
                };
                arguments.push((argument.to_string(), kind));
            }

            let borrowed: Vec<(&str, Kind)> = arguments
                .iter()
                .map(|(argument, kind)| (argument.as_str(), *kind))
                .collect();
            list.add(name, &borrowed)?;
        }

        Ok(list)
    }
}
