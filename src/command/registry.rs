use std::{
    collections::{BTreeMap, btree_map::Entry},
    sync::OnceLock,
};

use serde::{Deserialize, Serialize};

use super::{
    AddPotentialServerCommand, ChangeDbUserPasswordCommand, ClusterCommand, Command,
    CreateContinuousQueryCommand, CreateDatabaseCommand, CreateShardsCommand,
    DeleteContinuousQueryCommand, DropDatabaseCommand, DropShardCommand, JoinCommand,
    SaveClusterAdminCommand, SaveDbUserCommand, SetContinuousQueryTimestampCommand,
};

/// One Raft log entry payload: the command's wire name plus its serialized fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub name: String,
    pub payload: serde_json::Value,
}

pub type Decoder = fn(serde_json::Value) -> Result<ClusterCommand, serde_json::Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateName { name: &'static str },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateName { name } => write!(f, "command name registered twice: {name}"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug)]
pub enum DecodeError {
    UnregisteredCommand {
        name: String,
    },
    MalformedPayload {
        name: String,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnregisteredCommand { name } => write!(f, "unregistered command: {name:?}"),
            Self::MalformedPayload { name, source } => {
                write!(f, "malformed payload for command {name}: {source}")
            }
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::UnregisteredCommand { .. } => None,
            Self::MalformedPayload { source, .. } => Some(source),
        }
    }
}

/// Maps a command's wire name to the decoder for its payload.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    decoders: BTreeMap<&'static str, Decoder>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every command that can appear in the log.
    pub fn with_builtin_commands() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.register::<AddPotentialServerCommand>()?;
        registry.register::<CreateDatabaseCommand>()?;
        registry.register::<DropDatabaseCommand>()?;
        registry.register::<SaveDbUserCommand>()?;
        registry.register::<SaveClusterAdminCommand>()?;
        registry.register::<ChangeDbUserPasswordCommand>()?;
        registry.register::<CreateContinuousQueryCommand>()?;
        registry.register::<DeleteContinuousQueryCommand>()?;
        registry.register::<SetContinuousQueryTimestampCommand>()?;
        registry.register::<CreateShardsCommand>()?;
        registry.register::<DropShardCommand>()?;
        registry.register::<JoinCommand>()?;
        Ok(registry)
    }

    pub fn register<C: Command>(&mut self) -> Result<(), RegistryError> {
        match self.decoders.entry(C::NAME) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateName { name: C::NAME }),
            Entry::Vacant(slot) => {
                slot.insert(decode_as::<C>);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Decoder> {
        self.decoders.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    pub fn decode(&self, envelope: &CommandEnvelope) -> Result<ClusterCommand, DecodeError> {
        let decoder =
            self.lookup(&envelope.name)
                .ok_or_else(|| DecodeError::UnregisteredCommand {
                    name: envelope.name.clone(),
                })?;
        decoder(envelope.payload.clone()).map_err(|source| DecodeError::MalformedPayload {
            name: envelope.name.clone(),
            source,
        })
    }
}

fn decode_as<C: Command>(payload: serde_json::Value) -> Result<ClusterCommand, serde_json::Error> {
    serde_json::from_value::<C>(payload).map(Into::into)
}

static REGISTRY: OnceLock<CommandRegistry> = OnceLock::new();

/// Builds the process-wide registry. Call once at startup, before the Raft core
/// replays any entry.
pub fn init_registry() -> Result<&'static CommandRegistry, RegistryError> {
    if let Some(registry) = REGISTRY.get() {
        return Ok(registry);
    }
    let built = CommandRegistry::with_builtin_commands()?;
    Ok(REGISTRY.get_or_init(|| built))
}

/// The process-wide registry; read-only once built.
pub fn registry() -> &'static CommandRegistry {
    REGISTRY.get_or_init(|| {
        CommandRegistry::with_builtin_commands().expect("builtin command names are unique")
    })
}
