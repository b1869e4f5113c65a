//! Remote entity profiles and the registry holding them.
use core::fmt::{Display, Formatter};
use core::str::FromStr;

use derive_new::new;
use hashbrown::HashMap;
use log::{info, warn};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use spacepackets::cfdp::ChecksumType;

use crate::checksum;
use crate::config::EngineConfig;
use crate::fault::FaultHandlerOverrides;
use crate::inbound::InboundFdu;
use crate::EntityNumber;

/// Ack timer interval in seconds for entities which were registered automatically.
pub const DEFAULT_ACK_TIMER_INTERVAL: u32 = 10;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TransportKind {
    Bp,
    Ltp,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown transport kind {0:?}")]
pub struct InvalidTransport(pub String);

impl FromStr for TransportKind {
    type Err = InvalidTransport;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bp" => Ok(TransportKind::Bp),
            "ltp" => Ok(TransportKind::Ltp),
            "tcp" => Ok(TransportKind::Tcp),
            _ => Err(InvalidTransport(s.to_string())),
        }
    }
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            TransportKind::Bp => "bp",
            TransportKind::Ltp => "ltp",
            TransportKind::Tcp => "tcp",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("entity {0} is already registered")]
    Duplicate(EntityNumber),
    #[error("entity {0} is not registered")]
    Unknown(EntityNumber),
    #[error(transparent)]
    InvalidTransport(#[from] InvalidTransport),
    #[error("checksum type {0} is not supported")]
    UnsupportedChecksum(u8),
    #[error("entity {entity} still has {count} inbound transactions")]
    InboundTransactionsPending { entity: EntityNumber, count: usize },
}

/// User facing description of a remote entity, used to add and change registry entries.
///
/// The transport kind and checksum types are kept in their raw representation and validated by
/// the registry.
#[derive(Debug, Clone, PartialEq, Eq, new)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EntityProfile {
    pub number: EntityNumber,
    pub transport: String,
    pub endpoint: String,
    /// Seconds to wait for the Finish PDU of a transaction with closure requested.
    pub ack_timer_interval: u32,
    pub inbound_checksum: u8,
    pub outbound_checksum: u8,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub number: EntityNumber,
    pub transport: TransportKind,
    pub endpoint: String,
    pub ack_timer_interval: u32,
    pub inbound_checksum: ChecksumType,
    pub outbound_checksum: ChecksumType,
    pub fault_handlers: FaultHandlerOverrides,
    /// Inbound transactions from this entity, keyed by transaction number.
    pub(crate) inbound_fdus: HashMap<EntityNumber, InboundFdu>,
}

impl Entity {
    fn with_defaults(number: EntityNumber, config: &EngineConfig) -> Self {
        Self {
            number,
            transport: config.default_transport,
            endpoint: String::new(),
            ack_timer_interval: DEFAULT_ACK_TIMER_INTERVAL,
            inbound_checksum: config.default_checksum,
            outbound_checksum: config.default_checksum,
            fault_handlers: FaultHandlerOverrides::default(),
            inbound_fdus: HashMap::new(),
        }
    }

    pub fn profile(&self) -> EntityProfile {
        EntityProfile::new(
            self.number,
            self.transport.to_string(),
            self.endpoint.clone(),
            self.ack_timer_interval,
            self.inbound_checksum as u8,
            self.outbound_checksum as u8,
        )
    }

    pub fn inbound_transaction_count(&self) -> usize {
        self.inbound_fdus.len()
    }

    /// Validate and apply a profile. `fallback_outbound` replaces an invalid outbound checksum.
    fn apply(
        &mut self,
        profile: &EntityProfile,
        fallback_outbound: ChecksumType,
    ) -> Result<(), RegistryError> {
        let transport = profile.transport.parse::<TransportKind>()?;
        let inbound_checksum = checksum::supported_from_raw(profile.inbound_checksum)
            .ok_or(RegistryError::UnsupportedChecksum(profile.inbound_checksum))?;
        let outbound_checksum = match checksum::supported_from_raw(profile.outbound_checksum) {
            Some(checksum_type) => checksum_type,
            None => {
                warn!(
                    "entity {}: invalid outbound checksum type {}, using {:?}",
                    profile.number, profile.outbound_checksum, fallback_outbound
                );
                fallback_outbound
            }
        };
        self.transport = transport;
        self.endpoint = profile.endpoint.clone();
        self.ack_timer_interval = profile.ack_timer_interval;
        self.inbound_checksum = inbound_checksum;
        self.outbound_checksum = outbound_checksum;
        Ok(())
    }
}

/// Remote entities, kept in ascending order of their entity number.
#[derive(Debug, Default, Clone)]
pub struct EntityRegistry {
    entities: Vec<Entity>,
}

impl EntityRegistry {
    fn position(&self, number: EntityNumber) -> Result<usize, usize> {
        self.entities
            .binary_search_by(|entity| entity.number.cmp(&number))
    }

    pub fn find(&self, number: EntityNumber) -> Option<&Entity> {
        self.position(number).ok().map(|idx| &self.entities[idx])
    }

    pub fn find_mut(&mut self, number: EntityNumber) -> Option<&mut Entity> {
        match self.position(number) {
            Ok(idx) => Some(&mut self.entities[idx]),
            Err(_) => None,
        }
    }

    pub fn add(
        &mut self,
        profile: &EntityProfile,
        config: &EngineConfig,
    ) -> Result<(), RegistryError> {
        let idx = match self.position(profile.number) {
            Ok(_) => return Err(RegistryError::Duplicate(profile.number)),
            Err(idx) => idx,
        };
        let mut entity = Entity::with_defaults(profile.number, config);
        entity.apply(profile, config.default_checksum)?;
        self.entities.insert(idx, entity);
        Ok(())
    }

    /// Change an existing entity. An invalid outbound checksum type keeps the previous one.
    pub fn change(&mut self, profile: &EntityProfile) -> Result<(), RegistryError> {
        let entity = self
            .find_mut(profile.number)
            .ok_or(RegistryError::Unknown(profile.number))?;
        let previous = entity.outbound_checksum;
        entity.apply(profile, previous)
    }

    pub fn remove(&mut self, number: EntityNumber) -> Result<Entity, RegistryError> {
        let idx = self
            .position(number)
            .map_err(|_| RegistryError::Unknown(number))?;
        let count = self.entities[idx].inbound_transaction_count();
        if count > 0 {
            return Err(RegistryError::InboundTransactionsPending {
                entity: number,
                count,
            });
        }
        Ok(self.entities.remove(idx))
    }

    /// Look up an entity, registering it with default values if it is unknown.
    pub fn find_or_register(&mut self, number: EntityNumber, config: &EngineConfig) -> &mut Entity {
        let idx = match self.position(number) {
            Ok(idx) => idx,
            Err(idx) => {
                info!("registering unknown entity {number}");
                self.entities
                    .insert(idx, Entity::with_defaults(number, config));
                idx
            }
        };
        &mut self.entities[idx]
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.entities.iter_mut()
    }
}
