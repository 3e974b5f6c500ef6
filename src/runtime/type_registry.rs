//! Registry of item types that may flow through pipeline connections
//!
//! Connections are created from a `TypeId` at build time, so every item type
//! needs a registered constructor for its channel pair and broadcast sender.

use super::errors::BuildError;
use super::sender::{ChannelMessage, Sender};
use crossbeam_channel::{Sender as CrossbeamSender, bounded};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Mutex;

type ErasedEnd = Box<dyn Any + Send>;
type ChannelCreatorFn = Box<dyn Fn(usize) -> (ErasedEnd, ErasedEnd) + Send + Sync>;
type OutputWrapperFn = Box<dyn Fn(Vec<ErasedEnd>) -> Option<ErasedEnd> + Send + Sync>;

pub(crate) struct TypeRegistry {
    channel_creators: HashMap<TypeId, ChannelCreatorFn>,
    output_wrappers: HashMap<TypeId, OutputWrapperFn>,
}

impl TypeRegistry {
    fn new() -> Self {
        Self {
            channel_creators: HashMap::new(),
            output_wrappers: HashMap::new(),
        }
    }

    fn register<T: 'static + Send + Clone>(&mut self) {
        let type_id = TypeId::of::<T>();

        self.channel_creators.insert(
            type_id,
            Box::new(|capacity: usize| {
                let (tx, rx) = bounded::<ChannelMessage<T>>(capacity);
                (Box::new(tx) as ErasedEnd, Box::new(rx) as ErasedEnd)
            }),
        );

        self.output_wrappers.insert(
            type_id,
            Box::new(|senders: Vec<ErasedEnd>| {
                let typed = senders
                    .into_iter()
                    .map(|s| s.downcast::<CrossbeamSender<ChannelMessage<T>>>().ok().map(|tx| *tx))
                    .collect::<Option<Vec<_>>>()?;
                Some(Box::new(Sender::new(typed)) as ErasedEnd)
            }),
        );
    }

    pub(crate) fn create_channel(
        &self,
        type_id: TypeId,
        capacity: usize,
    ) -> Result<(ErasedEnd, ErasedEnd), BuildError> {
        self.channel_creators
            .get(&type_id)
            .map(|create| create(capacity))
            .ok_or(BuildError::UnregisteredType(type_id))
    }

    /// Combine the sending ends of one output port into a broadcast `Sender`.
    pub(crate) fn wrap_output(&self, type_id: TypeId, senders: Vec<ErasedEnd>) -> Option<ErasedEnd> {
        self.output_wrappers.get(&type_id).and_then(|wrap| wrap(senders))
    }
}

lazy_static::lazy_static! {
    pub(crate) static ref TYPE_REGISTRY: Mutex<TypeRegistry> = {
        use crate::nodes::{DecoderEvent, Expectation, GateEvent, Transmission};
        use crate::protocol::{Burst, TagIdentity};
        use crate::runtime::SampleBlock;

        let mut registry = TypeRegistry::new();
        registry.register::<SampleBlock>();
        registry.register::<GateEvent>();
        registry.register::<Burst>();
        registry.register::<DecoderEvent>();
        registry.register::<Expectation>();
        registry.register::<Transmission>();
        registry.register::<TagIdentity>();
        Mutex::new(registry)
    };
}

/// Register an additional item type (e.g. for a custom sink's input).
pub fn register_type<T: 'static + Send + Clone>() {
    TYPE_REGISTRY
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .register::<T>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Unregistered;

    #[test]
    fn unknown_type_is_reported() {
        let registry = TYPE_REGISTRY.lock().unwrap();
        let err = registry
            .create_channel(TypeId::of::<Unregistered>(), 4)
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::UnregisteredType(_)));
    }

    #[test]
    fn registered_type_gets_a_channel() {
        register_type::<u32>();
        let registry = TYPE_REGISTRY.lock().unwrap();
        let (tx, rx) = registry.create_channel(TypeId::of::<u32>(), 4).unwrap();
        assert!(tx.is::<CrossbeamSender<ChannelMessage<u32>>>());
        assert!(rx.is::<crossbeam_channel::Receiver<ChannelMessage<u32>>>());
        let sender = registry.wrap_output(TypeId::of::<u32>(), vec![tx]).unwrap();
        assert!(sender.is::<Sender<u32>>());
    }
}
