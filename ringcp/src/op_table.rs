use crate::buffer_pool::SlotId;
use crate::error::{EngineError, EngineResult};
use std::collections::HashMap;
use std::fmt;

/// Correlation token carried in a submission's `user_data` and echoed back
/// on its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A byte range of the file held in one buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub len: u32,
    pub slot: SlotId,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.len)
    }
}

/// What an outstanding operation id stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    OpenSource,
    OpenDestination,
    StatSize,
    Read(Extent),
    Write(Extent),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::OpenSource => "open source",
            Operation::OpenDestination => "open destination",
            Operation::StatSize => "statx",
            Operation::Read(_) => "read",
            Operation::Write(_) => "write",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Read(extent) | Operation::Write(extent) => write!(
                f,
                "{} [{}, {}) via {}",
                self.name(),
                extent.offset,
                extent.end(),
                extent.slot
            ),
            _ => f.write_str(self.name()),
        }
    }
}

/// Outstanding operations keyed by id.
///
/// Ids come from a 64-bit counter that is never rewound, so an id cannot be
/// reassigned while a completion for it may still arrive.
#[derive(Debug, Default)]
pub struct OperationTable {
    next_id: u64,
    live: HashMap<OperationId, Operation>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, operation: Operation) -> OperationId {
        let id = OperationId(self.next_id);
        self.next_id += 1;
        self.live.insert(id, operation);
        id
    }

    /// Remove and return the descriptor for a completed operation.
    pub fn take(&mut self, id: OperationId) -> EngineResult<Operation> {
        self.live
            .remove(&id)
            .ok_or(EngineError::UnknownOperation { id: id.0 })
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&OperationId, &Operation)> {
        self.live.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let mut table = OperationTable::new();
        let a = table.register(Operation::OpenSource);
        let b = table.register(Operation::StatSize);
        table.take(a).unwrap();
        let c = table.register(Operation::OpenDestination);
        assert!(a < b && b < c);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_take_returns_descriptor_once() {
        let mut table = OperationTable::new();
        let extent = Extent {
            offset: 4096,
            len: 512,
            slot: SlotId::new(2),
        };
        let id = table.register(Operation::Read(extent));

        assert_eq!(table.take(id).unwrap(), Operation::Read(extent));
        assert!(table.is_empty());
        assert!(matches!(
            table.take(id),
            Err(EngineError::UnknownOperation { id: 0 })
        ));
    }

    #[test]
    fn test_names_for_diagnostics() {
        let extent = Extent {
            offset: 0,
            len: 10,
            slot: SlotId::new(0),
        };
        assert_eq!(Operation::OpenSource.name(), "open source");
        assert_eq!(Operation::OpenDestination.name(), "open destination");
        assert_eq!(Operation::StatSize.name(), "statx");
        assert_eq!(Operation::Write(extent).to_string(), "write [0, 10) via #0");
    }
}
