use std::collections::{HashMap, VecDeque};

use super::ConnId;
use super::driver::NameFlag;

/// A name binding: the owning connection plus the queue of connections
/// waiting to take the name over.
#[derive(Debug)]
pub(crate) struct NameEntry {
    pub(crate) owner: ConnId,
    /// The flags the owner acquired the name with.
    pub(crate) flags: NameFlag,
    /// Waiting requesters in FIFO order, with the flags of their request.
    pub(crate) queue: VecDeque<(ConnId, NameFlag)>,
}

/// The process-wide mapping from names to owning connections.
///
/// Unique names (`:1.<n>`) are minted here and bound for the lifetime of
/// their connection; well-known names are requested and released by clients
/// and may carry a waiter queue.
pub(crate) struct NameRegistry {
    unique_seq: u32,
    names: HashMap<Box<str>, NameEntry>,
}

impl NameRegistry {
    pub(crate) fn new() -> Self {
        Self {
            unique_seq: 0,
            names: HashMap::new(),
        }
    }

    /// Mint the next unique name. The sequence is strictly increasing over
    /// the lifetime of the broker.
    pub(crate) fn mint_unique(&mut self) -> Box<str> {
        let name = format!(":1.{}", self.unique_seq);
        self.unique_seq += 1;
        name.into()
    }

    /// The connection owning `name`, if any.
    pub(crate) fn lookup(&self, name: &str) -> Option<ConnId> {
        Some(self.names.get(name)?.owner)
    }

    /// The entry for `name`, if bound.
    pub(crate) fn entry(&self, name: &str) -> Option<&NameEntry> {
        self.names.get(name)
    }

    /// Iterate over all bound names.
    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.names.keys().map(Box::as_ref)
    }

    /// Bind `name` to `conn`, displacing nothing. The name must be vacant.
    pub(crate) fn bind(&mut self, name: &str, conn: ConnId, flags: NameFlag) {
        let previous = self.names.insert(
            Box::from(name),
            NameEntry {
                owner: conn,
                flags,
                queue: VecDeque::new(),
            },
        );

        debug_assert!(previous.is_none(), "bound an already-bound name");
    }

    /// Update the flags of the current owner of `name`.
    pub(crate) fn update_flags(&mut self, name: &str, conn: ConnId, flags: NameFlag) {
        if let Some(entry) = self.names.get_mut(name) {
            if entry.owner == conn {
                entry.flags = flags;
            }
        }
    }

    /// Hand `name` over from `old` to `new`.
    ///
    /// When `requeue_old` is set the displaced owner is put at the front of
    /// the waiter queue.
    pub(crate) fn replace(
        &mut self,
        name: &str,
        old: ConnId,
        new: ConnId,
        flags: NameFlag,
        requeue_old: bool,
    ) {
        let Some(entry) = self.names.get_mut(name) else {
            return;
        };

        if entry.owner != old {
            return;
        }

        let old_flags = entry.flags;
        entry.queue.retain(|(conn, _)| *conn != new);

        if requeue_old {
            entry.queue.push_front((old, old_flags));
        }

        entry.owner = new;
        entry.flags = flags;
    }

    /// Append `conn` to the waiter queue of `name`, or update its recorded
    /// flags if it is already queued.
    pub(crate) fn enqueue(&mut self, name: &str, conn: ConnId, flags: NameFlag) {
        let Some(entry) = self.names.get_mut(name) else {
            return;
        };

        for (waiter, waiter_flags) in entry.queue.iter_mut() {
            if *waiter == conn {
                *waiter_flags = flags;
                return;
            }
        }

        entry.queue.push_back((conn, flags));
    }

    /// Release `name` from `conn`.
    ///
    /// If `conn` was the owner, the next waiter (if any) is promoted and
    /// returned; if it was queued it is simply removed.
    pub(crate) fn release(&mut self, name: &str, conn: ConnId) -> Option<(ConnId, NameFlag)> {
        let Some(entry) = self.names.get_mut(name) else {
            return None;
        };

        if entry.owner != conn {
            entry.queue.retain(|(waiter, _)| *waiter != conn);
            return None;
        }

        match entry.queue.pop_front() {
            Some((next, flags)) => {
                entry.owner = next;
                entry.flags = flags;
                Some((next, flags))
            }
            None => {
                self.names.remove(name);
                None
            }
        }
    }

    /// Drop `conn` from every waiter queue.
    pub(crate) fn remove_from_queues(&mut self, conn: ConnId) {
        for entry in self.names.values_mut() {
            entry.queue.retain(|(waiter, _)| *waiter != conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::ConnId;
    use super::super::driver::NameFlag;
    use super::NameRegistry;

    #[test]
    fn unique_names_increase() {
        let mut registry = NameRegistry::new();
        assert_eq!(&*registry.mint_unique(), ":1.0");
        assert_eq!(&*registry.mint_unique(), ":1.1");
        assert_eq!(&*registry.mint_unique(), ":1.2");
    }

    #[test]
    fn release_promotes_fifo() {
        let mut registry = NameRegistry::new();
        let (a, b, c) = (ConnId(1), ConnId(2), ConnId(3));

        registry.bind("com.example.X", a, NameFlag::NONE);
        registry.enqueue("com.example.X", b, NameFlag::NONE);
        registry.enqueue("com.example.X", c, NameFlag::NONE);

        let promoted = registry.release("com.example.X", a).unwrap();
        assert_eq!(promoted.0, b);
        assert_eq!(registry.lookup("com.example.X"), Some(b));

        let promoted = registry.release("com.example.X", b).unwrap();
        assert_eq!(promoted.0, c);

        assert!(registry.release("com.example.X", c).is_none());
        assert_eq!(registry.lookup("com.example.X"), None);
    }

    #[test]
    fn replace_requeues_old_owner() {
        let mut registry = NameRegistry::new();
        let (a, b) = (ConnId(1), ConnId(2));

        registry.bind("com.example.X", a, NameFlag::ALLOW_REPLACEMENT);
        registry.replace("com.example.X", a, b, NameFlag::NONE, true);

        assert_eq!(registry.lookup("com.example.X"), Some(b));

        let promoted = registry.release("com.example.X", b).unwrap();
        assert_eq!(promoted.0, a);
    }
}
