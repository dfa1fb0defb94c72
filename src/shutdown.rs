use std::sync::{Arc, Mutex, OnceLock, Weak};

use log::warn;

use crate::buffer::MessageBuffer;

/// Process-wide registry of open buffers, closed together at shutdown.
///
/// Buffers register on open and deregister on close; a process harness wires
/// [`close_all`] into its shutdown hook.
fn registry() -> &'static Mutex<Vec<Option<Weak<MessageBuffer>>>> {
    static REGISTRY: OnceLock<Mutex<Vec<Option<Weak<MessageBuffer>>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

pub struct ShutdownHandle {
    slot: usize,
}

pub(crate) fn register(buffer: &Arc<MessageBuffer>) -> ShutdownHandle {
    let weak = Arc::downgrade(buffer);
    let mut slots = registry().lock().unwrap_or_else(|err| err.into_inner());
    for (i, slot) in slots.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(weak);
            return ShutdownHandle { slot: i };
        }
    }
    slots.push(Some(weak));
    ShutdownHandle {
        slot: slots.len() - 1,
    }
}

pub(crate) fn unregister(handle: ShutdownHandle) {
    let mut slots = registry().lock().unwrap_or_else(|err| err.into_inner());
    if let Some(slot) = slots.get_mut(handle.slot) {
        *slot = None;
    }
}

/// Closes every live registered buffer. Intended to be called from a process
/// shutdown hook.
pub fn close_all() {
    let buffers: Vec<Arc<MessageBuffer>> = {
        let slots = registry().lock().unwrap_or_else(|err| err.into_inner());
        slots
            .iter()
            .flatten()
            .filter_map(Weak::upgrade)
            .collect()
    };
    for buffer in buffers {
        if let Err(err) = buffer.close() {
            warn!("shutdown close failed: {err}");
        }
    }
}
