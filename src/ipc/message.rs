//! Messages
//!
//! A message carries an optional source port, its destination port, and two
//! opaque payload words. Payloads are reference-counted, so a sender can
//! keep its own handle to whatever it sends.

use core::any::Any;
use core::fmt;
use std::sync::Arc;

use log::trace;

use super::{Port, PortType};
use crate::arch::YieldReason;
use crate::error::{KernError, KernResult};
use crate::kern::dpc::DpcAttrs;
use crate::kern::worker;

/// Opaque message payload
pub type Payload = Arc<dyn Any + Send + Sync>;

pub struct Message {
    src: Option<Arc<Port>>,
    dest: Arc<Port>,
    data1: Option<Payload>,
    data2: Option<Payload>,
}

impl Message {
    pub(crate) fn new(
        src: Option<Arc<Port>>,
        dest: Arc<Port>,
        data1: Option<Payload>,
        data2: Option<Payload>,
    ) -> Self {
        Self {
            src,
            dest,
            data1,
            data2,
        }
    }

    /// Port replies should go to, if the sender named one
    pub fn src(&self) -> Option<&Arc<Port>> {
        self.src.as_ref()
    }

    pub fn dest(&self) -> &Arc<Port> {
        &self.dest
    }

    pub fn is_from(&self, port: &Arc<Port>) -> bool {
        self.src.as_ref().is_some_and(|src| Arc::ptr_eq(src, port))
    }

    pub fn is_to(&self, port: &Arc<Port>) -> bool {
        Arc::ptr_eq(&self.dest, port)
    }

    pub fn data1(&self) -> Option<&Payload> {
        self.data1.as_ref()
    }

    pub fn data2(&self) -> Option<&Payload> {
        self.data2.as_ref()
    }

    /// First payload word, if present and of type `T`
    pub fn data1_as<T: Any>(&self) -> Option<&T> {
        self.data1.as_deref()?.downcast_ref()
    }

    /// Second payload word, if present and of type `T`
    pub fn data2_as<T: Any>(&self) -> Option<&T> {
        self.data2.as_deref()?.downcast_ref()
    }

    /// Take both payload words, releasing the port references
    pub fn into_data(self) -> (Option<Payload>, Option<Payload>) {
        (self.data1, self.data2)
    }

    /// Release the message and everything it references
    pub fn destroy(self) {
        drop(self);
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("src", &self.src.as_ref().map(|p| p.id()))
            .field("dest", &self.dest.id())
            .field("data1", &self.data1.is_some())
            .field("data2", &self.data2.is_some())
            .finish()
    }
}

// ============================================================================
// Send / Receive
// ============================================================================

/// Send a message to `dest`
///
/// On a thread-style port the message goes to the oldest blocked receiver,
/// or is queued when nobody waits. On a DPC-style port a new DPC runs the
/// port's handler with the message. Never blocks.
///
/// Callable from any thread or DPC of the port's host.
pub fn msg_send(
    dest: &Arc<Port>,
    from: Option<&Arc<Port>>,
    data1: Option<Payload>,
    data2: Option<Payload>,
) -> KernResult<()> {
    let host = worker::current_host().ok_or(KernError::NoContext)?;
    if dest.host_id() != host.id() {
        return Err(KernError::ForeignPort);
    }

    let msg = Message::new(from.cloned(), Arc::clone(dest), data1, data2);
    trace!(
        "send {} -> {}",
        from.map_or_else(|| "-".to_string(), |p| p.id().to_string()),
        dest.id()
    );
    match dest.port_type() {
        PortType::Dpc => {
            let handler = dest.dpc_handler().ok_or(KernError::NoDpcHandler)?;
            host.spawn_dpc(Box::new(move || handler(msg)), DpcAttrs::default())?;
            host.counters.dpc_deliveries.inc();
        }
        PortType::Thread => dest.deliver(msg, &host),
    }
    host.counters.msgs_sent.inc();
    Ok(())
}

/// Receive the oldest message on a thread-style port, blocking until one
/// arrives
///
/// Callable from threads only; DPCs cannot block.
pub fn msg_recv(port: &Arc<Port>) -> KernResult<Message> {
    if port.port_type() != PortType::Thread {
        return Err(KernError::WrongPortType(port.port_type()));
    }
    let host = worker::current_host().ok_or(KernError::NoContext)?;
    if port.host_id() != host.id() {
        return Err(KernError::ForeignPort);
    }
    drop(host);
    let (_, node) = worker::current_thread()?;

    loop {
        let guard = match port.take_or_hold() {
            Ok(msg) => return Ok(msg),
            Err(guard) => guard,
        };
        // The port stays locked until our worker has parked us
        worker::suspend(YieldReason::Waiting, Some(guard))?;
        // SAFETY: the receive slot of the running thread is written only
        // while the thread is parked, before it is made ready again.
        if let Some(msg) = unsafe { (*node.as_ptr()).recv_slot.take() } {
            return Ok(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::Host;

    #[test]
    fn test_message_accessors() {
        let host = Host::new().unwrap();
        let a = host.port_create(PortType::Thread);
        let b = host.port_create(PortType::Thread);

        let msg = Message::new(
            Some(a.clone()),
            b.clone(),
            Some(Arc::new(42u64)),
            Some(Arc::new("hello")),
        );
        assert!(msg.is_from(&a));
        assert!(!msg.is_from(&b));
        assert!(msg.is_to(&b));
        assert_eq!(msg.data1_as::<u64>(), Some(&42));
        assert_eq!(msg.data1_as::<u32>(), None);
        assert_eq!(msg.data2_as::<&str>(), Some(&"hello"));

        let (d1, d2) = msg.into_data();
        assert!(d1.is_some() && d2.is_some());
        assert_eq!(Arc::strong_count(&a), 1);
        assert_eq!(Arc::strong_count(&b), 1);
    }

    #[test]
    fn test_destroy_releases_payload() {
        let host = Host::new().unwrap();
        let port = host.port_create(PortType::Thread);
        let payload: Payload = Arc::new(vec![1u8, 2, 3]);

        let msg = Message::new(None, port.clone(), Some(payload.clone()), None);
        assert_eq!(Arc::strong_count(&payload), 2);
        assert!(msg.src().is_none());
        msg.destroy();
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn test_send_recv_outside_context() {
        let host = Host::new().unwrap();
        let port = host.port_create(PortType::Thread);
        assert_eq!(
            msg_send(&port, None, None, None).unwrap_err(),
            KernError::NoContext
        );
        assert_eq!(msg_recv(&port).unwrap_err(), KernError::NoContext);

        let dpc_port = host.port_create(PortType::Dpc);
        assert_eq!(
            msg_recv(&dpc_port).unwrap_err(),
            KernError::WrongPortType(PortType::Dpc)
        );
    }
}
